//! OpenID Connect relying party
//!
//! The sign-in flow is split in two requests. The provider callback is
//! captured under a one-time correlation key ([`capture_callback`]); a
//! second request redeems that key through an [`OidcResponseGenerator`],
//! which signs the session in and sends the browser on.

pub mod callback;
pub mod capture;
pub mod client;
pub mod discovery;
pub mod generator;
pub mod models;
pub mod token;
pub mod transport;

pub use callback::{capture_callback, CallbackOutcome};
pub use capture::{CaptureRecord, CorrelationKey, ResponseCapture};
pub use client::OidcProvider;
pub use discovery::OidcConfig;
pub use generator::{IdTokenAction, OidcResponseGenerator, SessionResponseGenerator};
pub use models::{
    OpenIdConnectSessionDetails, PendingAuthorization, ResponseMode, PENDING_AUTHORIZATION,
    SESSION_DETAILS,
};
pub use token::{IdTokenClaims, TokenResponse};
