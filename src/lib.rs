//! OIDC Pipeline Library
//!
//! OpenID Connect relying party: one-time capture of provider responses,
//! redemption into cookie sessions, and per-request session validation.

pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod middleware;
pub mod oidc;
pub mod params;
pub mod random;
pub mod serializer;
pub mod server;
pub mod session;
pub mod startup;
