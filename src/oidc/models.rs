//! Records kept in the session during and after sign-in

use crate::random::urlsafe_token;
use crate::session::SessionKey;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::str::FromStr;

/// What a redeemed capture left in the session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenIdConnectSessionDetails {
    pub login_provider: String,
    /// Provider response fields by name
    pub oidc: BTreeMap<String, String>,
}

pub const SESSION_DETAILS: SessionKey<OpenIdConnectSessionDetails> =
    SessionKey::new("oidc.session_details");

/// How the id token response is handed to the return target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    /// Plain redirect, no fields forwarded
    #[default]
    Redirect,
    /// Fields appended to the return URL's query
    Query,
    /// Auto-submitting HTML form
    FormPost,
}

impl FromStr for ResponseMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "redirect" => Ok(ResponseMode::Redirect),
            "query" => Ok(ResponseMode::Query),
            "form_post" => Ok(ResponseMode::FormPost),
            other => Err(format!("unsupported response_mode '{}'", other)),
        }
    }
}

/// An authorization request sent to the provider and not yet answered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAuthorization {
    pub state: String,
    pub nonce: String,
    /// PKCE verifier (RFC 7636)
    pub code_verifier: String,
    pub return_to: String,
    pub response_mode: ResponseMode,
    pub created_at: DateTime<Utc>,
}

pub const PENDING_AUTHORIZATION: SessionKey<PendingAuthorization> =
    SessionKey::new("oidc.pending_authorization");

impl PendingAuthorization {
    pub fn new(return_to: impl Into<String>, response_mode: ResponseMode) -> Self {
        Self {
            state: urlsafe_token(24),
            nonce: urlsafe_token(24),
            code_verifier: urlsafe_token(48),
            return_to: return_to.into(),
            response_mode,
            created_at: Utc::now(),
        }
    }

    /// BASE64URL(SHA256(code_verifier))
    pub fn code_challenge(&self) -> String {
        let hash = Sha256::digest(self.code_verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(hash)
    }
}
