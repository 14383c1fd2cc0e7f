//! Token endpoint responses and id token claims

use crate::error::{PipelineError, Result};
use crate::params::Parameters;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

/// Token response from OIDC provider
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl From<TokenResponse> for Parameters {
    fn from(response: TokenResponse) -> Self {
        let mut params = Parameters::from_dictionary([
            ("access_token", Some(response.access_token)),
            ("id_token", response.id_token),
            ("refresh_token", response.refresh_token),
            ("token_type", response.token_type),
            ("scope", response.scope),
        ]);
        if let Some(expires_in) = response.expires_in {
            params.merge_map([("expires_in", expires_in)]);
        }
        params
    }
}

/// The id token claims this relying party reads.
///
/// The token is only accepted from the direct token endpoint exchange, so
/// claims are read without local signature verification.
#[derive(Debug, Clone, Deserialize)]
pub struct IdTokenClaims {
    pub sub: String,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
}

impl IdTokenClaims {
    /// Decode the payload segment of a compact JWT
    pub fn from_jwt(id_token: &str) -> Result<Self> {
        let mut segments = id_token.split('.');
        let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
            (Some(_), Some(payload), Some(_), None) => payload,
            _ => {
                return Err(PipelineError::Token(
                    "id_token is not a compact JWT".to_string(),
                ))
            }
        };

        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| PipelineError::Token(format!("id_token payload is not base64url: {}", e)))?;

        serde_json::from_slice(&bytes)
            .map_err(|e| PipelineError::Token(format!("id_token payload is not valid claims: {}", e)))
    }
}
