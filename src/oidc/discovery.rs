//! OIDC provider discovery
//!
//! Fetches provider metadata from /.well-known/openid-configuration

use crate::error::{PipelineError, Result};
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcConfig {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
    #[serde(default)]
    pub jwks_uri: Option<String>,
}

impl OidcConfig {
    /// Discover provider metadata for `issuer_url`
    pub async fn discover(http: &ClientWithMiddleware, issuer_url: &str) -> Result<Self> {
        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            issuer_url.trim_end_matches('/')
        );

        let response = http.get(&discovery_url).send().await.map_err(|e| {
            PipelineError::Discovery(format!("Failed to fetch OIDC configuration: {}", e))
        })?;

        if !response.status().is_success() {
            return Err(PipelineError::Discovery(format!(
                "OIDC discovery request failed with status: {}",
                response.status()
            )));
        }

        let config: OidcConfig = response.json().await.map_err(|e| {
            PipelineError::Discovery(format!("Failed to parse OIDC configuration: {}", e))
        })?;

        if config.authorization_endpoint.is_empty() {
            return Err(PipelineError::Discovery(
                "OIDC configuration missing authorization_endpoint".to_string(),
            ));
        }

        if config.token_endpoint.is_empty() {
            return Err(PipelineError::Discovery(
                "OIDC configuration missing token_endpoint".to_string(),
            ));
        }

        if config.issuer.trim_end_matches('/') != issuer_url.trim_end_matches('/') {
            return Err(PipelineError::Discovery(format!(
                "Issuer mismatch: configured {}, provider reports {}",
                issuer_url, config.issuer
            )));
        }

        Ok(config)
    }
}
