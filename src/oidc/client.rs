//! OIDC provider client
//!
//! Builds authorization requests and redeems authorization codes at the
//! token endpoint. Provider metadata is discovered on first use and cached;
//! a failed discovery is retried on the next request, not in a loop.

use super::transport::build_http_client;
use super::{OidcConfig, PendingAuthorization, TokenResponse};
use crate::config::ProviderSettings;
use crate::error::{PipelineError, Result};
use crate::params::Parameters;
use reqwest_middleware::ClientWithMiddleware;
use std::time::Duration;
use tokio::sync::OnceCell;
use url::Url;

pub struct OidcProvider {
    settings: ProviderSettings,
    http: ClientWithMiddleware,
    metadata: OnceCell<OidcConfig>,
}

impl OidcProvider {
    pub fn new(settings: ProviderSettings, timeout: Duration) -> Result<Self> {
        Ok(Self {
            settings,
            http: build_http_client(timeout)?,
            metadata: OnceCell::new(),
        })
    }

    /// Login provider name recorded in sessions
    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    /// Provider metadata, discovered once
    pub async fn metadata(&self) -> Result<&OidcConfig> {
        self.metadata
            .get_or_try_init(|| OidcConfig::discover(&self.http, &self.settings.issuer_url))
            .await
    }

    /// Authorization code request URL for `pending`, with PKCE and nonce
    pub async fn authorization_url(&self, pending: &PendingAuthorization) -> Result<String> {
        let metadata = self.metadata().await?;
        let mut url = Url::parse(&metadata.authorization_endpoint)?;

        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.settings.client_id)
            .append_pair("redirect_uri", &self.settings.redirect_url)
            .append_pair("scope", &self.settings.scopes.join(" "))
            .append_pair("state", &pending.state)
            .append_pair("nonce", &pending.nonce)
            .append_pair("code_challenge", &pending.code_challenge())
            .append_pair("code_challenge_method", "S256");

        Ok(url.to_string())
    }

    /// Exchange an authorization code; the token response comes back as parameters
    pub async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<Parameters> {
        let metadata = self.metadata().await?;

        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.settings.redirect_url.as_str()),
            ("client_id", self.settings.client_id.as_str()),
            ("code_verifier", code_verifier),
        ];
        if let Some(secret) = self.settings.client_secret.as_deref() {
            params.push(("client_secret", secret));
        }

        let response = self
            .http
            .post(&metadata.token_endpoint)
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Token(format!(
                "Token exchange failed with status {}: {}",
                status, body
            )));
        }

        let token_response: TokenResponse = response.json().await?;
        Ok(Parameters::from(token_response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oidc::ResponseMode;

    fn provider(issuer: &str) -> OidcProvider {
        OidcProvider::new(
            ProviderSettings {
                name: "oidc".to_string(),
                issuer_url: issuer.to_string(),
                client_id: "client-id".to_string(),
                client_secret: Some("secret".to_string()),
                scopes: vec!["openid".to_string(), "profile".to_string()],
                redirect_url: "http://localhost:5000/signin-oidc".to_string(),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    async fn mock_discovery(server: &mut mockito::ServerGuard) -> mockito::Mock {
        let issuer = server.url();
        server
            .mock("GET", "/.well-known/openid-configuration")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                serde_json::json!({
                    "issuer": issuer,
                    "authorization_endpoint": format!("{}/authorize", issuer),
                    "token_endpoint": format!("{}/token", issuer),
                })
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_authorization_url_and_cached_discovery() {
        let mut server = mockito::Server::new_async().await;
        let discovery = mock_discovery(&mut server).await;
        let provider = provider(&server.url());
        let pending = PendingAuthorization::new("/", ResponseMode::Redirect);

        let first = provider.authorization_url(&pending).await.unwrap();
        let _second = provider.authorization_url(&pending).await.unwrap();

        let url = Url::parse(&first).unwrap();
        assert_eq!(url.path(), "/authorize");
        let query = Parameters::parse(url.query().unwrap_or_default());
        assert_eq!(query.get("response_type"), Some("code"));
        assert_eq!(query.get("client_id"), Some("client-id"));
        assert_eq!(query.get("scope"), Some("openid profile"));
        assert_eq!(query.get("state"), Some(pending.state.as_str()));
        assert_eq!(query.get("nonce"), Some(pending.nonce.as_str()));
        assert_eq!(
            query.get("code_challenge"),
            Some(pending.code_challenge().as_str())
        );

        // Metadata fetched once for both calls
        discovery.assert_async().await;
    }

    #[tokio::test]
    async fn test_exchange_code() {
        let mut server = mockito::Server::new_async().await;
        let _discovery = mock_discovery(&mut server).await;
        let token = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                mockito::Matcher::UrlEncoded("code".into(), "the-code".into()),
                mockito::Matcher::UrlEncoded("code_verifier".into(), "verifier".into()),
                mockito::Matcher::UrlEncoded("client_secret".into(), "secret".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"at","id_token":"a.b.c","token_type":"Bearer"}"#)
            .create_async()
            .await;

        let fields = provider(&server.url())
            .exchange_code("the-code", "verifier")
            .await
            .unwrap();

        assert_eq!(fields.get("access_token"), Some("at"));
        assert_eq!(fields.get("id_token"), Some("a.b.c"));
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_exchange_code_failure_is_token_error() {
        let mut server = mockito::Server::new_async().await;
        let _discovery = mock_discovery(&mut server).await;
        let _token = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let result = provider(&server.url()).exchange_code("bad", "verifier").await;
        assert!(matches!(result, Err(PipelineError::Token(msg)) if msg.contains("invalid_grant")));
    }
}
