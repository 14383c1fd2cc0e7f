//! HTTP client for identity provider calls
//!
//! Requests go through a `reqwest-middleware` chain that logs each call's
//! method, path, status and latency. Bodies and query strings are never
//! logged since they carry codes and tokens. There is no retry: a provider
//! that times out surfaces as an error to the caller.

use crate::error::Result;
use async_trait::async_trait;
use http::Extensions;
use reqwest::{Request, Response};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Middleware, Next, Result as MiddlewareResult};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Middleware logging outbound identity provider requests
pub struct IdpTraceMiddleware;

#[async_trait]
impl Middleware for IdpTraceMiddleware {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> MiddlewareResult<Response> {
        let method = req.method().clone();
        let target = format!(
            "{}{}",
            req.url().host_str().unwrap_or_default(),
            req.url().path()
        );
        let started = Instant::now();

        let result = next.run(req, extensions).await;
        let elapsed_ms = started.elapsed().as_millis();

        match &result {
            Ok(response) if response.status().is_success() => {
                debug!("{} {} -> {} ({} ms)", method, target, response.status(), elapsed_ms);
            }
            Ok(response) => {
                warn!("{} {} -> {} ({} ms)", method, target, response.status(), elapsed_ms);
            }
            Err(e) => {
                warn!("{} {} failed after {} ms: {}", method, target, elapsed_ms, e);
            }
        }

        result
    }
}

/// Build the provider client with the given per-request timeout
pub fn build_http_client(timeout: Duration) -> Result<ClientWithMiddleware> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    Ok(ClientBuilder::new(client).with(IdpTraceMiddleware).build())
}
