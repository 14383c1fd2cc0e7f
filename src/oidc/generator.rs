//! Redemption of captured responses into signed-in sessions

use super::{
    CaptureRecord, CorrelationKey, OpenIdConnectSessionDetails, ResponseCapture, ResponseMode,
    SESSION_DETAILS,
};
use crate::auth::{AuthContext, AuthTicket, TicketStore};
use crate::error::{PipelineError, Result};
use crate::params::{html_escape, Parameters};
use crate::serializer::{JsonSerializer, Serializer};
use crate::session::Session;
use async_trait::async_trait;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use std::sync::Arc;
use tracing::{info, warn};

/// Fields forwarded to the return target in `query` and `form_post` modes
pub const ID_TOKEN_RESPONSE_FIELDS: &[&str] = &[
    "id_token",
    "access_token",
    "token_type",
    "expires_in",
    "scope",
    "session_state",
];

/// What the browser is sent after a successful redemption
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdTokenAction {
    Redirect(String),
    FormPost { action: String, fields: Parameters },
}

impl IntoResponse for IdTokenAction {
    fn into_response(self) -> Response {
        match self {
            IdTokenAction::Redirect(location) => {
                (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
            }
            IdTokenAction::FormPost { action, fields } => Html(format!(
                r#"<!DOCTYPE html>
<html>
    <head><title>Signing in</title></head>
    <body onload="document.forms[0].submit()">
        <form method="post" action="{}">
{}            <noscript><button type="submit">Continue</button></noscript>
        </form>
    </body>
</html>
"#,
                html_escape(&action),
                fields.to_form_post()
            ))
            .into_response(),
        }
    }
}

#[async_trait]
pub trait OidcResponseGenerator: Send + Sync {
    /// Redeem `key` and sign the request in.
    ///
    /// With `delete` the capture is consumed, so any later call with the same
    /// key fails with `CaptureNotFound`. Without it the capture stays pending,
    /// which is only meant for diagnostics.
    ///
    /// A failure after the key was consumed leaves the session and the current
    /// identity untouched; the key stays spent and the user has to sign in again.
    async fn create_id_token_action_result(
        &self,
        key: &CorrelationKey,
        delete: bool,
        session: &Session,
        auth: &AuthContext,
    ) -> Result<IdTokenAction>;
}

/// Generator that keeps session details in the session and signs in with a ticket
pub struct SessionResponseGenerator {
    capture: Arc<ResponseCapture>,
    tickets: TicketStore,
}

impl SessionResponseGenerator {
    pub fn new(capture: Arc<ResponseCapture>, tickets: TicketStore) -> Self {
        Self { capture, tickets }
    }
}

#[async_trait]
impl OidcResponseGenerator for SessionResponseGenerator {
    async fn create_id_token_action_result(
        &self,
        key: &CorrelationKey,
        delete: bool,
        session: &Session,
        auth: &AuthContext,
    ) -> Result<IdTokenAction> {
        let record = self.capture.redeem(key, delete).await?;

        let session_id = match session.id().await {
            Some(id) if id == record.session_id => id,
            _ => {
                warn!("Capture redeemed from a different session; rejecting");
                return Err(PipelineError::CaptureNotFound);
            }
        };

        let details = OpenIdConnectSessionDetails {
            login_provider: record.login_provider.clone(),
            oidc: record.fields.to_dictionary(),
        };
        let details = JsonSerializer.serialize(&details, false)?;
        let ticket = AuthTicket::new(
            record.subject.clone(),
            record.login_provider.clone(),
            session_id,
            self.tickets.ttl(),
        );

        // The only fallible write; nothing else has changed if it fails
        self.tickets.save(&ticket).await?;
        session.set_string(SESSION_DETAILS.name(), details).await;

        // Re-authentication replaces the previous identity
        let previous = auth.ticket().await;
        auth.sign_in(ticket).await;
        if let Some(previous) = previous {
            if let Err(e) = self.tickets.remove(&previous.id).await {
                warn!("Failed to remove replaced ticket of {}: {}", previous.subject, e);
            }
        }

        info!("Signed in {} via {}", record.subject, record.login_provider);
        Ok(action_for(&record))
    }
}

fn action_for(record: &CaptureRecord) -> IdTokenAction {
    let forwarded: Parameters = record
        .fields
        .iter()
        .filter(|(name, _)| ID_TOKEN_RESPONSE_FIELDS.contains(name))
        .flat_map(|(name, values)| values.iter().map(move |value| (name, value.as_str())))
        .collect();

    match record.response_mode {
        ResponseMode::Redirect => IdTokenAction::Redirect(record.return_to.clone()),
        ResponseMode::Query => {
            let separator = if record.return_to.contains('?') { '&' } else { '?' };
            IdTokenAction::Redirect(format!(
                "{}{}{}",
                record.return_to,
                separator,
                forwarded.to_query_string()
            ))
        }
        ResponseMode::FormPost => IdTokenAction::FormPost {
            action: record.return_to.clone(),
            fields: forwarded,
        },
    }
}
