//! Provider callback handling
//!
//! Turns the fields the provider sends to the redirect URL into a stored
//! capture record: checks the pending authorization's `state`, redeems the
//! authorization code, checks the id token `nonce` and issuer, then hands the merged
//! response to [`ResponseCapture`].

use super::{
    CaptureRecord, CorrelationKey, IdTokenClaims, OidcProvider, ResponseCapture,
    PENDING_AUTHORIZATION,
};
use crate::error::{PipelineError, Result};
use crate::params::{Parameters, SENSITIVE_FIELDS};
use crate::session::Session;
use chrono::Utc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// Response stored; redeem with this key
    Captured(CorrelationKey),
    /// The provider refused the authorization
    Denied(String),
}

pub async fn capture_callback(
    provider: &OidcProvider,
    capture: &ResponseCapture,
    session: &Session,
    callback: Parameters,
) -> Result<CallbackOutcome> {
    debug!(
        "Provider callback: {:?}",
        callback.to_scrubbed_dictionary(SENSITIVE_FIELDS)
    );

    if let Some(error) = callback.get("error") {
        let description = callback
            .get("error_description")
            .unwrap_or("No description provided");
        warn!("Provider returned error: {} - {}", error, description);
        session.remove(&PENDING_AUTHORIZATION).await;
        return Ok(CallbackOutcome::Denied(format!("{} - {}", error, description)));
    }

    let pending = session
        .get(&PENDING_AUTHORIZATION)
        .await?
        .ok_or_else(|| PipelineError::Callback("No authorization in progress".to_string()))?;

    if callback.get("state") != Some(pending.state.as_str()) {
        return Err(PipelineError::Auth(
            "State mismatch - possible CSRF attack".to_string(),
        ));
    }

    // The state is single-use from here on
    session.remove(&PENDING_AUTHORIZATION).await;

    let code = callback
        .get("code")
        .ok_or_else(|| PipelineError::Callback("Missing code parameter in callback".to_string()))?;

    let tokens = provider.exchange_code(code, &pending.code_verifier).await?;

    let mut fields = callback.clone();
    fields.remove("code");
    fields.merge(&tokens);

    let id_token = fields
        .get("id_token")
        .ok_or_else(|| PipelineError::Token("Token response carried no id_token".to_string()))?;
    let claims = IdTokenClaims::from_jwt(id_token)?;

    if claims.nonce.as_deref() != Some(pending.nonce.as_str()) {
        return Err(PipelineError::Auth("Nonce mismatch in id_token".to_string()));
    }

    let issuer = &provider.metadata().await?.issuer;
    if claims.iss.as_deref().map(|iss| iss.trim_end_matches('/'))
        != Some(issuer.trim_end_matches('/'))
    {
        warn!(
            "id_token issuer {:?} does not match {}",
            claims.iss, issuer
        );
        return Err(PipelineError::Auth("Issuer mismatch in id_token".to_string()));
    }

    let record = CaptureRecord {
        login_provider: provider.name().to_string(),
        subject: claims.sub,
        session_id: session.session_id().await,
        fields,
        return_to: pending.return_to,
        response_mode: pending.response_mode,
        captured_at: Utc::now(),
    };

    let key = capture.capture(&record).await?;
    Ok(CallbackOutcome::Captured(key))
}
