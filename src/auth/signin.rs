//! Sign-out behind a narrow capability trait
//!
//! Callers only see [`SigninManager`]; the backend that actually holds
//! identities can be swapped without touching them.

use super::{AuthContext, TicketStore};
use crate::error::Result;
use crate::oidc::SESSION_DETAILS;
use crate::session::Session;
use async_trait::async_trait;
use tracing::info;

#[async_trait]
pub trait SigninManager: Send + Sync {
    /// Invalidate the identity bound to the current request
    async fn sign_out(&self, auth: &AuthContext, session: &Session) -> Result<()>;
}

/// Backend for cache-held authentication tickets
#[derive(Clone)]
pub struct TicketSigninManager {
    tickets: TicketStore,
}

impl TicketSigninManager {
    pub fn new(tickets: TicketStore) -> Self {
        Self { tickets }
    }
}

#[async_trait]
impl SigninManager for TicketSigninManager {
    async fn sign_out(&self, auth: &AuthContext, session: &Session) -> Result<()> {
        if let Some(ticket) = auth.sign_out().await {
            self.tickets.remove(&ticket.id).await?;
            info!(
                "Signed out {} ({})",
                ticket.subject, ticket.login_provider
            );
        }
        session.remove(&SESSION_DETAILS).await;
        Ok(())
    }
}
