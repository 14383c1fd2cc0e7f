//! Cookie authentication
//!
//! [`AuthContext`] is the per-request view of who is signed in. Handlers and
//! the signin manager record sign-in / sign-out on it; the authentication
//! middleware turns those changes into `Set-Cookie` headers.

pub mod cookie;
pub mod signin;
pub mod ticket;

pub use cookie::CookiePolicy;
pub use signin::{SigninManager, TicketSigninManager};
pub use ticket::{AuthTicket, TicketStore};

use std::sync::Arc;
use tokio::sync::Mutex;

/// Pending change to the authentication cookie
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieChange {
    /// Issue (or re-issue) the cookie for this ticket id
    Issue(String),
    Expire,
}

#[derive(Debug, Default)]
struct AuthState {
    ticket: Option<AuthTicket>,
    change: Option<CookieChange>,
}

#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    state: Arc<Mutex<AuthState>>,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn authenticated(ticket: AuthTicket) -> Self {
        Self {
            state: Arc::new(Mutex::new(AuthState {
                ticket: Some(ticket),
                change: None,
            })),
        }
    }

    pub async fn ticket(&self) -> Option<AuthTicket> {
        self.state.lock().await.ticket.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state.lock().await.ticket.is_some()
    }

    /// Adopt `ticket` as the current identity and issue its cookie
    pub async fn sign_in(&self, ticket: AuthTicket) {
        let mut state = self.state.lock().await;
        state.change = Some(CookieChange::Issue(ticket.id.clone()));
        state.ticket = Some(ticket);
    }

    /// Drop the current identity and expire the cookie
    pub async fn sign_out(&self) -> Option<AuthTicket> {
        let mut state = self.state.lock().await;
        state.change = Some(CookieChange::Expire);
        state.ticket.take()
    }

    /// Request a cookie change without touching the identity
    pub(crate) async fn record_change(&self, change: CookieChange) {
        self.state.lock().await.change = Some(change);
    }

    pub(crate) async fn take_change(&self) -> Option<CookieChange> {
        self.state.lock().await.change.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sign_in_then_out() {
        let auth = AuthContext::anonymous();
        assert!(!auth.is_authenticated().await);

        let ticket = AuthTicket::new("alice", "oidc", SessionId::generate(), Duration::from_secs(60));
        auth.sign_in(ticket.clone()).await;
        assert!(auth.is_authenticated().await);
        assert_eq!(auth.take_change().await, Some(CookieChange::Issue(ticket.id.clone())));
        assert_eq!(auth.take_change().await, None);

        assert_eq!(auth.sign_out().await, Some(ticket));
        assert!(!auth.is_authenticated().await);
        assert_eq!(auth.take_change().await, Some(CookieChange::Expire));
    }
}
