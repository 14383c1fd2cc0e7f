//! Authentication tickets
//!
//! The authentication cookie carries only a ticket id. The ticket itself,
//! with the claims it asserts, is kept in the cache.

use crate::cache::Cache;
use crate::error::Result;
use crate::random::urlsafe_token;
use crate::serializer::{JsonSerializer, Serializer};
use crate::session::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const TICKET_PREFIX: &str = "auth-ticket:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthTicket {
    pub id: String,
    pub subject: String,
    pub login_provider: String,
    /// Session this identity was established in
    pub session_id: SessionId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AuthTicket {
    pub fn new(
        subject: impl Into<String>,
        login_provider: impl Into<String>,
        session_id: SessionId,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: urlsafe_token(32),
            subject: subject.into(),
            login_provider: login_provider.into(),
            session_id,
            issued_at: now,
            expires_at: now + chrono_duration(ttl),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// More than half of `ttl` has passed since the ticket was last extended
    pub fn needs_renewal(&self, ttl: Duration) -> bool {
        let remaining = self.expires_at - Utc::now();
        remaining < chrono_duration(ttl) / 2
    }

    /// Slide the expiry to `ttl` from now
    pub fn renew(&mut self, ttl: Duration) {
        self.expires_at = Utc::now() + chrono_duration(ttl);
    }
}

fn chrono_duration(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::weeks(52))
}

/// Ticket persistence over the cache
#[derive(Clone)]
pub struct TicketStore {
    cache: Arc<dyn Cache>,
    ttl: Duration,
}

impl TicketStore {
    pub fn new(cache: Arc<dyn Cache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn load(&self, id: &str) -> Result<Option<AuthTicket>> {
        match self.cache.get(&ticket_key(id)).await? {
            Some(text) => {
                let ticket: AuthTicket = JsonSerializer.deserialize(&text)?;
                Ok((!ticket.is_expired()).then_some(ticket))
            }
            None => Ok(None),
        }
    }

    pub async fn save(&self, ticket: &AuthTicket) -> Result<()> {
        let text = JsonSerializer.serialize(ticket, false)?;
        self.cache.set(&ticket_key(&ticket.id), text, self.ttl).await
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.cache.remove(&ticket_key(id)).await
    }
}

fn ticket_key(id: &str) -> String {
    format!("{}{}", TICKET_PREFIX, id)
}
