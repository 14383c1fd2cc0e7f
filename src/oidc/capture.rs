//! One-time storage of captured provider responses
//!
//! A capture record is stored under a fresh correlation key and can be
//! redeemed once. Redemption with `delete` goes through [`Cache::take`], so
//! concurrent attempts on the same key yield exactly one record.

use super::ResponseMode;
use crate::cache::Cache;
use crate::error::{PipelineError, Result};
use crate::params::{Parameters, SENSITIVE_FIELDS};
use crate::random::urlsafe_token;
use crate::serializer::{JsonSerializer, Serializer};
use crate::session::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const CAPTURE_PREFIX: &str = "oidc-capture:";

/// Single-use key linking a provider callback to its stored response
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey(String);

impl CorrelationKey {
    pub fn generate() -> Self {
        Self(urlsafe_token(32))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Provider response awaiting redemption
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub login_provider: String,
    /// `sub` claim of the id token
    pub subject: String,
    /// Session the sign-in was started from
    pub session_id: SessionId,
    pub fields: Parameters,
    pub return_to: String,
    pub response_mode: ResponseMode,
    pub captured_at: DateTime<Utc>,
}

pub struct ResponseCapture {
    cache: Arc<dyn Cache>,
    ttl: Duration,
}

impl ResponseCapture {
    pub fn new(cache: Arc<dyn Cache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store `record` under a fresh key
    pub async fn capture(&self, record: &CaptureRecord) -> Result<CorrelationKey> {
        let key = CorrelationKey::generate();
        let text = JsonSerializer.serialize(record, false)?;
        self.cache.set(&capture_key(&key), text, self.ttl).await?;

        info!(
            "Captured {} response for session {} (expires in {}s)",
            record.login_provider,
            record.session_id,
            self.ttl.as_secs()
        );
        debug!(
            "Captured fields: {:?}",
            record.fields.to_scrubbed_dictionary(SENSITIVE_FIELDS)
        );
        Ok(key)
    }

    /// Look up a record; with `delete` it is consumed and cannot be redeemed again
    pub async fn redeem(&self, key: &CorrelationKey, delete: bool) -> Result<CaptureRecord> {
        let cache_key = capture_key(key);
        let text = if delete {
            self.cache.take(&cache_key).await?
        } else {
            self.cache.get(&cache_key).await?
        };

        let text = text.ok_or(PipelineError::CaptureNotFound)?;
        JsonSerializer.deserialize(&text)
    }
}

fn capture_key(key: &CorrelationKey) -> String {
    format!("{}{}", CAPTURE_PREFIX, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    fn record(session_id: SessionId) -> CaptureRecord {
        CaptureRecord {
            login_provider: "oidc".to_string(),
            subject: "alice".to_string(),
            session_id,
            fields: vec![("id_token", "a.b.c"), ("state", "s")].into_iter().collect(),
            return_to: "/".to_string(),
            response_mode: ResponseMode::Redirect,
            captured_at: Utc::now(),
        }
    }

    fn capture() -> ResponseCapture {
        ResponseCapture::new(Arc::new(MemoryCache::new()), Duration::from_secs(300))
    }

    #[tokio::test]
    async fn test_redeem_exactly_once() {
        let capture = capture();
        let stored = record(SessionId::generate());
        let key = capture.capture(&stored).await.unwrap();

        assert_eq!(capture.redeem(&key, true).await.unwrap(), stored);
        assert!(matches!(
            capture.redeem(&key, true).await,
            Err(PipelineError::CaptureNotFound)
        ));
        assert!(matches!(
            capture.redeem(&key, false).await,
            Err(PipelineError::CaptureNotFound)
        ));
    }

    #[tokio::test]
    async fn test_redeem_without_delete_keeps_record() {
        let capture = capture();
        let stored = record(SessionId::generate());
        let key = capture.capture(&stored).await.unwrap();

        assert_eq!(capture.redeem(&key, false).await.unwrap(), stored);
        assert_eq!(capture.redeem(&key, true).await.unwrap(), stored);
        assert!(capture.redeem(&key, true).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_and_expired_keys() {
        let capture = ResponseCapture::new(Arc::new(MemoryCache::new()), Duration::from_millis(20));
        assert!(matches!(
            capture.redeem(&CorrelationKey::from("nope"), true).await,
            Err(PipelineError::CaptureNotFound)
        ));

        let key = capture.capture(&record(SessionId::generate())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(
            capture.redeem(&key, true).await,
            Err(PipelineError::CaptureNotFound)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_redemption_has_one_winner() {
        let capture = Arc::new(capture());
        let key = capture.capture(&record(SessionId::generate())).await.unwrap();

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let capture = capture.clone();
                let key = key.clone();
                tokio::spawn(async move { capture.redeem(&key, true).await })
            })
            .collect();

        let mut successes = 0;
        let mut not_found = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => successes += 1,
                Err(PipelineError::CaptureNotFound) => not_found += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(not_found, 7);
    }

    #[test]
    fn test_keys_are_unique() {
        assert_ne!(CorrelationKey::generate(), CorrelationKey::generate());
    }
}
