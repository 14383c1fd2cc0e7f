//! Typed get/set over a string-keyed session
//!
//! A `Session` is the per-request view of one client's session. Values are
//! stored as serialized text under names declared with [`SessionKey`], so the
//! expected type of every entry is fixed at the declaration site.
//!
//! The session identifier is materialized lazily: a session that never stores
//! anything never gets an identifier (and no cookie is issued for it).
//!
//! Each request records the entries it sets or removes. Only those changes are
//! written back, one request at a time per session (see [`SessionLocks`]), so
//! concurrent requests on the same session never overwrite each other's entries.

use crate::error::Result;
use crate::random::urlsafe_token;
use crate::serializer::{JsonSerializer, Serializer};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Marker value written by [`Session::session_id`] to force materialization
const ENSURE_MARKER: &str = "ensure";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(urlsafe_token(32))
    }

    /// Accept an identifier read back from a cookie
    pub fn parse(value: &str) -> Option<Self> {
        let valid = !value.is_empty()
            && value.len() <= 128
            && value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a session entry together with the type stored under it
pub struct SessionKey<T> {
    name: &'static str,
    _type: PhantomData<fn() -> T>,
}

impl<T> SessionKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _type: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for SessionKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SessionKey<T> {}

impl<T> fmt::Debug for SessionKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SessionKey").field(&self.name).finish()
    }
}

#[derive(Debug, Default)]
struct SessionState {
    id: Option<SessionId>,
    entries: HashMap<String, String>,
    /// Entries set (`Some`) or removed (`None`) during this request
    changes: HashMap<String, Option<String>>,
    /// Identifier was created during this request
    created: bool,
}

impl SessionState {
    fn materialize(&mut self) -> SessionId {
        match &self.id {
            Some(id) => id.clone(),
            None => {
                let id = SessionId::generate();
                self.id = Some(id.clone());
                self.created = true;
                id
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct SessionSnapshot {
    pub id: SessionId,
    pub changes: HashMap<String, Option<String>>,
    pub created: bool,
    pub modified: bool,
}

impl SessionSnapshot {
    /// Replay this request's changes onto the stored entries
    pub fn apply(&self, entries: &mut HashMap<String, String>) {
        for (name, change) in &self.changes {
            match change {
                Some(value) => {
                    entries.insert(name.clone(), value.clone());
                }
                None => {
                    entries.remove(name);
                }
            }
        }
    }
}

/// Per-request session handle; clones share state
#[derive(Debug, Clone, Default)]
pub struct Session {
    state: Arc<Mutex<SessionState>>,
}

impl Session {
    /// A session with no identifier yet
    pub fn new() -> Self {
        Self::default()
    }

    /// A session loaded from the backing store
    pub fn existing(id: SessionId, entries: HashMap<String, String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SessionState {
                id: Some(id),
                entries,
                changes: HashMap::new(),
                created: false,
            })),
        }
    }

    /// Whether an identifier exists for this session
    pub async fn is_available(&self) -> bool {
        self.state.lock().await.id.is_some()
    }

    pub async fn id(&self) -> Option<SessionId> {
        self.state.lock().await.id.clone()
    }

    pub async fn get_string(&self, name: &str) -> Option<String> {
        self.state.lock().await.entries.get(name).cloned()
    }

    /// Store raw text, materializing the identifier if needed
    pub async fn set_string(&self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let mut state = self.state.lock().await;
        state.materialize();
        state.entries.insert(name.to_string(), value.clone());
        state.changes.insert(name.to_string(), Some(value));
    }

    pub async fn remove_string(&self, name: &str) -> Option<String> {
        let mut state = self.state.lock().await;
        let removed = state.entries.remove(name);
        if removed.is_some() {
            state.changes.insert(name.to_string(), None);
        }
        removed
    }

    /// Deserialize the entry for `key`; `None` if it was never set
    pub async fn get<T: DeserializeOwned>(&self, key: &SessionKey<T>) -> Result<Option<T>> {
        match self.get_string(key.name()).await {
            Some(text) => Ok(Some(JsonSerializer.deserialize(&text)?)),
            None => Ok(None),
        }
    }

    /// Like [`Session::get`], falling back to `T::default()`
    pub async fn get_or_default<T: DeserializeOwned + Default>(
        &self,
        key: &SessionKey<T>,
    ) -> Result<T> {
        Ok(self.get(key).await?.unwrap_or_default())
    }

    pub async fn set<T: Serialize>(&self, key: &SessionKey<T>, value: &T) -> Result<()> {
        let text = JsonSerializer.serialize(value, false)?;
        self.set_string(key.name(), text).await;
        Ok(())
    }

    pub async fn remove<T>(&self, key: &SessionKey<T>) {
        self.remove_string(key.name()).await;
    }

    /// The session identifier, created on first use.
    ///
    /// A fresh session is forced into existence by writing a throwaway
    /// marker entry, so the returned identifier is stable for the rest of
    /// the session even if nothing else is stored.
    pub async fn session_id(&self) -> SessionId {
        let mut state = self.state.lock().await;
        if let Some(id) = &state.id {
            return id.clone();
        }
        let id = state.materialize();
        let marker = urlsafe_token(16);
        state.entries.insert(marker.clone(), ENSURE_MARKER.to_string());
        state
            .changes
            .insert(marker, Some(ENSURE_MARKER.to_string()));
        id
    }

    /// State to persist after the request; `None` if no identifier exists
    pub(crate) async fn snapshot(&self) -> Option<SessionSnapshot> {
        let state = self.state.lock().await;
        Some(SessionSnapshot {
            id: state.id.clone()?,
            changes: state.changes.clone(),
            created: state.created,
            modified: !state.changes.is_empty(),
        })
    }
}

/// One write lock per live session identifier
#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<SessionId, Weak<Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive write access to the session `id`
    pub async fn lock(&self, id: &SessionId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.retain(|_, lock| lock.strong_count() > 0);
            match locks.get(id).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(Mutex::new(()));
                    locks.insert(id.clone(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }
}
