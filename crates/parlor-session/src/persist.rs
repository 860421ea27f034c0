//! Persistence collaborator contracts.
//!
//! The in-memory store is authoritative; a persister is a write-through cache
//! used to recover sessions after a restart.

use crate::error::SessionError;
use parlor_types::Message;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by persister methods.
pub type PersistFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SessionError>> + Send + 'a>>;

/// What a persister stores for one session key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

/// Storage backend for session histories.
///
/// Uses boxed futures so the store can hold it as `Arc<dyn Persister>`.
pub trait Persister: Send + Sync {
    fn save<'a>(
        &'a self,
        key: &'a str,
        messages: &'a [Message],
        model: Option<&'a str>,
    ) -> PersistFuture<'a, ()>;

    /// Load a stored session. Fails with `NotFound` if the key is unknown.
    /// The returned record's `profile` is always `None`.
    fn load<'a>(&'a self, key: &'a str) -> PersistFuture<'a, SessionRecord>;

    fn delete<'a>(&'a self, key: &'a str) -> PersistFuture<'a, ()>;

    fn list_keys(&self) -> PersistFuture<'_, Vec<String>>;

    /// The profile-aware view of this persister, if it has one.
    ///
    /// The store calls this once when the persister is installed.
    fn profile_aware(self: Arc<Self>) -> Option<Arc<dyn ProfilePersister>> {
        None
    }
}

/// A persister that also stores the personality profile override.
pub trait ProfilePersister: Persister {
    fn save_with_profile<'a>(
        &'a self,
        key: &'a str,
        messages: &'a [Message],
        model: Option<&'a str>,
        profile: Option<&'a str>,
    ) -> PersistFuture<'a, ()>;

    fn load_with_profile<'a>(&'a self, key: &'a str) -> PersistFuture<'a, SessionRecord>;
}

/// A persister with its profile capability resolved up front.
#[derive(Clone)]
pub(crate) struct PersisterHandle {
    base: Arc<dyn Persister>,
    with_profile: Option<Arc<dyn ProfilePersister>>,
}

impl PersisterHandle {
    pub(crate) fn new(persister: Arc<dyn Persister>) -> Self {
        let with_profile = Arc::clone(&persister).profile_aware();
        tracing::debug!(
            profile_aware = with_profile.is_some(),
            "session persister installed"
        );
        Self {
            base: persister,
            with_profile,
        }
    }

    pub(crate) async fn save(&self, key: &str, record: &SessionRecord) -> Result<(), SessionError> {
        let model = record.model.as_deref();
        match &self.with_profile {
            Some(p) => {
                p.save_with_profile(key, &record.messages, model, record.profile.as_deref())
                    .await
            }
            None => self.base.save(key, &record.messages, model).await,
        }
    }

    pub(crate) async fn load(&self, key: &str) -> Result<SessionRecord, SessionError> {
        match &self.with_profile {
            Some(p) => p.load_with_profile(key).await,
            None => self.base.load(key).await,
        }
    }

    pub(crate) async fn delete(&self, key: &str) -> Result<(), SessionError> {
        self.base.delete(key).await
    }

    pub(crate) async fn list_keys(&self) -> Result<Vec<String>, SessionError> {
        self.base.list_keys().await
    }
}
