//! In-memory session registry with write-through persistence.

use crate::error::SessionError;
use crate::key::{fork_key, resolve_key, session_key, session_label, validate_fork_name};
use crate::persist::{Persister, PersisterHandle};
use crate::session::{DEFAULT_MAX_HISTORY, Session};
use parlor_types::Message;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use tokio_util::task::TaskTracker;

/// Registry change reported to the store's change hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created { key: String },
    Forked { base: String, key: String },
    Deleted { key: String },
    Cleared { key: String },
}

/// Callback invoked after registry changes, outside all locks.
pub type ChangeHook = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// One entry of [`SessionStore::list_user_sessions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    /// `"main"` for the base session, the fork name otherwise.
    pub name: String,
    pub key: String,
}

/// The single authority mapping session keys to live sessions.
///
/// The store lock guards only the key map. Once a caller holds an
/// `Arc<Session>` it works on the session without touching the store, so a
/// slow operation on one conversation never blocks another.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    max_history: usize,
    persister: Option<PersisterHandle>,
    on_change: Option<ChangeHook>,
    tasks: TaskTracker,
    order: Arc<WriteOrder>,
}

/// Orders background writes per key.
///
/// Every write takes a sequence number when it is submitted and runs under
/// its key's slot. A save takes its number under the session lock, together
/// with its snapshot, so numbers follow snapshot order. A write older than
/// the last one applied for the key is dropped: a stale snapshot never
/// overwrites a newer one and a delete is never undone by an earlier save.
/// A slot is removed once no submitted write refers to it.
#[derive(Default)]
struct WriteOrder {
    next: AtomicU64,
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<u64>>>>,
}

type Slots<'a> = MutexGuard<'a, HashMap<String, Arc<tokio::sync::Mutex<u64>>>>;

impl WriteOrder {
    fn slots(&self) -> Slots<'_> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ticket(self: &Arc<Self>, key: &str) -> Ticket {
        let seq = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        let slot = Arc::clone(self.slots().entry(key.to_string()).or_default());
        Ticket {
            order: Arc::clone(self),
            key: key.to_string(),
            seq,
            slot,
        }
    }

    fn release(&self, key: &str, slot: Arc<tokio::sync::Mutex<u64>>) {
        let mut slots = self.slots();
        let idle = slots
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, &slot) && Arc::strong_count(&slot) == 2);
        if idle {
            slots.remove(key);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots().len()
    }
}

/// A write's place in its key's order.
struct Ticket {
    order: Arc<WriteOrder>,
    key: String,
    seq: u64,
    slot: Arc<tokio::sync::Mutex<u64>>,
}

impl Ticket {
    async fn run<F>(self, op: &'static str, fut: F)
    where
        F: std::future::Future<Output = Result<(), SessionError>>,
    {
        {
            let mut applied = self.slot.lock().await;
            if *applied > self.seq {
                tracing::debug!(op, key = %self.key, "superseded write skipped");
            } else {
                if let Err(e) = fut.await {
                    tracing::warn!(op, key = %self.key, "Session persistence failed: {}", e);
                }
                *applied = self.seq;
            }
        }
        self.order.release(&self.key, self.slot);
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    /// A store with no persistence and the default history cap.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_history: DEFAULT_MAX_HISTORY,
            persister: None,
            on_change: None,
            tasks: TaskTracker::new(),
            order: Arc::default(),
        }
    }

    /// Cap applied to sessions created from now on.
    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    /// Install a persister. Its profile capability is resolved here, once.
    pub fn with_persister(mut self, persister: Arc<dyn Persister>) -> Self {
        self.persister = Some(PersisterHandle::new(persister));
        self
    }

    pub fn with_change_hook(mut self, hook: ChangeHook) -> Self {
        self.on_change = Some(hook);
        self
    }

    fn read_map(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_map(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, event: SessionEvent) {
        if let Some(hook) = &self.on_change {
            hook(&event);
        }
    }

    /// Return the session for `(channel, user)`, creating an empty one on
    /// first access.
    pub fn get_or_create(&self, channel: &str, user: &str) -> Arc<Session> {
        let key = session_key(channel, user);
        if let Some(session) = self.read_map().get(&key) {
            return Arc::clone(session);
        }

        let session = {
            let mut map = self.write_map();
            // Another task may have created it between the two locks.
            if let Some(session) = map.get(&key) {
                return Arc::clone(session);
            }
            let session = Arc::new(Session::new(key.clone(), self.max_history));
            map.insert(key.clone(), Arc::clone(&session));
            session
        };
        tracing::debug!(key = %key, "session created");
        self.notify(SessionEvent::Created { key });
        session
    }

    /// Look up the base session for `(channel, user)` without creating it.
    pub fn get(&self, channel: &str, user: &str) -> Option<Arc<Session>> {
        self.get_by_key(&session_key(channel, user))
    }

    pub fn get_by_key(&self, key: &str) -> Option<Arc<Session>> {
        self.read_map().get(key).cloned()
    }

    /// Remove the base session for `(channel, user)` and delete its persisted
    /// copy. Sessions already handed out keep working but are no longer
    /// reachable through the store. Returns whether an entry was removed.
    pub fn delete(&self, channel: &str, user: &str) -> bool {
        self.delete_key(&session_key(channel, user))
    }

    /// [`delete`](Self::delete) by full key; also used for forks.
    pub fn delete_key(&self, key: &str) -> bool {
        let removed = self.write_map().remove(key);
        self.spawn_delete(key);
        match removed {
            Some(_) => {
                tracing::debug!(key = %key, "session deleted");
                self.notify(SessionEvent::Deleted {
                    key: key.to_string(),
                });
                true
            }
            None => false,
        }
    }

    /// Reset a conversation: the live session is cleared in place (so holders
    /// see the reset), removed from the registry, and its persisted copy
    /// deleted.
    pub fn clear_and_persist(&self, channel: &str, user: &str) {
        let key = session_key(channel, user);
        let removed = self.write_map().remove(&key);
        if let Some(session) = &removed {
            session.clear();
        }
        self.spawn_delete(&key);
        if removed.is_some() {
            tracing::debug!(key = %key, "session cleared");
            self.notify(SessionEvent::Cleared { key });
        }
    }

    /// Create fork `name` of the base session of `(channel, user)`.
    ///
    /// The fork is a deep copy taken under the base session's lock. An
    /// existing fork with the same name is replaced.
    pub fn fork(&self, channel: &str, user: &str, name: &str) -> Result<Arc<Session>, SessionError> {
        validate_fork_name(name)?;
        let base_key = session_key(channel, user);
        let base = self
            .get_by_key(&base_key)
            .ok_or_else(|| SessionError::not_found(&base_key))?;

        let key = fork_key(&base_key, name);
        let forked = Arc::new(base.fork(key.clone()));
        if self
            .write_map()
            .insert(key.clone(), Arc::clone(&forked))
            .is_some()
        {
            tracing::debug!(key = %key, "existing fork replaced");
        }
        tracing::debug!(base = %base_key, key = %key, messages = forked.len(), "session forked");
        self.notify(SessionEvent::Forked {
            base: base_key,
            key,
        });
        Ok(forked)
    }

    /// Resolve `name` among the sessions of `(channel, user)`: `"main"` or
    /// empty is the base session, anything else a fork.
    pub fn switch_session(
        &self,
        channel: &str,
        user: &str,
        name: &str,
    ) -> Result<Arc<Session>, SessionError> {
        let key = resolve_key(&session_key(channel, user), name);
        self.get_by_key(&key)
            .ok_or_else(|| SessionError::not_found(key))
    }

    /// The base session and all forks of `(channel, user)`: main first, then
    /// forks by name.
    pub fn list_user_sessions(&self, channel: &str, user: &str) -> Vec<SessionEntry> {
        let base = session_key(channel, user);
        let mut entries: Vec<SessionEntry> = self
            .read_map()
            .keys()
            .filter_map(|key| {
                session_label(&base, key).map(|name| SessionEntry {
                    name: name.to_string(),
                    key: key.clone(),
                })
            })
            .collect();
        entries.sort_by(|a, b| (a.key != base, &a.name).cmp(&(b.key != base, &b.name)));
        entries
    }

    /// All live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.read_map().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_map().is_empty()
    }

    /// Save a snapshot of `session` in the background.
    ///
    /// Failures are logged; the in-memory session stays authoritative.
    pub fn persist(&self, session: &Session) {
        let Some(persister) = self.persister.clone() else {
            return;
        };
        let Some(handle) = runtime_handle("save", session.key()) else {
            return;
        };
        let (record, ticket) = session.snapshot_with(|| self.order.ticket(session.key()));
        let key = session.key().to_string();
        self.tasks.spawn_on(
            ticket.run("save", async move { persister.save(&key, &record).await }),
            &handle,
        );
    }

    /// Append a message and persist the result.
    pub fn add_message_and_persist(&self, session: &Session, message: Message) {
        session.add_message(message);
        self.persist(session);
    }

    /// Wait for all background persistence started so far.
    pub async fn flush(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Load every persisted session that is not already live. Keys that fail
    /// to load are logged and skipped. Returns how many were restored.
    pub async fn restore(&self) -> Result<usize, SessionError> {
        let Some(persister) = &self.persister else {
            return Ok(0);
        };
        let mut restored = 0;
        for key in persister.list_keys().await? {
            if self.get_by_key(&key).is_some() {
                continue;
            }
            let record = match persister.load(&key).await {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!("Failed to restore session {}: {}", key, e);
                    continue;
                }
            };
            let session = Arc::new(Session::restore(key.clone(), record, self.max_history));
            // A message may have created the session while we were loading.
            if let std::collections::hash_map::Entry::Vacant(slot) = self.write_map().entry(key) {
                slot.insert(session);
                restored += 1;
            }
        }
        tracing::debug!(restored, "sessions restored");
        Ok(restored)
    }

    fn spawn_delete(&self, key: &str) {
        let Some(persister) = self.persister.clone() else {
            return;
        };
        let Some(handle) = runtime_handle("delete", key) else {
            return;
        };
        let ticket = self.order.ticket(key);
        let key = key.to_string();
        self.tasks.spawn_on(
            ticket.run("delete", async move {
                match persister.delete(&key).await {
                    Err(SessionError::NotFound { .. }) => Ok(()),
                    other => other,
                }
            }),
            &handle,
        );
    }
}

fn runtime_handle(op: &'static str, key: &str) -> Option<tokio::runtime::Handle> {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Some(handle),
        Err(_) => {
            tracing::warn!(op, key = %key, "No async runtime; skipping session persistence");
            None
        }
    }
}
