//! A single conversation's mutable state.

use crate::persist::SessionRecord;
use chrono::{DateTime, Utc};
use parlor_types::Message;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Default cap on retained messages per session.
pub const DEFAULT_MAX_HISTORY: usize = 100;

/// One conversation: its ordered history plus per-session overrides.
///
/// Every method takes the session lock for its full duration and never does
/// I/O while holding it. Share it as `Arc<Session>`.
#[derive(Debug)]
pub struct Session {
    key: String,
    created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
}

#[derive(Debug, Clone)]
struct SessionState {
    messages: Vec<Message>,
    max_history: usize,
    updated_at: DateTime<Utc>,
    model: Option<String>,
    profile: Option<String>,
    tts: Option<bool>,
    /// Bumped on every history mutation.
    revision: u64,
}

impl SessionState {
    fn empty(max_history: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_history: max_history.max(1),
            updated_at: Utc::now(),
            model: None,
            profile: None,
            tts: None,
            revision: 0,
        }
    }

    fn enforce_cap(&mut self) {
        if self.messages.len() > self.max_history {
            let excess = self.messages.len() - self.max_history;
            self.messages.drain(..excess);
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.revision += 1;
    }
}

impl Session {
    /// Create an empty session. A `max_history` of zero is raised to one.
    pub fn new(key: impl Into<String>, max_history: usize) -> Self {
        Self {
            key: key.into(),
            created_at: Utc::now(),
            state: Mutex::new(SessionState::empty(max_history)),
        }
    }

    /// Rebuild a session from a persisted record. The cap applies to the
    /// restored history as well.
    pub fn restore(key: impl Into<String>, record: SessionRecord, max_history: usize) -> Self {
        let mut state = SessionState::empty(max_history);
        state.messages = record.messages;
        state.model = record.model;
        state.profile = record.profile;
        state.enforce_cap();
        Self {
            key: key.into(),
            created_at: Utc::now(),
            state: Mutex::new(state),
        }
    }

    /// Deep copy of this session under a new key.
    ///
    /// Messages and overrides are copied under this session's lock; the two
    /// sessions share nothing afterwards.
    pub fn fork(&self, key: impl Into<String>) -> Self {
        let mut state = self.lock().clone();
        state.updated_at = Utc::now();
        state.revision = 0;
        Self {
            key: key.into(),
            created_at: Utc::now(),
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.lock().updated_at
    }

    /// Append a message, dropping the oldest ones beyond `max_history`.
    pub fn add_message(&self, message: Message) {
        let mut state = self.lock();
        state.messages.push(message);
        state.touch();
        state.enforce_cap();
    }

    /// The newest `n` messages (fewer if the history is shorter), newest last.
    pub fn get_history(&self, n: usize) -> Vec<Message> {
        let state = self.lock();
        let start = state.messages.len().saturating_sub(n);
        state.messages[start..].to_vec()
    }

    pub fn get_all_messages(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    /// Replace the entire history. Callers pass the complete sequence.
    pub fn replace_history(&self, messages: Vec<Message>) {
        let mut state = self.lock();
        state.messages = messages;
        state.touch();
    }

    /// Replace the history only if it has not changed since `revision` was
    /// read. Returns whether the replacement was applied.
    pub fn replace_history_if(&self, revision: u64, messages: Vec<Message>) -> bool {
        let mut state = self.lock();
        if state.revision != revision {
            return false;
        }
        state.messages = messages;
        state.touch();
        true
    }

    /// History together with the revision it was read at.
    pub fn messages_with_revision(&self) -> (Vec<Message>, u64) {
        let state = self.lock();
        (state.messages.clone(), state.revision)
    }

    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    /// Empty the history and reset the model override. Profile and TTS
    /// overrides are kept.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.messages.clear();
        state.model = None;
        state.touch();
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().messages.is_empty()
    }

    pub fn max_history(&self) -> usize {
        self.lock().max_history
    }

    /// Change the cap; an over-long history is trimmed immediately.
    pub fn set_max_history(&self, max_history: usize) {
        let mut state = self.lock();
        state.max_history = max_history.max(1);
        let before = state.messages.len();
        state.enforce_cap();
        if state.messages.len() != before {
            state.touch();
        }
    }

    /// Set or clear (`None`) the model override.
    pub fn set_model(&self, model: Option<String>) {
        let mut state = self.lock();
        state.model = model;
        state.updated_at = Utc::now();
    }

    pub fn model(&self) -> Option<String> {
        self.lock().model.clone()
    }

    /// Set or clear (`None`) the personality profile override.
    pub fn set_profile(&self, profile: Option<String>) {
        let mut state = self.lock();
        state.profile = profile;
        state.updated_at = Utc::now();
    }

    pub fn profile(&self) -> Option<String> {
        self.lock().profile.clone()
    }

    /// Set or clear (`None`, inherit global) the text-to-speech preference.
    pub fn set_tts(&self, tts: Option<bool>) {
        let mut state = self.lock();
        state.tts = tts;
        state.updated_at = Utc::now();
    }

    /// `None` means inherit the global setting.
    pub fn tts(&self) -> Option<bool> {
        self.lock().tts
    }

    /// Copy of everything the persister stores.
    pub fn snapshot(&self) -> SessionRecord {
        self.snapshot_with(|| ()).0
    }

    /// [`snapshot`](Self::snapshot), also running `f` while the lock is held
    /// so its result is ordered with the copy.
    pub(crate) fn snapshot_with<T>(&self, f: impl FnOnce() -> T) -> (SessionRecord, T) {
        let state = self.lock();
        let record = SessionRecord {
            messages: state.messages.clone(),
            model: state.model.clone(),
            profile: state.profile.clone(),
        };
        (record, f())
    }
}
