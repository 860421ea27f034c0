//! Integration tests for write-through persistence and restart recovery.
//!
//! Covers the JSON file persister end to end, the fallback path for a
//! persister without profile support, and that persistence failures never
//! disturb in-memory state.

use parlor_session::{
    JsonFilePersister, PersistFuture, Persister, SessionError, SessionRecord, SessionStore,
};
use parlor_types::Message;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// MemoryPersister
// ---------------------------------------------------------------------------

/// A persister without profile support that records every call.
#[derive(Default)]
struct MemoryPersister {
    records: Mutex<HashMap<String, SessionRecord>>,
    deletes: Mutex<Vec<String>>,
    fail: bool,
}

impl MemoryPersister {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn record(&self, key: &str) -> Option<SessionRecord> {
        self.records.lock().unwrap().get(key).cloned()
    }
}

impl Persister for MemoryPersister {
    fn save<'a>(
        &'a self,
        key: &'a str,
        messages: &'a [Message],
        model: Option<&'a str>,
    ) -> PersistFuture<'a, ()> {
        Box::pin(async move {
            if self.fail {
                return Err(SessionError::Persistence("disk full".into()));
            }
            self.records.lock().unwrap().insert(
                key.to_string(),
                SessionRecord {
                    messages: messages.to_vec(),
                    model: model.map(str::to_string),
                    profile: None,
                },
            );
            Ok(())
        })
    }

    fn load<'a>(&'a self, key: &'a str) -> PersistFuture<'a, SessionRecord> {
        Box::pin(async move {
            self.record(key).ok_or_else(|| SessionError::NotFound {
                key: key.to_string(),
            })
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> PersistFuture<'a, ()> {
        Box::pin(async move {
            self.deletes.lock().unwrap().push(key.to_string());
            if self.fail {
                return Err(SessionError::Persistence("disk full".into()));
            }
            self.records.lock().unwrap().remove(key);
            Ok(())
        })
    }

    fn list_keys(&self) -> PersistFuture<'_, Vec<String>> {
        Box::pin(async move {
            if self.fail {
                return Err(SessionError::Persistence("disk full".into()));
            }
            Ok(self.records.lock().unwrap().keys().cloned().collect())
        })
    }
}

async fn file_store(dir: &TempDir) -> SessionStore {
    let persister = JsonFilePersister::new(dir.path()).await.unwrap();
    SessionStore::new().with_persister(Arc::new(persister))
}

#[tokio::test]
async fn sessions_survive_restart_with_overrides() {
    let tmp = TempDir::new().unwrap();

    let store = file_store(&tmp).await;
    let session = store.get_or_create("telegram", "123");
    session.set_model(Some("large".into()));
    session.set_profile(Some("pirate".into()));
    store.add_message_and_persist(&session, Message::user("What's the weather?"));
    store.add_message_and_persist(&session, Message::bot("Sunny."));
    let fork = store.fork("telegram", "123", "plan-b").unwrap();
    store.persist(&fork);
    store.flush().await;

    let restarted = file_store(&tmp).await;
    assert_eq!(restarted.restore().await.unwrap(), 2);

    let loaded = restarted.get("telegram", "123").unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded.get_all_messages()[1].text, "Sunny.");
    assert!(loaded.get_all_messages()[1].from_bot);
    assert_eq!(loaded.model().as_deref(), Some("large"));
    assert_eq!(loaded.profile().as_deref(), Some("pirate"));

    let names: Vec<_> = restarted
        .list_user_sessions("telegram", "123")
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["main", "plan-b"]);
}

#[tokio::test]
async fn restore_does_not_replace_live_sessions() {
    let tmp = TempDir::new().unwrap();
    let store = file_store(&tmp).await;
    let session = store.get_or_create("t", "1");
    store.add_message_and_persist(&session, Message::user("persisted"));
    store.flush().await;

    session.add_message(Message::user("only in memory"));
    assert_eq!(store.restore().await.unwrap(), 0);
    assert_eq!(store.get("t", "1").unwrap().len(), 2);
}

#[tokio::test]
async fn delete_removes_persisted_copy() {
    let tmp = TempDir::new().unwrap();
    let store = file_store(&tmp).await;
    let session = store.get_or_create("t", "1");
    store.add_message_and_persist(&session, Message::user("bye"));
    store.flush().await;

    store.delete("t", "1");
    store.flush().await;

    let restarted = file_store(&tmp).await;
    assert_eq!(restarted.restore().await.unwrap(), 0);
    assert!(restarted.is_empty());
}

#[tokio::test]
async fn basic_persister_receives_model_but_no_profile() {
    let persister = Arc::new(MemoryPersister::default());
    let store = SessionStore::new().with_persister(Arc::clone(&persister) as Arc<dyn Persister>);

    let session = store.get_or_create("discord", "9");
    session.set_model(Some("small".into()));
    session.set_profile(Some("formal".into()));
    store.add_message_and_persist(&session, Message::user("hi"));
    store.flush().await;

    let record = persister.record("discord:9").unwrap();
    assert_eq!(record.messages.len(), 1);
    assert_eq!(record.model.as_deref(), Some("small"));
    assert_eq!(record.profile, None);

    store.clear_and_persist("discord", "9");
    store.flush().await;
    assert_eq!(*persister.deletes.lock().unwrap(), vec!["discord:9"]);
    assert!(persister.record("discord:9").is_none());
}

#[tokio::test]
async fn persistence_failures_leave_memory_authoritative() {
    let persister = Arc::new(MemoryPersister::failing());
    let store = SessionStore::new().with_persister(persister as Arc<dyn Persister>);

    let session = store.get_or_create("t", "1");
    store.add_message_and_persist(&session, Message::user("kept"));
    store.flush().await;
    assert_eq!(session.len(), 1);
    assert_eq!(store.get("t", "1").unwrap().len(), 1);

    assert!(store.delete("t", "1"));
    store.flush().await;
    assert!(store.get("t", "1").is_none());

    assert!(matches!(
        store.restore().await,
        Err(SessionError::Persistence(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_respect_history_cap() {
    let store = Arc::new(SessionStore::new().with_max_history(50));
    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..200 {
        let store = Arc::clone(&store);
        tasks.spawn(async move {
            let session = store.get_or_create("telegram", "busy");
            session.add_message(Message::user(format!("m{i}")));
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }
    let session = store.get("telegram", "busy").unwrap();
    assert_eq!(session.len(), 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn latest_snapshot_wins_on_disk() {
    let tmp = TempDir::new().unwrap();
    let store = file_store(&tmp).await;
    let session = store.get_or_create("t", "1");
    for i in 0..30 {
        store.add_message_and_persist(&session, Message::user(format!("m{i}")));
    }
    store.flush().await;

    let restarted = file_store(&tmp).await;
    assert_eq!(restarted.restore().await.unwrap(), 1);
    let loaded = restarted.get("t", "1").unwrap();
    assert_eq!(loaded.len(), 30);
    assert_eq!(loaded.get_all_messages()[29].text, "m29");
}

#[tokio::test]
async fn save_after_delete_is_not_resurrected() {
    let persister = Arc::new(MemoryPersister::default());
    let store = SessionStore::new().with_persister(Arc::clone(&persister) as Arc<dyn Persister>);

    let session = store.get_or_create("t", "1");
    store.add_message_and_persist(&session, Message::user("one"));
    store.delete("t", "1");
    store.flush().await;

    assert!(persister.record("t:1").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_persists_leave_newest_snapshot() {
    for _ in 0..20 {
        let persister = Arc::new(MemoryPersister::default());
        let store = Arc::new(
            SessionStore::new()
                .with_max_history(1000)
                .with_persister(Arc::clone(&persister) as Arc<dyn Persister>),
        );
        let session = store.get_or_create("t", "1");

        let mut tasks = tokio::task::JoinSet::new();
        for writer in 0..8 {
            let store = Arc::clone(&store);
            let session = Arc::clone(&session);
            tasks.spawn(async move {
                for i in 0..50 {
                    store.add_message_and_persist(&session, Message::user(format!("{writer}-{i}")));
                }
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }
        store.flush().await;

        let record = persister.record("t:1").unwrap();
        assert_eq!(record.messages.len(), 400);
        assert_eq!(record.messages, session.get_all_messages());
    }
}
