//! Persister backed by one JSON file per session key.

use crate::error::SessionError;
use crate::persist::{PersistFuture, Persister, ProfilePersister, SessionRecord};
use chrono::{DateTime, Utc};
use parlor_types::Message;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// On-disk layout of a session file.
#[derive(Debug, Serialize, Deserialize)]
struct StoredSession {
    key: String,
    saved_at: DateTime<Utc>,
    #[serde(flatten)]
    record: SessionRecord,
}

/// File-based persister. Each key is a JSON file in `sessions_dir`.
pub struct JsonFilePersister {
    sessions_dir: PathBuf,
}

impl JsonFilePersister {
    /// Create a persister, ensuring `<data_dir>/sessions` exists.
    pub async fn new(data_dir: impl AsRef<Path>) -> Result<Self, SessionError> {
        let sessions_dir = data_dir.as_ref().join("sessions");
        tokio::fs::create_dir_all(&sessions_dir).await?;
        Ok(Self { sessions_dir })
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    /// Write a compaction archive as a markdown file next to the session.
    pub async fn write_compaction_archive(
        &self,
        key: &str,
        markdown: &str,
    ) -> Result<PathBuf, SessionError> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let filename = format!("{}-compact-{stamp}.md", urlencoding::encode(key));
        let path = self.sessions_dir.join(filename);
        tokio::fs::write(&path, markdown).await?;
        Ok(path)
    }

    fn session_path(&self, key: &str) -> PathBuf {
        self.sessions_dir.join(format!("{}.json", urlencoding::encode(key)))
    }

    async fn read(&self, key: &str) -> Result<SessionRecord, SessionError> {
        let path = self.session_path(key);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SessionError::not_found(key));
            }
            Err(e) => return Err(e.into()),
        };
        let stored: StoredSession = serde_json::from_str(&data)?;
        Ok(stored.record)
    }

    /// Atomic write: `.tmp` then rename.
    async fn write(&self, key: &str, record: SessionRecord) -> Result<(), SessionError> {
        let path = self.session_path(key);
        let tmp_path = path.with_extension("tmp");
        let stored = StoredSession {
            key: key.to_string(),
            saved_at: Utc::now(),
            record,
        };
        let json = serde_json::to_string_pretty(&stored)?;
        tokio::fs::write(&tmp_path, json).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }
}

impl Persister for JsonFilePersister {
    fn save<'a>(
        &'a self,
        key: &'a str,
        messages: &'a [Message],
        model: Option<&'a str>,
    ) -> PersistFuture<'a, ()> {
        Box::pin(async move {
            // A plain save must not wipe a profile written earlier.
            let profile = self.read(key).await.ok().and_then(|r| r.profile);
            let record = SessionRecord {
                messages: messages.to_vec(),
                model: model.map(str::to_string),
                profile,
            };
            self.write(key, record).await
        })
    }

    fn load<'a>(&'a self, key: &'a str) -> PersistFuture<'a, SessionRecord> {
        Box::pin(async move {
            let mut record = self.read(key).await?;
            record.profile = None;
            Ok(record)
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> PersistFuture<'a, ()> {
        Box::pin(async move {
            match tokio::fs::remove_file(self.session_path(key)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(SessionError::not_found(key))
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    fn list_keys(&self) -> PersistFuture<'_, Vec<String>> {
        Box::pin(async move {
            let mut keys = Vec::new();
            let mut entries = tokio::fs::read_dir(&self.sessions_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let name_str = name.to_string_lossy();
                let Some(stem) = name_str.strip_suffix(".json") else {
                    continue;
                };
                match urlencoding::decode(stem) {
                    Ok(key) => keys.push(key.into_owned()),
                    Err(_) => tracing::warn!("Skipping unrecognized session file {}", name_str),
                }
            }
            keys.sort();
            Ok(keys)
        })
    }

    fn profile_aware(self: Arc<Self>) -> Option<Arc<dyn ProfilePersister>> {
        Some(self)
    }
}

impl ProfilePersister for JsonFilePersister {
    fn save_with_profile<'a>(
        &'a self,
        key: &'a str,
        messages: &'a [Message],
        model: Option<&'a str>,
        profile: Option<&'a str>,
    ) -> PersistFuture<'a, ()> {
        Box::pin(async move {
            let record = SessionRecord {
                messages: messages.to_vec(),
                model: model.map(str::to_string),
                profile: profile.map(str::to_string),
            };
            self.write(key, record).await
        })
    }

    fn load_with_profile<'a>(&'a self, key: &'a str) -> PersistFuture<'a, SessionRecord> {
        Box::pin(self.read(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_persister() -> (JsonFilePersister, TempDir) {
        let tmp = TempDir::new().unwrap();
        let persister = JsonFilePersister::new(tmp.path()).await.unwrap();
        (persister, tmp)
    }

    #[tokio::test]
    async fn keys_are_percent_encoded_file_names() {
        let (persister, _tmp) = test_persister().await;
        let key = "telegram:123:draft one/\u{00e9}";
        persister.save(key, &[], None).await.unwrap();
        persister.save("telegram:123", &[], None).await.unwrap();

        assert!(persister.sessions_dir().join("telegram%3A123.json").exists());
        let mut keys = persister.list_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["telegram:123".to_string(), key.to_string()]);
    }

    #[tokio::test]
    async fn undecodable_file_names_are_skipped() {
        let (persister, _tmp) = test_persister().await;
        tokio::fs::write(persister.sessions_dir().join("bad%FF.json"), "{}")
            .await
            .unwrap();
        persister.save("t:1", &[], None).await.unwrap();
        assert_eq!(persister.list_keys().await.unwrap(), vec!["t:1"]);
    }

    #[tokio::test]
    async fn save_and_load() {
        let (persister, _tmp) = test_persister().await;
        let messages = vec![Message::user("Hello"), Message::bot("Hi")];
        persister
            .save("telegram:1", &messages, Some("small"))
            .await
            .unwrap();

        let loaded = persister.load("telegram:1").await.unwrap();
        assert_eq!(loaded.messages, messages);
        assert_eq!(loaded.model.as_deref(), Some("small"));
        assert!(loaded.profile.is_none());
    }

    #[tokio::test]
    async fn plain_save_keeps_existing_profile() {
        let (persister, _tmp) = test_persister().await;
        persister
            .save_with_profile("t:1", &[], None, Some("pirate"))
            .await
            .unwrap();
        persister
            .save("t:1", &[Message::user("x")], None)
            .await
            .unwrap();

        let loaded = persister.load_with_profile("t:1").await.unwrap();
        assert_eq!(loaded.profile.as_deref(), Some("pirate"));
        assert_eq!(loaded.messages.len(), 1);
    }

    #[tokio::test]
    async fn load_missing_returns_not_found() {
        let (persister, _tmp) = test_persister().await;
        let result = persister.load("nobody:0").await;
        assert!(matches!(result, Err(SessionError::NotFound { .. })));
    }

    #[tokio::test]
    async fn list_and_delete() {
        let (persister, _tmp) = test_persister().await;
        persister.save("t:2", &[], None).await.unwrap();
        persister.save("t:1", &[], None).await.unwrap();
        persister.save("t:1:fork", &[], None).await.unwrap();
        persister
            .write_compaction_archive("t:1", "# Archive")
            .await
            .unwrap();

        assert_eq!(
            persister.list_keys().await.unwrap(),
            vec!["t:1", "t:1:fork", "t:2"]
        );

        persister.delete("t:1").await.unwrap();
        assert_eq!(persister.list_keys().await.unwrap(), vec!["t:1:fork", "t:2"]);
        assert!(matches!(
            persister.delete("t:1").await,
            Err(SessionError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn reports_profile_capability() {
        let (persister, _tmp) = test_persister().await;
        assert!(Arc::new(persister).profile_aware().is_some());
    }

    #[tokio::test]
    async fn archive_is_written() {
        let (persister, _tmp) = test_persister().await;
        let path = persister
            .write_compaction_archive("t:1", "# Archive\nHello")
            .await
            .unwrap();
        assert!(path.exists());
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.contains("# Archive"));
    }
}
