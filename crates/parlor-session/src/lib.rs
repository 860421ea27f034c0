//! Conversation session registry and history compaction for Parlor.

pub mod compact;
pub mod error;
pub mod file;
pub mod key;
pub mod persist;
pub mod session;
pub mod store;
pub mod summarize;
pub mod tokens;

pub use compact::{
    CompactError, CompactionDetails, CompactionResult, CompactionSettings, Compactor,
    archive_markdown, extract_file_ops, find_split_point, needs_compaction, split_messages,
};
pub use error::SessionError;
pub use file::JsonFilePersister;
pub use key::{MAIN_SESSION, fork_key, session_key};
pub use persist::{PersistFuture, Persister, ProfilePersister, SessionRecord};
pub use session::{DEFAULT_MAX_HISTORY, Session};
pub use store::{ChangeHook, SessionEntry, SessionEvent, SessionStore};
pub use summarize::{ExtractiveSummarizer, SummarizeError, Summarizer};
pub use tokens::{ContextInfo, estimate_history_tokens, estimate_tokens};
