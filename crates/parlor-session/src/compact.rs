//! Token-budgeted history compaction.
//!
//! Old messages are replaced by a single summary message produced by a
//! [`Summarizer`]; the most recent messages, up to a token budget, are kept
//! verbatim. File provenance recorded on tool messages and on earlier
//! summaries is carried into every new summary so it accumulates across
//! compactions.

use crate::session::Session;
use crate::summarize::{SummarizeError, Summarizer};
use crate::tokens::{estimate_history_tokens, estimate_tokens};
use parlor_types::{
    META_COMPACTION_DETAILS, META_PATH, META_TOOL, META_TYPE, Message, TOOL_FILE_LIST,
    TOOL_FILE_READ, TOOL_FILE_WRITE, TYPE_SUMMARY,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;
use thiserror::Error;

/// Default token count above which a history is compacted.
pub const DEFAULT_MAX_TOKENS: usize = 80_000;

/// Default token budget for the verbatim tail kept after compaction.
pub const DEFAULT_KEEP_RECENT_TOKENS: usize = 10_000;

/// Token thresholds for compaction.
///
/// The two values are independent; nothing checks that
/// `keep_recent_tokens < max_tokens`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionSettings {
    pub max_tokens: usize,
    pub keep_recent_tokens: usize,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            keep_recent_tokens: DEFAULT_KEEP_RECENT_TOKENS,
        }
    }
}

/// Files touched by tools in compacted history, accumulated across
/// compactions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionDetails {
    #[serde(default)]
    pub read_files: BTreeSet<String>,
    #[serde(default)]
    pub modified_files: BTreeSet<String>,
}

impl CompactionDetails {
    pub fn is_empty(&self) -> bool {
        self.read_files.is_empty() && self.modified_files.is_empty()
    }

    pub fn merge(&mut self, other: CompactionDetails) {
        self.read_files.extend(other.read_files);
        self.modified_files.extend(other.modified_files);
    }
}

/// Why a compaction attempt produced no new history.
#[derive(Debug, Error)]
pub enum CompactError {
    #[error("Summarization failed: {0}")]
    Summarize(#[from] SummarizeError),

    #[error("Compaction would not shrink history ({before} -> {after} estimated tokens)")]
    NotSmaller { before: usize, after: usize },

    #[error("Session {key} changed while compacting; result discarded")]
    Stale { key: String },
}

impl From<CompactError> for parlor_types::ParlorError {
    fn from(err: CompactError) -> Self {
        Self::Compaction(err.to_string())
    }
}

/// Result of a compaction operation.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    /// The history to use from now on: summary + kept tail, or the input
    /// unchanged when nothing was compacted.
    pub new_messages: Vec<Message>,
    /// Messages folded into the summary.
    pub discarded: Vec<Message>,
    pub tokens_before: usize,
    pub tokens_after: usize,
    /// Provenance recorded on the summary; empty when nothing was compacted.
    pub details: CompactionDetails,
}

impl CompactionResult {
    fn unchanged(history: &[Message]) -> Self {
        let tokens = estimate_history_tokens(history);
        Self {
            new_messages: history.to_vec(),
            discarded: Vec::new(),
            tokens_before: tokens,
            tokens_after: tokens,
            details: CompactionDetails::default(),
        }
    }

    /// Whether a summary replaced part of the history.
    pub fn compacted(&self) -> bool {
        !self.discarded.is_empty()
    }

    /// How many messages were removed from the conversation.
    pub fn messages_removed(&self) -> usize {
        self.discarded.len()
    }
}

/// True iff the history's estimated tokens exceed `max_tokens`.
pub fn needs_compaction(history: &[Message], max_tokens: usize) -> bool {
    estimate_history_tokens(history) > max_tokens
}

/// Index of the first kept message, or `None` if the whole history fits in
/// `keep_recent_tokens`.
///
/// Scans newest to oldest; the first message that would push the running
/// total over the budget is the newest message to summarize.
pub fn find_split_point(history: &[Message], keep_recent_tokens: usize) -> Option<usize> {
    let mut total = 0usize;
    for (i, msg) in history.iter().enumerate().rev() {
        total += estimate_tokens(&msg.text);
        if total > keep_recent_tokens {
            return Some(i + 1);
        }
    }
    None
}

/// Split into `(to_summarize, to_keep)`. `to_summarize` is empty when the
/// whole history fits the budget.
pub fn split_messages(history: &[Message], keep_recent_tokens: usize) -> (&[Message], &[Message]) {
    match find_split_point(history, keep_recent_tokens) {
        Some(split) => history.split_at(split),
        None => (&[], history),
    }
}

/// Collect file provenance from tool tags and from earlier summaries.
pub fn extract_file_ops(messages: &[Message]) -> CompactionDetails {
    let mut details = CompactionDetails::default();
    for msg in messages {
        if msg.is_summary() {
            let prior = msg
                .metadata
                .get(META_COMPACTION_DETAILS)
                .and_then(|v| serde_json::from_value::<CompactionDetails>(v.clone()).ok());
            if let Some(prior) = prior {
                details.merge(prior);
            }
        }

        let Some(path) = msg.meta_str(META_PATH) else {
            continue;
        };
        match msg.meta_str(META_TOOL) {
            Some(TOOL_FILE_READ) | Some(TOOL_FILE_LIST) => {
                details.read_files.insert(path.to_string());
            }
            Some(TOOL_FILE_WRITE) => {
                details.modified_files.insert(path.to_string());
            }
            _ => {}
        }
    }
    details
}

/// Build the synthetic summary message: prose followed by file sections,
/// tagged `type: "summary"` with the provenance in its metadata.
pub fn build_summary_message(summary: &str, details: &CompactionDetails) -> Message {
    let mut text = summary.trim().to_string();
    append_file_section(&mut text, "read-files", &details.read_files);
    append_file_section(&mut text, "modified-files", &details.modified_files);

    Message::user(text)
        .with_metadata(META_TYPE, TYPE_SUMMARY)
        .with_metadata(
            META_COMPACTION_DETAILS,
            serde_json::json!({
                "readFiles": details.read_files,
                "modifiedFiles": details.modified_files,
            }),
        )
}

fn append_file_section(text: &mut String, tag: &str, files: &BTreeSet<String>) {
    if files.is_empty() {
        return;
    }
    let _ = write!(text, "\n\n<{tag}>\n");
    for file in files {
        text.push_str(file);
        text.push('\n');
    }
    let _ = write!(text, "</{tag}>");
}

/// Render messages as a markdown archive.
pub fn archive_markdown(messages: &[Message]) -> String {
    let mut md = String::from("# Conversation Archive\n\n");
    for msg in messages {
        let author = if msg.is_summary() {
            "Summary"
        } else if msg.from_bot {
            "Assistant"
        } else {
            "User"
        };
        let _ = writeln!(
            md,
            "## **{author}** ({})\n",
            msg.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        );
        if let (Some(tool), Some(path)) = (msg.meta_str(META_TOOL), msg.meta_str(META_PATH)) {
            let _ = writeln!(md, "*Tool: {tool} `{path}`*\n");
        }
        md.push_str(&msg.text);
        md.push_str("\n\n");
    }
    md
}

/// Summarizes old history to keep a conversation within a token budget.
///
/// Holds no per-session state; any number of sessions can share one.
pub struct Compactor {
    summarizer: Arc<dyn Summarizer>,
    settings: CompactionSettings,
}

impl Compactor {
    pub fn new(summarizer: Arc<dyn Summarizer>, settings: CompactionSettings) -> Self {
        Self {
            summarizer,
            settings,
        }
    }

    pub fn settings(&self) -> CompactionSettings {
        self.settings
    }

    pub fn needs_compaction(&self, history: &[Message]) -> bool {
        needs_compaction(history, self.settings.max_tokens)
    }

    /// Compact only when the history exceeds `max_tokens`; otherwise return
    /// it unchanged without calling the summarizer.
    pub async fn compact_if_needed(
        &self,
        history: &[Message],
    ) -> Result<CompactionResult, CompactError> {
        if !self.needs_compaction(history) {
            return Ok(CompactionResult::unchanged(history));
        }
        self.force_compact(history).await
    }

    /// Compact regardless of `max_tokens`. Returns the history unchanged,
    /// without calling the summarizer, when everything fits in
    /// `keep_recent_tokens`.
    ///
    /// On error nothing is built; the caller's history is untouched.
    pub async fn force_compact(
        &self,
        history: &[Message],
    ) -> Result<CompactionResult, CompactError> {
        let (to_summarize, to_keep) = split_messages(history, self.settings.keep_recent_tokens);
        if to_summarize.is_empty() {
            return Ok(CompactionResult::unchanged(history));
        }

        let details = extract_file_ops(to_summarize);
        let summary = match self.summarizer.summarize(to_summarize).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::warn!(
                    summarizer = self.summarizer.name(),
                    messages = to_summarize.len(),
                    "Summarization failed, keeping history: {}",
                    e
                );
                return Err(e.into());
            }
        };

        let mut new_messages = Vec::with_capacity(to_keep.len() + 1);
        new_messages.push(build_summary_message(&summary, &details));
        new_messages.extend_from_slice(to_keep);

        let tokens_before = estimate_history_tokens(history);
        let tokens_after = estimate_history_tokens(&new_messages);
        if tokens_after >= tokens_before {
            tracing::warn!(
                tokens_before,
                tokens_after,
                "Summary did not shrink history, keeping original"
            );
            return Err(CompactError::NotSmaller {
                before: tokens_before,
                after: tokens_after,
            });
        }

        tracing::info!(
            summarized = to_summarize.len(),
            kept = to_keep.len(),
            tokens_before,
            tokens_after,
            "Compacted history"
        );
        Ok(CompactionResult {
            new_messages,
            discarded: to_summarize.to_vec(),
            tokens_before,
            tokens_after,
            details,
        })
    }

    /// Compact a live session.
    ///
    /// The history is snapshotted, summarized outside the session lock, and
    /// written back only if the session did not change in the meantime.
    /// Any failure leaves the session exactly as it was.
    pub async fn compact_session(
        &self,
        session: &Session,
        force: bool,
    ) -> Result<CompactionResult, CompactError> {
        let (history, revision) = session.messages_with_revision();
        let result = if force {
            self.force_compact(&history).await?
        } else {
            self.compact_if_needed(&history).await?
        };
        if !result.compacted() {
            return Ok(result);
        }
        if !session.replace_history_if(revision, result.new_messages.clone()) {
            tracing::warn!(key = session.key(), "Session changed during compaction");
            return Err(CompactError::Stale {
                key: session.key().to_string(),
            });
        }
        Ok(result)
    }
}
