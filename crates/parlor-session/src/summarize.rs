//! Summarization collaborator contract and an offline implementation.

use parlor_types::{META_PATH, META_TOOL, Message, TOOL_FILE_WRITE, preview};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors a summarizer may report. Any of them aborts the compaction attempt.
#[derive(Debug, Error)]
pub enum SummarizeError {
    #[error("Summarizer request failed: {0}")]
    Request(String),

    #[error("Summarizer timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Summarizer returned an empty summary")]
    Empty,
}

/// Produces prose summarizing a prefix of a conversation.
///
/// Dyn-compatible so the compactor can hold `Arc<dyn Summarizer>`. Timeouts
/// are the implementation's responsibility; callers never cancel.
pub trait Summarizer: Send + Sync {
    fn summarize<'a>(
        &'a self,
        messages: &'a [Message],
    ) -> Pin<Box<dyn Future<Output = Result<String, SummarizeError>> + Send + 'a>>;

    /// Name for logging.
    fn name(&self) -> &str;
}

/// Maximum length of a quoted request in an extractive summary.
const REQUEST_PREVIEW_BYTES: usize = 120;

/// Maximum number of user requests quoted in an extractive summary.
const MAX_REQUESTS: usize = 20;

/// Summarizer that extracts key facts without calling a model.
///
/// Quotes the user's requests (most recent ones when there are many) and
/// names the files the tools wrote. Useful offline and in operator tooling.
#[derive(Debug, Clone, Default)]
pub struct ExtractiveSummarizer;

impl ExtractiveSummarizer {
    fn extract_key_facts(messages: &[Message]) -> Vec<String> {
        let mut facts = Vec::new();

        let prior: Vec<&Message> = messages.iter().filter(|m| m.is_summary()).collect();
        if let Some(last) = prior.last() {
            let first_line = last.text.lines().next().unwrap_or_default();
            facts.push(format!(
                "Earlier summary: {}",
                preview(first_line, REQUEST_PREVIEW_BYTES)
            ));
        }

        let requests: Vec<&Message> = messages
            .iter()
            .filter(|m| !m.from_bot && !m.is_summary() && !m.text.trim().is_empty())
            .collect();
        let skipped = requests.len().saturating_sub(MAX_REQUESTS);
        if skipped > 0 {
            facts.push(format!("({skipped} earlier requests omitted)"));
        }
        for msg in &requests[skipped..] {
            facts.push(format!(
                "User asked: {}",
                preview(&msg.text, REQUEST_PREVIEW_BYTES)
            ));
        }

        let mut written: Vec<&str> = Vec::new();
        for msg in messages {
            if msg.meta_str(META_TOOL) != Some(TOOL_FILE_WRITE) {
                continue;
            }
            if let Some(path) = msg.meta_str(META_PATH) {
                if !written.contains(&path) {
                    written.push(path);
                }
            }
        }
        if !written.is_empty() {
            facts.push(format!("Files modified: {}", written.join(", ")));
        }

        let bot_replies = messages.iter().filter(|m| m.from_bot).count();
        facts.push(format!(
            "{} messages condensed ({bot_replies} from the assistant)",
            messages.len()
        ));
        facts
    }
}

impl Summarizer for ExtractiveSummarizer {
    fn summarize<'a>(
        &'a self,
        messages: &'a [Message],
    ) -> Pin<Box<dyn Future<Output = Result<String, SummarizeError>> + Send + 'a>> {
        Box::pin(async move {
            if messages.is_empty() {
                return Err(SummarizeError::Empty);
            }
            let mut text = String::from("Key facts from the earlier conversation:\n");
            for fact in Self::extract_key_facts(messages) {
                text.push_str("- ");
                text.push_str(&fact);
                text.push('\n');
            }
            Ok(text)
        })
    }

    fn name(&self) -> &str {
        "extractive"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_types::{META_TYPE, TYPE_SUMMARY};

    #[tokio::test]
    async fn quotes_user_requests() {
        let msgs = vec![
            Message::user("Book a table for two"),
            Message::bot("Done."),
            Message::user("Also remind me at 7pm"),
        ];
        let text = ExtractiveSummarizer.summarize(&msgs).await.unwrap();
        assert!(text.contains("User asked: Book a table for two"));
        assert!(text.contains("User asked: Also remind me at 7pm"));
        assert!(text.contains("3 messages condensed (1 from the assistant)"));
        assert!(!text.contains("Done."));
    }

    #[tokio::test]
    async fn names_written_files_once() {
        let msgs = vec![
            Message::bot("wrote").with_tool(TOOL_FILE_WRITE, "notes.md"),
            Message::bot("wrote again").with_tool(TOOL_FILE_WRITE, "notes.md"),
        ];
        let text = ExtractiveSummarizer.summarize(&msgs).await.unwrap();
        assert!(text.contains("Files modified: notes.md\n"));
    }

    #[tokio::test]
    async fn carries_forward_prior_summary() {
        let msgs = vec![
            Message::user("Key facts: user likes Rust\nmore")
                .with_metadata(META_TYPE, TYPE_SUMMARY),
            Message::user("next question"),
        ];
        let text = ExtractiveSummarizer.summarize(&msgs).await.unwrap();
        assert!(text.contains("Earlier summary: Key facts: user likes Rust"));
        assert!(!text.contains("User asked: Key facts"));
    }

    #[tokio::test]
    async fn caps_quoted_requests() {
        let msgs: Vec<_> = (0..25).map(|i| Message::user(format!("q{i}"))).collect();
        let text = ExtractiveSummarizer.summarize(&msgs).await.unwrap();
        assert!(text.contains("(5 earlier requests omitted)"));
        assert!(!text.contains("User asked: q4\n"));
        assert!(text.contains("User asked: q24"));
    }

    #[tokio::test]
    async fn empty_input_is_an_error() {
        let result = ExtractiveSummarizer.summarize(&[]).await;
        assert!(matches!(result, Err(SummarizeError::Empty)));
    }
}
