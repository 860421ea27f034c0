//! Heuristic token estimation and context usage reporting.
//!
//! These are cheap proxies, not a tokenizer. Counts are monotonic within a
//! script class but make no claim of accuracy against any specific model.

use parlor_types::Message;

/// Estimate the token cost of `text`.
///
/// Text where bytes outnumber chars more than two to one (CJK and similar
/// scripts) counts one token per char; everything else counts one token per
/// four bytes.
pub fn estimate_tokens(text: &str) -> usize {
    let bytes = text.len();
    let chars = text.chars().count();
    if bytes > chars * 2 { chars } else { bytes / 4 }
}

/// Sum of [`estimate_tokens`] over every message's text.
pub fn estimate_history_tokens(messages: &[Message]) -> usize {
    messages.iter().map(|m| estimate_tokens(&m.text)).sum()
}

/// Estimated context usage of a conversation against a token budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextInfo {
    pub estimated_tokens: usize,
    pub max_tokens: usize,
    pub user_tokens: usize,
    pub bot_tokens: usize,
    pub message_count: usize,
}

impl ContextInfo {
    pub fn estimate(messages: &[Message], max_tokens: usize) -> Self {
        let mut user_tokens = 0;
        let mut bot_tokens = 0;
        for msg in messages {
            let tokens = estimate_tokens(&msg.text);
            if msg.from_bot {
                bot_tokens += tokens;
            } else {
                user_tokens += tokens;
            }
        }
        Self {
            estimated_tokens: user_tokens + bot_tokens,
            max_tokens,
            user_tokens,
            bot_tokens,
            message_count: messages.len(),
        }
    }

    /// Usage as a percentage of the budget.
    pub fn usage_percent(&self) -> f64 {
        if self.max_tokens == 0 {
            return 0.0;
        }
        (self.estimated_tokens as f64 / self.max_tokens as f64) * 100.0
    }

    pub fn over_budget(&self) -> bool {
        self.estimated_tokens > self.max_tokens
    }

    /// One-line summary, e.g. `Context: 12.3k/80k tokens (15%), 42 messages`.
    pub fn format_brief(&self) -> String {
        let est_k = self.estimated_tokens as f64 / 1000.0;
        let max_k = self.max_tokens as f64 / 1000.0;
        format!(
            "Context: {est_k:.1}k/{max_k:.0}k tokens ({:.0}%), {} messages",
            self.usage_percent(),
            self.message_count
        )
    }

    /// Multi-line breakdown by author.
    pub fn format_detailed(&self) -> String {
        let mut lines = vec![self.format_brief()];
        lines.push(format!("  User: ~{} tokens", self.user_tokens));
        lines.push(format!("  Bot:  ~{} tokens", self.bot_tokens));
        if self.over_budget() {
            lines.push("  Over budget: compaction due".to_string());
        }
        lines.join("\n")
    }
}
