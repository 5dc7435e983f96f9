use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a transcript entry, unique and increasing within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Author {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    Complete,
    Streaming,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub id: EntryId,
    pub author: Author,
    pub content: String,
    pub status: EntryStatus,
    /// Raw failure detail, set only when `status` is `Failed`
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TranscriptEntry {
    pub fn new(id: EntryId, author: Author, content: impl Into<String>, status: EntryStatus) -> Self {
        Self {
            id,
            author,
            content: content.into(),
            status,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// An empty assistant entry waiting for the response stream
    pub fn placeholder(id: EntryId) -> Self {
        Self::new(id, Author::Assistant, String::new(), EntryStatus::Streaming)
    }

    pub fn is_streaming(&self) -> bool {
        self.status == EntryStatus::Streaming
    }

    /// Mark the entry failed, keeping whatever text already arrived.
    ///
    /// The marker becomes the whole content when nothing streamed yet,
    /// otherwise it is appended as its own paragraph.
    pub fn fail(&mut self, marker: &str, detail: impl Into<String>) {
        if self.content.is_empty() {
            self.content = marker.to_string();
        } else {
            self.content.push_str("\n\n");
            self.content.push_str(marker);
        }
        self.status = EntryStatus::Failed;
        self.error = Some(detail.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_starts_streaming_and_empty() {
        let entry = TranscriptEntry::placeholder(EntryId(2));
        assert!(entry.is_streaming());
        assert!(entry.content.is_empty());
        assert_eq!(entry.author, Author::Assistant);
    }

    #[test]
    fn test_fail_preserves_partial_text() {
        let mut entry = TranscriptEntry::placeholder(EntryId(1));
        entry.content.push_str("Partial");
        entry.fail("Error: boom", "boom");

        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(entry.content, "Partial\n\nError: boom");
        assert_eq!(entry.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_fail_on_empty_uses_marker() {
        let mut entry = TranscriptEntry::placeholder(EntryId(1));
        entry.fail("Error: rate limited", "rate limited");
        assert_eq!(entry.content, "Error: rate limited");
    }
}
