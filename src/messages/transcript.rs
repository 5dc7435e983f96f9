use super::types::{Author, EntryId, EntryStatus, TranscriptEntry};

/// Ordered, append-only list of conversation entries
#[derive(Debug, Clone)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    next_id: u64,
}

impl Transcript {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    fn allocate_id(&mut self) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Append a new entry and return its id
    pub fn push(&mut self, author: Author, content: impl Into<String>, status: EntryStatus) -> EntryId {
        let id = self.allocate_id();
        self.entries
            .push(TranscriptEntry::new(id, author, content, status));
        id
    }

    pub fn push_user(&mut self, content: impl Into<String>) -> EntryId {
        self.push(Author::User, content, EntryStatus::Complete)
    }

    pub fn push_placeholder(&mut self) -> EntryId {
        self.push(Author::Assistant, String::new(), EntryStatus::Streaming)
    }

    pub fn get(&self, id: EntryId) -> Option<&TranscriptEntry> {
        self.entries.iter().rev().find(|e| e.id == id)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut TranscriptEntry> {
        self.entries.iter_mut().rev().find(|e| e.id == id)
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    /// Owned copy for the rendering layer
    pub fn snapshot(&self) -> Vec<TranscriptEntry> {
        self.entries.clone()
    }

    pub fn streaming_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_streaming()).count()
    }

    /// Remove every entry. Ids keep increasing across clears.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let mut transcript = Transcript::default();
        let a = transcript.push_user("one");
        let b = transcript.push_placeholder();
        transcript.clear();
        let c = transcript.push_user("two");

        assert!(a < b);
        assert!(b < c);
        assert_eq!(transcript.len(), 1);
    }

    #[test]
    fn test_lookup_by_id_not_position() {
        let mut transcript = Transcript::new();
        let placeholder = transcript.push_placeholder();
        transcript.push_user("appended later");

        transcript
            .get_mut(placeholder)
            .expect("placeholder")
            .content
            .push_str("reply");

        assert_eq!(transcript.entries()[0].content, "reply");
        assert_eq!(transcript.entries()[1].content, "appended later");
        assert_eq!(transcript.streaming_count(), 1);
    }
}
