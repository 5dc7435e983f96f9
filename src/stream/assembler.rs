//! Incremental decoder for `data: {...}\n\n` framed response streams
//!
//! Chunks arrive at arbitrary boundaries: a frame, its `data: ` prefix or
//! the blank-line delimiter itself may be split across several chunks. The
//! assembler buffers the trailing fragment until the delimiter shows up and
//! only then decodes the frame.

use serde::Deserialize;
use tracing::{debug, warn};

/// Two-character boundary terminating every frame
pub const FRAME_DELIMITER: &str = "\n\n";

/// Optional field prefix in front of each payload
pub const DATA_PREFIX: &str = "data: ";

/// A semantic event decoded from one frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodedEvent {
    /// Text to append to the in-progress message
    Delta(String),
    /// Server-signalled failure; the stream is over
    Fault(String),
}

impl DecodedEvent {
    pub fn is_fault(&self) -> bool {
        matches!(self, DecodedEvent::Fault(_))
    }
}

#[derive(Debug, Deserialize)]
struct FramePayload {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Streaming frame decoder for one response body
#[derive(Clone, Debug, Default)]
pub struct StreamAssembler {
    /// Bytes received but not yet terminated by a delimiter
    buffer: String,

    /// Set after a fault or `finish`; later input is ignored
    terminated: bool,

    /// Number of frames decoded so far, malformed ones included
    frames_seen: usize,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare for a new response stream
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.terminated = false;
        self.frames_seen = 0;
    }

    /// Append a chunk and decode every frame it completes
    ///
    /// Returns events in wire order. After a `Fault` nothing further is
    /// decoded, neither from the rest of this chunk nor from later ones.
    pub fn feed(&mut self, chunk: &str) -> Vec<DecodedEvent> {
        let mut events = Vec::new();
        if self.terminated {
            if !chunk.is_empty() {
                debug!("Ignoring {} bytes after stream termination", chunk.len());
            }
            return events;
        }

        self.buffer.push_str(chunk);

        let mut consumed = 0;
        while let Some(pos) = self.buffer[consumed..].find(FRAME_DELIMITER) {
            let frame_end = consumed + pos;
            let frame = &self.buffer[consumed..frame_end];
            consumed = frame_end + FRAME_DELIMITER.len();
            if frame.trim().is_empty() {
                continue;
            }
            self.frames_seen += 1;

            match decode_frame(frame) {
                Ok(event) => {
                    let fault = event.is_fault();
                    events.push(event);
                    if fault {
                        self.terminated = true;
                        break;
                    }
                }
                Err(e) => {
                    warn!("Dropping malformed frame #{}: {}", self.frames_seen, e);
                }
            }
        }

        if self.terminated {
            self.buffer.clear();
        } else {
            self.buffer.drain(..consumed);
        }

        events
    }

    /// The transport reached end of stream
    ///
    /// A leftover fragment cannot be a complete frame and is discarded.
    pub fn finish(&mut self) {
        if !self.buffer.is_empty() {
            debug!(
                "Discarding {} bytes of unterminated frame at end of stream",
                self.buffer.len()
            );
            self.buffer.clear();
        }
        self.terminated = true;
    }

    /// Text waiting for its delimiter
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn frames_seen(&self) -> usize {
        self.frames_seen
    }
}

/// Decode a single frame body (delimiter already removed)
fn decode_frame(frame: &str) -> Result<DecodedEvent, serde_json::Error> {
    // Stray blank lines between frames end up in front of the prefix
    let frame = frame.trim_start();
    let body = frame.strip_prefix(DATA_PREFIX).unwrap_or(frame);
    let payload: FramePayload = serde_json::from_str(body)?;

    // An empty error string does not end the stream
    match payload.error.filter(|error| !error.is_empty()) {
        Some(error) => Ok(DecodedEvent::Fault(error)),
        None => Ok(DecodedEvent::Delta(payload.content.unwrap_or_default())),
    }
}

/// Decode a complete body in one pass
///
/// Useful for testing or when the whole response is already available.
pub fn decode_all(body: &str) -> Vec<DecodedEvent> {
    let mut assembler = StreamAssembler::new();
    let events = assembler.feed(body);
    assembler.finish();
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(s: &str) -> DecodedEvent {
        DecodedEvent::Delta(s.to_string())
    }

    #[test]
    fn test_single_frame() {
        let events = decode_all("data: {\"content\":\"Hi\"}\n\n");
        assert_eq!(events, vec![delta("Hi")]);
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let mut assembler = StreamAssembler::new();

        let first = assembler.feed("data: {\"content\":\"Hel");
        assert!(first.is_empty());

        let second = assembler.feed("lo\"}\n\ndata: {\"content\":\" world\"}\n\n");
        assert_eq!(second, vec![delta("Hello"), delta(" world")]);
        assert!(assembler.buffered().is_empty());
    }

    #[test]
    fn test_delimiter_split_in_the_middle() {
        let mut assembler = StreamAssembler::new();

        assert!(assembler.feed("data: {\"content\":\"a\"}\n").is_empty());
        assert_eq!(assembler.feed("\ndata: {\"content\":\"b\"}"), vec![delta("a")]);
        assert_eq!(assembler.feed("\n\n"), vec![delta("b")]);
    }

    #[test]
    fn test_every_split_point_matches_single_feed() {
        let body = concat!(
            "data: {\"content\":\"One\"}\n\n",
            "data: not json\n\n",
            "{\"content\":\" two\"}\n\n",
            "data: {\"content\":\" ünïcødé\"}\n\n",
            "data: {}\n\n",
            "data: {\"error\":\"stop\"}\n\n",
            "data: {\"content\":\"never\"}\n\n",
        );
        let expected = decode_all(body);
        assert_eq!(
            expected,
            vec![
                delta("One"),
                delta(" two"),
                delta(" ünïcødé"),
                delta(""),
                DecodedEvent::Fault("stop".to_string()),
            ]
        );

        for split in 0..=body.len() {
            if !body.is_char_boundary(split) {
                continue;
            }
            let mut assembler = StreamAssembler::new();
            let mut events = assembler.feed(&body[..split]);
            events.extend(assembler.feed(&body[split..]));
            assert_eq!(events, expected, "split at {}", split);
        }
    }

    #[test]
    fn test_one_char_at_a_time() {
        let body = "data: {\"content\":\"x\"}\n\ndata: {\"content\":\"y\"}\n\n";
        let mut assembler = StreamAssembler::new();
        let mut events = Vec::new();
        for c in body.chars() {
            events.extend(assembler.feed(&c.to_string()));
        }
        assert_eq!(events, vec![delta("x"), delta("y")]);
    }

    #[test]
    fn test_malformed_frame_is_skipped() {
        let events = decode_all(
            "data: {\"content\":\"A\"}\n\ndata: {\"content\":\n\ndata: {\"content\":\"B\"}\n\n",
        );
        assert_eq!(events, vec![delta("A"), delta("B")]);
    }

    #[test]
    fn test_fault_terminates_stream() {
        let mut assembler = StreamAssembler::new();
        let events = assembler.feed("data: {\"error\":\"rate limited\"}\n\ndata: {\"content\":\"x\"}\n\n");

        assert_eq!(events, vec![DecodedEvent::Fault("rate limited".to_string())]);
        assert!(assembler.is_terminated());
        assert!(assembler.feed("data: {\"content\":\"late\"}\n\n").is_empty());
    }

    #[test]
    fn test_error_wins_over_content() {
        let events = decode_all("data: {\"content\":\"x\",\"error\":\"bad\"}\n\n");
        assert_eq!(events, vec![DecodedEvent::Fault("bad".to_string())]);
    }

    #[test]
    fn test_extra_blank_lines_between_frames() {
        let events = decode_all(
            "data: {\"content\":\"a\"}\n\n\ndata: {\"content\":\"b\"}\n\n\n\ndata: {\"content\":\"c\"}\n\n",
        );
        assert_eq!(events, vec![delta("a"), delta("b"), delta("c")]);
    }

    #[test]
    fn test_empty_error_is_not_a_fault() {
        let mut assembler = StreamAssembler::new();
        let events = assembler.feed("data: {\"content\":\"x\",\"error\":\"\"}\n\ndata: {\"error\":\"\"}\n\n");

        assert_eq!(events, vec![delta("x"), delta("")]);
        assert!(!assembler.is_terminated());
    }

    #[test]
    fn test_empty_payload_is_empty_delta() {
        assert_eq!(decode_all("data: {}\n\n"), vec![delta("")]);
    }

    #[test]
    fn test_empty_chunk() {
        let mut assembler = StreamAssembler::new();
        assert!(assembler.feed("").is_empty());
        assert!(assembler.buffered().is_empty());
    }

    #[test]
    fn test_finish_discards_partial_frame() {
        let mut assembler = StreamAssembler::new();
        assembler.feed("data: {\"content\":\"trunc");
        assembler.finish();

        assert!(assembler.buffered().is_empty());
        assert!(assembler.feed("ated\"}\n\n").is_empty());
    }

    #[test]
    fn test_reset_allows_reuse() {
        let mut assembler = StreamAssembler::new();
        assembler.feed("data: {\"error\":\"x\"}\n\n");
        assembler.reset();

        assert!(!assembler.is_terminated());
        assert_eq!(assembler.feed("data: {\"content\":\"ok\"}\n\n"), vec![delta("ok")]);
        assert_eq!(assembler.frames_seen(), 1);
    }
}
