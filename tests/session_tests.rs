//! Conversation flows through the public session API

use crossbeam_channel::{unbounded, Sender};
use madski::config::ChatConfig;
use madski::messages::{Author, EntryStatus};
use madski::session::{ConversationSession, CyclePhase, TRANSPORT_ERROR_MARKER};
use madski::transport::{ChatClient, ChatRequest, ChatTransport, CycleId, TransportEvent};
use madski::{MadskiError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

const GREETING: &str = "Hello! I'm MADSKI's AI assistant. How can I help you today?";

#[derive(Clone, Copy)]
enum Reply {
    Chunk(&'static str),
    End,
    Drop(&'static str),
}

/// Answers every open with the next scripted reply, delivered at once
#[derive(Clone)]
struct ScriptedTransport {
    events: Sender<TransportEvent>,
    replies: Arc<Mutex<VecDeque<Vec<Reply>>>>,
    requests: Arc<Mutex<Vec<String>>>,
    cancelled: Arc<Mutex<Vec<CycleId>>>,
}

impl ChatTransport for ScriptedTransport {
    fn open(&self, cycle: CycleId, request: ChatRequest) -> Result<()> {
        self.requests.lock().push(request.message);
        let script = self.replies.lock().pop_front().unwrap_or_default();
        for reply in script {
            let event = match reply {
                Reply::Chunk(text) => TransportEvent::Chunk {
                    cycle,
                    text: text.to_string(),
                    is_final: false,
                },
                Reply::End => TransportEvent::Chunk {
                    cycle,
                    text: String::new(),
                    is_final: true,
                },
                Reply::Drop(error) => TransportEvent::Failed {
                    cycle,
                    error: error.to_string(),
                },
            };
            let _ = self.events.send(event);
        }
        Ok(())
    }

    fn cancel(&self, cycle: CycleId) {
        self.cancelled.lock().push(cycle);
    }
}

fn scripted(replies: Vec<Vec<Reply>>) -> (ConversationSession, ScriptedTransport) {
    let (tx, rx) = unbounded();
    let transport = ScriptedTransport {
        events: tx,
        replies: Arc::new(Mutex::new(replies.into())),
        requests: Arc::new(Mutex::new(Vec::new())),
        cancelled: Arc::new(Mutex::new(Vec::new())),
    };
    let mut session = ConversationSession::new().with_greeting(Some(GREETING.to_string()));
    session.attach(Box::new(transport.clone()), rx);
    (session, transport)
}

#[test]
fn test_streamed_answer_split_across_chunks() {
    let (mut session, transport) = scripted(vec![vec![
        Reply::Chunk("data: {\"content\": \"Hel"),
        Reply::Chunk("lo, w\u{f6}\"}\n"),
        Reply::Chunk("\ndata: {\"content\": \"rld!\"}\n\n"),
        Reply::End,
    ]]);

    let placeholder = session.send("Hi there").unwrap();
    assert_eq!(session.phase(), CyclePhase::Awaiting);
    session.poll_events();

    let entry = session.entry(placeholder).unwrap();
    assert_eq!(entry.content, "Hello, w\u{f6}rld!");
    assert_eq!(entry.status, EntryStatus::Complete);
    assert_eq!(session.phase(), CyclePhase::Complete);
    assert!(!session.is_busy());
    assert_eq!(*transport.requests.lock(), vec!["Hi there".to_string()]);

    let authors: Vec<Author> = session.entries().iter().map(|e| e.author).collect();
    assert_eq!(authors, vec![Author::Assistant, Author::User, Author::Assistant]);
    assert_eq!(session.entries()[0].content, GREETING);
}

#[test]
fn test_consecutive_cycles_use_fresh_ids() {
    let (mut session, _transport) = scripted(vec![
        vec![Reply::Chunk("data: {\"content\": \"one\"}\n\n"), Reply::End],
        vec![Reply::Chunk("{\"content\": \"two\"}\n\n"), Reply::End],
    ]);

    let first = session.send("first").unwrap();
    session.poll_events();
    let second = session.send("second").unwrap();
    session.poll_events();

    assert_ne!(first, second);
    assert_eq!(session.entry(first).unwrap().content, "one");
    assert_eq!(session.entry(second).unwrap().content, "two");
    assert_eq!(session.entries().len(), 5);
}

#[test]
fn test_malformed_frames_are_skipped() {
    let (mut session, _transport) = scripted(vec![vec![
        Reply::Chunk("data: {\"content\": \"a\"}\n\ndata: {oops}\n\n"),
        Reply::Chunk("data: {\"content\": \"b\"}\n\n"),
        Reply::End,
    ]]);

    let placeholder = session.send("go").unwrap();
    session.poll_events();

    let entry = session.entry(placeholder).unwrap();
    assert_eq!(entry.content, "ab");
    assert_eq!(entry.status, EntryStatus::Complete);
}

#[test]
fn test_server_error_frame_ends_cycle() {
    let (mut session, transport) = scripted(vec![vec![
        Reply::Chunk("data: {\"content\": \"Part\"}\n\ndata: {\"error\": \"model overloaded\"}\n\n"),
        Reply::Chunk("data: {\"content\": \"ignored\"}\n\n"),
        Reply::End,
    ]]);

    let placeholder = session.send("hello").unwrap();
    session.poll_events();

    let entry = session.entry(placeholder).unwrap();
    assert_eq!(entry.status, EntryStatus::Failed);
    assert_eq!(entry.content, "Part\n\nError: model overloaded");
    assert_eq!(session.phase(), CyclePhase::Failed);
    assert_eq!(
        session.last_error(),
        Some(&MadskiError::Server("model overloaded".to_string()))
    );
    assert_eq!(transport.cancelled.lock().len(), 1);

    // The session accepts new input straight away
    assert!(session.send("again").is_ok());
}

#[test]
fn test_connection_drop_before_content() {
    let (mut session, _transport) = scripted(vec![vec![Reply::Drop("connection refused")]]);

    let placeholder = session.send("anyone?").unwrap();
    session.poll_events();

    let entry = session.entry(placeholder).unwrap();
    assert_eq!(entry.status, EntryStatus::Failed);
    assert_eq!(entry.content, TRANSPORT_ERROR_MARKER);
    assert!(session.streaming_entry().is_none());
}

#[test]
fn test_busy_session_rejects_input() {
    let (mut session, transport) = scripted(vec![vec![Reply::Chunk("data: {\"content\": \"x\"}\n\n")]]);

    session.send("first").unwrap();
    session.poll_events();
    assert_eq!(session.phase(), CyclePhase::Streaming);
    assert_eq!(session.send("second"), Err(MadskiError::SessionBusy));
    assert_eq!(session.send("   "), Err(MadskiError::EmptyMessage));
    assert_eq!(transport.requests.lock().len(), 1);
}

#[test]
fn test_unreachable_server_fails_entry() {
    let config = ChatConfig {
        base_url: "http://127.0.0.1:9".to_string(),
        connect_timeout_ms: Some(2000),
        ..ChatConfig::default()
    };
    let client = ChatClient::new(config);
    let handle = client.handle();
    let events = client.event_receiver();
    let worker = client.start_worker().unwrap();

    let mut session = ConversationSession::new();
    session.attach(Box::new(handle.clone()), events);
    let placeholder = session.send("hello?").unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while session.is_busy() {
        assert!(Instant::now() < deadline, "no transport event");
        session.poll_events();
        std::thread::sleep(Duration::from_millis(10));
    }

    let entry = session.entry(placeholder).unwrap();
    assert_eq!(entry.status, EntryStatus::Failed);
    assert_eq!(entry.content, TRANSPORT_ERROR_MARKER);
    assert!(matches!(session.last_error(), Some(MadskiError::Transport(_))));

    handle.shutdown();
    worker.join().unwrap();
}
