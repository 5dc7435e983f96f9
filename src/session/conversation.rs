use crate::messages::{Author, EntryId, EntryStatus, Transcript, TranscriptEntry};
use crate::stream::{DecodedEvent, StreamAssembler};
use crate::transport::{ChatRequest, ChatTransport, CycleId, TransportEvent};
use crate::{MadskiError, Result};
use crossbeam_channel::{Receiver, TryRecvError};
use tracing::{debug, error, info, warn};

/// Shown in place of (or after) the reply when the transport fails
pub const TRANSPORT_ERROR_MARKER: &str = "Error: Unable to reach the assistant. Please try again.";

/// Appended to a reply that was cancelled before it finished
pub const CANCELLED_MARKER: &str = "Response cancelled.";

/// Where the session is within its current (or last) cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    /// No cycle has run yet, or the last one was cancelled
    Idle,
    /// Request opened, placeholder created, no delta received yet
    Awaiting,
    /// At least one delta applied
    Streaming,
    /// Last cycle ended normally
    Complete,
    /// Last cycle ended with a fault or transport error
    Failed,
}

impl CyclePhase {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, CyclePhase::Awaiting | CyclePhase::Streaming)
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveCycle {
    id: CycleId,
    /// The placeholder this cycle writes to
    entry: EntryId,
}

/// Owns the transcript and drives one streamed response at a time
pub struct ConversationSession {
    transcript: Transcript,

    assembler: StreamAssembler,

    phase: CyclePhase,

    active: Option<ActiveCycle>,

    /// Generation counter; every cycle gets a fresh id
    last_cycle: u64,

    greeting: Option<String>,

    transport: Option<Box<dyn ChatTransport>>,

    event_rx: Option<Receiver<TransportEvent>>,

    last_error: Option<MadskiError>,
}

impl Default for ConversationSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationSession {
    pub fn new() -> Self {
        Self {
            transcript: Transcript::new(),
            assembler: StreamAssembler::new(),
            phase: CyclePhase::Idle,
            active: None,
            last_cycle: 0,
            greeting: None,
            transport: None,
            event_rx: None,
            last_error: None,
        }
    }

    /// Seed the transcript with an assistant greeting (kept across resets)
    pub fn with_greeting(mut self, greeting: Option<String>) -> Self {
        self.greeting = greeting;
        self.seed_greeting();
        self
    }

    /// Connect the outbound transport and the channel its events arrive on
    pub fn attach(&mut self, transport: Box<dyn ChatTransport>, events: Receiver<TransportEvent>) {
        self.transport = Some(transport);
        self.event_rx = Some(events);
    }

    /// Submit a user message and open a response cycle
    ///
    /// Returns the id of the assistant placeholder. Empty input and input
    /// while a response is in flight are rejected without touching state.
    pub fn send(&mut self, user_text: &str) -> Result<EntryId> {
        let text = user_text.trim();
        if text.is_empty() {
            return Err(MadskiError::EmptyMessage);
        }
        if let Some(active) = self.active {
            warn!("Rejected message while {} is in flight", active.id);
            return Err(MadskiError::SessionBusy);
        }

        self.transcript.push_user(text);
        let entry = self.transcript.push_placeholder();

        self.last_cycle += 1;
        let cycle = ActiveCycle {
            id: CycleId(self.last_cycle),
            entry,
        };
        self.active = Some(cycle);
        self.phase = CyclePhase::Awaiting;
        self.assembler.reset();
        self.last_error = None;

        info!("Opening {} for placeholder {}", cycle.id, entry);

        let opened = match &self.transport {
            Some(transport) => transport.open(cycle.id, ChatRequest::new(text)),
            None => Err(MadskiError::Transport("No transport attached".to_string())),
        };
        if let Err(e) = opened {
            error!("Failed to open {}: {}", cycle.id, e);
            self.fail_transport(cycle, &e.to_string());
        }

        self.check_invariants();
        Ok(entry)
    }

    /// Apply one transport event
    ///
    /// Returns false when the event belongs to a cycle that is no longer
    /// current and was discarded.
    pub fn handle_event(&mut self, event: TransportEvent) -> bool {
        let cycle = match self.active {
            Some(cycle) if cycle.id == event.cycle() => cycle,
            _ => {
                debug!("Discarding stale event for {}", event.cycle());
                return false;
            }
        };

        match event {
            TransportEvent::Chunk { text, is_final, .. } => {
                self.apply_chunk(cycle, &text, is_final);
            }
            TransportEvent::Failed { error, .. } => {
                warn!("{} transport failure: {}", cycle.id, error);
                self.fail_transport(cycle, &error);
            }
        }

        self.check_invariants();
        true
    }

    /// Drain pending transport events without blocking
    ///
    /// Returns how many events were applied to the current cycle.
    pub fn poll_events(&mut self) -> usize {
        let mut pending = Vec::new();
        let mut disconnected = false;

        if let Some(rx) = &self.event_rx {
            loop {
                match rx.try_recv() {
                    Ok(event) => pending.push(event),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        disconnected = true;
                        break;
                    }
                }
            }
        }

        let mut applied = 0;
        for event in pending {
            if self.handle_event(event) {
                applied += 1;
            }
        }

        if disconnected {
            if let Some(cycle) = self.active {
                error!("Transport channel closed during {}", cycle.id);
                self.fail_transport(cycle, "Transport worker stopped");
            }
        }

        applied
    }

    /// Abandon the in-flight response, if any
    ///
    /// The reader is released and anything that still arrives for the
    /// cancelled cycle is discarded.
    pub fn cancel(&mut self) {
        let Some(cycle) = self.active else {
            return;
        };

        info!("Cancelling {}", cycle.id);
        if let Some(transport) = &self.transport {
            transport.cancel(cycle.id);
        }
        if let Some(entry) = self.transcript.get_mut(cycle.entry) {
            entry.fail(CANCELLED_MARKER, "cancelled");
        }
        self.end_cycle(CyclePhase::Idle);
    }

    /// Cancel and start over with an empty transcript
    pub fn reset(&mut self) {
        self.cancel();
        self.transcript.clear();
        self.phase = CyclePhase::Idle;
        self.last_error = None;
        self.seed_greeting();
    }

    fn seed_greeting(&mut self) {
        if let Some(greeting) = &self.greeting {
            self.transcript
                .push(Author::Assistant, greeting.clone(), EntryStatus::Complete);
        }
    }

    fn apply_chunk(&mut self, cycle: ActiveCycle, text: &str, is_final: bool) {
        for event in self.assembler.feed(text) {
            match event {
                DecodedEvent::Delta(content) => {
                    match self.transcript.get_mut(cycle.entry) {
                        Some(entry) => entry.content.push_str(&content),
                        None => warn!("Placeholder {} missing, delta dropped", cycle.entry),
                    }
                    self.phase = CyclePhase::Streaming;
                }
                DecodedEvent::Fault(message) => {
                    self.fail_fault(cycle, message);
                    return;
                }
            }
        }

        if is_final {
            self.assembler.finish();
            if let Some(entry) = self.transcript.get_mut(cycle.entry) {
                entry.status = EntryStatus::Complete;
            }
            debug!("{} complete", cycle.id);
            self.end_cycle(CyclePhase::Complete);
        }
    }

    /// The stream itself reported an error
    fn fail_fault(&mut self, cycle: ActiveCycle, message: String) {
        warn!("{} terminated by server: {}", cycle.id, message);
        if let Some(transport) = &self.transport {
            transport.cancel(cycle.id);
        }

        let marker = format!("Error: {}", message);
        match self.transcript.get_mut(cycle.entry) {
            Some(entry) => entry.fail(&marker, message.clone()),
            None => self.push_failed(&marker, &message),
        }
        self.last_error = Some(MadskiError::Server(message));
        self.end_cycle(CyclePhase::Failed);
    }

    /// Connection refused, bad status or mid-stream drop; never retried
    fn fail_transport(&mut self, cycle: ActiveCycle, detail: &str) {
        match self.transcript.get_mut(cycle.entry) {
            Some(entry) if entry.is_streaming() => entry.fail(TRANSPORT_ERROR_MARKER, detail),
            _ => self.push_failed(TRANSPORT_ERROR_MARKER, detail),
        }
        self.last_error = Some(MadskiError::Transport(detail.to_string()));
        self.end_cycle(CyclePhase::Failed);
    }

    fn push_failed(&mut self, marker: &str, detail: &str) {
        let id = self
            .transcript
            .push(Author::Assistant, marker, EntryStatus::Failed);
        if let Some(entry) = self.transcript.get_mut(id) {
            entry.error = Some(detail.to_string());
        }
    }

    fn end_cycle(&mut self, phase: CyclePhase) {
        self.active = None;
        self.phase = phase;
        self.assembler.reset();
    }

    fn check_invariants(&self) {
        debug_assert!(
            self.transcript.streaming_count() <= 1,
            "more than one streaming entry"
        );
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    /// True while a response is awaited or streaming
    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    pub fn current_cycle(&self) -> Option<CycleId> {
        self.active.map(|c| c.id)
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        self.transcript.entries()
    }

    /// Owned copy of the transcript for rendering
    pub fn snapshot(&self) -> Vec<TranscriptEntry> {
        self.transcript.snapshot()
    }

    pub fn entry(&self, id: EntryId) -> Option<&TranscriptEntry> {
        self.transcript.get(id)
    }

    /// The placeholder currently receiving deltas
    pub fn streaming_entry(&self) -> Option<&TranscriptEntry> {
        self.active.and_then(|c| self.transcript.get(c.entry))
    }

    pub fn last_error(&self) -> Option<&MadskiError> {
        self.last_error.as_ref()
    }
}
