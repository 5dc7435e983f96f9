//! HTTP chat transport
//!
//! Posts `{ "message": ... }` to the chat endpoint and forwards the
//! streamed body as text chunks. Runs on a dedicated worker thread with its
//! own tokio runtime; the UI side only touches channels.

use super::{ChatRequest, ChatTransport, CycleId, TransportCommand, TransportEvent};
use crate::config::ChatConfig;
use crate::stream::Utf8ChunkDecoder;
use crate::{MadskiError, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use futures::{Stream, StreamExt};
use std::collections::VecDeque;
use std::thread::JoinHandle;
use tokio::runtime::Builder;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

/// Stream the response body of one chat request as decoded text
///
/// Yields an error for connection failures, non-success statuses and
/// mid-stream drops; the stream ends after the first error.
pub fn response_chunks(
    client: reqwest::Client,
    url: String,
    request: ChatRequest,
) -> impl Stream<Item = Result<String>> {
    async_stream::try_stream! {
        let response = client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| MadskiError::Transport(format!("Request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            Err::<(), _>(MadskiError::Transport(format!("HTTP {}", status)))?;
        }

        let mut decoder = Utf8ChunkDecoder::new();
        let mut body = response.bytes_stream();

        while let Some(bytes) = body.next().await {
            let bytes = bytes
                .map_err(|e| MadskiError::Transport(format!("Stream interrupted: {}", e)))?;
            let text = decoder.decode(&bytes);
            if !text.is_empty() {
                yield text;
            }
        }

        let tail = decoder.finish();
        if !tail.is_empty() {
            yield tail;
        }
    }
}

/// Cloneable sender side of a running [`ChatClient`]
#[derive(Clone, Debug)]
pub struct ChatClientHandle {
    command_tx: UnboundedSender<TransportCommand>,
}

impl ChatClientHandle {
    /// Stop the worker after its current request
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(TransportCommand::Shutdown);
    }
}

impl ChatTransport for ChatClientHandle {
    fn open(&self, cycle: CycleId, request: ChatRequest) -> Result<()> {
        self.command_tx
            .send(TransportCommand::Open { cycle, request })
            .map_err(|_| MadskiError::Transport("Chat worker is not running".to_string()))
    }

    fn cancel(&self, cycle: CycleId) {
        if self.command_tx.send(TransportCommand::Cancel(cycle)).is_err() {
            debug!("Cancel for {} after worker exit", cycle);
        }
    }
}

/// Chat transport with channel-based communication
pub struct ChatClient {
    config: ChatConfig,

    command_tx: UnboundedSender<TransportCommand>,

    command_rx: UnboundedReceiver<TransportCommand>,

    event_tx: Sender<TransportEvent>,

    event_rx: Receiver<TransportEvent>,
}

impl ChatClient {
    pub fn new(config: ChatConfig) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = unbounded();

        Self {
            config,
            command_tx,
            command_rx,
            event_tx,
            event_rx,
        }
    }

    /// Handle used to open and cancel requests
    pub fn handle(&self) -> ChatClientHandle {
        ChatClientHandle {
            command_tx: self.command_tx.clone(),
        }
    }

    /// Receiver for transport events
    pub fn event_receiver(&self) -> Receiver<TransportEvent> {
        self.event_rx.clone()
    }

    /// Start the worker thread
    pub fn start_worker(self) -> Result<JoinHandle<()>> {
        let ChatClient {
            config,
            command_rx,
            event_tx,
            ..
        } = self;

        std::thread::Builder::new()
            .name("chat-transport".to_string())
            .spawn(move || {
                info!("Chat transport worker starting");

                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to create tokio runtime: {}", e);
                        return;
                    }
                };

                runtime.block_on(run_worker(config, command_rx, event_tx));
                info!("Chat transport worker stopped");
            })
            .map_err(|e| MadskiError::Transport(format!("Failed to spawn chat worker: {}", e)))
    }
}

/// How a single cycle's read loop ended
#[derive(Debug, PartialEq, Eq)]
enum CycleExit {
    Finished,
    Cancelled,
    Shutdown,
}

fn build_client(config: &ChatConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = config.connect_timeout() {
        builder = builder.connect_timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| MadskiError::Transport(format!("Failed to build HTTP client: {}", e)))
}

async fn run_worker(
    config: ChatConfig,
    mut commands: UnboundedReceiver<TransportCommand>,
    events: Sender<TransportEvent>,
) {
    let url = config.endpoint();
    let client = build_client(&config);
    if let Err(e) = &client {
        error!("{}", e);
    }

    // Opens that arrived while another response was still streaming
    let mut backlog: VecDeque<(CycleId, ChatRequest)> = VecDeque::new();

    loop {
        let command = match backlog.pop_front() {
            Some((cycle, request)) => TransportCommand::Open { cycle, request },
            None => match commands.recv().await {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            TransportCommand::Open { cycle, request } => {
                let client = match &client {
                    Ok(client) => client.clone(),
                    Err(e) => {
                        let _ = events.send(TransportEvent::Failed {
                            cycle,
                            error: e.to_string(),
                        });
                        continue;
                    }
                };

                debug!("Opening {} against {}", cycle, url);
                let exit = stream_cycle(
                    client,
                    &url,
                    cycle,
                    request,
                    &events,
                    &mut commands,
                    &mut backlog,
                )
                .await;

                if exit == CycleExit::Shutdown {
                    break;
                }
            }
            TransportCommand::Cancel(cycle) => {
                debug!("Cancel for idle {}", cycle);
            }
            TransportCommand::Shutdown => break,
        }
    }
}

/// Read one response to completion, cancellation or shutdown
async fn stream_cycle(
    client: reqwest::Client,
    url: &str,
    cycle: CycleId,
    request: ChatRequest,
    events: &Sender<TransportEvent>,
    commands: &mut UnboundedReceiver<TransportCommand>,
    backlog: &mut VecDeque<(CycleId, ChatRequest)>,
) -> CycleExit {
    let chunks = response_chunks(client, url.to_string(), request);
    futures::pin_mut!(chunks);

    loop {
        tokio::select! {
            item = chunks.next() => match item {
                Some(Ok(text)) => {
                    let _ = events.send(TransportEvent::Chunk { cycle, text, is_final: false });
                }
                Some(Err(e)) => {
                    warn!("{} failed: {}", cycle, e);
                    let _ = events.send(TransportEvent::Failed { cycle, error: e.to_string() });
                    return CycleExit::Finished;
                }
                None => {
                    debug!("{} reached end of stream", cycle);
                    let _ = events.send(TransportEvent::Chunk {
                        cycle,
                        text: String::new(),
                        is_final: true,
                    });
                    return CycleExit::Finished;
                }
            },
            command = commands.recv() => match command {
                Some(TransportCommand::Cancel(target)) if target == cycle => {
                    info!("{} cancelled, releasing response reader", cycle);
                    return CycleExit::Cancelled;
                }
                Some(TransportCommand::Cancel(other)) => {
                    debug!("Ignoring cancel for {} while streaming {}", other, cycle);
                }
                Some(TransportCommand::Open { cycle: next, request }) => {
                    warn!("{} requested while {} is streaming; queued", next, cycle);
                    backlog.push_back((next, request));
                }
                Some(TransportCommand::Shutdown) | None => {
                    info!("Shutdown while streaming {}", cycle);
                    return CycleExit::Shutdown;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_client_creation() {
        let client = ChatClient::new(ChatConfig::default());

        // Verify channels are created
        let _handle = client.handle();
        let events = client.event_receiver();
        assert!(events.is_empty());
    }

    #[test]
    fn test_unreachable_server_reports_failure() {
        let config = ChatConfig {
            // Port 9 (discard) on localhost is closed in test environments
            base_url: "http://127.0.0.1:9".to_string(),
            connect_timeout_ms: Some(2_000),
            ..ChatConfig::default()
        };
        let client = ChatClient::new(config);
        let handle = client.handle();
        let events = client.event_receiver();
        let worker = client.start_worker().unwrap();

        handle.open(CycleId(1), ChatRequest::new("hi")).unwrap();

        let event = events.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(matches!(event, TransportEvent::Failed { cycle: CycleId(1), .. }));

        handle.shutdown();
        worker.join().unwrap();
    }

    #[test]
    fn test_open_after_shutdown_errors() {
        let client = ChatClient::new(ChatConfig::default());
        let handle = client.handle();
        let worker = client.start_worker().unwrap();

        handle.shutdown();
        worker.join().unwrap();

        let result = handle.open(CycleId(1), ChatRequest::new("late"));
        assert!(matches!(result, Err(MadskiError::Transport(_))));
    }
}
