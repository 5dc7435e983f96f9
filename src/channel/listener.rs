//! Persistent push channel to the classification backend
//!
//! The listener owns a worker thread running its own tokio runtime. Outbound
//! audio frames go out fire-and-forget; every inbound result event replaces
//! the current [`ResultSet`] wholesale and is fanned out to subscribers.

use super::backoff::ReconnectPolicy;
use super::connector::{PushConnection, PushConnector};
use super::socketio::SocketIoConnector;
use super::types::{parse_predictions, AudioFrame, ChannelState, ListenerEvent, ResultSet};
use crate::config::ChannelConfig;
use crate::{MadskiError, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::runtime::Builder;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared between the listener handle and its worker
struct Shared {
    state: RwLock<ChannelState>,
    results: RwLock<Arc<ResultSet>>,
    subscribers: Mutex<Vec<(Uuid, Sender<ListenerEvent>)>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: RwLock::new(ChannelState::Disconnected),
            results: RwLock::new(Arc::new(ResultSet::default())),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn set_state(&self, state: ChannelState) {
        {
            let mut current = self.state.write();
            if *current == state {
                return;
            }
            debug!("Channel state {:?} -> {:?}", *current, state);
            *current = state.clone();
        }
        self.notify(ListenerEvent::StateChanged(state));
    }

    fn replace_results(&self, results: ResultSet) {
        let results = Arc::new(results);
        *self.results.write() = Arc::clone(&results);
        self.notify(ListenerEvent::Results(results));
    }

    fn notify(&self, event: ListenerEvent) {
        self.subscribers
            .lock()
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }
}

/// Live feed of listener events; unregisters itself when dropped
pub struct Subscription {
    id: Uuid,
    receiver: Receiver<ListenerEvent>,
    shared: Weak<Shared>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn receiver(&self) -> &Receiver<ListenerEvent> {
        &self.receiver
    }

    /// Next event if one is already queued
    pub fn try_next(&self) -> Option<ListenerEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<ListenerEvent> {
        self.receiver.recv_timeout(timeout).ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.subscribers.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

struct Worker {
    frame_tx: mpsc::UnboundedSender<AudioFrame>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Push channel listener, generic over how the channel is established
pub struct PushChannelListener<C: PushConnector = SocketIoConnector> {
    connector: C,
    config: ChannelConfig,
    shared: Arc<Shared>,
    worker: Option<Worker>,
}

impl PushChannelListener<SocketIoConnector> {
    /// Listener for the Socket.IO server at `config.base_url`
    pub fn from_config(config: ChannelConfig) -> Self {
        let connector = SocketIoConnector::new(&config.base_url);
        Self::new(connector, config)
    }
}

impl<C: PushConnector> PushChannelListener<C> {
    pub fn new(connector: C, config: ChannelConfig) -> Self {
        Self {
            connector,
            config,
            shared: Arc::new(Shared::new()),
            worker: None,
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = unbounded();
        let id = Uuid::new_v4();
        self.shared.subscribers.lock().push((id, tx));
        Subscription {
            id,
            receiver: rx,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Start the channel worker. No-op while a worker is already running;
    /// after `Failed` this starts a fresh retry sequence.
    pub fn connect(&mut self) -> Result<()> {
        if self.is_active() {
            debug!("Channel worker already running");
            return Ok(());
        }
        if let Some(old) = self.worker.take() {
            let _ = old.handle.join();
        }

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let connector = self.connector.clone();
        let config = self.config.clone();
        let shared = Arc::clone(&self.shared);

        shared.set_state(ChannelState::Connecting);

        let handle = std::thread::Builder::new()
            .name("push-channel".to_string())
            .spawn(move || {
                info!("Push channel worker starting");

                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to create tokio runtime: {}", e);
                        shared.set_state(ChannelState::Failed(e.to_string()));
                        return;
                    }
                };

                runtime.block_on(run_channel(connector, config, &shared, frame_rx, shutdown_rx));
                info!("Push channel worker stopped");
            })
            .map_err(|e| MadskiError::Channel(format!("Failed to spawn channel worker: {}", e)))?;

        self.worker = Some(Worker {
            frame_tx,
            shutdown_tx,
            handle,
        });
        Ok(())
    }

    /// Queue a frame for sending. Frames offered while the channel is not
    /// connected are dropped.
    pub fn send_frame(&self, frame: AudioFrame) -> Result<()> {
        let worker = match &self.worker {
            Some(worker) if !worker.handle.is_finished() => worker,
            _ => return Err(MadskiError::NotConnected),
        };

        if !self.shared.state.read().is_connected() {
            debug!("Dropping frame of {} samples, channel not connected", frame.chunk.len());
            return Ok(());
        }

        worker
            .frame_tx
            .send(frame)
            .map_err(|_| MadskiError::NotConnected)
    }

    /// Stop the worker and wait for it to exit
    pub fn disconnect(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.shutdown_tx.send(true);
            drop(worker.frame_tx);
            if worker.handle.join().is_err() {
                error!("Push channel worker panicked");
            }
            info!("Push channel disconnected");
        }
        self.shared.set_state(ChannelState::Disconnected);
    }

    pub fn results(&self) -> Arc<ResultSet> {
        self.shared.results.read().clone()
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state.read().clone()
    }

    /// Worker alive and not permanently failed
    pub fn is_active(&self) -> bool {
        self.worker_running() && !self.state().is_terminal()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    fn worker_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|worker| !worker.handle.is_finished())
            .unwrap_or(false)
    }
}

impl<C: PushConnector> Drop for PushChannelListener<C> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Why a connected session ended
enum PumpExit {
    Shutdown,
    Lost(String),
}

async fn run_channel<C: PushConnector>(
    mut connector: C,
    config: ChannelConfig,
    shared: &Shared,
    mut frames: mpsc::UnboundedReceiver<AudioFrame>,
    mut shutdown: watch::Receiver<bool>,
) {
    let policy: ReconnectPolicy = config.reconnect_policy();
    let mut attempt = 0u32;

    loop {
        if *shutdown.borrow() {
            return;
        }

        if attempt > 0 {
            shared.set_state(ChannelState::Reconnecting { attempt });
            let delay = policy.delay_for(attempt);
            debug!("Reconnect attempt {} in {:?}", attempt, delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
        }

        let connected = tokio::select! {
            result = connector.connect() => result,
            _ = shutdown.changed() => return,
        };

        let reason = match connected {
            Ok(mut connection) => {
                attempt = 0;
                // Frames queued before the connection existed are stale
                while frames.try_recv().is_ok() {}
                shared.set_state(ChannelState::Connected);

                match pump(connection.as_mut(), &config, shared, &mut frames, &mut shutdown).await {
                    PumpExit::Shutdown => {
                        let _ = tokio::time::timeout(CLOSE_TIMEOUT, connection.close()).await;
                        return;
                    }
                    PumpExit::Lost(reason) => {
                        warn!("Channel lost: {}", reason);
                        reason
                    }
                }
            }
            Err(e) => {
                warn!("Channel connect failed: {}", e);
                e.to_string()
            }
        };

        attempt += 1;
        if !policy.allows(attempt) {
            error!("Giving up on channel after {} attempts: {}", attempt, reason);
            shared.set_state(ChannelState::Failed(reason));
            return;
        }
    }
}

async fn pump(
    connection: &mut dyn PushConnection,
    config: &ChannelConfig,
    shared: &Shared,
    frames: &mut mpsc::UnboundedReceiver<AudioFrame>,
    shutdown: &mut watch::Receiver<bool>,
) -> PumpExit {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return PumpExit::Shutdown,
            frame = frames.recv() => match frame {
                Some(frame) => {
                    let samples = frame.chunk.len();
                    let payload = match serde_json::to_value(&frame) {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!("Dropping unserializable frame: {}", e);
                            continue;
                        }
                    };
                    // A stalled write must not hold up disconnect()
                    tokio::select! {
                        sent = connection.emit(&config.frame_event, payload) => {
                            if let Err(e) = sent {
                                return PumpExit::Lost(e.to_string());
                            }
                        }
                        _ = shutdown.changed() => return PumpExit::Shutdown,
                    }
                    debug!("Sent frame of {} samples", samples);
                }
                None => return PumpExit::Shutdown,
            },
            event = connection.next_event() => match event {
                Ok(Some(event)) if event.name == config.result_event => {
                    match parse_predictions(event.payload) {
                        Ok(results) => {
                            debug!("Received {} predictions", results.len());
                            shared.replace_results(results);
                        }
                        Err(e) => warn!("Ignoring {} event: {}", config.result_event, e),
                    }
                }
                Ok(Some(event)) => debug!("Ignoring event {}", event.name),
                Ok(None) => return PumpExit::Lost("closed by server".to_string()),
                Err(e) => return PumpExit::Lost(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_unregisters_on_drop() {
        let shared = Arc::new(Shared::new());
        let (tx, rx) = unbounded();
        let id = Uuid::new_v4();
        shared.subscribers.lock().push((id, tx));

        let subscription = Subscription {
            id,
            receiver: rx,
            shared: Arc::downgrade(&shared),
        };
        shared.set_state(ChannelState::Connecting);
        assert_eq!(
            subscription.try_next(),
            Some(ListenerEvent::StateChanged(ChannelState::Connecting))
        );

        drop(subscription);
        assert!(shared.subscribers.lock().is_empty());
    }

    #[test]
    fn test_repeated_state_not_notified() {
        let shared = Shared::new();
        let (tx, rx) = unbounded();
        shared.subscribers.lock().push((Uuid::new_v4(), tx));

        shared.set_state(ChannelState::Connected);
        shared.set_state(ChannelState::Connected);
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn test_dead_subscribers_pruned() {
        let shared = Shared::new();
        let (tx, rx) = unbounded();
        shared.subscribers.lock().push((Uuid::new_v4(), tx));
        drop(rx);

        shared.replace_results(ResultSet::default());
        assert!(shared.subscribers.lock().is_empty());
    }

    #[test]
    fn test_send_before_connect() {
        let listener = PushChannelListener::from_config(ChannelConfig::default());
        let result = listener.send_frame(AudioFrame::new(vec![0.0; 4], 22050));
        assert_eq!(result, Err(MadskiError::NotConnected));
        assert_eq!(listener.state(), ChannelState::Disconnected);
        assert!(!listener.is_active());
    }
}
