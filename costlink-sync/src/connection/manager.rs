//! Shared connection lifecycle
//!
//! One [`ConnectionManager`] owns the single connection to the backend.
//! Any number of consumers attach to it; the first attach starts a
//! supervisor task and the last detach closes the connection with the
//! intentional close code so no reconnect follows.
//!
//! **State machine:**
//! - `Disconnected -> Connecting`: first attach, or scheduled reconnect
//! - `Connecting -> Connected`: transport open; retry counter reset; heartbeat starts
//! - `Connecting -> Disconnected`: open failed or timed out
//! - `Connected -> Disconnected`: transport closed or failed; heartbeat stops;
//!   a reconnect is scheduled unless the last consumer detached
//!
//! Each supervisor run is tagged with a generation number. Detaching to zero
//! bumps the generation so a supervisor that is still winding down can no
//! longer touch shared state.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use costlink_common::config::SyncConfig;
use costlink_common::events::{ConnectionState, StatusBus, StatusEvent};
use costlink_common::protocol::OutboundFrame;
use costlink_common::time::duration_to_millis;
use costlink_common::{Error, Result};
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::backoff::Backoff;
use super::transport::{Connector, Transport, WireMessage, INTENTIONAL_CLOSE_CODE};

/// Receives everything the connection delivers
///
/// Both callbacks run on the connection task and must not block.
pub trait ConnectionListener: Send + Sync {
    /// One inbound text frame, in arrival order
    fn on_frame(&self, text: &str);

    /// A state transition has happened
    fn on_state_change(&self, _old: ConnectionState, _new: ConnectionState) {}
}

/// Reference-counted handle to the shared connection
///
/// Cloning is cheap; every clone refers to the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: SyncConfig,
    connector: Arc<dyn Connector>,
    status: StatusBus,
    listener: RwLock<Option<Arc<dyn ConnectionListener>>>,
    shared: Mutex<Shared>,
}

struct Shared {
    state: ConnectionState,
    consumers: usize,
    failures: u32,
    last_activity: Option<DateTime<Utc>>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    session_id: Option<Uuid>,
    /// Cancellation for the running supervisor; `None` when none runs
    cycle: Option<CancellationToken>,
    generation: u64,
}

/// How a transport session ended
enum SessionEnd {
    Intentional,
    Lost(String),
}

impl ConnectionManager {
    pub fn new(config: SyncConfig, connector: Arc<dyn Connector>) -> Self {
        let status = StatusBus::new(config.status_channel_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                status,
                listener: RwLock::new(None),
                shared: Mutex::new(Shared {
                    state: ConnectionState::Disconnected,
                    consumers: 0,
                    failures: 0,
                    last_activity: None,
                    outbound: None,
                    session_id: None,
                    cycle: None,
                    generation: 0,
                }),
            }),
        }
    }

    /// Install the receiver of inbound frames and state changes
    pub fn set_listener(&self, listener: Arc<dyn ConnectionListener>) {
        *self
            .inner
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    /// Register a consumer; the first one starts connecting
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach(&self) {
        let start = {
            let mut shared = self.lock();
            shared.consumers += 1;
            debug!(consumers = shared.consumers, "Consumer attached");

            if shared.consumers == 1 && shared.cycle.is_none() {
                shared.failures = 0;
                Some(self.begin_cycle(&mut shared))
            } else {
                None
            }
        };

        if let Some((generation, token)) = start {
            self.spawn_supervisor(generation, token);
        }
    }

    /// Unregister a consumer; the last one closes the connection
    pub fn detach(&self) {
        let (token, old_state) = {
            let mut shared = self.lock();
            if shared.consumers == 0 {
                warn!("detach() called with no attached consumers");
                return;
            }
            shared.consumers -= 1;
            debug!(consumers = shared.consumers, "Consumer detached");
            if shared.consumers > 0 {
                return;
            }

            shared.generation += 1;
            shared.failures = 0;
            shared.outbound = None;
            shared.session_id = None;
            let old_state = shared.state;
            shared.state = ConnectionState::Disconnected;
            (shared.cycle.take(), old_state)
        };

        info!("Last consumer detached, closing connection");
        if let Some(token) = token {
            token.cancel();
        }
        if old_state != ConnectionState::Disconnected {
            self.notify_transition(old_state, ConnectionState::Disconnected);
        }
    }

    /// RAII consumer: attaches now, detaches on drop
    pub fn consumer(&self) -> Consumer {
        self.attach();
        Consumer {
            connection: self.clone(),
        }
    }

    /// Start a fresh connection cycle after reconnection was abandoned
    ///
    /// Returns `false` when no consumer is attached or a cycle is already
    /// running.
    pub fn reconnect_now(&self) -> bool {
        let start = {
            let mut shared = self.lock();
            if shared.consumers == 0 || shared.cycle.is_some() {
                return false;
            }
            shared.failures = 0;
            self.begin_cycle(&mut shared)
        };

        info!("Manual reconnect requested");
        self.spawn_supervisor(start.0, start.1);
        true
    }

    /// Queue a frame for transmission
    ///
    /// Fails with [`Error::NotConnected`] unless the state is `Connected`.
    /// Frames are never buffered across disconnects.
    pub fn send(&self, frame: &OutboundFrame) -> Result<()> {
        self.send_text(frame.to_json())
    }

    /// Queue a pre-encoded text frame for transmission
    pub fn send_text(&self, text: String) -> Result<()> {
        let shared = self.lock();
        if shared.state != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        let outbound = shared.outbound.as_ref().ok_or(Error::NotConnected)?;
        outbound.send(text).map_err(|_| Error::NotConnected)
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Number of attached consumers
    pub fn consumer_count(&self) -> usize {
        self.lock().consumers
    }

    /// Consecutive failed connection cycles since the last successful open
    pub fn retry_count(&self) -> u32 {
        self.lock().failures
    }

    /// Time of the last frame sent or received
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.lock().last_activity
    }

    /// Id of the currently open transport session, for log correlation
    pub fn session_id(&self) -> Option<Uuid> {
        self.lock().session_id
    }

    /// Subscribe to state changes and reconnect notifications
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.status.subscribe()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Wait until the state is `Connected`
    ///
    /// Fails with [`Error::NotConnected`] on timeout or when reconnection is
    /// abandoned while waiting.
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<()> {
        let mut status = self.subscribe_status();
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        let wait = async {
            loop {
                match status.recv().await {
                    Ok(StatusEvent::StateChanged {
                        new_state: ConnectionState::Connected,
                        ..
                    }) => return Ok(()),
                    Ok(StatusEvent::ReconnectAbandoned { .. }) => return Err(Error::NotConnected),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.state() == ConnectionState::Connected {
                            return Ok(());
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(Error::NotConnected),
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::NotConnected)?
    }

    // ========================================
    // Supervisor
    // ========================================

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn listener(&self) -> Option<Arc<dyn ConnectionListener>> {
        self.inner
            .listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn begin_cycle(&self, shared: &mut Shared) -> (u64, CancellationToken) {
        shared.generation += 1;
        let token = CancellationToken::new();
        shared.cycle = Some(token.clone());
        (shared.generation, token)
    }

    fn spawn_supervisor(&self, generation: u64, token: CancellationToken) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_cycle(generation, token).await;
        });
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    /// Apply a transition if `generation` still owns the connection
    fn transition(&self, generation: u64, new_state: ConnectionState) {
        let old_state = {
            let mut shared = self.lock();
            if shared.generation != generation || shared.state == new_state {
                return;
            }
            let old_state = shared.state;
            shared.state = new_state;
            if new_state != ConnectionState::Connected {
                shared.outbound = None;
                shared.session_id = None;
            }
            old_state
        };
        self.notify_transition(old_state, new_state);
    }

    /// Publish a transition; runs outside the state lock
    fn notify_transition(&self, old_state: ConnectionState, new_state: ConnectionState) {
        info!(from = %old_state, to = %new_state, "Connection state changed");
        self.inner.status.emit_lossy(StatusEvent::StateChanged {
            old_state,
            new_state,
            timestamp: Utc::now(),
        });
        if let Some(listener) = self.listener() {
            listener.on_state_change(old_state, new_state);
        }
    }

    fn touch(&self) {
        self.lock().last_activity = Some(Utc::now());
    }

    async fn run_cycle(self, generation: u64, cancel: CancellationToken) {
        let config = &self.inner.config;
        let mut backoff = Backoff::new(config.reconnect);

        loop {
            if cancel.is_cancelled() || !self.is_current(generation) {
                break;
            }

            self.transition(generation, ConnectionState::Connecting);
            debug!(url = %config.endpoint_url, "Opening transport");

            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = tokio::time::timeout(
                    config.connect_timeout,
                    self.inner.connector.connect(&config.endpoint_url),
                ) => result,
            };

            match opened {
                Ok(Ok(transport)) => {
                    backoff.reset();
                    match self.run_session(generation, transport, &cancel).await {
                        SessionEnd::Intentional => break,
                        SessionEnd::Lost(reason) => {
                            warn!(reason = %reason, "Connection lost");
                            self.transition(generation, ConnectionState::Disconnected);
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Connection attempt failed");
                    self.transition(generation, ConnectionState::Disconnected);
                }
                Err(_) => {
                    warn!(
                        timeout_ms = duration_to_millis(config.connect_timeout),
                        "Connection attempt timed out"
                    );
                    self.transition(generation, ConnectionState::Disconnected);
                }
            }

            if cancel.is_cancelled() || !self.is_current(generation) {
                break;
            }

            let delay = backoff.record_failure();
            self.lock().failures = backoff.failures();

            let Some(delay) = delay else {
                error!(
                    attempts = backoff.failures(),
                    "Reconnection abandoned after repeated failures"
                );
                self.inner.status.emit_lossy(StatusEvent::ReconnectAbandoned {
                    attempts: backoff.failures(),
                    timestamp: Utc::now(),
                });
                break;
            };

            info!(
                attempt = backoff.failures(),
                delay_ms = duration_to_millis(delay),
                "Reconnect scheduled"
            );
            self.inner.status.emit_lossy(StatusEvent::ReconnectScheduled {
                attempt: backoff.failures(),
                delay_ms: duration_to_millis(delay),
                timestamp: Utc::now(),
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let mut shared = self.lock();
        if shared.generation == generation {
            shared.cycle = None;
        }
    }

    async fn run_session(
        &self,
        generation: u64,
        transport: Transport,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let Transport {
            mut sink,
            mut stream,
        } = transport;
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let session_id = Uuid::new_v4();

        let opened = {
            let mut shared = self.lock();
            if shared.generation == generation {
                let old_state = shared.state;
                shared.state = ConnectionState::Connected;
                shared.failures = 0;
                shared.outbound = Some(outbound_tx);
                shared.session_id = Some(session_id);
                shared.last_activity = Some(Utc::now());
                Some(old_state)
            } else {
                None
            }
        };
        let Some(old_state) = opened else {
            // Detached while the open was in flight
            let _ = sink.close().await;
            return SessionEnd::Intentional;
        };
        info!(session = %session_id, "Transport open");
        self.notify_transition(old_state, ConnectionState::Connected);

        let period = self.inner.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let ping = OutboundFrame::Ping.to_json();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let close = WireMessage::Close {
                        code: INTENTIONAL_CLOSE_CODE,
                        reason: "last consumer detached".to_string(),
                    };
                    if let Err(e) = sink.send(close).await {
                        debug!(session = %session_id, error = %e, "Close frame not delivered");
                    }
                    let _ = sink.close().await;
                    return SessionEnd::Intentional;
                }
                inbound = stream.next() => match inbound {
                    Some(Ok(text)) => {
                        self.touch();
                        trace!(session = %session_id, len = text.len(), "Frame received");
                        if let Some(listener) = self.listener() {
                            listener.on_frame(&text);
                        }
                    }
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    None => return SessionEnd::Lost("closed by peer".to_string()),
                },
                Some(text) = outbound_rx.recv() => {
                    if let Err(e) = sink.send(WireMessage::Text(text)).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                    self.touch();
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = sink.send(WireMessage::Text(ping.clone())).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                    self.touch();
                    trace!(session = %session_id, "Heartbeat sent");
                }
            }
        }
    }
}

/// Attached consumer; detaches when dropped
pub struct Consumer {
    connection: ConnectionManager,
}

impl Consumer {
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.connection.detach();
    }
}
