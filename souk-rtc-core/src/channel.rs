//! Transport channel
//!
//! A persistent, bidirectional, event-multiplexed connection shared by
//! call signaling, chat, and presence. The wire itself sits behind the
//! [`WireTransport`] trait; this module owns connection lifecycle,
//! bounded reconnection with exponential backoff, and the broadcast
//! stream collaborators subscribe to.
//!
//! Delivery is at-least-once per event: consumers must be idempotent to
//! duplicates (messages merge by id; signaling is guarded per call and
//! state transition).

use crate::wire::{ClientEvent, ServerEvent};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Channel errors
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Emit attempted while the channel is down
    #[error("channel is not connected")]
    NotConnected,

    /// The wire failed to establish a connection
    #[error("wire connection failed: {0}")]
    ConnectFailed(String),

    /// A send on an established connection failed
    #[error("wire send failed: {0}")]
    SendFailed(String),
}

/// Sending half of one established wire connection
#[async_trait]
pub trait WireSink: Send {
    /// Send one event to the server
    async fn send(&mut self, event: ClientEvent) -> Result<(), ChannelError>;
}

/// Receiving half of one established wire connection
#[async_trait]
pub trait WireStream: Send {
    /// Next event from the server; `None` when the connection closed
    async fn next_event(&mut self) -> Option<ServerEvent>;
}

/// Factory for wire connections
///
/// Implementations: [`crate::ws::WsTransport`] over WebSocket for
/// production, [`crate::loopback::LoopbackWire`] in-process for tests
/// and demos. The credential travels as connection-time metadata inside
/// the implementation, never inside event payloads.
#[async_trait]
pub trait WireTransport: Send + Sync {
    /// Establish one connection, returning its two halves
    async fn connect(&self)
        -> Result<(Box<dyn WireSink>, Box<dyn WireStream>), ChannelError>;
}

/// Reconnection and backoff tuning
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Consecutive failed attempts tolerated before giving up
    pub max_reconnect_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound on the retry delay
    pub max_backoff: Duration,
    /// Growth factor applied per failed attempt
    pub backoff_multiplier: f64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 8,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(15),
            backoff_multiplier: 2.0,
        }
    }
}

/// Connectivity and traffic notifications
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// First successful connection
    Connected,
    /// Connection re-established after a drop; collaborators should
    /// resynchronize (the chat store re-joins its active room)
    Reconnected,
    /// Connection lost or shut down
    Disconnected,
    /// An event arrived from the server
    Incoming(ServerEvent),
}

/// The process-wide transport channel
///
/// One instance per client with a single lifecycle (connect on auth,
/// disconnect on logout). Components subscribe to it rather than
/// owning it.
pub struct Channel {
    wire: Arc<dyn WireTransport>,
    config: ChannelConfig,
    outbox: parking_lot::Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>,
    connected: watch::Sender<bool>,
    events: broadcast::Sender<ChannelEvent>,
    run_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    /// Create a channel over the given wire
    #[must_use]
    pub fn new(wire: Arc<dyn WireTransport>, config: ChannelConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let (connected, _) = watch::channel(false);
        Self {
            wire,
            config,
            outbox: parking_lot::Mutex::new(None),
            connected,
            events,
            run_task: parking_lot::Mutex::new(None),
        }
    }

    /// Start the connection task
    ///
    /// Idempotent: a second call while the task is running is a no-op.
    pub fn connect(self: &Arc<Self>) {
        let mut task = self.run_task.lock();
        if task.is_some() {
            tracing::warn!("channel connect called while already running");
            return;
        }
        let channel = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            channel.run().await;
        }));
    }

    /// Shut the channel down
    pub fn disconnect(&self) {
        if let Some(task) = self.run_task.lock().take() {
            task.abort();
        }
        *self.outbox.lock() = None;
        let was_connected = *self.connected.borrow();
        let _ = self.connected.send_replace(false);
        if was_connected {
            let _ = self.events.send(ChannelEvent::Disconnected);
        }
        tracing::info!("channel disconnected");
    }

    /// Whether a live connection currently exists
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Watch connectivity changes
    #[must_use]
    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    /// Subscribe to channel events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Emit one event toward the server
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotConnected`] when no live connection
    /// exists. An event accepted here may still be lost if the wire
    /// rejects the write afterward; that tears the connection down and
    /// surfaces as [`ChannelEvent::Disconnected`], so consumers watch
    /// channel events rather than per-emit results for delivery health.
    pub fn emit(&self, event: ClientEvent) -> Result<(), ChannelError> {
        let guard = self.outbox.lock();
        match guard.as_ref() {
            Some(tx) => {
                tracing::trace!(event = event.name(), "emitting event");
                tx.send(event).map_err(|_| ChannelError::NotConnected)
            }
            None => Err(ChannelError::NotConnected),
        }
    }

    async fn run(self: Arc<Self>) {
        let mut ever_connected = false;
        let mut failed_attempts: u32 = 0;

        loop {
            match self.wire.connect().await {
                Ok((mut sink, mut stream)) => {
                    failed_attempts = 0;

                    let (tx, mut rx) = mpsc::unbounded_channel::<ClientEvent>();
                    *self.outbox.lock() = Some(tx);
                    let _ = self.connected.send_replace(true);
                    let _ = self.events.send(if ever_connected {
                        ChannelEvent::Reconnected
                    } else {
                        ChannelEvent::Connected
                    });
                    tracing::info!(reconnect = ever_connected, "channel connected");
                    ever_connected = true;

                    let mut writer = tokio::spawn(async move {
                        while let Some(event) = rx.recv().await {
                            if let Err(e) = sink.send(event).await {
                                tracing::warn!(error = %e, "wire send failed");
                                return;
                            }
                        }
                    });

                    loop {
                        tokio::select! {
                            // A failed wire send invalidates the whole
                            // connection even while reads still work;
                            // tear it down so nothing else is lost
                            // silently.
                            _ = &mut writer => break,
                            event = stream.next_event() => match event {
                                Some(event) => {
                                    tracing::trace!(event = event.name(), "incoming event");
                                    let _ = self.events.send(ChannelEvent::Incoming(event));
                                }
                                None => break,
                            },
                        }
                    }

                    writer.abort();
                    *self.outbox.lock() = None;
                    let _ = self.connected.send_replace(false);
                    let _ = self.events.send(ChannelEvent::Disconnected);
                    tracing::warn!("channel connection lost");
                }
                Err(e) => {
                    failed_attempts += 1;
                    if failed_attempts > self.config.max_reconnect_attempts {
                        tracing::error!(
                            attempts = failed_attempts - 1,
                            error = %e,
                            "giving up on reconnection"
                        );
                        return;
                    }
                    let backoff = self.backoff_delay(failed_attempts);
                    tracing::warn!(
                        attempt = failed_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "connect failed, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Exponential backoff with jitter for the given attempt number
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.initial_backoff.as_millis() as f64
            * self.config.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.config.max_backoff.as_millis() as f64);
        let jitter = rand::thread_rng().gen_range(0.0..=0.25);
        Duration::from_millis((capped * (1.0 + jitter)) as u64)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(task) = self.run_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::MessageId;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct PipeSink {
        tx: mpsc::UnboundedSender<ClientEvent>,
    }

    #[async_trait]
    impl WireSink for PipeSink {
        async fn send(&mut self, event: ClientEvent) -> Result<(), ChannelError> {
            self.tx
                .send(event)
                .map_err(|e| ChannelError::SendFailed(e.to_string()))
        }
    }

    struct PipeStream {
        rx: mpsc::UnboundedReceiver<ServerEvent>,
    }

    #[async_trait]
    impl WireStream for PipeStream {
        async fn next_event(&mut self) -> Option<ServerEvent> {
            self.rx.recv().await
        }
    }

    /// Server-side handles for one accepted connection
    struct ServerSide {
        to_client: mpsc::UnboundedSender<ServerEvent>,
        from_client: mpsc::UnboundedReceiver<ClientEvent>,
    }

    /// Wire that fails a configured number of times, then connects
    struct FlakyWire {
        failures_remaining: AtomicU32,
        accepted: parking_lot::Mutex<Vec<ServerSide>>,
    }

    impl FlakyWire {
        fn new(failures: u32) -> Self {
            Self {
                failures_remaining: AtomicU32::new(failures),
                accepted: parking_lot::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl WireTransport for FlakyWire {
        async fn connect(
            &self,
        ) -> Result<(Box<dyn WireSink>, Box<dyn WireStream>), ChannelError> {
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(ChannelError::ConnectFailed("flaky".to_string()));
            }
            let (up_tx, up_rx) = mpsc::unbounded_channel();
            let (down_tx, down_rx) = mpsc::unbounded_channel();
            self.accepted.lock().push(ServerSide {
                to_client: down_tx,
                from_client: up_rx,
            });
            Ok((
                Box::new(PipeSink { tx: up_tx }),
                Box::new(PipeStream { rx: down_rx }),
            ))
        }
    }

    fn fast_config() -> ChannelConfig {
        ChannelConfig {
            max_reconnect_attempts: 3,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn emit_before_connect_is_refused() {
        let wire = Arc::new(FlakyWire::new(0));
        let channel = Channel::new(wire, fast_config());

        let result = channel.emit(ClientEvent::MessageRead {
            message_id: MessageId::Server("m-1".to_string()),
        });
        assert!(matches!(result, Err(ChannelError::NotConnected)));
    }

    #[tokio::test]
    async fn connects_and_delivers_both_directions() {
        let wire = Arc::new(FlakyWire::new(0));
        let channel = Arc::new(Channel::new(wire.clone(), fast_config()));
        let mut events = channel.subscribe();

        channel.connect();
        assert!(matches!(
            events.recv().await.unwrap(),
            ChannelEvent::Connected
        ));
        assert!(channel.is_connected());

        channel
            .emit(ClientEvent::MessageRead {
                message_id: MessageId::Server("m-1".to_string()),
            })
            .unwrap();

        let mut server = wire.accepted.lock().pop().unwrap();
        let received = server.from_client.recv().await.unwrap();
        assert!(matches!(received, ClientEvent::MessageRead { .. }));

        server
            .to_client
            .send(ServerEvent::UserOnline {
                user_id: crate::types::UserId::new("u-1"),
            })
            .unwrap();
        loop {
            if let ChannelEvent::Incoming(ev) = events.recv().await.unwrap() {
                assert_eq!(ev.name(), "user_online");
                break;
            }
        }
    }

    #[tokio::test]
    async fn reconnects_after_drop_and_emits_reconnected() {
        let wire = Arc::new(FlakyWire::new(0));
        let channel = Arc::new(Channel::new(wire.clone(), fast_config()));
        let mut events = channel.subscribe();

        channel.connect();
        assert!(matches!(
            events.recv().await.unwrap(),
            ChannelEvent::Connected
        ));

        // Drop the server side; the stream closes and the channel retries.
        wire.accepted.lock().clear();

        assert!(matches!(
            events.recv().await.unwrap(),
            ChannelEvent::Disconnected
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            ChannelEvent::Reconnected
        ));
        assert!(channel.is_connected());
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let wire = Arc::new(FlakyWire::new(100));
        let channel = Arc::new(Channel::new(wire, fast_config()));

        channel.connect();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn survives_initial_failures_within_bound() {
        let wire = Arc::new(FlakyWire::new(2));
        let channel = Arc::new(Channel::new(wire, fast_config()));
        let mut events = channel.subscribe();

        channel.connect();
        assert!(matches!(
            events.recv().await.unwrap(),
            ChannelEvent::Connected
        ));
    }

    struct DeadSink;

    #[async_trait]
    impl WireSink for DeadSink {
        async fn send(&mut self, _event: ClientEvent) -> Result<(), ChannelError> {
            Err(ChannelError::SendFailed("broken pipe".to_string()))
        }
    }

    /// Wire whose writes always fail while the read side stays open
    struct DeadSinkWire {
        streams: parking_lot::Mutex<Vec<mpsc::UnboundedSender<ServerEvent>>>,
    }

    #[async_trait]
    impl WireTransport for DeadSinkWire {
        async fn connect(
            &self,
        ) -> Result<(Box<dyn WireSink>, Box<dyn WireStream>), ChannelError> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.streams.lock().push(tx);
            Ok((Box::new(DeadSink), Box::new(PipeStream { rx })))
        }
    }

    #[tokio::test]
    async fn send_failure_drops_the_connection() {
        let wire = Arc::new(DeadSinkWire {
            streams: parking_lot::Mutex::new(Vec::new()),
        });
        let channel = Arc::new(Channel::new(wire, fast_config()));
        let mut events = channel.subscribe();

        channel.connect();
        assert!(matches!(
            events.recv().await.unwrap(),
            ChannelEvent::Connected
        ));

        // The emit is accepted; the wire then rejects the write. The
        // channel must not pretend the connection is still usable.
        channel
            .emit(ClientEvent::MessageRead {
                message_id: MessageId::Server("m-1".to_string()),
            })
            .unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            ChannelEvent::Disconnected
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            ChannelEvent::Reconnected
        ));
    }
}
