//! Collector session state machine
//!
//! One [`Collector`] wraps one logical connection to one collector endpoint.
//! The session walks a fixed handshake before any metric flows:
//!
//! ```text
//! Disconnected → Connecting → HelloSent → AuthSent → Authenticated
//! ```
//!
//! Metrics submitted before authentication completes are buffered in a
//! pending queue and flushed FIFO the moment the collector acknowledges the
//! API key. A disconnect at any point clears the authentication flag and
//! drops the transport handle; the next metric write (or an explicit
//! [`Collector::connect`]) starts a fresh cycle.
//!
//! Metric submission never blocks and never fails: when no usable transport
//! can be obtained the line is dropped and counted, nothing more. A metrics
//! pipe must not take the host application down with it.
//!
//! All transport events funnel through a single dispatcher task, and every
//! state mutation happens under one mutex, so callback-driven flushes and
//! application-thread writes cannot interleave.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::{ClientIdentity, CollectorConfig};
use crate::error::{Error, Result};
use crate::protocol::{self, MessageKind, ACK};
use crate::transport::{
    EventSink, TcpTransportFactory, Transport, TransportEvent, TransportFactory,
};

/// Handle to a collector session.
///
/// Cheap to clone; all clones share the same session state. Construction
/// requires a running tokio runtime (the session spawns its event dispatcher
/// there) and immediately starts the first connection attempt. Synchronous
/// applications should use [`crate::blocking::BlockingCollector`] instead.
#[derive(Clone)]
pub struct Collector {
    state: Arc<Mutex<Session>>,
}

impl Collector {
    /// Create a session and start connecting to the configured endpoint.
    ///
    /// Fails only on invalid configuration or when no tokio runtime is
    /// available; a failed first connection attempt is logged and retried
    /// implicitly on the next write.
    pub fn new(config: CollectorConfig) -> Result<Self> {
        Self::with_transport_factory(config, ClientIdentity::detect(), Box::new(TcpTransportFactory))
    }

    /// Create a session announcing the given identity in its hello line
    pub fn with_identity(config: CollectorConfig, identity: ClientIdentity) -> Result<Self> {
        Self::with_transport_factory(config, identity, Box::new(TcpTransportFactory))
    }

    /// Create a session on a custom transport factory.
    ///
    /// This is the seam tests use to observe the wire without a socket.
    pub fn with_transport_factory(
        config: CollectorConfig,
        identity: ClientIdentity,
        factory: Box<dyn TransportFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let api_key = config.api_key.clone().unwrap_or_default();

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::TransportCreation(format!("no tokio runtime: {}", e)))?;

        let (events, mut rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(Session {
            config,
            api_key,
            identity,
            factory,
            transport: None,
            generation: 0,
            authenticated: false,
            pending: VecDeque::new(),
            dropped: 0,
            events,
        }));

        // Event dispatcher: the single serialized context every transport
        // event goes through. Holds only a weak reference so dropping the
        // last handle tears the whole session down.
        let weak = Arc::downgrade(&state);
        runtime.spawn(async move {
            while let Some((generation, event)) = rx.recv().await {
                let Some(state) = weak.upgrade() else { break };
                let mut session = lock_session(&state);
                session.handle_event(generation, event);
            }
        });

        let collector = Collector { state };
        if let Err(e) = collector.connect() {
            tracing::warn!(error = %e, "initial connection attempt failed");
        }
        Ok(collector)
    }

    /// Ensure a transport exists and initiate a connection if necessary.
    ///
    /// Non-blocking; completion (or failure) is handled internally. The
    /// returned error covers only what can be seen immediately: transport
    /// creation failure or a connect command that could not be issued.
    pub fn connect(&self) -> Result<()> {
        self.lock().connect()
    }

    /// Flush pending lines best-effort, then close once in-flight writes
    /// complete. Does not block waiting for closure.
    pub fn disconnect(&self) {
        self.lock().disconnect()
    }

    /// Increment a counter metric by 1
    pub fn increment(&self, name: &str) {
        self.increment_by(name, 1)
    }

    /// Increment a counter metric by an arbitrary amount
    pub fn increment_by(&self, name: &str, amount: i64) {
        self.lock().increment(name, amount)
    }

    /// Report a gauge reading
    pub fn gauge(&self, name: &str, value: f64) {
        self.lock().gauge(name, value, false)
    }

    /// Report an absolute gauge reading (`gauge_absolute` on the wire)
    pub fn gauge_absolute(&self, name: &str, value: f64) {
        self.lock().gauge(name, value, true)
    }

    /// Whether the handshake has completed on the current connection
    pub fn is_authenticated(&self) -> bool {
        self.lock().authenticated
    }

    /// Number of metric lines buffered while unauthenticated
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Number of metric lines dropped because no transport was available
    pub fn dropped_count(&self) -> u64 {
        self.lock().dropped
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        lock_session(&self.state)
    }
}

/// Lock the session, recovering the guard if a panicking writer poisoned it
fn lock_session(state: &Arc<Mutex<Session>>) -> MutexGuard<'_, Session> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Session state; every field is guarded by the [`Collector`] mutex
struct Session {
    config: CollectorConfig,
    api_key: String,
    identity: ClientIdentity,
    factory: Box<dyn TransportFactory>,
    /// Transport slot; `None` whenever the session is disconnected
    transport: Option<Box<dyn Transport>>,
    /// Generation of the current transport handle; events stamped with an
    /// older generation belong to a replaced handle and are discarded
    generation: u64,
    /// Set once the collector acknowledges the API key; cleared on disconnect
    authenticated: bool,
    /// Metric lines waiting for authentication, flushed FIFO
    pending: VecDeque<(String, MessageKind)>,
    /// Lines dropped for lack of a usable transport
    dropped: u64,
    events: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl Session {
    /// Get the transport, creating a fresh handle if the slot is empty
    fn ensure_transport(&mut self) -> Result<&mut Box<dyn Transport>> {
        let transport = match self.transport.take() {
            Some(transport) => transport,
            None => {
                self.generation += 1;
                let sink = EventSink::new(self.generation, self.events.clone());
                self.factory.create(sink)?
            }
        };
        Ok(self.transport.insert(transport))
    }

    fn connect(&mut self) -> Result<()> {
        let host = self.config.host.clone();
        let port = self.config.port;
        let transport = self.ensure_transport()?;
        if !transport.is_connected() {
            transport.connect(&host, port)?;
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.catch_up();
        if let Some(ref mut transport) = self.transport {
            transport.close_after_writes();
        }
    }

    fn increment(&mut self, name: &str, amount: i64) {
        let full_name = protocol::full_metric_name(self.config.prefix.as_deref(), name);
        let line = protocol::increment_line(&full_name, amount, protocol::unix_timestamp());
        self.write_metric(line, MessageKind::Increment);
    }

    fn gauge(&mut self, name: &str, value: f64, absolute: bool) {
        let full_name = protocol::full_metric_name(self.config.prefix.as_deref(), name);
        let line = protocol::gauge_line(&full_name, value, absolute, protocol::unix_timestamp());
        self.write_metric(line, MessageKind::Gauge);
    }

    /// Queue a metric line while unauthenticated, send it otherwise.
    ///
    /// Once authenticated, any lines still queued from before the handshake
    /// completed go out first, in their original order.
    fn write_metric(&mut self, line: String, kind: MessageKind) {
        if !self.authenticated {
            self.pending.push_back((line, kind));
            // A dead session revives on the next write; a handshake already
            // in flight is left alone.
            if self.transport.is_none() {
                if let Err(e) = self.connect() {
                    tracing::debug!(error = %e, "reconnect attempt failed");
                }
            }
            return;
        }

        self.catch_up();
        self.write(line, kind);
    }

    /// Flush the pending queue through the transport, FIFO
    fn catch_up(&mut self) {
        while let Some((line, kind)) = self.pending.pop_front() {
            self.write(line, kind);
        }
    }

    /// Write one line, reconnecting first if needed; drops the line when no
    /// usable transport can be obtained
    fn write(&mut self, line: String, kind: MessageKind) {
        if let Err(e) = self.connect() {
            self.dropped += 1;
            tracing::debug!(
                kind = kind.wire_command(),
                error = %e,
                dropped = self.dropped,
                "no transport available, dropping line"
            );
            return;
        }

        if let Some(ref mut transport) = self.transport {
            tracing::debug!(line = line.trim_end_matches('\n'), "writing line");
            transport.write(line.into_bytes(), kind);
        }
    }

    fn hello(&mut self) {
        let line = protocol::hello_line(&self.identity);
        self.write(line, MessageKind::Hello);
    }

    fn authenticate(&mut self) {
        let line = protocol::authenticate_line(&self.api_key);
        self.write(line, MessageKind::Auth);
    }

    fn handle_event(&mut self, generation: u64, event: TransportEvent) {
        if generation != self.generation || self.transport.is_none() {
            tracing::debug!(generation, "ignoring event from stale transport");
            return;
        }

        match event {
            TransportEvent::Connected { host, port } => {
                tracing::info!(host = %host, port, "connected to collector");
                self.hello();
            }
            TransportEvent::WriteComplete { tag } => {
                if tag.expects_response() {
                    let timeout = Duration::from_secs(self.config.response_timeout_secs);
                    if let Some(ref mut transport) = self.transport {
                        transport.read(timeout, tag);
                    }
                }
            }
            TransportEvent::DataReceived { tag, data } => {
                let response = String::from_utf8_lossy(&data);
                tracing::debug!(response = response.trim_end_matches('\n'), "read line");

                if response == ACK {
                    match tag {
                        MessageKind::Hello => self.authenticate(),
                        MessageKind::Auth => {
                            tracing::info!("authenticated with collector");
                            self.authenticated = true;
                            self.catch_up();
                        }
                        _ => {}
                    }
                }
                // Anything but the ack is ignored; the handshake stalls until
                // the next connection cycle.
            }
            TransportEvent::Disconnected { error } => {
                match error {
                    Some(e) => tracing::warn!(error = %e, "disconnected from collector"),
                    None => tracing::info!("disconnected from collector"),
                }
                self.authenticated = false;
                self.transport = None;
            }
        }
    }
}
