//! Transport layer for the collector connection
//!
//! The session consumes the transport as a capability: a factory creates a
//! handle bound to an event sink, the handle accepts non-blocking commands
//! (connect, write, read, close), and completions come back asynchronously as
//! [`TransportEvent`]s on the sink.
//!
//! The TCP implementation runs one I/O task per handle. Commands are
//! processed strictly in order — a write enqueued while a connect is still in
//! flight goes out once the connection is up, and a close command only runs
//! after every earlier write has completed. An armed response read does not
//! hold up the command stream: it stays pending on the side while writes
//! continue, mirroring the independent read/write queues of the socket layer
//! this design comes from. While connected and idle the task watches the
//! socket, so a server-side close surfaces as a disconnect event right away
//! instead of on the next write. A response read that times out tears the
//! connection down; the session sees an ordinary disconnect and recovers
//! through its normal reconnect path.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::protocol::MessageKind;

/// Event delivered by a transport to its owning session
#[derive(Debug)]
pub enum TransportEvent {
    /// The connection to the collector is established
    Connected { host: String, port: u16 },
    /// A write finished; `tag` is the kind passed to [`Transport::write`]
    WriteComplete { tag: MessageKind },
    /// A response line arrived for an armed read
    DataReceived { tag: MessageKind, data: Vec<u8> },
    /// The connection is gone (error, EOF, read timeout, or requested close)
    Disconnected { error: Option<Error> },
}

/// Delivers transport events back to the owning session.
///
/// Each transport handle is bound to one sink for its whole lifetime. The
/// sink stamps every event with the generation of the handle that produced
/// it, which lets the session discard events from a handle it has already
/// replaced.
#[derive(Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl EventSink {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { generation, tx }
    }

    /// Deliver an event; silently dropped if the session is gone
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send((self.generation, event));
    }
}

/// A non-blocking transport handle.
///
/// Every method returns immediately; outcomes arrive as events on the sink
/// the handle was created with.
pub trait Transport: Send {
    /// Whether the connection is currently established
    fn is_connected(&self) -> bool;

    /// Initiate a connection to the endpoint.
    ///
    /// Completion is reported as [`TransportEvent::Connected`] or
    /// [`TransportEvent::Disconnected`]; an immediate error here means the
    /// command could not even be queued.
    fn connect(&mut self, host: &str, port: u16) -> Result<()>;

    /// Queue bytes for writing; completion arrives as `WriteComplete { tag }`
    fn write(&mut self, bytes: Vec<u8>, tag: MessageKind);

    /// Arm a single response read with a timeout
    fn read(&mut self, timeout: Duration, tag: MessageKind);

    /// Close the connection once all queued writes have completed
    fn close_after_writes(&mut self);
}

/// Creates transport handles bound to a session's event sink
pub trait TransportFactory: Send {
    fn create(&self, sink: EventSink) -> Result<Box<dyn Transport>>;
}

/// Factory for the tokio TCP transport.
///
/// Creation spawns the handle's I/O task and therefore requires a running
/// tokio runtime; outside one it fails with `Error::TransportCreation`.
#[derive(Debug, Default)]
pub struct TcpTransportFactory;

impl TransportFactory for TcpTransportFactory {
    fn create(&self, sink: EventSink) -> Result<Box<dyn Transport>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::TransportCreation(format!("no tokio runtime: {}", e)))?;

        let (cmds, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));

        let task = IoTask {
            rx,
            sink,
            connected: Arc::clone(&connected),
            reader: None,
            writer: None,
            active_read: None,
            read_buf: Vec::new(),
            data_pending: false,
        };
        runtime.spawn(task.run());

        Ok(Box::new(TcpTransport { cmds, connected }))
    }
}

/// TCP transport handle; all I/O happens on the handle's task
struct TcpTransport {
    cmds: mpsc::UnboundedSender<IoCommand>,
    connected: Arc<AtomicBool>,
}

enum IoCommand {
    Connect { host: String, port: u16 },
    Write { bytes: Vec<u8>, tag: MessageKind },
    Read { timeout: Duration, tag: MessageKind },
    CloseAfterWrites,
}

impl Transport for TcpTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        self.cmds
            .send(IoCommand::Connect {
                host: host.to_string(),
                port,
            })
            .map_err(|_| Error::Connection("transport task is gone".to_string()))
    }

    fn write(&mut self, bytes: Vec<u8>, tag: MessageKind) {
        let _ = self.cmds.send(IoCommand::Write { bytes, tag });
    }

    fn read(&mut self, timeout: Duration, tag: MessageKind) {
        let _ = self.cmds.send(IoCommand::Read { timeout, tag });
    }

    fn close_after_writes(&mut self) {
        let _ = self.cmds.send(IoCommand::CloseAfterWrites);
    }
}

/// An armed response read waiting for a line or its deadline
struct ActiveRead {
    tag: MessageKind,
    deadline: Instant,
}

/// One observation of the I/O loop
enum Step {
    Cmd(Option<IoCommand>),
    ReadDone(io::Result<usize>),
    ReadTimeout,
    Idle(io::Result<usize>),
}

/// Sequential I/O worker behind a [`TcpTransport`] handle
struct IoTask {
    rx: mpsc::UnboundedReceiver<IoCommand>,
    sink: EventSink,
    connected: Arc<AtomicBool>,
    reader: Option<BufReader<OwnedReadHalf>>,
    writer: Option<OwnedWriteHalf>,
    /// Armed response read, if any; writes keep flowing while it pends
    active_read: Option<ActiveRead>,
    /// Accumulates the response line across loop iterations
    read_buf: Vec<u8>,
    /// Unconsumed bytes sit in the read buffer; suspend the idle watch so it
    /// does not spin until an armed read drains them
    data_pending: bool,
}

impl IoTask {
    async fn run(mut self) {
        loop {
            let step = {
                let IoTask {
                    rx,
                    reader,
                    active_read,
                    read_buf,
                    data_pending,
                    ..
                } = &mut self;

                match (reader.as_mut(), active_read.as_ref()) {
                    // A response read is armed: race it against its deadline
                    // while still accepting commands.
                    (Some(reader), Some(read)) => {
                        tokio::select! {
                            biased;
                            cmd = rx.recv() => Step::Cmd(cmd),
                            res = tokio::time::timeout_at(read.deadline, reader.read_until(b'\n', read_buf)) => {
                                match res {
                                    Ok(io_res) => Step::ReadDone(io_res),
                                    Err(_) => Step::ReadTimeout,
                                }
                            }
                        }
                    }
                    // Connected and idle: watch the socket so a remote close
                    // is noticed without waiting for the next write.
                    (Some(reader), None) if !*data_pending => {
                        tokio::select! {
                            biased;
                            cmd = rx.recv() => Step::Cmd(cmd),
                            res = reader.fill_buf() => Step::Idle(res.map(|buf| buf.len())),
                        }
                    }
                    _ => Step::Cmd(rx.recv().await),
                }
            };

            match step {
                Step::Cmd(Some(cmd)) => self.dispatch(cmd).await,
                // Handle dropped: the session replaced or released this
                // transport. Exit quietly; a disconnect event now would be
                // stale anyway.
                Step::Cmd(None) => return,
                Step::ReadDone(Ok(0)) | Step::Idle(Ok(0)) => {
                    self.teardown(Some(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by collector",
                    ))))
                    .await;
                }
                Step::ReadDone(Ok(_)) => {
                    if let Some(read) = self.active_read.take() {
                        let data = std::mem::take(&mut self.read_buf);
                        self.data_pending = false;
                        self.sink.emit(TransportEvent::DataReceived {
                            tag: read.tag,
                            data,
                        });
                    }
                }
                Step::ReadDone(Err(e)) | Step::Idle(Err(e)) => {
                    self.teardown(Some(e.into())).await
                }
                Step::ReadTimeout => {
                    self.teardown(Some(Error::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "timed out waiting for collector response",
                    ))))
                    .await;
                }
                Step::Idle(Ok(_)) => self.data_pending = true,
            }
        }
    }

    async fn dispatch(&mut self, cmd: IoCommand) {
        match cmd {
            IoCommand::Connect { host, port } => self.handle_connect(&host, port).await,
            IoCommand::Write { bytes, tag } => self.handle_write(bytes, tag).await,
            IoCommand::Read { timeout, tag } => self.arm_read(timeout, tag),
            IoCommand::CloseAfterWrites => self.teardown(None).await,
        }
    }

    async fn handle_connect(&mut self, host: &str, port: u16) {
        if self.writer.is_some() {
            tracing::debug!(host, port, "connect requested while already connected");
            return;
        }

        match TcpStream::connect((host, port)).await {
            Ok(stream) => {
                let (read_half, write_half) = stream.into_split();
                self.reader = Some(BufReader::new(read_half));
                self.writer = Some(write_half);
                self.active_read = None;
                self.read_buf.clear();
                self.data_pending = false;
                self.connected.store(true, Ordering::SeqCst);
                self.sink.emit(TransportEvent::Connected {
                    host: host.to_string(),
                    port,
                });
            }
            Err(e) => {
                tracing::debug!(host, port, error = %e, "connect attempt failed");
                self.sink.emit(TransportEvent::Disconnected {
                    error: Some(e.into()),
                });
            }
        }
    }

    async fn handle_write(&mut self, bytes: Vec<u8>, tag: MessageKind) {
        let Some(writer) = self.writer.as_mut() else {
            // A failed connect already produced a disconnect event for this
            // cycle; orphaned writes just repeat it.
            self.teardown(Some(Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "write with no connection",
            ))))
            .await;
            return;
        };

        match writer.write_all(&bytes).await {
            Ok(()) => self.sink.emit(TransportEvent::WriteComplete { tag }),
            Err(e) => self.teardown(Some(e.into())).await,
        }
    }

    fn arm_read(&mut self, timeout: Duration, tag: MessageKind) {
        if self.reader.is_none() {
            return;
        }
        if self.active_read.is_some() {
            tracing::debug!(tag = tag.wire_command(), "read armed while one is pending");
            return;
        }
        self.read_buf.clear();
        self.active_read = Some(ActiveRead {
            tag,
            deadline: Instant::now() + timeout,
        });
    }

    /// Drop the connection and report it, flushing the write half first
    async fn teardown(&mut self, error: Option<Error>) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        self.reader = None;
        self.active_read = None;
        self.read_buf.clear();
        self.data_pending = false;
        self.connected.store(false, Ordering::SeqCst);
        self.sink.emit(TransportEvent::Disconnected { error });
    }
}
