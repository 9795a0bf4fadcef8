//! A single node connection: one socket, one reader task, one writer task,
//! and the pending table correlating responses to callers.
//!
//! Lifecycle:
//!
//! ```text
//! Disconnected --dial--> Connecting --tcp/tls ok--> Handshaking --ok--> Ready
//!                                 \--error--> Disconnected (backoff, redial)
//! Ready --socket error / peer close--> Closing --> Disconnected
//!                                      (pending requests fail with Disconnect)
//! ```
//!
//! Dialing and the backoff schedule live in [`crate::topology`]; this module
//! owns everything from an established stream onwards. A connection is only
//! handed out once the handshake (HELLO/AUTH/SETNAME/SELECT) has completed,
//! so holding a [`Connection`] implies Ready.
//!
//! The writer drains its queue in batches: whatever accumulated while the
//! previous drain was in flight is encoded and flushed as one write. The
//! reader resolves each decoded frame against the front of the in-flight
//! queue; a reply with no matching callback is a protocol violation that
//! tears the connection down.

use crate::codec::valkey::{NegotiatedProtocol, ValkeyCodecBuilder, ValkeyDecoder, ValkeyEncoder};
use crate::codec::{CodecBuilder, CodecReadError, Direction};
use crate::config::{ClientConfig, Credentials, ProtocolVersion};
use crate::error::Error;
use crate::frame::{expect_ok, ValkeyFrame};
use crate::protocol::CallbackId;
use crate::tcp;
use crate::tls::TlsConnector;
use anyhow::anyhow;
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{split, AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, Instrument};

/// An unrecoverable error on a node connection. The connection is no longer
/// usable after one of these is observed.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("the server closed the connection")]
    OtherSideClosed,
    #[error("the connection was closed locally")]
    LocalClosed,
    #[error("message decode error {0}")]
    MessageDecode(Arc<anyhow::Error>),
    #[error("message encode error {0}")]
    MessageEncode(Arc<anyhow::Error>),
    #[error("io error {0}")]
    Io(Arc<std::io::Error>),
}

/// What the handshake needs to know, split out of [`ClientConfig`] so the
/// topology can hand it to every connection it dials.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub protocol: ProtocolVersion,
    pub credentials: Option<Credentials>,
    pub client_name: Option<String>,
    /// Standalone only; cluster connections never SELECT.
    pub database_id: Option<i64>,
}

impl HandshakeConfig {
    pub fn from_config(config: &ClientConfig) -> Self {
        HandshakeConfig {
            protocol: config.protocol,
            credentials: config.credentials.clone(),
            client_name: config.client_name.clone(),
            database_id: if config.cluster_mode {
                None
            } else {
                config.database_id
            },
        }
    }
}

pub(crate) enum Request {
    Single {
        frame: ValkeyFrame,
        tx: oneshot::Sender<Result<ValkeyFrame, Error>>,
    },
    /// A pipelined batch whose replies are collected in order. Used for
    /// transactions (MULTI..EXEC) and ASKING-prefixed redirects.
    Batch {
        frames: Vec<ValkeyFrame>,
        tx: oneshot::Sender<Result<Vec<ValkeyFrame>, Error>>,
    },
}

enum ResponseSink {
    Single(oneshot::Sender<Result<ValkeyFrame, Error>>),
    Batch {
        state: Arc<Mutex<BatchState>>,
        index: usize,
    },
}

struct BatchState {
    results: Vec<Option<ValkeyFrame>>,
    remaining: usize,
    tx: Option<oneshot::Sender<Result<Vec<ValkeyFrame>, Error>>>,
}

struct Waiter {
    sink: ResponseSink,
}

/// The per-connection pending table: a slab of waiters indexed by callback
/// id, a free-list stack recycling ids, and the in-flight FIFO that maps
/// response order back to callback ids. A callback id lives in exactly one
/// table and exactly once in its in-flight queue.
pub(crate) struct PendingTable {
    entries: Vec<Option<Waiter>>,
    free: Vec<CallbackId>,
    in_flight: VecDeque<CallbackId>,
    last_activity: Instant,
}

impl PendingTable {
    fn new() -> Self {
        PendingTable {
            entries: Vec::new(),
            free: Vec::new(),
            in_flight: VecDeque::new(),
            last_activity: Instant::now(),
        }
    }

    fn allocate(&mut self, waiter: Waiter) -> CallbackId {
        self.last_activity = Instant::now();
        match self.free.pop() {
            Some(id) => {
                self.entries[id as usize] = Some(waiter);
                id
            }
            None => {
                self.entries.push(Some(waiter));
                (self.entries.len() - 1) as CallbackId
            }
        }
    }

    fn enqueue(&mut self, request: Request, frames: &mut Vec<ValkeyFrame>) {
        match request {
            Request::Single { frame, tx } => {
                let id = self.allocate(Waiter {
                    sink: ResponseSink::Single(tx),
                });
                self.in_flight.push_back(id);
                frames.push(frame);
            }
            Request::Batch {
                frames: batch_frames,
                tx,
            } => {
                let state = Arc::new(Mutex::new(BatchState {
                    results: vec![None; batch_frames.len()],
                    remaining: batch_frames.len(),
                    tx: Some(tx),
                }));
                for (index, frame) in batch_frames.into_iter().enumerate() {
                    let id = self.allocate(Waiter {
                        sink: ResponseSink::Batch {
                            state: state.clone(),
                            index,
                        },
                    });
                    self.in_flight.push_back(id);
                    frames.push(frame);
                }
            }
        }
    }

    /// Resolves the oldest in-flight callback with `frame`. Fails when there
    /// is nothing in flight, which means the server replied to a request we
    /// never made.
    fn resolve_next(&mut self, frame: ValkeyFrame) -> anyhow::Result<()> {
        self.last_activity = Instant::now();
        let id = self
            .in_flight
            .pop_front()
            .ok_or_else(|| anyhow!("received a reply with no request in flight"))?;
        let waiter = self.entries[id as usize]
            .take()
            .ok_or_else(|| anyhow!("callback {id} has no pending entry"))?;
        self.free.push(id);

        match waiter.sink {
            ResponseSink::Single(tx) => {
                // A dropped receiver means the caller timed out; the slot is
                // released either way so the table returns to baseline.
                let _ = tx.send(Ok(frame));
            }
            ResponseSink::Batch { state, index } => {
                let mut state = state.lock().unwrap();
                state.results[index] = Some(frame);
                state.remaining -= 1;
                if state.remaining == 0 {
                    if let Some(tx) = state.tx.take() {
                        let results = state.results.drain(..).map(|r| r.unwrap()).collect();
                        let _ = tx.send(Ok(results));
                    }
                }
            }
        }
        Ok(())
    }

    /// Rejects every pending request. Used on teardown (`Disconnect`) and on
    /// client close (`Closing`).
    fn fail_all(&mut self, error: &Error) {
        self.in_flight.clear();
        for (id, slot) in self.entries.iter_mut().enumerate() {
            if let Some(waiter) = slot.take() {
                self.free.push(id as CallbackId);
                match waiter.sink {
                    ResponseSink::Single(tx) => {
                        let _ = tx.send(Err(error.clone()));
                    }
                    ResponseSink::Batch { state, .. } => {
                        let mut state = state.lock().unwrap();
                        if let Some(tx) = state.tx.take() {
                            let _ = tx.send(Err(error.clone()));
                        }
                    }
                }
            }
        }
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    fn is_idle(&self, timeout: Duration) -> bool {
        self.in_flight.is_empty()
            && self.pending_len() == 0
            && self.last_activity.elapsed() >= timeout
    }
}

/// A Ready connection to one node. Dropping it (or calling [`close`]) stops
/// both IO tasks.
///
/// [`close`]: Connection::close
pub struct Connection {
    request_tx: mpsc::UnboundedSender<Request>,
    pending: Arc<Mutex<PendingTable>>,
    error: Arc<Mutex<Option<ConnectionError>>>,
    shutdown: Arc<Notify>,
    protocol: NegotiatedProtocol,
    address: String,
}

impl Connection {
    /// Dials `address`, spawns the IO tasks and runs the handshake. The
    /// returned connection is Ready; any failure along the way aborts the
    /// whole attempt.
    pub async fn connect(
        address: &str,
        handshake: &HandshakeConfig,
        tls: &Option<TlsConnector>,
        connect_timeout: Duration,
    ) -> Result<Connection, Error> {
        let protocol = NegotiatedProtocol::new(handshake.protocol);
        let codec_builder = ValkeyCodecBuilder::new(Direction::Sink, protocol.clone());

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(PendingTable::new()));
        let error = Arc::new(Mutex::new(None));
        let shutdown = Arc::new(Notify::new());

        if let Some(tls) = tls {
            let tls_stream = tls.connect(connect_timeout, address.to_string()).await?;
            let (rx, tx) = split(tls_stream);
            spawn_read_write_tasks(
                codec_builder,
                rx,
                tx,
                request_rx,
                pending.clone(),
                error.clone(),
                shutdown.clone(),
            );
        } else {
            let tcp_stream = tcp::dial(connect_timeout, address).await?;
            let (rx, tx) = tcp_stream.into_split();
            spawn_read_write_tasks(
                codec_builder,
                rx,
                tx,
                request_rx,
                pending.clone(),
                error.clone(),
                shutdown.clone(),
            );
        }

        let connection = Connection {
            request_tx,
            pending,
            error,
            shutdown,
            protocol,
            address: address.to_string(),
        };

        if let Err(err) = connection.handshake(handshake).await {
            // Abort the whole attempt; a half-shaken connection is useless.
            connection.close(&Error::Closing);
            return Err(err);
        }
        Ok(connection)
    }

    /// The handshake, in order: HELLO (RESP3, with inline AUTH), degrading
    /// to the RESP2 AUTH fallback when the server does not know HELLO; then
    /// CLIENT SETNAME; then SELECT for standalone databases.
    async fn handshake(&self, config: &HandshakeConfig) -> Result<(), Error> {
        if config.protocol == ProtocolVersion::Resp3 {
            let mut hello = ValkeyFrame::Array(vec![
                ValkeyFrame::BulkString("HELLO".into()),
                ValkeyFrame::BulkString("3".into()),
            ]);
            if let Some(credentials) = &config.credentials {
                if let ValkeyFrame::Array(parts) = &mut hello {
                    parts.push(ValkeyFrame::BulkString("AUTH".into()));
                    parts.push(ValkeyFrame::BulkString(
                        credentials
                            .username
                            .clone()
                            .unwrap_or_else(|| "default".into())
                            .into_bytes()
                            .into(),
                    ));
                    parts.push(ValkeyFrame::BulkString(
                        credentials.password.clone().into_bytes().into(),
                    ));
                }
            }

            match self.request(hello).await? {
                ValkeyFrame::Error(e) if e.starts_with("ERR") => {
                    // Pre-HELLO server. Fall back to the RESP2 handshake.
                    debug!("{}: server rejected HELLO, using RESP2", self.address);
                    self.protocol.downgrade_to_resp2();
                    self.resp2_auth(config).await?;
                }
                ValkeyFrame::Error(e) => return Err(crate::frame::error_from_reply(&e)),
                _ => {}
            }
        } else {
            self.resp2_auth(config).await?;
        }

        if let Some(name) = &config.client_name {
            let reply = self
                .request(
                    crate::commands::cmd("CLIENT")
                        .arg("SETNAME")
                        .arg(name.clone())
                        .to_frame(),
                )
                .await?;
            expect_ok(&reply)?;
        }

        if let Some(database_id) = config.database_id {
            let reply = self
                .request(crate::commands::cmd("SELECT").arg(database_id).to_frame())
                .await?;
            expect_ok(&reply)?;
        }

        Ok(())
    }

    async fn resp2_auth(&self, config: &HandshakeConfig) -> Result<(), Error> {
        if let Some(credentials) = &config.credentials {
            let mut auth = crate::commands::cmd("AUTH");
            if let Some(username) = &credentials.username {
                auth = auth.arg(username.clone());
            }
            auth = auth.arg(credentials.password.clone());
            let reply = self.request(auth.to_frame()).await?;
            expect_ok(&reply)?;
        }
        Ok(())
    }

    fn stored_error(&self) -> ConnectionError {
        self.error
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(ConnectionError::LocalClosed)
    }

    /// Queues `frame` for the next writer drain. Fails without side effects
    /// when the connection is dead: a request rejected here was never
    /// written, so re-dispatching it elsewhere is always safe.
    pub fn send(
        &self,
        frame: ValkeyFrame,
    ) -> Result<oneshot::Receiver<Result<ValkeyFrame, Error>>, Error> {
        let (tx, rx) = oneshot::channel();
        self.request_tx
            .send(Request::Single { frame, tx })
            .map_err(|_| Error::Connection(self.stored_error()))?;
        Ok(rx)
    }

    /// Queues a pipelined batch; the receiver yields every reply in order.
    pub fn send_batch(
        &self,
        frames: Vec<ValkeyFrame>,
    ) -> Result<oneshot::Receiver<Result<Vec<ValkeyFrame>, Error>>, Error> {
        let (tx, rx) = oneshot::channel();
        self.request_tx
            .send(Request::Batch { frames, tx })
            .map_err(|_| Error::Connection(self.stored_error()))?;
        Ok(rx)
    }

    /// Sends one frame and awaits its reply.
    pub async fn request(&self, frame: ValkeyFrame) -> Result<ValkeyFrame, Error> {
        let rx = self.send(frame)?;
        rx.await
            .map_err(|_| Error::Connection(self.stored_error()))?
    }

    pub fn is_closed(&self) -> bool {
        self.request_tx.is_closed()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// True when nothing is pending and the connection has been quiet for at
    /// least `timeout`; the topology reaper uses this.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.pending.lock().unwrap().is_idle(timeout)
    }

    /// Rejects everything pending with `error` and stops both IO tasks.
    pub fn close(&self, error: &Error) {
        self.pending.lock().unwrap().fail_all(error);
        *self.error.lock().unwrap() = Some(ConnectionError::LocalClosed);
        self.shutdown.notify_waiters();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.notify_waiters();
    }
}

fn spawn_read_write_tasks<
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
>(
    codec_builder: ValkeyCodecBuilder,
    stream_rx: R,
    stream_tx: W,
    request_rx: UnboundedReceiver<Request>,
    pending: Arc<Mutex<PendingTable>>,
    error: Arc<Mutex<Option<ConnectionError>>>,
    shutdown: Arc<Notify>,
) {
    let (decoder, encoder) = codec_builder.build();
    let reader = FramedRead::new(stream_rx, decoder);
    let writer = FramedWrite::new(stream_tx, encoder);

    let reader_pending = pending.clone();
    let reader_error = error.clone();
    let reader_shutdown = shutdown.clone();
    tokio::spawn(
        async move {
            let result = tokio::select! {
                result = reader_task(reader, reader_pending.clone()) => result,
                _ = reader_shutdown.notified() => Ok(()),
            };
            if let Err(err) = result {
                trace!("reader task finished: {err}");
                *reader_error.lock().unwrap() = Some(err.clone());
                reader_pending
                    .lock()
                    .unwrap()
                    .fail_all(&Error::Connection(err));
                // Stop the writer too; a half-dead connection is dead.
                reader_shutdown.notify_waiters();
            }
        }
        .in_current_span(),
    );

    tokio::spawn(
        async move {
            let result = tokio::select! {
                result = writer_task(writer, request_rx, pending.clone()) => result,
                _ = shutdown.notified() => Ok(()),
            };
            if let Err(err) = result {
                trace!("writer task finished: {err}");
                *error.lock().unwrap() = Some(err.clone());
                pending.lock().unwrap().fail_all(&Error::Connection(err));
                shutdown.notify_waiters();
            }
        }
        .in_current_span(),
    );
}

async fn reader_task<R: AsyncRead + Unpin + Send + 'static>(
    mut reader: FramedRead<R, ValkeyDecoder>,
    pending: Arc<Mutex<PendingTable>>,
) -> Result<(), ConnectionError> {
    while let Some(result) = reader.next().await {
        match result {
            Ok(frames) => {
                let mut pending = pending.lock().unwrap();
                for frame in frames {
                    pending
                        .resolve_next(frame)
                        .map_err(|e| ConnectionError::MessageDecode(Arc::new(e)))?;
                }
            }
            Err(CodecReadError::Parser(err)) => {
                return Err(ConnectionError::MessageDecode(Arc::new(err)));
            }
            Err(CodecReadError::Io(err)) => {
                return Err(ConnectionError::Io(Arc::new(err)));
            }
        }
    }
    Err(ConnectionError::OtherSideClosed)
}

async fn writer_task<W: AsyncWrite + Unpin + Send + 'static>(
    mut writer: FramedWrite<W, ValkeyEncoder>,
    mut request_rx: UnboundedReceiver<Request>,
    pending: Arc<Mutex<PendingTable>>,
) -> Result<(), ConnectionError> {
    loop {
        let first = match request_rx.recv().await {
            Some(request) => request,
            // The connection handle was dropped; nothing left to write.
            None => return Ok(()),
        };

        // Everything that queued while the last drain was in flight goes out
        // in this one, as a single flush.
        let mut requests = vec![first];
        loop {
            match request_rx.try_recv() {
                Ok(request) => requests.push(request),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        let mut frames = Vec::with_capacity(requests.len());
        {
            let mut pending = pending.lock().unwrap();
            for request in requests {
                pending.enqueue(request, &mut frames);
            }
        }

        match writer.send(frames).await {
            Ok(()) => {}
            Err(crate::codec::CodecWriteError::Encoder(err)) => {
                return Err(ConnectionError::MessageEncode(Arc::new(err)));
            }
            Err(crate::codec::CodecWriteError::Io(err)) => {
                if matches!(
                    err.kind(),
                    ErrorKind::BrokenPipe | ErrorKind::ConnectionReset
                ) {
                    return Err(ConnectionError::OtherSideClosed);
                } else {
                    return Err(ConnectionError::Io(Arc::new(err)));
                }
            }
        }
    }
}
