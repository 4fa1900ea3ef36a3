//! Relay connection management.
//!
//! A [`Connection`] multiplexes any number of concurrent requests over one
//! byte stream. Outbound requests get a fresh id and a slot in the pending
//! table; a single background reader resolves slots as replies arrive and
//! hands inbound requests to the user's [`Handler`], each on its own task.
//!
//! Only the writer task touches the write half. Callers and handler tasks
//! queue whole encoded frames for it, so a caller that gives up (or whose
//! future is dropped) can never leave a partial frame on the wire.

use crate::config::ConnectionConfig;
use crate::error::ClientError;
use crate::handler::{self, Handler};
use crate::ids::IdAllocator;
use crate::pending::{Outcome, PendingTable};
use bytes::Bytes;
use iris_protocol::{Decoder, Encoder, Envelope, Message, RequestId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How long `close` lets the writer flush queued frames and the CLOSE.
const CLOSE_LINGER: Duration = Duration::from_millis(250);

/// Cap on request deadlines, far enough out to never fire in practice.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Work for the writer task.
enum Outbound {
    /// One complete encoded frame.
    Frame(Bytes),
    /// Write the farewell frame, if any, then shut the stream down.
    Shutdown(Option<Bytes>),
}

/// A connection to an iris relay, attached to one cluster.
pub struct Connection {
    shared: Arc<Shared>,
    /// Background reader (the only task reading the stream).
    reader_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    /// Background writer (the only task writing the stream).
    writer_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// State shared between callers, the reader and writer tasks and handler tasks.
struct Shared {
    config: ConnectionConfig,
    cluster: String,
    connection_id: String,
    /// Queue feeding the writer task.
    outbound: mpsc::Sender<Outbound>,
    /// Requests waiting for a reply.
    pending: PendingTable,
    ids: IdAllocator,
    handler: Arc<dyn Handler>,
    connected: AtomicBool,
    /// Set once teardown has started, by either side.
    closing: AtomicBool,
}

impl Connection {
    /// Connects to the relay at `config.addr` and joins `cluster`.
    ///
    /// Requests addressed to `cluster` (including ones sent from this very
    /// connection) may be routed to `handler`.
    pub async fn connect<H: Handler>(
        config: ConnectionConfig,
        cluster: impl Into<String>,
        handler: H,
    ) -> Result<Self, ClientError> {
        tracing::debug!("Connecting to {}...", config.addr);

        let tcp_stream =
            tokio::time::timeout(config.connect_timeout, TcpStream::connect(config.addr))
                .await
                .map_err(|_| {
                    tracing::debug!("Connection timeout");
                    ClientError::ConnectTimeout
                })?
                .map_err(|e| {
                    tracing::debug!("Connection failed: {}", e);
                    ClientError::Io(e)
                })?;

        tcp_stream.set_nodelay(true).ok();

        Self::connect_stream(tcp_stream, config, cluster, handler).await
    }

    /// Runs the handshake over an already established byte stream and starts
    /// the reader and writer.
    pub async fn connect_stream<S, H>(
        stream: S,
        config: ConnectionConfig,
        cluster: impl Into<String>,
        handler: H,
    ) -> Result<Self, ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        H: Handler,
    {
        let cluster = cluster.into();
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader: BoxedReader = Box::new(read_half);
        let mut writer: BoxedWriter = Box::new(write_half);
        let mut decoder = Decoder::new();

        tracing::debug!("Starting handshake for cluster {}", cluster);
        let connection_id = tokio::time::timeout(
            config.connect_timeout,
            handshake(&mut reader, &mut writer, &mut decoder, &config, &cluster),
        )
        .await
        .map_err(|_| {
            tracing::debug!("Handshake timeout");
            ClientError::ConnectTimeout
        })??;
        tracing::info!("Connected as {} (cluster {})", connection_id, cluster);

        let (outbound, outbound_rx) = mpsc::channel(config.write_queue_capacity);
        let shared = Arc::new(Shared {
            config,
            cluster,
            connection_id,
            outbound,
            pending: PendingTable::new(),
            ids: IdAllocator::new(),
            handler: Arc::new(handler),
            connected: AtomicBool::new(true),
            closing: AtomicBool::new(false),
        });

        let writer_task = tokio::spawn(write_loop(shared.clone(), writer, outbound_rx));
        // Bytes that arrived behind the WELCOME stay in the decoder.
        let reader_task = tokio::spawn(read_loop(shared.clone(), reader, decoder));

        Ok(Self {
            shared,
            reader_task: parking_lot::Mutex::new(Some(reader_task)),
            writer_task: parking_lot::Mutex::new(Some(writer_task)),
        })
    }

    /// Sends `payload` to `cluster` and waits up to `timeout` for the reply.
    ///
    /// The timeout bounds the whole call, including any wait for room in the
    /// write queue. Returns the reply payload unchanged, or the error that
    /// ended the request: [`ClientError::Timeout`],
    /// [`ClientError::Application`] if the serving handler failed, or
    /// [`ClientError::ConnectionClosed`].
    pub async fn request(
        &self,
        cluster: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Bytes, ClientError> {
        if timeout.is_zero() {
            return Err(ClientError::InvalidTimeout);
        }
        if !self.is_connected() {
            return Err(ClientError::ConnectionClosed);
        }
        let deadline = Instant::now() + timeout.min(FAR_FUTURE);

        let shared = &self.shared;
        let id = shared.ids.next();
        let mut slot = shared.pending.register(id)?;

        let timeout_ms = u64::try_from(timeout.as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        let message = Message::request(id, cluster, timeout_ms, payload.into());
        tracing::debug!(
            "Sending request id={} to {} ({} bytes)",
            id,
            cluster,
            message.payload.len()
        );

        // On any early return the slot is dropped here, which removes its entry.
        let frame = Encoder::encode(&message)?.freeze();
        match tokio::time::timeout_at(deadline, shared.enqueue(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!("Request id={} not sent: {}", id, e);
                return Err(e);
            }
            Err(_) => {
                tracing::debug!("Request id={} timed out waiting for the writer", id);
                return Err(ClientError::Timeout);
            }
        }

        let outcome = slot.wait_until(deadline).await;
        match &outcome {
            Outcome::Reply(_) => tracing::debug!("Request id={} got reply", id),
            Outcome::TimedOut => tracing::debug!("Request id={} timed out", id),
            other => tracing::debug!("Request id={} failed: {:?}", id, other),
        }
        outcome.into_result()
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Relay-assigned connection id.
    pub fn connection_id(&self) -> &str {
        &self.shared.connection_id
    }

    /// Cluster this connection serves.
    pub fn cluster(&self) -> &str {
        &self.shared.cluster
    }

    /// Returns the number of pending requests.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Closes the connection.
    ///
    /// Every pending request fails with [`ClientError::ConnectionClosed`].
    /// Queued frames and a CLOSE get a short grace period to reach the relay;
    /// a transport that does not drain is abandoned. The handler's
    /// `handle_drop` is not called for a local close.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.shared.connected.store(false, Ordering::SeqCst);
        let already_closing = self.shared.closing.swap(true, Ordering::SeqCst);

        let cancelled = self.shared.pending.cancel_all(Outcome::Closed);
        let reader_task = self.reader_task.lock().take();
        if let Some(task) = reader_task {
            task.abort();
        }
        if already_closing {
            return Ok(());
        }
        tracing::debug!(
            "Closing connection {} ({} pending requests cancelled)",
            self.shared.connection_id,
            cancelled
        );

        let bye = Encoder::encode(&Message::close(None))?.freeze();
        let writer_task = self.writer_task.lock().take();
        if let Some(mut task) = writer_task {
            let queued = self
                .shared
                .outbound
                .try_send(Outbound::Shutdown(Some(bye)))
                .is_ok();
            if !queued || tokio::time::timeout(CLOSE_LINGER, &mut task).await.is_err() {
                // Dropping the queue also releases callers blocked on it.
                tracing::debug!("Writer did not drain, abandoning unsent frames");
                task.abort();
            }
        }

        tracing::debug!("Connection closed");
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.pending.cancel_all(Outcome::Closed);
        if let Some(task) = self.reader_task.get_mut().take() {
            task.abort();
        }
        if let Some(task) = self.writer_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Sends HELLO and waits for the relay's verdict. Returns the connection id.
async fn handshake(
    reader: &mut BoxedReader,
    writer: &mut BoxedWriter,
    decoder: &mut Decoder,
    config: &ConnectionConfig,
    cluster: &str,
) -> Result<String, ClientError> {
    let hello = Encoder::encode(&Message::hello(cluster, config.client_name.clone()))?;
    writer.write_all(&hello).await?;
    writer.flush().await?;

    let mut buf = vec![0u8; config.read_buffer_size];
    loop {
        if let Some(message) = decoder.decode_message()? {
            return match message.envelope {
                Envelope::Welcome { connection_id } => Ok(connection_id),
                Envelope::ErrorReply { error, .. } => Err(ClientError::Handshake(format!(
                    "{}: {}",
                    error.code, error.message
                ))),
                Envelope::Close { reason } => Err(ClientError::Handshake(
                    reason.unwrap_or_else(|| "closed by relay".to_string()),
                )),
                other => Err(ClientError::Handshake(format!(
                    "unexpected {} message",
                    other.kind()
                ))),
            };
        }

        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        decoder.extend(&buf[..n]);
    }
}

/// Reader task body: demultiplex until the stream ends, then tear down.
async fn read_loop(shared: Arc<Shared>, mut reader: BoxedReader, mut decoder: Decoder) {
    tracing::debug!("read_loop started");
    let reason = shared.demultiplex(&mut reader, &mut decoder).await;
    shared.teardown(reason);
}

/// Writer task body: writes queued frames one at a time, each in full.
async fn write_loop(
    shared: Arc<Shared>,
    mut writer: BoxedWriter,
    mut outbound: mpsc::Receiver<Outbound>,
) {
    tracing::debug!("write_loop started");
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(frame) => {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    tracing::debug!("write_loop: write error: {}", e);
                    shared.teardown(ClientError::Send(e));
                    return;
                }
            }
            Outbound::Shutdown(farewell) => {
                if let Some(frame) = farewell {
                    let _ = write_frame(&mut writer, &frame).await;
                }
                let _ = writer.shutdown().await;
                tracing::debug!("write_loop: stream shut down");
                return;
            }
        }
    }
}

async fn write_frame(writer: &mut BoxedWriter, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

impl Shared {
    /// Queues one encoded frame for the writer, waiting for room if needed.
    async fn enqueue(&self, frame: Bytes) -> Result<(), ClientError> {
        self.outbound
            .send(Outbound::Frame(frame))
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Processes inbound frames until the transport fails. Returns why.
    async fn demultiplex(
        self: &Arc<Self>,
        reader: &mut BoxedReader,
        decoder: &mut Decoder,
    ) -> ClientError {
        let mut buf = vec![0u8; self.config.read_buffer_size];

        loop {
            loop {
                match decoder.decode_message() {
                    Ok(Some(message)) => {
                        if let Some(reason) = self.dispatch(message) {
                            return reason;
                        }
                    }
                    Ok(None) => break,
                    Err(e) if e.is_recoverable() => {
                        tracing::warn!("read_loop: dropping bad frame: {}", e);
                    }
                    Err(e) => {
                        tracing::warn!("read_loop: stream corrupted: {}", e);
                        return ClientError::Protocol(e);
                    }
                }
            }

            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    tracing::debug!("read_loop: connection closed");
                    return ClientError::ConnectionClosed;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!("read_loop: read error: {}", e);
                    return ClientError::Io(e);
                }
            };
            decoder.extend(&buf[..n]);
        }
    }

    /// Routes one inbound message. Returns `Some` if the relay ended the session.
    fn dispatch(self: &Arc<Self>, message: Message) -> Option<ClientError> {
        match message.envelope {
            Envelope::Reply { id } => {
                if !self.pending.resolve(id, Outcome::Reply(message.payload)) {
                    tracing::debug!("read_loop: discarding reply for id={}", id);
                }
            }
            Envelope::ErrorReply { id, error } => {
                if !self.pending.resolve(id, Outcome::Rejected(error)) {
                    tracing::debug!("read_loop: discarding error reply for id={}", id);
                }
            }
            Envelope::Request { id, .. } => {
                self.serve(id, message.payload);
            }
            Envelope::Close { reason } => {
                tracing::info!(
                    "Relay closed connection {}: {}",
                    self.connection_id,
                    reason.as_deref().unwrap_or("no reason given")
                );
                return Some(ClientError::ConnectionClosed);
            }
            other => {
                tracing::warn!("read_loop: unexpected {} message", other.kind());
            }
        }
        None
    }

    /// Serves an inbound request on its own task and queues the reply.
    fn serve(self: &Arc<Self>, id: RequestId, request: Bytes) {
        let shared = self.clone();
        tokio::spawn(async move {
            let reply = handler::invoke(shared.handler.clone(), id, request).await;
            let sent = match Encoder::encode(&reply) {
                Ok(frame) => shared.enqueue(frame.freeze()).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = sent {
                tracing::debug!("Reply for inbound request id={} not sent: {}", id, e);
            }
        });
    }

    /// Fails all pending requests once either side of the transport is gone.
    fn teardown(&self, reason: ClientError) {
        self.connected.store(false, Ordering::SeqCst);
        let cancelled = self.pending.cancel_all(Outcome::Closed);

        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(
            "Connection {} lost: {} ({} pending requests failed)",
            self.connection_id,
            reason,
            cancelled
        );

        // A full queue means the writer is stuck; it ends with the connection.
        let _ = self.outbound.try_send(Outbound::Shutdown(None));

        let handler = self.handler.clone();
        tokio::task::spawn_blocking(move || handler.handle_drop(&reason));
    }
}
