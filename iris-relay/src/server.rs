//! TCP relay server.

use crate::config::Config;
use crate::error::RelayError;
use crate::router::{MemberId, Router};
use crate::session::{Session, SessionState};
use iris_protocol::{
    Decoder, Encoder, Envelope, ErrorCode, Message, ReplyError, RequestId, DEFAULT_PORT,
    PROTOCOL_VERSION,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

const READ_BUFFER_SIZE: usize = 8192;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Idle connection timeout (zero disables it).
    pub idle_timeout: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Interval between sweeps of expired routes.
    pub sweep_interval: Duration,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            idle_timeout: Duration::ZERO,
            max_connections: 1000,
            sweep_interval: Duration::from_secs(1),
            outbound_queue: 1024,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }
}

impl From<&Config> for ServerConfig {
    fn from(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            idle_timeout: config.network.idle_timeout(),
            max_connections: config.network.max_connections,
            sweep_interval: config.routing.sweep_interval(),
            outbound_queue: config.routing.outbound_queue,
        }
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub messages_received: AtomicU64,
    pub errors_total: AtomicU64,
}

/// TCP relay for iris clients.
pub struct Server {
    config: ServerConfig,
    router: Arc<Router>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            router: Arc::new(Router::new()),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and runs the server.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Runs the server on an already bound listener until [`Server::shutdown`].
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Relay listening on {}", listener.local_addr()?);

        let sweeper = self.spawn_sweeper();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.accept(stream, addr),
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Relay shutting down");
                    break;
                }
            }
        }

        sweeper.abort();
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn accept(&self, stream: TcpStream, addr: SocketAddr) {
        if self.stats.connections_active.load(Ordering::Relaxed)
            >= self.config.max_connections as u64
        {
            tracing::warn!("Connection limit reached, rejecting {}", addr);
            self.stats
                .connections_rejected
                .fetch_add(1, Ordering::Relaxed);
            tokio::spawn(async move {
                let mut stream = stream;
                let bye = Message::close(Some("connection limit reached".to_string()));
                if let Err(e) = write_message(&mut stream, &bye).await {
                    tracing::debug!("[{}] Failed to send close: {}", addr, e);
                }
                let _ = stream.shutdown().await;
            });
            return;
        }

        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let router = self.router.clone();
        let stats = self.stats.clone();
        let config = self.config.clone();
        let mut conn_shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("[{}] set_nodelay failed: {}", addr, e);
            }
            let result =
                Self::handle_connection(stream, addr, router, &stats, &config, &mut conn_shutdown)
                    .await;

            if let Err(e) = result {
                tracing::debug!("Connection {} error: {}", addr, e);
                stats.errors_total.fetch_add(1, Ordering::Relaxed);
            }

            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            tracing::info!("Client disconnected: {}", addr);
        });
    }

    fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let router = self.router.clone();
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                router.sweep_expired(Instant::now());
            }
        })
    }

    /// Runs one connection and removes it from the registry afterwards.
    async fn handle_connection(
        mut stream: TcpStream,
        addr: SocketAddr,
        router: Arc<Router>,
        stats: &ServerStats,
        config: &ServerConfig,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), RelayError> {
        tracing::info!("Client connected: {}", addr);

        let mut session = Session::new(addr);
        let result =
            Self::connection_loop(&mut stream, &mut session, &router, stats, config, shutdown)
                .await;

        if let Some(member) = session.member() {
            router.leave(member);
        }
        tracing::debug!(
            "[{}] session {} ({} in cluster {}) ended after {:?} ({} requests, {} replies)",
            addr,
            session.id,
            session.client_name().unwrap_or("anonymous"),
            session.cluster().unwrap_or("-"),
            session.age(),
            session.requests_sent(),
            session.replies_sent()
        );
        result
    }

    async fn connection_loop(
        stream: &mut TcpStream,
        session: &mut Session,
        router: &Router,
        stats: &ServerStats,
        config: &ServerConfig,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), RelayError> {
        let addr = session.remote_addr;
        let mut decoder = Decoder::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        // Messages routed to this connection by other sessions (or itself).
        let (outbound_tx, mut outbound) = mpsc::channel::<Message>(config.outbound_queue);
        let mut outbound_tx = Some(outbound_tx);
        let idle_enabled = !config.idle_timeout.is_zero();

        loop {
            tokio::select! {
                biased;

                Some(message) = outbound.recv() => {
                    session.touch();
                    write_message(stream, &message).await?;
                }

                result = stream.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("[{}] Connection closed by client", addr);
                            return Ok(());
                        }
                        Ok(n) => {
                            session.touch();
                            decoder.extend(&buf[..n]);
                        }
                        Err(e) => {
                            tracing::debug!("[{}] Read error: {}", addr, e);
                            return Err(RelayError::Io(e));
                        }
                    }
                }

                _ = tokio::time::sleep(config.idle_timeout), if idle_enabled => {
                    if session.idle_duration() >= config.idle_timeout {
                        tracing::debug!("[{}] Idle timeout", addr);
                        let close = Message::close(Some("idle timeout".to_string()));
                        let _ = write_message(stream, &close).await;
                        return Ok(());
                    }
                }

                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", addr);
                    let close = Message::close(Some("relay shutting down".to_string()));
                    let _ = write_message(stream, &close).await;
                    return Err(RelayError::ShuttingDown);
                }
            }

            loop {
                let message = match decoder.decode_message() {
                    Ok(Some(message)) => message,
                    Ok(None) => break,
                    Err(e) if e.is_recoverable() => {
                        tracing::warn!("[{}] Skipping undecodable frame: {}", addr, e);
                        stats.errors_total.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };
                stats.messages_received.fetch_add(1, Ordering::Relaxed);

                let keep_open = match session.state() {
                    SessionState::Connected => {
                        Self::handshake(stream, session, router, &mut outbound_tx, message)
                            .await?
                    }
                    SessionState::Ready => Self::route(stream, session, router, message).await?,
                    SessionState::Closing => false,
                };
                if !keep_open {
                    session.set_state(SessionState::Closing);
                    tracing::debug!("[{}] Session closing", addr);
                    return Ok(());
                }
            }
        }
    }

    /// Handles the first message of a session, which must be HELLO.
    async fn handshake(
        stream: &mut TcpStream,
        session: &mut Session,
        router: &Router,
        outbound_tx: &mut Option<mpsc::Sender<Message>>,
        message: Message,
    ) -> Result<bool, RelayError> {
        let (protocol_version, cluster, client_name) = match message.envelope {
            Envelope::Hello {
                protocol_version,
                cluster,
                client_name,
            } => (protocol_version, cluster, client_name),
            Envelope::Close { .. } => return Ok(false),
            other => {
                let err = RelayError::HandshakeFailed(format!("expected hello, got {}", other.kind()));
                reject_handshake(stream, &err).await;
                return Err(err);
            }
        };

        if protocol_version != PROTOCOL_VERSION {
            let err = RelayError::UnsupportedProtocol(protocol_version);
            reject_handshake(stream, &err).await;
            return Err(err);
        }
        if cluster.trim().is_empty() {
            let err = RelayError::HandshakeFailed("cluster must not be empty".to_string());
            reject_handshake(stream, &err).await;
            return Err(err);
        }
        let tx = outbound_tx
            .take()
            .ok_or_else(|| RelayError::HandshakeFailed("session already joined".to_string()))?;

        let member = router.join(&cluster, tx);
        tracing::info!(
            "[{}] Session {} joined cluster {} as {} ({})",
            session.remote_addr,
            session.id,
            cluster,
            member,
            client_name.as_deref().unwrap_or("anonymous")
        );
        session.complete_handshake(cluster, client_name, member);
        write_message(stream, &Message::welcome(session.id.clone())).await?;
        Ok(true)
    }

    /// Handles a message from a joined session.
    async fn route(
        stream: &mut TcpStream,
        session: &mut Session,
        router: &Router,
        message: Message,
    ) -> Result<bool, RelayError> {
        let member: MemberId = session
            .member()
            .ok_or_else(|| RelayError::InvalidRequest("session has not joined".to_string()))?;

        let Message { envelope, payload } = message;
        match envelope {
            Envelope::Request {
                id,
                cluster,
                timeout_ms,
            } => {
                session.record_request();
                let timeout = Duration::from_millis(timeout_ms.max(1));
                router.route_request(member, id, &cluster, timeout, payload);
            }
            envelope @ (Envelope::Reply { .. } | Envelope::ErrorReply { .. }) => {
                session.record_reply();
                router.route_reply(member, Message::new(envelope, payload));
            }
            Envelope::Close { reason } => {
                tracing::debug!(
                    "[{}] Client closing: {}",
                    session.remote_addr,
                    reason.as_deref().unwrap_or("no reason")
                );
                return Ok(false);
            }
            other => {
                tracing::warn!(
                    "[{}] Unexpected {} after handshake",
                    session.remote_addr,
                    other.kind()
                );
                let error = ReplyError::new(
                    ErrorCode::BadRequest,
                    format!("unexpected {} after handshake", other.kind()),
                );
                write_message(stream, &Message::error_reply(RequestId::NONE, error)).await?;
            }
        }
        Ok(true)
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Returns the cluster registry.
    pub fn router(&self) -> &Router {
        &self.router
    }
}

async fn write_message(stream: &mut TcpStream, message: &Message) -> Result<(), RelayError> {
    let bytes = Encoder::encode(message)?;
    stream.write_all(&bytes).await?;
    Ok(())
}

async fn reject_handshake(stream: &mut TcpStream, err: &RelayError) {
    tracing::warn!("Rejecting handshake: {}", err);
    let reply = Message::error_reply(
        RequestId::NONE,
        ReplyError::new(err.error_code(), err.to_string()),
    );
    let _ = write_message(stream, &reply).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start_server(config: ServerConfig) -> (Arc<Server>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(config));
        let runner = server.clone();
        tokio::spawn(async move { runner.serve(listener).await });
        (server, addr)
    }

    async fn read_message(stream: &mut TcpStream, decoder: &mut Decoder) -> Option<Message> {
        let mut buf = [0u8; 1024];
        loop {
            if let Some(message) = decoder.decode_message().unwrap() {
                return Some(message);
            }
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                return None;
            }
            decoder.extend(&buf[..n]);
        }
    }

    async fn send(stream: &mut TcpStream, message: Message) {
        write_message(stream, &message).await.unwrap();
    }

    #[test]
    fn test_server_basic() {
        let server = Server::new(ServerConfig::new("127.0.0.1:0".parse().unwrap()));
        assert!(!server.is_running());
        assert_eq!(server.stats().connections_total.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_server_config_from_config() {
        let mut config = Config::default();
        config.network.idle_timeout_secs = 30;
        config.routing.sweep_interval_ms = 250;

        let server_config = ServerConfig::from(&config);
        assert_eq!(server_config.idle_timeout, Duration::from_secs(30));
        assert_eq!(server_config.sweep_interval, Duration::from_millis(250));
        assert_eq!(server_config.bind_addr, config.network.bind_addr);
    }

    #[tokio::test]
    async fn test_connection_limit_sends_close() {
        let mut config = ServerConfig::default();
        config.max_connections = 1;
        let (server, addr) = start_server(config).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut first_decoder = Decoder::new();
        send(&mut first, Message::hello("svc", None)).await;
        let welcome = read_message(&mut first, &mut first_decoder).await.unwrap();
        assert!(matches!(welcome.envelope, Envelope::Welcome { .. }));

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut decoder = Decoder::new();
        let bye = read_message(&mut second, &mut decoder).await.unwrap();
        assert_eq!(
            bye.envelope,
            Envelope::Close {
                reason: Some("connection limit reached".to_string())
            }
        );
        assert!(read_message(&mut second, &mut decoder).await.is_none());
        assert_eq!(
            server.stats().connections_rejected.load(Ordering::Relaxed),
            1
        );

        server.shutdown();
    }

    #[tokio::test]
    async fn test_handshake_and_self_request() {
        let (server, addr) = start_server(ServerConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut decoder = Decoder::new();

        send(&mut stream, Message::hello("svc", Some("raw".to_string()))).await;
        let welcome = read_message(&mut stream, &mut decoder).await.unwrap();
        assert!(matches!(welcome.envelope, Envelope::Welcome { .. }));
        assert_eq!(server.router().member_count("svc"), 1);

        send(
            &mut stream,
            Message::request(RequestId(5), "svc", 1000, bytes::Bytes::from_static(b"hi")),
        )
        .await;
        let forwarded = read_message(&mut stream, &mut decoder).await.unwrap();
        let route_id = match forwarded.envelope {
            Envelope::Request { id, .. } => id,
            other => panic!("unexpected envelope: {:?}", other),
        };
        assert_eq!(forwarded.payload.as_ref(), b"hi");

        send(&mut stream, Message::reply(route_id, forwarded.payload)).await;
        let reply = read_message(&mut stream, &mut decoder).await.unwrap();
        assert_eq!(reply.envelope, Envelope::Reply { id: RequestId(5) });
        assert_eq!(reply.payload.as_ref(), b"hi");

        server.shutdown();
    }

    #[tokio::test]
    async fn test_unsupported_protocol_rejected() {
        let (_server, addr) = start_server(ServerConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut decoder = Decoder::new();

        send(
            &mut stream,
            Message::control(Envelope::Hello {
                protocol_version: 99,
                cluster: "svc".to_string(),
                client_name: None,
            }),
        )
        .await;

        let reply = read_message(&mut stream, &mut decoder).await.unwrap();
        match reply.envelope {
            Envelope::ErrorReply { id, error } => {
                assert_eq!(id, RequestId::NONE);
                assert_eq!(error.code, ErrorCode::UnsupportedProtocol);
            }
            other => panic!("unexpected envelope: {:?}", other),
        }
        assert!(read_message(&mut stream, &mut decoder).await.is_none());
    }

    #[tokio::test]
    async fn test_request_before_hello_rejected() {
        let (_server, addr) = start_server(ServerConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut decoder = Decoder::new();

        send(
            &mut stream,
            Message::request(RequestId(1), "svc", 100, bytes::Bytes::new()),
        )
        .await;
        match read_message(&mut stream, &mut decoder).await.unwrap().envelope {
            Envelope::ErrorReply { error, .. } => assert_eq!(error.code, ErrorCode::BadRequest),
            other => panic!("unexpected envelope: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_leaves_cluster() {
        let (server, addr) = start_server(ServerConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut decoder = Decoder::new();

        send(&mut stream, Message::hello("svc", None)).await;
        read_message(&mut stream, &mut decoder).await.unwrap();
        assert_eq!(server.router().member_count("svc"), 1);

        drop(stream);
        for _ in 0..100 {
            if server.router().member_count("svc") == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.router().member_count("svc"), 0);
    }

    #[tokio::test]
    async fn test_shutdown_sends_close() {
        let (server, addr) = start_server(ServerConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut decoder = Decoder::new();

        send(&mut stream, Message::hello("svc", None)).await;
        read_message(&mut stream, &mut decoder).await.unwrap();
        assert!(server.is_running());

        server.shutdown();
        let close = read_message(&mut stream, &mut decoder).await.unwrap();
        assert!(matches!(close.envelope, Envelope::Close { .. }));
    }
}
