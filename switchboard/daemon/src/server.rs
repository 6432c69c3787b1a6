//! Daemon Server Implementation
//!
//! This module provides the server loop for the switchboard daemon:
//! - Accepts connections on a Unix socket (owner-only permissions)
//! - Decodes frames per connection and feeds them to the engine
//! - Routes outbound frames back to the connection that last spoke for
//!   each session
//! - Supports graceful shutdown
//!
//! # Session Routing
//!
//! A session is not bound to a connection. Whichever connection last sent
//! a frame for a session receives its outbound frames, so a client that
//! reconnects resumes its streams by sending on them again.
//!
//! Outbound frames are never dropped for a live connection. A connection
//! whose backlog stays full past the stall timeout is disconnected instead;
//! its client reconnects and reopens, which replays each stream's terminal
//! frame.
//!
//! ```text
//!                     DaemonServer
//!                          │
//!          ┌───────────────┼───────────────┐
//!          │               │               │
//!       client A        client B        client C
//!       (conn-1)        (conn-2)        (conn-3)
//!          │               │               │
//!          └───────┬───────┴───────────────┘
//!                  │ frames            ▲ Outbound{session, frame}
//!                  ▼                   │
//!              Switchboard ── session routes ──┘
//! ```

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Instrument};

use switchboard_core::{
    ErrorReport, Frame, FrameCodec, FrameDecoder, LogTelemetrySink, Outbound, SessionId, StreamId,
    StreamKey, Switchboard, SwitchboardConfig,
};

/// Identifier of one client connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next connection id
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state tracking
struct ConnectionState {
    /// When the connection was established
    connected_at: std::time::Instant,
    /// Remote peer UID (from SO_PEERCRED)
    peer_uid: Option<u32>,
    /// Frames queued for this connection
    sender: mpsc::Sender<Frame>,
    /// Handle to abort the connection task
    abort_handle: tokio::task::AbortHandle,
}

/// Configuration for the daemon server
pub struct ServerConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Per-connection outbound channel capacity
    pub connection_channel_capacity: usize,
    /// Read buffer size per connection
    pub read_buffer_size: usize,
    /// How long a full connection backlog may block delivery before the
    /// connection is dropped
    pub outbound_stall_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            connection_channel_capacity: 256,
            read_buffer_size: 8192,
            outbound_stall_timeout: Duration::from_secs(5),
        }
    }
}

/// Shared routing state between the accept loop and connection tasks
#[derive(Clone, Default)]
struct Routes {
    connections: Arc<DashMap<ConnectionId, ConnectionState>>,
    sessions: Arc<DashMap<SessionId, ConnectionId>>,
}

impl Routes {
    fn sender_for(&self, session: &SessionId) -> Option<(ConnectionId, mpsc::Sender<Frame>)> {
        let conn_id = *self.sessions.get(session)?;
        self.connections
            .get(&conn_id)
            .map(|c| (conn_id, c.sender.clone()))
    }

    /// Abort a connection's task and forget its routes
    fn disconnect(&self, conn_id: ConnectionId) {
        let handle = self
            .connections
            .get(&conn_id)
            .map(|state| state.abort_handle.clone());
        if let Some(handle) = handle {
            handle.abort();
        }
        self.forget(conn_id);
    }

    fn forget(&self, conn_id: ConnectionId) {
        if let Some((_, state)) = self.connections.remove(&conn_id) {
            debug!(
                conn_id = %conn_id,
                peer_uid = ?state.peer_uid,
                uptime_secs = state.connected_at.elapsed().as_secs(),
                "Connection forgotten"
            );
        }
        self.sessions.retain(|_, owner| *owner != conn_id);
    }
}

/// The main daemon server
pub struct DaemonServer {
    /// Loaded configuration
    config: SwitchboardConfig,
    /// Server configuration
    server_config: ServerConfig,
    /// Connection and session routing
    routes: Routes,
}

impl DaemonServer {
    /// Create a new daemon server
    pub fn new(config: SwitchboardConfig) -> Self {
        Self {
            config,
            server_config: ServerConfig::default(),
            routes: Routes::default(),
        }
    }

    fn socket_path(&self) -> &PathBuf {
        &self.config.socket_path
    }

    /// Codec for every connection, signing when a key is configured
    fn codec(&self) -> FrameCodec {
        let codec = FrameCodec::new().with_max_frame_size(self.config.max_frame_size);
        match self.config.signing_key() {
            Some(key) => {
                info!(env = %self.config.signing_key_env, "Frame signing enabled");
                codec.with_signing_key(key)
            }
            None => codec,
        }
    }

    /// Get peer credentials from Unix socket
    #[cfg(unix)]
    fn get_peer_uid(stream: &UnixStream) -> Option<u32> {
        use std::os::unix::io::AsRawFd;

        let fd = stream.as_raw_fd();
        let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        let result = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                std::ptr::addr_of_mut!(cred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        if result == 0 {
            Some(cred.uid)
        } else {
            None
        }
    }

    /// Prepare the socket path (create directory, remove stale socket)
    fn prepare_socket(&self) -> Result<()> {
        let socket_path = self.socket_path();
        if let Some(parent) = socket_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create socket directory: {parent:?}"))?;
                info!(path = ?parent, "Created socket directory");
            }
        }

        if socket_path.exists() {
            warn!(path = ?socket_path, "Removing stale socket file");
            fs::remove_file(socket_path)
                .with_context(|| format!("Failed to remove stale socket: {socket_path:?}"))?;
        }

        Ok(())
    }

    /// Bind the socket, start the engine and serve until `shutdown` is set
    pub async fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        self.prepare_socket()?;

        let listener = UnixListener::bind(self.socket_path())
            .with_context(|| format!("Failed to bind to {:?}", self.socket_path()))?;
        info!(path = ?self.socket_path(), "Listening for connections");

        // Set socket permissions (owner-only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(self.socket_path(), perms)?;
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let engine =
            Arc::new(Switchboard::from_config(&self.config, Arc::new(LogTelemetrySink), outbound_tx).await);
        engine.start();

        let router = tokio::spawn(Self::route_outbound(
            outbound_rx,
            self.routes.clone(),
            self.server_config.outbound_stall_timeout,
        ));
        let codec = self.codec();

        // Main accept loop
        loop {
            if shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested, stopping accept loop");
                break;
            }

            // Accept with timeout to allow checking shutdown flag
            let accept_result =
                tokio::time::timeout(tokio::time::Duration::from_millis(100), listener.accept())
                    .await;

            let stream = match accept_result {
                Ok(Ok((stream, _addr))) => stream,
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
                Err(_) => continue,
            };

            if self.connection_count() >= self.server_config.max_connections {
                warn!("Connection limit reached, rejecting new connection");
                drop(stream);
                continue;
            }

            // Validate peer (same UID as daemon)
            let peer_uid = Self::get_peer_uid(&stream);
            let our_uid = unsafe { libc::getuid() };
            if let Some(uid) = peer_uid {
                if uid != our_uid && uid != 0 {
                    warn!(
                        peer_uid = uid,
                        our_uid = our_uid,
                        "Rejecting connection from different user"
                    );
                    drop(stream);
                    continue;
                }
            }

            let (frame_tx, frame_rx) =
                mpsc::channel::<Frame>(self.server_config.connection_channel_capacity);
            let conn_id = ConnectionId::new();
            info!(
                conn_id = %conn_id,
                peer_uid = ?peer_uid,
                active_connections = self.connection_count() + 1,
                "New connection accepted"
            );

            // Hold the slot while spawning so replies never miss the route
            let slot = self.routes.connections.entry(conn_id);
            let task_handle = tokio::spawn(
                Self::handle_connection(
                    conn_id,
                    stream,
                    codec.clone(),
                    Arc::clone(&engine),
                    frame_rx,
                    self.routes.clone(),
                    self.server_config.read_buffer_size,
                )
                .instrument(tracing::info_span!("connection", %conn_id)),
            );

            slot.insert(ConnectionState {
                connected_at: std::time::Instant::now(),
                peer_uid,
                sender: frame_tx,
                abort_handle: task_handle.abort_handle(),
            });
        }

        engine.shutdown();
        router.abort();
        let summary = engine.metrics_summary();
        info!(
            uptime_secs = summary.uptime_seconds,
            streams_opened = summary.streams_opened,
            streams_completed = summary.streams_completed,
            aborts = summary.aborts,
            escalations = summary.escalations,
            decode_errors = summary.decode_errors,
            "Engine stopped"
        );
        self.shutdown().await
    }

    /// Deliver engine output to the connection owning each session
    ///
    /// Waits for backlog space rather than dropping, so partial data and
    /// terminal frames arrive in order. A connection that stays full for
    /// `stall_timeout` is disconnected.
    async fn route_outbound(
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
        routes: Routes,
        stall_timeout: Duration,
    ) {
        while let Some(Outbound { session, frame }) = outbound.recv().await {
            let Some((conn_id, sender)) = routes.sender_for(&session) else {
                debug!(session = %session, "No connection for session, frame dropped");
                continue;
            };
            match tokio::time::timeout(stall_timeout, sender.send(frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    debug!(conn_id = %conn_id, session = %session, "Connection gone, frame dropped");
                }
                Err(_) => {
                    warn!(
                        conn_id = %conn_id,
                        session = %session,
                        stall_ms = stall_timeout.as_millis() as u64,
                        "Connection backlog stalled, disconnecting"
                    );
                    routes.disconnect(conn_id);
                }
            }
        }
    }

    /// Handle a single client connection
    ///
    /// Reads frames from the client into the engine and writes frames routed
    /// to this connection back out.
    async fn handle_connection(
        conn_id: ConnectionId,
        stream: UnixStream,
        codec: FrameCodec,
        engine: Arc<Switchboard>,
        mut frame_rx: mpsc::Receiver<Frame>,
        routes: Routes,
        read_buffer_size: usize,
    ) {
        info!("Connection handler started");

        let (mut read_half, mut write_half) = stream.into_split();
        let mut decoder = FrameDecoder::new(codec.clone());
        let mut read_buf = vec![0u8; read_buffer_size];

        'conn: loop {
            tokio::select! {
                read_result = read_half.read(&mut read_buf) => {
                    match read_result {
                        Ok(0) => {
                            info!("Client disconnected (EOF)");
                            break;
                        }
                        Ok(n) => {
                            decoder.push(&read_buf[..n]);
                            loop {
                                match decoder.decode() {
                                    Ok(Some(frame)) => {
                                        routes.sessions.insert(frame.session_id.clone(), conn_id);
                                        engine.handle_frame(frame).await;
                                    }
                                    Ok(None) => break,
                                    Err(e) => {
                                        // Fatal to the frame, not the connection
                                        engine.metrics().decode_errors.inc();
                                        warn!(error = %e, code = %e.code(), "Failed to decode frame");
                                        let key = StreamKey {
                                            session: SessionId::new(""),
                                            stream: StreamId::session_level(),
                                        };
                                        let report = ErrorReport::new(e.code(), e.to_string());
                                        let reply = Frame::error(&key, 0, report);
                                        if let Err(e) = Self::write_frame(&codec, &mut write_half, &reply).await {
                                            error!(error = %e, "Write error");
                                            break 'conn;
                                        }
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Read error");
                            break;
                        }
                    }
                }

                outgoing = frame_rx.recv() => {
                    let Some(frame) = outgoing else {
                        info!("Connection channel closed");
                        break;
                    };
                    if let Err(e) = Self::write_frame(&codec, &mut write_half, &frame).await {
                        error!(error = %e, "Write error");
                        break;
                    }
                }
            }
        }

        // Streams stay alive for resumption; the heartbeat sweep ends them
        routes.forget(conn_id);
        info!(
            active_connections = routes.connections.len(),
            "Connection handler finished"
        );
    }

    /// Encode and write one frame; encode failures are logged and skipped
    async fn write_frame<W>(codec: &FrameCodec, writer: &mut W, frame: &Frame) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match codec.encode(frame) {
            Ok(bytes) => writer.write_all(&bytes).await,
            Err(e) => {
                warn!(error = %e, stream = %frame.key(), "Failed to encode frame");
                Ok(())
            }
        }
    }

    /// Graceful shutdown
    async fn shutdown(&mut self) -> Result<()> {
        info!("Initiating graceful shutdown");

        let conn_ids: Vec<ConnectionId> = self.routes.connections.iter().map(|r| *r.key()).collect();
        for conn_id in conn_ids {
            if let Some((_, conn_state)) = self.routes.connections.remove(&conn_id) {
                info!(conn_id = %conn_id, "Aborting connection");
                conn_state.abort_handle.abort();
            }
        }
        self.routes.sessions.clear();

        // Wait a bit for handlers to finish
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        let socket_path = self.socket_path();
        if socket_path.exists() {
            fs::remove_file(socket_path)
                .with_context(|| format!("Failed to remove socket: {socket_path:?}"))?;
            info!(path = ?socket_path, "Socket file removed");
        }

        info!("Shutdown complete");
        Ok(())
    }

    /// Get number of active connections
    pub fn connection_count(&self) -> usize {
        self.routes.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::{FrameFlags, WindowLimits};

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId::new();
        assert!(format!("{id}").starts_with("conn-"));
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.connection_channel_capacity, 256);
        assert_eq!(config.read_buffer_size, 8192);
    }

    fn connection(capacity: usize) -> (ConnectionState, mpsc::Receiver<Frame>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let task = tokio::spawn(std::future::pending::<()>());
        let state = ConnectionState {
            connected_at: std::time::Instant::now(),
            peer_uid: None,
            sender,
            abort_handle: task.abort_handle(),
        };
        (state, receiver)
    }

    fn routed(session: &SessionId, frame: Frame) -> Outbound {
        Outbound {
            session: session.clone(),
            frame,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_backlog_delays_terminal_frame_instead_of_dropping() {
        let routes = Routes::default();
        let session = SessionId::new("slow");
        let key = StreamKey::new("slow", "x");
        let (state, mut receiver) = connection(1);
        routes.connections.insert(ConnectionId(7), state);
        routes.sessions.insert(session.clone(), ConnectionId(7));

        let (tx, rx) = mpsc::unbounded_channel();
        let router = tokio::spawn(DaemonServer::route_outbound(
            rx,
            routes.clone(),
            Duration::from_secs(5),
        ));
        tx.send(routed(&session, Frame::data(&key, 1, 0, "partial", true))).unwrap();
        tx.send(routed(&session, Frame::close(&key, 1))).unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        let first = receiver.recv().await.unwrap();
        assert!(first.has(FrameFlags::MORE));
        let last = receiver.recv().await.unwrap();
        assert!(last.has(FrameFlags::CLOSE));
        assert!(routes.connections.contains_key(&ConnectionId(7)));
        router.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_connection_is_disconnected() {
        let routes = Routes::default();
        let session = SessionId::new("stuck");
        let key = StreamKey::new("stuck", "x");
        let (state, _receiver) = connection(1);
        routes.connections.insert(ConnectionId(8), state);
        routes.sessions.insert(session.clone(), ConnectionId(8));

        let (tx, rx) = mpsc::unbounded_channel();
        let router = tokio::spawn(DaemonServer::route_outbound(
            rx,
            routes.clone(),
            Duration::from_secs(5),
        ));
        tx.send(routed(&session, Frame::data(&key, 1, 0, "partial", true))).unwrap();
        tx.send(routed(&session, Frame::close(&key, 1))).unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!routes.connections.contains_key(&ConnectionId(8)));
        assert!(routes.sessions.get(&session).is_none());
        router.abort();
    }

    #[test]
    fn test_routes_forget_connection() {
        let routes = Routes::default();
        routes.sessions.insert(SessionId::new("a"), ConnectionId(1));
        routes.sessions.insert(SessionId::new("b"), ConnectionId(2));
        routes.forget(ConnectionId(1));
        assert!(routes.sessions.get(&SessionId::new("a")).is_none());
        assert!(routes.sessions.get(&SessionId::new("b")).is_some());
    }

    #[tokio::test]
    async fn test_open_over_socket_is_acknowledged() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SwitchboardConfig::default();
        config.socket_path = dir.path().join("sb.sock");
        config.signing_key_env = "SWITCHBOARD_TEST_UNSET_KEY".to_string();
        let socket_path = config.socket_path.clone();

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut server = DaemonServer::new(config);
        let server_shutdown = Arc::clone(&shutdown);
        let server_task = tokio::spawn(async move { server.run(server_shutdown).await });

        let mut client = None;
        for _ in 0..50 {
            if let Ok(stream) = UnixStream::connect(&socket_path).await {
                client = Some(stream);
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        }
        let mut client = client.expect("daemon did not start listening");

        let codec = FrameCodec::new();
        let key = StreamKey::new("sess", "s1");
        let bytes = codec.encode(&Frame::open(&key, WindowLimits::default())).unwrap();
        client.write_all(&bytes).await.unwrap();

        let mut decoder = FrameDecoder::new(codec);
        let mut buf = vec![0u8; 4096];
        let ack = 'read: loop {
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0, "daemon closed the connection");
            decoder.push(&buf[..n]);
            while let Some(frame) = decoder.decode().unwrap() {
                if frame.has(FrameFlags::ACK) {
                    break 'read frame;
                }
            }
        };
        assert!(ack.has(FrameFlags::ACK));
        assert_eq!(ack.key(), key);

        shutdown.store(true, Ordering::SeqCst);
        server_task.await.unwrap().unwrap();
        assert!(!socket_path.exists());
    }
}
