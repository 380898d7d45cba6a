//! TCP server with idle timeouts and graceful drain.
//!
//! Accepts connections, wraps each in a [`Connection`], and runs one task per
//! connection that reads a message, hands it to the [`Handler`], and writes
//! the response back. Any timeout, I/O error or handler error closes that
//! connection only. Shutdown stops the accept loop and waits for every live
//! connection to finish.

use crate::connection::Connection;
use crate::protocols::{Handler, HandlerError};
use crate::registry::{ConnectionInfo, Registry, RegistryGuard};
use bytes::BytesMut;
use chrono::Utc;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept, so persistent errors like EMFILE don't spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Smallest drain progress interval.
const MIN_DRAIN_INTERVAL: Duration = Duration::from_millis(1);

/// Server construction parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to (`host:port`, or `:port` for all interfaces)
    pub listen: String,
    /// Inactivity allowed before a connection is closed
    pub idle_timeout: Duration,
    /// Maximum bytes per read, also the read buffer size
    pub byte_limit: usize,
    /// Interval between progress logs while draining
    pub drain_interval: Duration,
    /// Listen backlog
    pub backlog: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9000".to_string(),
            idle_timeout: Duration::from_secs(5),
            byte_limit: 1024,
            drain_interval: Duration::from_millis(500),
            backlog: 1024,
        }
    }
}

/// Errors fatal to the whole server
#[derive(Debug)]
pub enum ServerError {
    /// The listener could not be created.
    Bind { addr: String, source: io::Error },
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind { addr, source } => {
                write!(f, "Failed to bind '{}': {}", addr, source)
            }
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind { source, .. } => Some(source),
        }
    }
}

/// Why a connection loop ended
#[derive(Debug)]
pub enum ConnectionError {
    /// No activity within the idle timeout.
    IdleTimeout,
    /// Read, write or flush failed.
    Io(io::Error),
    /// The handler rejected a message.
    Handler(HandlerError),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::IdleTimeout => write!(f, "idle timeout"),
            ConnectionError::Io(e) => write!(f, "I/O error: {}", e),
            ConnectionError::Handler(e) => write!(f, "handler error: {}", e),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::TimedOut {
            ConnectionError::IdleTimeout
        } else {
            ConnectionError::Io(e)
        }
    }
}

/// Server instance
///
/// Shared behind an `Arc` so one task can run [`Server::listen_and_serve`]
/// while another calls [`Server::shutdown`].
pub struct Server {
    config: ServerConfig,
    registry: Arc<Registry>,
    stop: watch::Sender<bool>,
    listening: watch::Sender<bool>,
}

impl Server {
    /// Create a new server instance
    ///
    /// A zero `byte_limit` is raised to 1 and a zero `drain_interval` to
    /// 1 ms, since neither can drive the server.
    pub fn new(mut config: ServerConfig) -> Self {
        if config.byte_limit == 0 {
            warn!("byte_limit of 0 raised to 1");
            config.byte_limit = 1;
        }
        if config.drain_interval < MIN_DRAIN_INTERVAL {
            warn!(min = ?MIN_DRAIN_INTERVAL, "drain_interval raised to the minimum");
            config.drain_interval = MIN_DRAIN_INTERVAL;
        }

        let (stop, _) = watch::channel(false);
        let (listening, _) = watch::channel(false);

        Server {
            config,
            registry: Arc::new(Registry::new()),
            stop,
            listening,
        }
    }

    /// Bind the configured address and serve connections until shutdown.
    ///
    /// Only a bind failure is returned as an error; everything that goes wrong
    /// afterwards is logged and confined to a single connection.
    pub async fn listen_and_serve<H: Handler>(&self, handler: Arc<H>) -> Result<(), ServerError> {
        let listener = self.bind()?;
        self.serve(listener, handler).await;
        Ok(())
    }

    /// Create the listening socket. Must be called from within a Tokio runtime.
    pub fn bind(&self) -> Result<TcpListener, ServerError> {
        let bind_err = |source| ServerError::Bind {
            addr: self.config.listen.clone(),
            source,
        };

        let addr = parse_listen_addr(&self.config.listen).map_err(bind_err)?;
        let listener = create_listener(addr, self.config.backlog).map_err(bind_err)?;
        TcpListener::from_std(listener).map_err(bind_err)
    }

    /// Accept connections from `listener` until shutdown is requested.
    ///
    /// The listener is released when this returns or when the future is
    /// dropped.
    pub async fn serve<H: Handler>(&self, listener: TcpListener, handler: Arc<H>) {
        let mut stop = self.stop.subscribe();
        let _listening = ListeningGuard::new(&self.listening);

        match listener.local_addr() {
            Ok(addr) => info!(address = %addr, "waiting for requests"),
            Err(_) => info!(address = %self.config.listen, "waiting for requests"),
        }

        loop {
            if *stop.borrow_and_update() {
                break;
            }

            let accepted = tokio::select! {
                _ = stop.changed() => continue,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    self.spawn_connection(stream, peer, Arc::clone(&handler));
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    pause_after_accept_error(&mut stop).await;
                }
            }
        }

        drop(listener);
        info!("accept loop stopped");
    }

    /// Stop accepting and wait for every live connection to close.
    ///
    /// Logs the outstanding count on each drain interval tick. There is no
    /// hard deadline; wrap the call in `tokio::time::timeout` to impose one.
    pub async fn shutdown(&self) {
        info!(at = %Utc::now(), "shutting down");
        self.stop.send_replace(true);

        // Once the accept loop has released the listener no new connection
        // can be registered, so an empty registry stays empty.
        wait_until(&mut self.listening.subscribe(), |listening| !*listening).await;

        let mut live = self.registry.watch();
        let drained = wait_until(&mut live, |count| *count == 0);
        tokio::pin!(drained);

        let mut ticker = tokio::time::interval(self.config.drain_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = &mut drained => break,
                _ = ticker.tick() => {
                    info!(remaining = self.registry.len(), "waiting on connections");
                }
            }
        }

        info!("all connections closed");
    }

    /// Number of live connections
    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    /// Snapshot of the live connections
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry.snapshot()
    }

    /// Server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn spawn_connection<H: Handler>(&self, stream: TcpStream, peer: SocketAddr, handler: Arc<H>) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let mut conn = Connection::new(stream, self.config.idle_timeout, self.config.byte_limit);
        let teardown = Teardown::new(self.registry.register(peer), peer);
        let conn_id = teardown.conn_id;
        info!(conn_id, peer = %peer, "connection accepted");

        tokio::spawn(async move {
            // Dropped last, also when the handler panics.
            let mut teardown = teardown;

            match handle_connection(&mut conn, &*handler).await {
                Ok(()) => debug!(conn_id, "closed by peer"),
                Err(ConnectionError::IdleTimeout) => debug!(conn_id, "idle timeout"),
                Err(e) => warn!(conn_id, error = %e, "connection error"),
            }

            if let Err(e) = conn.close().await {
                debug!(conn_id, error = %e, "error closing connection");
            }
            teardown.finished = true;
        });
    }
}

/// Marks the accept loop as running; clears the mark when dropped.
struct ListeningGuard<'a> {
    listening: &'a watch::Sender<bool>,
}

impl<'a> ListeningGuard<'a> {
    fn new(listening: &'a watch::Sender<bool>) -> Self {
        listening.send_replace(true);
        Self { listening }
    }
}

impl Drop for ListeningGuard<'_> {
    fn drop(&mut self) {
        self.listening.send_replace(false);
    }
}

/// Deregisters a connection and logs its closure when its task ends.
///
/// `finished` stays false if the task is torn down mid-loop, e.g. after a
/// handler panic.
struct Teardown {
    registration: Option<RegistryGuard>,
    conn_id: usize,
    peer: SocketAddr,
    finished: bool,
}

impl Teardown {
    fn new(registration: RegistryGuard, peer: SocketAddr) -> Self {
        Self {
            conn_id: registration.id(),
            registration: Some(registration),
            peer,
            finished: false,
        }
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        drop(self.registration.take());
        if self.finished {
            info!(conn_id = self.conn_id, peer = %self.peer, "connection closed");
        } else {
            warn!(conn_id = self.conn_id, peer = %self.peer, "connection closed abnormally");
        }
    }
}

/// Wait out the accept error backoff, returning early on shutdown.
async fn pause_after_accept_error(stop: &mut watch::Receiver<bool>) {
    if *stop.borrow_and_update() {
        return;
    }
    tokio::select! {
        _ = stop.changed() => {}
        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
    }
}

/// Run the read/handle/write loop for one connection.
///
/// Each read is one message of exactly the bytes received. Returns `Ok(())`
/// when the peer closes its side, and an error for every other way the loop
/// can end. The caller is responsible for closing the connection.
pub async fn handle_connection<S, H>(
    conn: &mut Connection<S>,
    handler: &H,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: Handler + ?Sized,
{
    let mut buffer = BytesMut::zeroed(conn.byte_limit());

    loop {
        let n = conn.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }

        let response = handler
            .handle(&buffer[..n])
            .map_err(ConnectionError::Handler)?;

        conn.write_all(&response).await?;
        conn.flush().await?;
    }
}

/// Resolve a listen address. A bare `:port` means every IPv4 interface.
pub fn parse_listen_addr(listen: &str) -> io::Result<SocketAddr> {
    let listen = if listen.starts_with(':') {
        format!("0.0.0.0{}", listen)
    } else {
        listen.to_string()
    };

    if let Ok(addr) = listen.parse::<SocketAddr>() {
        return Ok(addr);
    }

    listen.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address found for '{}'", listen),
        )
    })
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    Ok(socket.into())
}

/// Wait until the watched value satisfies `done`.
async fn wait_until<T>(rx: &mut watch::Receiver<T>, done: impl Fn(&T) -> bool) {
    loop {
        if done(&rx.borrow_and_update()) {
            return;
        }
        // The sender lives in `Server`, which outlives this borrow.
        if rx.changed().await.is_err() {
            return;
        }
    }
}
