//! TCP server for client connections.
//!
//! Accepts connections, binds each one to a pooled session, reads frames
//! and hands their payloads to the session.

use crate::config::Config;
use crate::frame::{read_frame, FrameError};
use crate::pool::{run_reclaimer, SessionPool};
use crate::session::{SessionError, SessionLease};
use crate::task::spawn_contained;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Listen backlog.
const BACKLOG: i32 = 1024;

/// Errors that end one client connection.
#[derive(Debug)]
pub enum ConnectionError {
    /// Framing or socket failure.
    Frame(FrameError),
    /// No complete frame arrived within the read timeout.
    Timeout(Duration),
    /// The session stopped taking payloads.
    Session(SessionError),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Frame(e) => write!(f, "{}", e),
            ConnectionError::Timeout(d) => write!(f, "No frame within {:?}", d),
            ConnectionError::Session(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<FrameError> for ConnectionError {
    fn from(e: FrameError) -> Self {
        ConnectionError::Frame(e)
    }
}

impl From<SessionError> for ConnectionError {
    fn from(e: SessionError) -> Self {
        ConnectionError::Session(e)
    }
}

/// Per-connection settings.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    /// Deadline for reading one whole frame.
    pub read_timeout: Duration,
    /// Socket send/receive buffer size.
    pub socket_buffer: usize,
}

/// Server instance
pub struct Server {
    listen: SocketAddr,
    sweep_interval: Duration,
    settings: ConnectionSettings,
    pool: Arc<SessionPool>,
}

impl Server {
    /// Create a new server instance around an allocated pool
    pub fn new(config: &Config, pool: Arc<SessionPool>) -> Self {
        Server {
            listen: config.listen,
            sweep_interval: Duration::from_secs(config.sweep_interval),
            settings: ConnectionSettings {
                read_timeout: Duration::from_secs(config.read_timeout),
                socket_buffer: config.socket_buffer,
            },
            pool,
        }
    }

    /// Bind the listener and serve until `shutdown` turns true.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let listener = bind(self.listen)?;
        info!(
            address = %self.listen,
            gate_id = self.pool.gate_id(),
            capacity = self.pool.capacity(),
            "Server listening"
        );

        serve(
            listener,
            Arc::clone(&self.pool),
            self.settings,
            self.sweep_interval,
            shutdown,
        )
        .await;
        Ok(())
    }
}

/// Create the listening socket with address reuse enabled.
pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
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
    socket.listen(BACKLOG)?;

    TcpListener::from_std(socket.into())
}

/// Accept connections and run the reclaimer until `shutdown` turns true.
pub async fn serve(
    listener: TcpListener,
    pool: Arc<SessionPool>,
    settings: ConnectionSettings,
    sweep_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let reclaimer = tokio::spawn(run_reclaimer(
        Arc::clone(&pool),
        sweep_interval,
        shutdown.clone(),
    ));

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "New connection");
                    let pool = Arc::clone(&pool);
                    spawn_contained(
                        "connection",
                        async move {
                            if let Err(e) = handle_connection(stream, peer, pool, settings).await {
                                debug!(peer = %peer, error = %e, "Connection closed");
                            }
                        },
                        || {},
                    );
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            },
            _ = shutdown.wait_for(|stop| *stop) => break,
        }
    }

    info!("Listener stopped");
    let _ = reclaimer.await;
}

/// Apply socket buffer sizes to an accepted connection.
fn tune_socket(stream: &TcpStream, size: usize) -> io::Result<()> {
    let sock = socket2::SockRef::from(stream);
    sock.set_recv_buffer_size(size)?;
    sock.set_send_buffer_size(size)?;
    Ok(())
}

/// Handle a single client connection
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    pool: Arc<SessionPool>,
    settings: ConnectionSettings,
) -> Result<(), ConnectionError> {
    if let Err(e) = tune_socket(&stream, settings.socket_buffer) {
        warn!(peer = %peer, error = %e, "Failed to set socket buffers");
    }

    let (mut reader, writer) = stream.into_split();
    let lease = match pool.acquire(peer.ip(), Box::new(writer)) {
        Ok(lease) => lease,
        Err(e) => {
            // Dropping both halves closes the socket.
            warn!(peer = %peer, error = %e, "Rejecting connection");
            return Ok(());
        }
    };

    info!(peer = %peer, session_id = lease.id(), "Client connected");
    lease.start();

    drive(&mut reader, &lease, settings.read_timeout).await
}

/// Read frames from `reader` and feed them to the session until the
/// connection fails or the session dies.
///
/// Dropping the lease on return signals die, so the session always learns
/// that its connection is gone.
async fn drive<R>(
    reader: &mut R,
    lease: &SessionLease,
    read_timeout: Duration,
) -> Result<(), ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let session_id = lease.id();
    let mut die = lease.die_signal();

    loop {
        let payload = tokio::select! {
            read = tokio::time::timeout(read_timeout, read_frame(reader)) => match read {
                Ok(Ok(payload)) => payload,
                Ok(Err(FrameError::Closed)) => {
                    debug!(session_id, "Client closed connection");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(session_id, error = %e, "Read frame failed");
                    return Err(e.into());
                }
                Err(_) => {
                    warn!(session_id, timeout = ?read_timeout, "Read timed out");
                    return Err(ConnectionError::Timeout(read_timeout));
                }
            },
            _ = die.wait() => {
                info!(session_id, "Connection closed by session");
                return Ok(());
            }
        };

        tokio::select! {
            delivered = lease.deliver(payload) => delivered?,
            _ = die.wait() => {
                info!(session_id, "Connection closed by session");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{self, BackendMessage, MessageKind};
    use crate::constants::SESSION_KEY;
    use crate::crypto::SessionKey;
    use crate::pool::PoolConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;
    use tokio_test::io::Builder;

    const SETTINGS: ConnectionSettings = ConnectionSettings {
        read_timeout: Duration::from_secs(5),
        socket_buffer: 32767,
    };

    fn pool(capacity: usize) -> (Arc<SessionPool>, mpsc::Receiver<BackendMessage>) {
        let (tx, rx) = backend::uplink(64);
        let config = PoolConfig {
            gate_id: 0,
            capacity,
            max_packets_per_minute: 0,
        };
        (SessionPool::new(config, SessionKey::new(SESSION_KEY).unwrap(), tx), rx)
    }

    async fn next(rx: &mut mpsc::Receiver<BackendMessage>) -> BackendMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("uplink timed out")
            .expect("uplink closed")
    }

    /// Start a server on an ephemeral port.
    async fn start(
        pool: Arc<SessionPool>,
    ) -> (SocketAddr, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let listener = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(serve(listener, pool, SETTINGS, Duration::from_secs(60), rx));
        (addr, tx, task)
    }

    #[test]
    fn test_connection_error_display() {
        let e = ConnectionError::Timeout(Duration::from_secs(60));
        assert_eq!(e.to_string(), "No frame within 60s");
        let e: ConnectionError = SessionError::Closed.into();
        assert_eq!(e.to_string(), "Session closed");
    }

    #[tokio::test]
    async fn test_drive_delivers_hello_once() {
        let (pool, mut rx) = pool(1);
        let lease = pool.acquire("10.1.1.1".parse().unwrap(), Box::new(tokio::io::sink())).unwrap();
        lease.start();
        assert_eq!(next(&mut rx).await.kind, MessageKind::Register);

        let mut wire = b"hello".to_vec();
        SessionKey::new(SESSION_KEY).unwrap().ciphers().encrypt(&mut wire);
        let mut mock = Builder::new().read(&[0x00, 0x05]).read(&wire).build();

        drive(&mut mock, &lease, SETTINGS.read_timeout).await.unwrap();

        let msg = next(&mut rx).await;
        assert_eq!(msg.kind, MessageKind::Normal);
        assert_eq!(&msg.payload[..], b"hello");

        drop(lease);
        // Nothing but the quit follows.
        assert_eq!(next(&mut rx).await.kind, MessageKind::Quit);
    }

    #[tokio::test]
    async fn test_drive_truncated_frame_is_error() {
        let (pool, _rx) = pool(1);
        let lease = pool.acquire("10.1.1.1".parse().unwrap(), Box::new(tokio::io::sink())).unwrap();

        let mut reader: &[u8] = &[0x00, 0x09, b'x'];
        let result = drive(&mut reader, &lease, SETTINGS.read_timeout).await;
        assert!(matches!(
            result,
            Err(ConnectionError::Frame(FrameError::Truncated { expected: 9, received: 1 }))
        ));
    }

    #[tokio::test]
    async fn test_drive_stops_on_die() {
        let (pool, _rx) = pool(1);
        let lease = pool.acquire("10.1.1.1".parse().unwrap(), Box::new(tokio::io::sink())).unwrap();
        // A reader that never yields anything.
        let (_client, mut server) = tokio::io::duplex(64);

        lease.signal_die();
        tokio::time::timeout(
            Duration::from_secs(5),
            drive(&mut server, &lease, SETTINGS.read_timeout),
        )
        .await
        .expect("drive did not notice die")
        .unwrap();
    }

    #[tokio::test]
    async fn test_drive_times_out() {
        let (pool, _rx) = pool(1);
        let lease = pool.acquire("10.1.1.1".parse().unwrap(), Box::new(tokio::io::sink())).unwrap();
        let (_client, mut server) = tokio::io::duplex(64);

        let result = drive(&mut server, &lease, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ConnectionError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_tcp_hello_reaches_backend() {
        let (pool, mut rx) = pool(4);
        let (addr, shutdown, task) = start(Arc::clone(&pool)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(next(&mut rx).await.kind, MessageKind::Register);

        let key = SessionKey::new(SESSION_KEY).unwrap();
        let mut ciphers = key.ciphers();
        let mut wire = b"hello".to_vec();
        ciphers.encrypt(&mut wire);
        client.write_all(&[0x00, 0x05]).await.unwrap();
        client.write_all(&wire).await.unwrap();

        let msg = next(&mut rx).await;
        assert_eq!(msg.kind, MessageKind::Normal);
        assert_eq!(&msg.payload[..], b"hello");

        // Zero-length frames are delivered too.
        client.write_all(&[0x00, 0x00]).await.unwrap();
        let msg = next(&mut rx).await;
        assert_eq!(msg.kind, MessageKind::Normal);
        assert!(msg.payload.is_empty());

        drop(client);
        assert_eq!(next(&mut rx).await.kind, MessageKind::Quit);

        shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_tcp_capacity_one_rejects_second_client() {
        let (pool, mut rx) = pool(1);
        let (addr, shutdown, _task) = start(Arc::clone(&pool)).await;

        let _first = TcpStream::connect(addr).await.unwrap();
        assert_eq!(next(&mut rx).await.kind, MessageKind::Register);

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .expect("second connection was not closed")
            .unwrap_or(0);
        assert_eq!(n, 0);

        let stats = pool.stats();
        assert_eq!(stats.working, 1);
        assert_eq!(stats.free, 0);

        shutdown.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_tcp_kick_closes_client() {
        let (pool, mut rx) = pool(1);
        let (addr, shutdown, _task) = start(Arc::clone(&pool)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(next(&mut rx).await.kind, MessageKind::Register);

        pool.route(0, crate::backend::Downlink::Kick).await.unwrap();

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("client was not disconnected")
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(next(&mut rx).await.kind, MessageKind::Quit);

        shutdown.send(true).unwrap();
    }
}
