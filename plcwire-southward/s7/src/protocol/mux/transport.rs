use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    fmt, io,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream},
    net::TcpStream,
    sync::mpsc,
    time::timeout,
};

/// Byte stream a physical link runs over.
pub trait LinkIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> LinkIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedIo = Box<dyn LinkIo>;

/// Produces connected byte streams for the multiplexer.
///
/// The multiplexer never does socket setup itself; tests plug in an
/// in-memory factory here.
#[async_trait]
pub trait TransportFactory: Send + Sync + fmt::Debug + 'static {
    async fn open(&self, address: &str) -> io::Result<BoxedIo>;
}

/// Plain TCP with a connect timeout and `TCP_NODELAY`.
#[derive(Debug, Clone)]
pub struct TcpTransportFactory {
    pub connect_timeout: Duration,
    pub nodelay: bool,
}

impl Default for TcpTransportFactory {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            nodelay: true,
        }
    }
}

impl TcpTransportFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ..Default::default()
        }
    }
}

#[async_trait]
impl TransportFactory for TcpTransportFactory {
    async fn open(&self, address: &str) -> io::Result<BoxedIo> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {address} timed out"),
                )
            })??;
        stream.set_nodelay(self.nodelay)?;
        Ok(Box::new(stream))
    }
}

/// In-memory transport. Every successful `open` hands the far end of a
/// duplex pipe to whoever is listening on that address.
#[derive(Debug, Default)]
pub struct MemoryTransportFactory {
    peers: Mutex<HashMap<String, mpsc::UnboundedSender<DuplexStream>>>,
    down: Mutex<HashSet<String>>,
}

impl MemoryTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Far ends of every stream subsequently opened to `address`.
    pub fn listen(&self, address: &str) -> mpsc::UnboundedReceiver<DuplexStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.peers).insert(address.to_string(), tx);
        rx
    }

    /// Unreachable addresses refuse new opens; existing streams are untouched.
    pub fn set_reachable(&self, address: &str, reachable: bool) {
        let mut down = lock(&self.down);
        if reachable {
            down.remove(address);
        } else {
            down.insert(address.to_string());
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn open(&self, address: &str) -> io::Result<BoxedIo> {
        if lock(&self.down).contains(address) {
            return Err(io::ErrorKind::ConnectionRefused.into());
        }
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let peers = lock(&self.peers);
        let tx = peers
            .get(address)
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        tx.send(remote)
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        Ok(Box::new(local))
    }
}
