//! Socket transport: Unix domain or TCP, newline-delimited JSON frames

use std::fmt;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;
use perfpipe_common::{CollectorCommand, ProducerRequest};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{ProducerChannel, ProducerStream};
use crate::domain::{ConfigError, TransportError};

const UNIX_PREFIX: &str = "unix:";

/// Upper bound on a single TCP connection attempt
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Where the collector listens for producers.
///
/// Parsed from `unix:/path/to/socket` or `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerSideAddress {
    Unix(PathBuf),
    Tcp(String),
}

impl FromStr for ProducerSideAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix(UNIX_PREFIX) {
            if path.is_empty() {
                return Err(ConfigError::InvalidAddress(s.to_string()));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Self::Tcp(s.to_string()))
            }
            _ => Err(ConfigError::InvalidAddress(s.to_string())),
        }
    }
}

impl fmt::Display for ProducerSideAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "{UNIX_PREFIX}{}", path.display()),
            Self::Tcp(addr) => write!(f, "{addr}"),
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Connected socket of either family
#[derive(Debug)]
pub(crate) enum SocketConnection {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl SocketConnection {
    /// Connect, giving up on each resolved TCP address after `timeout`.
    pub(crate) fn connect(address: &ProducerSideAddress, timeout: Duration) -> io::Result<Self> {
        match address {
            ProducerSideAddress::Unix(path) => UnixStream::connect(path).map(Self::Unix),
            ProducerSideAddress::Tcp(addr) => {
                let stream = connect_tcp(addr, timeout)?;
                stream.set_nodelay(true)?;
                Ok(Self::Tcp(stream))
            }
        }
    }

    pub(crate) fn try_clone(&self) -> io::Result<Self> {
        match self {
            Self::Unix(stream) => stream.try_clone().map(Self::Unix),
            Self::Tcp(stream) => stream.try_clone().map(Self::Tcp),
        }
    }

    pub(crate) fn shutdown(&self) {
        // Fails only if the peer is already gone
        let _ = match self {
            Self::Unix(stream) => stream.shutdown(Shutdown::Both),
            Self::Tcp(stream) => stream.shutdown(Shutdown::Both),
        };
    }

    pub(crate) fn set_blocking(&self) -> io::Result<()> {
        match self {
            Self::Unix(stream) => stream.set_nonblocking(false),
            Self::Tcp(stream) => stream.set_nonblocking(false),
        }
    }
}

fn connect_tcp(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_error = None;
    for resolved in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&resolved, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, format!("{addr} resolved to no address"))
    }))
}

impl Read for SocketConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Unix(stream) => stream.read(buf),
            Self::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for SocketConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Unix(stream) => stream.write(buf),
            Self::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Unix(stream) => stream.flush(),
            Self::Tcp(stream) => stream.flush(),
        }
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Write one message as a single JSON line.
pub(crate) fn write_frame<W: Write, T: Serialize>(
    writer: &mut W,
    message: &T,
) -> Result<(), TransportError> {
    serde_json::to_writer(&mut *writer, message)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// Read the next JSON line. `Ok(None)` means the peer closed the connection.
pub(crate) fn read_frame<R: BufRead, T: DeserializeOwned>(
    reader: &mut R,
) -> Result<Option<T>, TransportError> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        return serde_json::from_str(trimmed)
            .map(Some)
            .map_err(|e| TransportError::MalformedFrame(e.to_string()));
    }
}

// ============================================================================
// Producer side
// ============================================================================

pub struct SocketStream {
    reader: Mutex<BufReader<SocketConnection>>,
    writer: Mutex<BufWriter<SocketConnection>>,
    control: SocketConnection,
    cancelled: AtomicBool,
}

impl SocketStream {
    fn new(connection: SocketConnection) -> io::Result<Self> {
        let reader = BufReader::new(connection.try_clone()?);
        let writer = BufWriter::new(connection.try_clone()?);
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            control: connection,
            cancelled: AtomicBool::new(false),
        })
    }

    fn check_cancelled(&self) -> Result<(), TransportError> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(TransportError::Cancelled);
        }
        Ok(())
    }
}

impl ProducerStream for SocketStream {
    fn write(&self, request: &ProducerRequest) -> Result<(), TransportError> {
        self.check_cancelled()?;
        write_frame(&mut *self.writer.lock(), request)
    }

    fn read(&self) -> Result<CollectorCommand, TransportError> {
        self.check_cancelled()?;
        let frame = read_frame(&mut *self.reader.lock());
        // A cancelled stream reports cancellation whatever the socket said
        self.check_cancelled()?;
        frame?.ok_or(TransportError::Closed)
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            debug!("Cancelling producer-side socket stream");
            self.control.shutdown();
        }
    }
}

/// Connects to a collector over a Unix domain or TCP socket.
///
/// TCP connection attempts are bounded by a connect timeout so that a
/// producer shutting down never waits on an unreachable collector for longer
/// than that.
pub struct SocketChannel {
    address: ProducerSideAddress,
    connect_timeout: Duration,
}

impl SocketChannel {
    #[must_use]
    pub fn new(address: ProducerSideAddress) -> Self {
        Self { address, connect_timeout: DEFAULT_CONNECT_TIMEOUT }
    }

    /// Replace [`DEFAULT_CONNECT_TIMEOUT`]. Zero is raised to one millisecond.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout.max(Duration::from_millis(1));
        self
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    #[must_use]
    pub fn address(&self) -> &ProducerSideAddress {
        &self.address
    }
}

impl ProducerChannel for SocketChannel {
    fn open_stream(&self) -> Result<Arc<dyn ProducerStream>, TransportError> {
        let connect_failed = |source| TransportError::ConnectFailed {
            address: self.address.to_string(),
            source,
        };
        let connection = SocketConnection::connect(&self.address, self.connect_timeout)
            .map_err(connect_failed)?;
        let stream = SocketStream::new(connection).map_err(connect_failed)?;
        Ok(Arc::new(stream))
    }

    fn describe(&self) -> String {
        self.address.to_string()
    }
}
