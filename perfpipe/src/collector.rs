//! # Producer-Side Server
//!
//! Minimal collector endpoint: accepts producer connections on a Unix domain
//! or TCP socket, broadcasts capture commands to every connected producer,
//! and records what the producers send back.
//!
//! Threads:
//! - one accept thread (non-blocking listener, polled)
//! - one reader thread per connection, decoding [`ProducerRequest`] frames
//!
//! Used by the `collect` subcommand and by the socket integration tests.

use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use perfpipe_common::{CaptureOptions, CollectorCommand, ProducerCaptureEvent, ProducerRequest};

use crate::domain::TransportError;
use crate::transport::socket::{read_frame, write_frame, SocketConnection};
use crate::transport::ProducerSideAddress;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Counters maintained by the server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorStats {
    pub connections_accepted: u64,
    pub active_connections: u64,
    pub batches_received: u64,
    pub events_received: u64,
    pub all_events_sent: u64,
}

enum ServerListener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl ServerListener {
    fn bind(address: &ProducerSideAddress) -> io::Result<Self> {
        let listener = match address {
            ProducerSideAddress::Unix(path) => {
                // Stale socket from a previous run
                if path.exists() {
                    fs::remove_file(path)?;
                }
                Self::Unix(UnixListener::bind(path)?)
            }
            ProducerSideAddress::Tcp(addr) => Self::Tcp(TcpListener::bind(addr.as_str())?),
        };
        match &listener {
            Self::Unix(l) => l.set_nonblocking(true)?,
            Self::Tcp(l) => l.set_nonblocking(true)?,
        }
        Ok(listener)
    }

    fn accept(&self) -> io::Result<SocketConnection> {
        let connection = match self {
            Self::Unix(l) => SocketConnection::Unix(l.accept()?.0),
            Self::Tcp(l) => SocketConnection::Tcp(l.accept()?.0),
        };
        connection.set_blocking()?;
        Ok(connection)
    }

    fn local_address(&self, requested: &ProducerSideAddress) -> io::Result<ProducerSideAddress> {
        match self {
            Self::Unix(_) => Ok(requested.clone()),
            Self::Tcp(l) => Ok(ProducerSideAddress::Tcp(l.local_addr()?.to_string())),
        }
    }
}

struct ConnectionHandle {
    id: u64,
    writer: BufWriter<SocketConnection>,
    control: SocketConnection,
}

struct ServerShared {
    connections: Mutex<Vec<ConnectionHandle>>,
    stats: Mutex<CollectorStats>,
    stats_changed: Condvar,
    events: Mutex<Vec<ProducerCaptureEvent>>,
    reader_threads: Mutex<Vec<JoinHandle<()>>>,
    shutdown_requested: AtomicBool,
    next_connection_id: AtomicU64,
}

pub struct ProducerSideServer {
    shared: Arc<ServerShared>,
    address: ProducerSideAddress,
    accept_thread: Option<JoinHandle<()>>,
}

impl ProducerSideServer {
    /// Bind the listener and start accepting producers.
    ///
    /// A TCP address with port 0 binds an ephemeral port; see
    /// [`ProducerSideServer::address`].
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub fn bind(address: &ProducerSideAddress) -> Result<Self, TransportError> {
        let listener = ServerListener::bind(address)?;
        let local_address = listener.local_address(address)?;

        let shared = Arc::new(ServerShared {
            connections: Mutex::new(Vec::new()),
            stats: Mutex::new(CollectorStats::default()),
            stats_changed: Condvar::new(),
            events: Mutex::new(Vec::new()),
            reader_threads: Mutex::new(Vec::new()),
            shutdown_requested: AtomicBool::new(false),
            next_connection_id: AtomicU64::new(0),
        });

        let accept_shared = Arc::clone(&shared);
        let accept_thread = thread::Builder::new()
            .name("perfpipe-accept".to_string())
            .spawn(move || accept_loop(&accept_shared, &listener))?;

        info!("Collector listening on {local_address}");
        Ok(Self { shared, address: local_address, accept_thread: Some(accept_thread) })
    }

    /// Address producers should connect to
    #[must_use]
    pub fn address(&self) -> &ProducerSideAddress {
        &self.address
    }

    /// Returns the number of producers the command reached.
    pub fn start_capture(&self, options: CaptureOptions) -> usize {
        self.broadcast(&CollectorCommand::StartCapture { options })
    }

    pub fn stop_capture(&self) -> usize {
        self.broadcast(&CollectorCommand::StopCapture)
    }

    pub fn capture_finished(&self) -> usize {
        self.broadcast(&CollectorCommand::CaptureFinished)
    }

    #[must_use]
    pub fn stats(&self) -> CollectorStats {
        *self.shared.stats.lock()
    }

    /// Block until at least `count` producers are connected.
    #[must_use]
    pub fn wait_for_connections(&self, count: u64, timeout: Duration) -> bool {
        self.wait_for_stats(timeout, |stats| stats.active_connections >= count)
    }

    /// Block until `count` AllEventsSent signals were received in total.
    #[must_use]
    pub fn wait_for_all_events_sent(&self, count: u64, timeout: Duration) -> bool {
        self.wait_for_stats(timeout, |stats| stats.all_events_sent >= count)
    }

    /// Events received so far, in arrival order. Clears the store.
    pub fn take_events(&self) -> Vec<ProducerCaptureEvent> {
        std::mem::take(&mut *self.shared.events.lock())
    }

    /// Close every connection and stop accepting. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shared.shutdown_requested.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        for connection in self.shared.connections.lock().drain(..) {
            connection.control.shutdown();
        }
        let readers = std::mem::take(&mut *self.shared.reader_threads.lock());
        for handle in readers {
            let _ = handle.join();
        }

        if let ProducerSideAddress::Unix(path) = &self.address {
            if let Err(e) = fs::remove_file(path) {
                debug!("Could not remove {}: {e}", path.display());
            }
        }
        info!("Collector stopped");
    }

    fn broadcast(&self, command: &CollectorCommand) -> usize {
        let mut connections = self.shared.connections.lock();
        connections.retain_mut(|connection| match write_frame(&mut connection.writer, command) {
            Ok(()) => true,
            Err(e) => {
                warn!("Dropping producer connection {}: {e}", connection.id);
                connection.control.shutdown();
                false
            }
        });
        debug!("Sent {command:?} to {} producers", connections.len());
        connections.len()
    }

    fn wait_for_stats(&self, timeout: Duration, done: impl Fn(&CollectorStats) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stats = self.shared.stats.lock();
        while !done(&stats) {
            if self.shared.stats_changed.wait_until(&mut stats, deadline).timed_out() {
                return done(&stats);
            }
        }
        true
    }
}

impl Drop for ProducerSideServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(shared: &Arc<ServerShared>, listener: &ServerListener) {
    while !shared.shutdown_requested.load(Ordering::Acquire) {
        match listener.accept() {
            Ok(connection) => {
                if let Err(e) = register_connection(shared, connection) {
                    warn!("Failed to set up producer connection: {e}");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                warn!("Accept failed: {e}");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}

fn register_connection(shared: &Arc<ServerShared>, connection: SocketConnection) -> io::Result<()> {
    let id = shared.next_connection_id.fetch_add(1, Ordering::Relaxed);
    let reader = BufReader::new(connection.try_clone()?);
    let writer = BufWriter::new(connection.try_clone()?);

    let control = connection.try_clone()?;

    // Registered before the reader starts so its exit always finds the entry
    shared.connections.lock().push(ConnectionHandle { id, writer, control: connection });

    let reader_shared = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name(format!("perfpipe-conn-{id}"))
        .spawn(move || read_requests_loop(&reader_shared, id, reader));
    let handle = match spawned {
        Ok(handle) => handle,
        Err(e) => {
            shared.connections.lock().retain(|connection| connection.id != id);
            control.shutdown();
            return Err(e);
        }
    };
    {
        let mut readers = shared.reader_threads.lock();
        join_finished_readers(&mut readers);
        readers.push(handle);
    }
    {
        let mut stats = shared.stats.lock();
        stats.connections_accepted += 1;
        stats.active_connections += 1;
    }
    shared.stats_changed.notify_all();
    info!("Producer {id} connected");
    Ok(())
}

/// Joins readers of producers that already disconnected.
fn join_finished_readers(readers: &mut Vec<JoinHandle<()>>) {
    let mut index = 0;
    while index < readers.len() {
        if readers[index].is_finished() {
            let _ = readers.swap_remove(index).join();
        } else {
            index += 1;
        }
    }
}

fn read_requests_loop(shared: &ServerShared, id: u64, mut reader: BufReader<SocketConnection>) {
    loop {
        match read_frame::<_, ProducerRequest>(&mut reader) {
            Ok(Some(request)) => record_request(shared, request),
            Ok(None) => {
                info!("Producer {id} disconnected");
                break;
            }
            Err(e) => {
                if !shared.shutdown_requested.load(Ordering::Acquire) {
                    warn!("Producer {id} connection failed: {e}");
                }
                break;
            }
        }
    }

    shared.connections.lock().retain(|connection| connection.id != id);
    {
        let mut stats = shared.stats.lock();
        stats.active_connections = stats.active_connections.saturating_sub(1);
    }
    shared.stats_changed.notify_all();
}

fn record_request(shared: &ServerShared, request: ProducerRequest) {
    match request {
        ProducerRequest::BufferedCaptureEvents { events } => {
            let count = events.len() as u64;
            shared.events.lock().extend(events);
            let mut stats = shared.stats.lock();
            stats.batches_received += 1;
            stats.events_received += count;
        }
        ProducerRequest::AllEventsSent => {
            debug!("AllEventsSent received");
            shared.stats.lock().all_events_sent += 1;
        }
    }
    shared.stats_changed.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ProducerChannel, SocketChannel};

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_tcp_ephemeral_port_is_reported() {
        let server = ProducerSideServer::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        match server.address() {
            ProducerSideAddress::Tcp(addr) => assert!(!addr.ends_with(":0")),
            ProducerSideAddress::Unix(_) => panic!("expected a TCP address"),
        }
    }

    #[test]
    fn test_commands_and_requests_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let address = ProducerSideAddress::Unix(dir.path().join("collector.sock"));
        let server = ProducerSideServer::bind(&address).unwrap();

        let stream = SocketChannel::new(address).open_stream().unwrap();
        assert!(server.wait_for_connections(1, TIMEOUT));

        assert_eq!(server.stop_capture(), 1);
        assert_eq!(stream.read().unwrap(), CollectorCommand::StopCapture);

        let events = vec![ProducerCaptureEvent { timestamp_ns: 7, payload: b"{}".to_vec() }];
        stream.write(&ProducerRequest::BufferedCaptureEvents { events: events.clone() }).unwrap();
        stream.write(&ProducerRequest::AllEventsSent).unwrap();

        assert!(server.wait_for_all_events_sent(1, TIMEOUT));
        let stats = server.stats();
        assert_eq!(stats.batches_received, 1);
        assert_eq!(stats.events_received, 1);
        assert_eq!(server.take_events(), events);
        assert!(server.take_events().is_empty());
    }

    #[test]
    fn test_reconnecting_producers_do_not_accumulate_readers() {
        let server = ProducerSideServer::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let channel = SocketChannel::new(server.address().clone());

        for round in 1..=8 {
            let stream = channel.open_stream().unwrap();
            assert!(server.wait_for_connections(1, TIMEOUT));
            stream.cancel();
            assert!(server.wait_for_stats(TIMEOUT, |stats| {
                stats.connections_accepted == round && stats.active_connections == 0
            }));
        }
        thread::sleep(Duration::from_millis(50));

        let _stream = channel.open_stream().unwrap();
        assert!(server.wait_for_connections(1, TIMEOUT));
        assert!(server.shared.reader_threads.lock().len() <= 2);
    }

    #[test]
    fn test_shutdown_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collector.sock");
        let mut server = ProducerSideServer::bind(&ProducerSideAddress::Unix(path.clone())).unwrap();
        assert!(path.exists());
        server.shutdown();
        assert!(!path.exists());
    }
}
