use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use perfpipe::producer::{CaptureEventProducer, CaptureSessionState, CaptureStateListener};
use perfpipe::transport::{loopback, LoopbackConnection, ProducerChannel};
use perfpipe_common::{CaptureOptions, CollectorCommand, ProducerCaptureEvent, ProducerRequest};

const TIMEOUT: Duration = Duration::from_secs(5);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

fn event(timestamp_ns: u64) -> ProducerCaptureEvent {
    ProducerCaptureEvent { timestamp_ns, payload: vec![0xab] }
}

fn start(capture_id: u64) -> CollectorCommand {
    CollectorCommand::StartCapture { options: CaptureOptions { capture_id, ..Default::default() } }
}

/// Records lifecycle calls; signals AllEventsSent from the stop callback the
/// way a producer with nothing left to flush would.
#[derive(Default)]
struct Listener {
    starts: AtomicU64,
    stops: AtomicU64,
    last_capture_id: AtomicU64,
    producer: parking_lot::Mutex<Option<Arc<CaptureEventProducer>>>,
    notify_on_stop: AtomicBool,
}

impl CaptureStateListener for Listener {
    fn on_capture_start(&self, options: &CaptureOptions) {
        self.last_capture_id.store(options.capture_id, Ordering::SeqCst);
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn on_capture_stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.notify_on_stop.load(Ordering::SeqCst) {
            if let Some(producer) = self.producer.lock().as_ref() {
                producer.notify_all_events_sent();
            }
        }
    }
}

fn producer_with_listener(
    notify_on_stop: bool,
) -> (Arc<CaptureEventProducer>, Arc<Listener>) {
    let listener = Arc::new(Listener::default());
    listener.notify_on_stop.store(notify_on_stop, Ordering::SeqCst);
    let producer = Arc::new(CaptureEventProducer::new(Arc::clone(&listener) as _));
    producer.set_reconnection_delay(Duration::from_millis(20));
    *listener.producer.lock() = Some(Arc::clone(&producer));
    (producer, listener)
}

/// Breaks the listener → producer cycle and stops the producer.
fn finish(producer: &Arc<CaptureEventProducer>, listener: &Listener) {
    producer.shutdown_and_wait();
    listener.producer.lock().take();
}

fn count_all_events_sent(connection: &LoopbackConnection) -> usize {
    let mut count = 0;
    while let Some(request) = connection.recv_request(Duration::from_millis(200)) {
        if request == ProducerRequest::AllEventsSent {
            count += 1;
        }
    }
    count
}

#[test]
fn test_send_fails_while_disconnected() {
    init_logging();
    let (channel, collector) = loopback();
    collector.set_refuse_connections(true);
    let (producer, listener) = producer_with_listener(false);

    assert!(!producer.send_capture_events(vec![event(1)]));
    producer.build_and_start(Arc::new(channel)).unwrap();
    thread::sleep(Duration::from_millis(50));

    assert!(!producer.send_capture_events(vec![event(2)]));
    assert!(!producer.is_capturing());
    assert!(matches!(
        producer.state(),
        CaptureSessionState::Disconnected | CaptureSessionState::Connecting
    ));

    finish(&producer, &listener);
}

#[test]
fn test_send_requires_capture() {
    init_logging();
    let (channel, collector) = loopback();
    let (producer, listener) = producer_with_listener(false);
    producer.build_and_start(Arc::new(channel)).unwrap();
    let connection = collector.accept(TIMEOUT).unwrap();

    assert!(wait_until(|| producer.state() == CaptureSessionState::WaitingForCommands));
    assert!(!producer.send_capture_events(vec![event(1)]));

    connection.send(start(9));
    assert!(wait_until(|| producer.is_capturing()));
    assert_eq!(listener.last_capture_id.load(Ordering::SeqCst), 9);
    assert!(producer.send_capture_events(vec![event(2), event(3)]));
    assert_eq!(
        connection.recv_request(TIMEOUT),
        Some(ProducerRequest::BufferedCaptureEvents { events: vec![event(2), event(3)] })
    );

    finish(&producer, &listener);
}

#[test]
fn test_start_stop_cycles_send_one_signal_each() {
    init_logging();
    let (channel, collector) = loopback();
    let (producer, listener) = producer_with_listener(true);
    producer.build_and_start(Arc::new(channel)).unwrap();
    let connection = collector.accept(TIMEOUT).unwrap();

    for capture_id in 1..=3 {
        connection.send(start(capture_id));
        assert!(wait_until(|| listener.starts.load(Ordering::SeqCst) == capture_id));
        connection.send(CollectorCommand::StopCapture);
        assert_eq!(connection.recv_request(TIMEOUT), Some(ProducerRequest::AllEventsSent));
        assert!(wait_until(|| producer.state() == CaptureSessionState::WaitingForCommands));
    }

    // A stop without a capture is ignored and produces no signal
    connection.send(CollectorCommand::StopCapture);
    assert_eq!(count_all_events_sent(&connection), 0);
    assert_eq!(listener.stops.load(Ordering::SeqCst), 3);

    finish(&producer, &listener);
}

#[test]
fn test_reconnects_after_connection_loss() {
    init_logging();
    let (channel, collector) = loopback();
    let (producer, listener) = producer_with_listener(false);
    producer.build_and_start(Arc::new(channel)).unwrap();

    let first = collector.accept(TIMEOUT).unwrap();
    first.send(start(1));
    assert!(wait_until(|| producer.is_capturing()));

    // Losing the connection mid-capture stops the capture locally
    first.close();
    assert!(wait_until(|| listener.stops.load(Ordering::SeqCst) == 1));
    assert!(!producer.is_capturing());
    assert!(!producer.notify_all_events_sent());

    let second = collector.accept(TIMEOUT).unwrap();
    assert!(wait_until(|| producer.state() == CaptureSessionState::WaitingForCommands));
    second.send(start(2));
    assert!(wait_until(|| listener.starts.load(Ordering::SeqCst) == 2));
    assert!(producer.send_capture_events(vec![event(5)]));

    finish(&producer, &listener);
}

#[test]
fn test_keeps_retrying_refused_connections() {
    init_logging();
    let (channel, collector) = loopback();
    collector.set_refuse_connections(true);
    let (producer, listener) = producer_with_listener(false);
    producer.build_and_start(Arc::new(channel)).unwrap();

    thread::sleep(Duration::from_millis(100));
    assert!(collector.accept(Duration::from_millis(10)).is_none());

    collector.set_refuse_connections(false);
    assert!(collector.accept(TIMEOUT).is_some());

    finish(&producer, &listener);
}

#[test]
fn test_shutdown_while_capturing() {
    init_logging();
    let (channel, collector) = loopback();
    let (producer, listener) = producer_with_listener(false);
    producer.build_and_start(Arc::new(channel)).unwrap();
    let connection = collector.accept(TIMEOUT).unwrap();

    connection.send(start(1));
    assert!(wait_until(|| producer.is_capturing()));

    let started = Instant::now();
    finish(&producer, &listener);
    assert!(started.elapsed() < Duration::from_secs(1));

    assert!(!producer.is_capturing());
    assert_eq!(producer.state(), CaptureSessionState::Disconnected);
    assert_eq!(listener.stops.load(Ordering::SeqCst), 1);
    assert!(!producer.send_capture_events(vec![event(1)]));

    // Idempotent
    producer.shutdown_and_wait();
}

#[test]
fn test_shutdown_interrupts_reconnection_delay() {
    init_logging();
    let (channel, collector) = loopback();
    collector.set_refuse_connections(true);
    let listener = Arc::new(Listener::default());
    let producer = CaptureEventProducer::new(Arc::clone(&listener) as _);
    assert_eq!(producer.reconnection_delay(), Duration::from_millis(5000));

    let channel: Arc<dyn ProducerChannel> = Arc::new(channel);
    producer.build_and_start(channel).unwrap();
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    producer.shutdown_and_wait();
    assert!(started.elapsed() < Duration::from_secs(1));
}
