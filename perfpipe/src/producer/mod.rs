//! Producer side of the capture protocol

pub mod buffered;
pub mod capture_event_producer;

pub use buffered::{BufferedCaptureEventProducer, CaptureEventSender};
pub use capture_event_producer::{CaptureEventProducer, CaptureSessionState, CaptureStateListener};
