//! Background execution of deferred work

pub mod thread_pool;

pub use thread_pool::{Action, ActionWrapper, ThreadPool, MIN_IDLE_TTL};
