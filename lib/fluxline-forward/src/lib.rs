//! Buffered asynchronous delivery of line-protocol measurements.
//!
//! The [`Proxy`] is the delivery engine: application threads append encoded
//! measurements to a bank of lock-segmented buffers (the buffer chain), and
//! a background drainer periodically swaps the accumulated bytes out and
//! dispatches them through a pluggable [`Sender`] with retry, backoff,
//! per-attempt timeouts, and an optional shared in-flight limit.
//!
//! Senders are selected by destination URL scheme; `http`/`https`,
//! `udp`/`udp4`/`udp6`, and `file`/`fd` are built in, and applications can
//! register their own with [`register_sender`].
//!
//! Delivery is at-most-once: a batch that has been swapped out and fails all
//! of its send attempts is logged and dropped. There is no durable queue.
#![deny(warnings)]
#![deny(missing_docs)]

mod chain;
mod error;
mod proxy;
mod retry;
mod sender;
mod shared;

pub use self::error::{BadStatusError, ForwardError, SendError};
pub use self::proxy::{Proxy, ProxyBuilder, ProxyWriter, RequestLimiter};
pub use self::retry::{default_backoff, BackoffFn};
pub use self::sender::http::HttpDirector;
pub use self::sender::{register_sender, Sender, SenderConfig, SenderFactory};
pub use self::shared::{
    set_shared_writer, shared_writer, write, write_measurement, write_measurements, write_point,
};
