//! A process-wide shared delivery proxy.
//!
//! Libraries that want to emit measurements without threading a [`Proxy`]
//! handle through every call site can write through these free functions.
//! Until a proxy is installed (or after it is cleared), every write is
//! silently discarded, so emitting telemetry never becomes a reason for the
//! host application to fail.

use std::sync::RwLock;

use fluxline_protocol::{Fields, Measurement, Tags};

use crate::error::ForwardError;
use crate::proxy::Proxy;

static SHARED_WRITER: RwLock<Option<Proxy>> = RwLock::new(None);

/// Installs (or, with `None`, clears) the process-wide shared proxy.
pub fn set_shared_writer(proxy: Option<Proxy>) {
    let mut shared = SHARED_WRITER.write().unwrap();
    *shared = proxy;
}

/// Returns a handle to the process-wide shared proxy, if one is installed.
pub fn shared_writer() -> Option<Proxy> {
    SHARED_WRITER.read().unwrap().clone()
}

/// Appends raw bytes to the shared proxy. A no-op returning 0 when no proxy
/// is installed or `data` is empty.
pub fn write(data: &[u8]) -> Result<usize, ForwardError> {
    if data.is_empty() {
        return Ok(0);
    }

    let shared = SHARED_WRITER.read().unwrap();
    match &*shared {
        Some(proxy) => proxy.write(data),
        None => Ok(0),
    }
}

/// Encodes a measurement into the shared proxy. A no-op returning 0 when no
/// proxy is installed.
pub fn write_measurement<M>(measurement: &M) -> Result<usize, ForwardError>
where
    M: Measurement + ?Sized,
{
    let shared = SHARED_WRITER.read().unwrap();
    match &*shared {
        Some(proxy) => proxy.write_measurement(measurement),
        None => Ok(0),
    }
}

/// Encodes multiple measurements into the shared proxy as one contiguous
/// group. A no-op returning 0 when no proxy is installed.
pub fn write_measurements<I>(measurements: I) -> Result<usize, ForwardError>
where
    I: IntoIterator,
    I::Item: Measurement,
{
    let shared = SHARED_WRITER.read().unwrap();
    match &*shared {
        Some(proxy) => proxy.write_measurements(measurements),
        None => Ok(0),
    }
}

/// Encodes a one-shot point into the shared proxy. A no-op returning 0 when
/// no proxy is installed.
pub fn write_point(key: &str, timestamp: Option<i64>, tags: Tags, fields: Fields) -> Result<usize, ForwardError> {
    let shared = SHARED_WRITER.read().unwrap();
    match &*shared {
        Some(proxy) => proxy.write_point(key, timestamp, tags, fields),
        None => Ok(0),
    }
}
