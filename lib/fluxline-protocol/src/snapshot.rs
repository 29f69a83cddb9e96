use crate::measurement::{Fields, Measurement, RawMeasurement};
use crate::time;

/// Captures a detached, time-fixed copy of a measurement.
///
/// The result carries the measurement's key and tags, a snapshot of every
/// field value as taken at this instant, and a timestamp resolved now (or
/// the measurement's own fixed timestamp, if it has one). Mutating the
/// original afterwards does not affect the snapshot.
///
/// Returns `None` if the measurement has an empty key or no fields, since
/// there is nothing meaningful to capture. Compiled points and point sets report
/// empty parts and so cannot be snapshotted this way; use
/// [`CompiledPoint::snapshot`][crate::CompiledPoint::snapshot] for those.
pub fn snapshot<M>(measurement: &M) -> Option<RawMeasurement>
where
    M: Measurement + ?Sized,
{
    let key = measurement.key().into_owned();
    if key.is_empty() {
        return None;
    }

    let source_fields = measurement.fields();
    if source_fields.is_empty() {
        return None;
    }

    let mut fields = Fields::new();
    for (name, field) in &source_fields {
        fields.insert(name.clone(), field.snapshot());
    }

    Some(RawMeasurement {
        key,
        tags: measurement.tags(),
        fields,
        timestamp: Some(measurement.timestamp().unwrap_or_else(time::now_unix_nanos)),
    })
}
