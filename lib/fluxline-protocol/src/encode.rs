use std::cell::RefCell;
use std::io::{self, Write as _};

use snafu::ResultExt as _;

use crate::error::{self, ProtocolError};
use crate::escape::escape_component_into;
use crate::measurement::{Fields, Measurement, Tags};
use crate::time;

// Scratch buffers start small and are clamped back down after an unusually
// large encode so a single huge batch doesn't pin memory forever.
const MIN_SCRATCH_CAPACITY: usize = 128;
const MAX_SCRATCH_CAPACITY: usize = 65_000;

thread_local! {
    static SCRATCH: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(MIN_SCRATCH_CAPACITY));
}

fn with_scratch<R>(f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
    SCRATCH.with(|cell| match cell.try_borrow_mut() {
        Ok(mut buf) => {
            buf.clear();
            let result = f(&mut buf);
            if buf.capacity() > MAX_SCRATCH_CAPACITY {
                *buf = Vec::with_capacity(MIN_SCRATCH_CAPACITY);
            }
            result
        }
        // Re-entrant encode; fall back to a one-off buffer.
        Err(_) => f(&mut Vec::with_capacity(MIN_SCRATCH_CAPACITY)),
    })
}

/// Assembles one wire line from measurement parts, appending to `out`.
///
/// Tags and fields are emitted in map order, which is ascending by name. If
/// a field fails to encode, `out` is truncated back to where this
/// measurement began so partial lines never reach the wire.
pub(crate) fn write_parts(
    out: &mut Vec<u8>, key: &str, tags: &Tags, fields: &Fields, timestamp: Option<i64>,
) -> Result<usize, ProtocolError> {
    if fields.is_empty() {
        return Err(ProtocolError::NoFields);
    }

    let head = out.len();

    escape_component_into(out, key);

    for (name, value) in tags {
        out.push(b',');
        escape_component_into(out, name);
        out.push(b'=');
        escape_component_into(out, value);
    }

    out.push(b' ');

    let mut separator = false;
    for (name, field) in fields {
        if separator {
            out.push(b',');
        }
        separator = true;

        escape_component_into(out, name);
        out.push(b'=');

        if let Err(e) = field.encode_value(out) {
            out.truncate(head);
            return Err(e);
        }
    }

    out.push(b' ');
    write_timestamp(out, timestamp.unwrap_or_else(time::now_unix_nanos));
    out.push(b'\n');

    Ok(out.len() - head)
}

pub(crate) fn write_timestamp(out: &mut Vec<u8>, nanos: i64) {
    write!(out, "{}", nanos).expect("write to Vec cannot fail");
}

/// Appends a single measurement's wire line to `out`.
///
/// Returns the number of bytes written. If the measurement has no fields,
/// nothing is written and [`ProtocolError::NoFields`] is returned.
pub fn write_measurement<M>(out: &mut Vec<u8>, measurement: &M) -> Result<usize, ProtocolError>
where
    M: Measurement + ?Sized,
{
    measurement.write_line(out)
}

/// Appends multiple measurements' wire lines to `out`.
///
/// Measurements without fields are silently skipped; each skipped
/// measurement leaves no bytes behind. Any other error truncates everything
/// this call wrote and aborts.
pub fn write_measurements<I>(out: &mut Vec<u8>, measurements: I) -> Result<usize, ProtocolError>
where
    I: IntoIterator,
    I::Item: Measurement,
{
    let head = out.len();

    for measurement in measurements {
        match measurement.write_line(out) {
            Ok(_) | Err(ProtocolError::NoFields) => {}
            Err(e) => {
                out.truncate(head);
                return Err(e);
            }
        }
    }

    Ok(out.len() - head)
}

/// Encodes multiple measurements and writes the result to `w` as one block.
///
/// Uses a pooled scratch buffer; if the encoded output is empty (all
/// measurements skipped), the writer is never touched and 0 is returned.
pub fn write_measurements_to<W, I>(w: &mut W, measurements: I) -> Result<usize, ProtocolError>
where
    W: io::Write,
    I: IntoIterator,
    I::Item: Measurement,
{
    with_scratch(|buf| {
        write_measurements(buf, measurements)?;
        if buf.is_empty() {
            return Ok(0);
        }
        w.write_all(buf).context(error::Io)?;
        Ok(buf.len())
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::field::{BoolField, DynamicField, Field, FloatField, IntField, TextField};
    use crate::measurement::RawMeasurement;
    use crate::time::set_fixed_timestamp;

    const TEST_TIMESTAMP: i64 = 1_136_214_245_000_000_000;
    const GOLDEN_LINE: &str = "service.some_event,host=example.local,pid=1234 depth=123.456,msg=\"a \\\"string\\\" of sorts\",on=T,value=123i 1136214245000000000\n";

    fn sample_measurement() -> RawMeasurement {
        let mut m = RawMeasurement {
            key: "service.some_event".to_string(),
            ..Default::default()
        };
        m.tags.insert("pid".to_string(), "1234".to_string());
        m.tags.insert("host".to_string(), "example.local".to_string());

        let value = IntField::new(123);
        let depth = FloatField::new(123.456);
        let on = BoolField::new(true);
        let msg = TextField::new(r#"a "string" of sorts"#);
        m.fields.insert("value".to_string(), value.into());
        m.fields.insert("depth".to_string(), depth.into());
        m.fields.insert("on".to_string(), on.into());
        m.fields.insert("msg".to_string(), msg.into());
        m
    }

    #[test]
    fn single_measurement_golden_line() {
        set_fixed_timestamp(TEST_TIMESTAMP);

        let mut out = Vec::new();
        let written = write_measurement(&mut out, &sample_measurement()).expect("encode should succeed");
        assert_eq!(written, out.len());
        assert_eq!(String::from_utf8(out).unwrap(), GOLDEN_LINE);
    }

    #[test]
    fn explicit_timestamp_wins_over_clock() {
        set_fixed_timestamp(TEST_TIMESTAMP);

        let mut m = sample_measurement();
        m.timestamp = Some(42);

        let mut out = Vec::new();
        write_measurement(&mut out, &m).expect("encode should succeed");
        assert!(String::from_utf8(out).unwrap().ends_with(" 42\n"));
    }

    #[test]
    fn no_fields_writes_nothing() {
        let m = RawMeasurement {
            key: "empty".to_string(),
            ..Default::default()
        };

        let mut out = Vec::new();
        let err = write_measurement(&mut out, &m).expect_err("no fields must be rejected");
        assert!(matches!(err, ProtocolError::NoFields));
        assert!(out.is_empty());
    }

    #[test]
    fn batch_skips_fieldless_members() {
        set_fixed_timestamp(TEST_TIMESTAMP);

        let a = sample_measurement();
        let empty = RawMeasurement {
            key: "empty".to_string(),
            ..Default::default()
        };
        let mut c = sample_measurement();
        c.key = "service.other_event".to_string();

        let mut out = Vec::new();
        write_measurements(&mut out, [&a as &dyn super::Measurement, &empty, &c]).expect("batch should succeed");

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.split_inclusive('\n').collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("service.some_event,"));
        assert!(lines[1].starts_with("service.other_event,"));
    }

    #[derive(Debug)]
    struct FailingField;

    impl DynamicField for FailingField {
        fn encode_value(&self, _out: &mut Vec<u8>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Err("field backend unavailable".into())
        }

        fn snapshot(&self) -> Field {
            Field::FixedInt(0)
        }
    }

    #[test]
    fn failing_field_rewinds_measurement() {
        set_fixed_timestamp(TEST_TIMESTAMP);

        let mut m = sample_measurement();
        // Sorts after "depth", so some output exists before the failure.
        m.fields.insert("fails".to_string(), Field::Dynamic(Arc::new(FailingField)));

        let mut out = b"prior".to_vec();
        let err = write_measurement(&mut out, &m).expect_err("dynamic field failure must surface");
        assert!(matches!(err, ProtocolError::FieldEncode { .. }));
        assert_eq!(out, b"prior");
    }

    #[test]
    fn empty_batch_never_touches_writer() {
        struct ExplodingWriter;

        impl io::Write for ExplodingWriter {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                panic!("writer must not be touched for empty output");
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let empty = RawMeasurement {
            key: "empty".to_string(),
            ..Default::default()
        };

        let written =
            write_measurements_to(&mut ExplodingWriter, [&empty]).expect("empty batch should succeed");
        assert_eq!(written, 0);
    }

    #[test]
    fn batch_writes_through_to_writer() {
        set_fixed_timestamp(TEST_TIMESTAMP);

        let mut out = Vec::new();
        let written = write_measurements_to(&mut out, [&sample_measurement()]).expect("encode should succeed");
        assert_eq!(written, out.len());
        assert_eq!(String::from_utf8(out).unwrap(), GOLDEN_LINE);
    }
}
