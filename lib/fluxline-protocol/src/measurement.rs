use std::borrow::Cow;
use std::collections::BTreeMap;

use crate::encode;
use crate::error::ProtocolError;
use crate::field::Field;

/// Tags attached to a measurement, ordered ascending by name.
///
/// The ordered map keeps names sorted and de-duplicated, which is the order
/// the wire format requires.
pub type Tags = BTreeMap<String, String>;

/// Fields carried by a measurement, ordered ascending by name.
pub type Fields = BTreeMap<String, Field>;

/// Duplicates a field map.
///
/// When `deep` is set, the field values themselves are duplicated so that
/// the copies diverge under further mutation; otherwise the copies share the
/// originals' storage.
pub(crate) fn dup_fields(fields: &Fields, deep: bool) -> Fields {
    fields
        .iter()
        .map(|(name, field)| (name.clone(), if deep { field.dup() } else { field.clone() }))
        .collect()
}

/// The minimum contract for anything that can be sent as a line-protocol
/// measurement: a key, optional tags, at least one field, and an optional
/// fixed timestamp.
///
/// Implementations that maintain their own encoded form override
/// [`write_line`][Measurement::write_line]; the provided implementation
/// assembles the line from the accessor methods, sorting nothing because the
/// maps are already ordered.
pub trait Measurement {
    /// The measurement's key, the first token on the wire line.
    fn key(&self) -> Cow<'_, str>;

    /// A detached copy of the measurement's tags.
    fn tags(&self) -> Tags;

    /// A detached copy of the measurement's fields.
    ///
    /// The field values are shared with the measurement, so mutating them
    /// mutates the measurement's state.
    fn fields(&self) -> Fields;

    /// The measurement's timestamp in Unix nanoseconds, or `None` to stamp
    /// it with the current clock at encode time.
    fn timestamp(&self) -> Option<i64> {
        None
    }

    /// Appends the measurement's full wire line (trailing newline included)
    /// to `out`, returning the number of bytes written.
    ///
    /// On error nothing is left behind in `out`.
    fn write_line(&self, out: &mut Vec<u8>) -> Result<usize, ProtocolError> {
        encode::write_parts(out, &self.key(), &self.tags(), &self.fields(), self.timestamp())
    }
}

/// A plain-data measurement with no concurrency machinery.
///
/// Useful as a one-shot value that is encoded and immediately discarded.
/// Prefer the fixed field variants here to avoid the overhead of atomics.
#[derive(Clone, Debug, Default)]
pub struct RawMeasurement {
    /// The measurement key.
    pub key: String,
    /// Tags, ascending by name.
    pub tags: Tags,
    /// Fields, ascending by name.
    pub fields: Fields,
    /// Fixed timestamp in Unix nanoseconds; `None` resolves to the clock at
    /// encode time.
    pub timestamp: Option<i64>,
}

impl Measurement for RawMeasurement {
    fn key(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.key)
    }

    fn tags(&self) -> Tags {
        self.tags.clone()
    }

    fn fields(&self) -> Fields {
        self.fields.clone()
    }

    fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }
}

impl<M: Measurement + ?Sized> Measurement for &M {
    fn key(&self) -> Cow<'_, str> {
        (**self).key()
    }

    fn tags(&self) -> Tags {
        (**self).tags()
    }

    fn fields(&self) -> Fields {
        (**self).fields()
    }

    fn timestamp(&self) -> Option<i64> {
        (**self).timestamp()
    }

    fn write_line(&self, out: &mut Vec<u8>) -> Result<usize, ProtocolError> {
        (**self).write_line(out)
    }
}
