use std::borrow::Cow;
use std::sync::{Arc, RwLock};

use crate::encode::{self, write_timestamp};
use crate::error::ProtocolError;
use crate::escape::escape_component_into;
use crate::field::Field;
use crate::measurement::{dup_fields, Fields, Measurement, Tags};
use crate::time;

struct Shape {
    tags: Tags,
    fields: Fields,
}

/// A single named, mutable measurement.
///
/// A `Point` owns its tag and field sets. Shape changes (adding or removing
/// a tag or field) are mutually exclusive with serialization, but reads of
/// the field *values* during serialization take no lock because every field
/// handles its own atomicity.
///
/// If the point has no fields it cannot be written; encoding it reports
/// [`ProtocolError::NoFields`] until a field is set.
pub struct Point {
    key: String,
    shape: RwLock<Shape>,
}

impl Point {
    /// Creates a new `Point` with the given key, tags, and fields.
    ///
    /// # Panics
    ///
    /// Panics if `key` is empty; a keyless point can never be encoded, so
    /// this is a contract violation rather than a runtime error.
    pub fn new(key: impl Into<String>, tags: Tags, fields: Fields) -> Self {
        let key = key.into();
        assert!(!key.is_empty(), "Point::new: key is empty");

        Self {
            key,
            shape: RwLock::new(Shape { tags, fields }),
        }
    }

    /// Returns the point's key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Sets a tag on the point.
    ///
    /// An empty name is a no-op; an empty value removes the tag.
    pub fn set_tag(&self, name: &str, value: &str) {
        if name.is_empty() {
            return;
        }
        if value.is_empty() {
            self.remove_tag(name);
            return;
        }

        let mut shape = self.shape.write().unwrap();
        shape.tags.insert(name.to_string(), value.to_string());
    }

    /// Removes the tag with the given name. An empty name is a no-op.
    pub fn remove_tag(&self, name: &str) {
        if name.is_empty() {
            return;
        }

        let mut shape = self.shape.write().unwrap();
        shape.tags.remove(name);
    }

    /// Sets a field on the point. An empty name is a no-op.
    pub fn set_field(&self, name: &str, field: Field) {
        if name.is_empty() {
            return;
        }

        let mut shape = self.shape.write().unwrap();
        shape.fields.insert(name.to_string(), field);
    }

    /// Removes the field with the given name. An empty name is a no-op.
    pub fn remove_field(&self, name: &str) {
        if name.is_empty() {
            return;
        }

        let mut shape = self.shape.write().unwrap();
        shape.fields.remove(name);
    }

    /// Returns a compiled form of the point, or `None` if the point has no
    /// fields (and so could never be written).
    ///
    /// The compiled form pre-escapes the key, tags, and field names into a
    /// single buffer, leaving only field values and the timestamp to encode
    /// per write. It is immutable except for its field values; use it when
    /// encoding throughput matters and the point's shape is settled.
    pub fn compiled(&self) -> Option<CompiledPoint> {
        let shape = self.shape.read().unwrap();
        if shape.fields.is_empty() {
            return None;
        }
        Some(compile(&self.key, &shape.tags, &shape.fields))
    }
}

impl Measurement for Point {
    fn key(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.key)
    }

    fn tags(&self) -> Tags {
        self.shape.read().unwrap().tags.clone()
    }

    fn fields(&self) -> Fields {
        dup_fields(&self.shape.read().unwrap().fields, false)
    }

    fn write_line(&self, out: &mut Vec<u8>) -> Result<usize, ProtocolError> {
        let shape = self.shape.read().unwrap();
        encode::write_parts(out, &self.key, &shape.tags, &shape.fields, None)
    }
}

#[derive(Clone, Debug)]
struct CompiledField {
    from: usize,
    to: usize,
    value: Field,
}

/// An immutable, pre-escaped form of a [`Point`].
///
/// Holds one contiguous prefix buffer containing the escaped key, all tag
/// pairs, and each field's separator-plus-name-plus-`=` range; `lead` covers
/// the key, tags, and the first field's prefix. Only field values and the
/// timestamp are produced at write time.
///
/// A compiled point reports an empty key and empty tag/field sets so that it
/// is only ever serialized through its own write path.
#[derive(Clone)]
pub struct CompiledPoint {
    prefix: Arc<Vec<u8>>,
    lead: usize,
    fields: Arc<[CompiledField]>,
}

fn compile(key: &str, tags: &Tags, fields: &Fields) -> CompiledPoint {
    let mut prefix = Vec::new();

    escape_component_into(&mut prefix, key);
    for (name, value) in tags {
        prefix.push(b',');
        escape_component_into(&mut prefix, name);
        prefix.push(b'=');
        escape_component_into(&mut prefix, value);
    }

    let mut lead = prefix.len();
    let mut compiled = Vec::with_capacity(fields.len());
    let mut separator = b' ';
    for (i, (name, field)) in fields.iter().enumerate() {
        let mut from = prefix.len();
        prefix.push(separator);
        separator = b',';

        escape_component_into(&mut prefix, name);
        prefix.push(b'=');

        let to = prefix.len();
        if i == 0 {
            // The first field's whole prefix folds into the lead.
            from = to;
            lead = to;
        }
        compiled.push(CompiledField {
            from,
            to,
            value: field.clone(),
        });
    }

    CompiledPoint {
        prefix: Arc::new(prefix),
        lead,
        fields: compiled.into(),
    }
}

impl CompiledPoint {
    /// Returns this compiled point with its timestamp frozen at the current
    /// clock, for capturing point state at a specific instant.
    pub fn snapshot(&self) -> CompiledSnapshot {
        CompiledSnapshot {
            point: self.clone(),
            timestamp: time::now_unix_nanos(),
        }
    }

    fn write_line_at(&self, out: &mut Vec<u8>, timestamp: i64) -> Result<usize, ProtocolError> {
        let head = out.len();

        out.extend_from_slice(&self.prefix[..self.lead]);
        for field in self.fields.iter() {
            if field.from < field.to {
                out.extend_from_slice(&self.prefix[field.from..field.to]);
            }
            if let Err(e) = field.value.encode_value(out) {
                out.truncate(head);
                return Err(e);
            }
        }

        out.push(b' ');
        write_timestamp(out, timestamp);
        out.push(b'\n');

        Ok(out.len() - head)
    }
}

impl Measurement for CompiledPoint {
    fn key(&self) -> Cow<'_, str> {
        Cow::Borrowed("")
    }

    fn tags(&self) -> Tags {
        Tags::new()
    }

    fn fields(&self) -> Fields {
        Fields::new()
    }

    fn write_line(&self, out: &mut Vec<u8>) -> Result<usize, ProtocolError> {
        self.write_line_at(out, time::now_unix_nanos())
    }
}

/// A [`CompiledPoint`] frozen at a specific timestamp.
#[derive(Clone)]
pub struct CompiledSnapshot {
    point: CompiledPoint,
    timestamp: i64,
}

impl Measurement for CompiledSnapshot {
    fn key(&self) -> Cow<'_, str> {
        Cow::Borrowed("")
    }

    fn tags(&self) -> Tags {
        Tags::new()
    }

    fn fields(&self) -> Fields {
        Fields::new()
    }

    fn timestamp(&self) -> Option<i64> {
        Some(self.timestamp)
    }

    fn write_line(&self, out: &mut Vec<u8>) -> Result<usize, ProtocolError> {
        self.point.write_line_at(out, self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::write_measurement;
    use crate::field::{BoolField, FloatField, IntField, TextField};
    use crate::time::set_fixed_timestamp;

    const TEST_TIMESTAMP: i64 = 1_136_214_245_000_000_000;
    const GOLDEN_LINE: &str = "service.some_event,host=example.local,pid=1234 depth=123.456,msg=\"a \\\"string\\\" of sorts\",on=T,value=123i 1136214245000000000\n";

    fn sample_point() -> Point {
        let point = Point::new("service.some_event", Tags::new(), Fields::new());
        point.set_tag("pid", "1234");
        point.set_tag("host", "example.local");
        point.set_field("value", IntField::new(123).into());
        point.set_field("depth", FloatField::new(123.456).into());
        point.set_field("on", BoolField::new(true).into());
        point.set_field("msg", TextField::new(r#"a "string" of sorts"#).into());
        point
    }

    fn line_of<M: Measurement>(m: &M) -> String {
        let mut out = Vec::new();
        write_measurement(&mut out, m).expect("encode should succeed");
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn point_golden_line() {
        set_fixed_timestamp(TEST_TIMESTAMP);
        assert_eq!(line_of(&sample_point()), GOLDEN_LINE);
    }

    #[test]
    fn compiled_point_matches_uncompiled_output() {
        set_fixed_timestamp(TEST_TIMESTAMP);

        let point = sample_point();
        let compiled = point.compiled().expect("point has fields");
        assert_eq!(line_of(&compiled), line_of(&point));
        assert_eq!(line_of(&compiled), GOLDEN_LINE);
    }

    #[test]
    fn compiled_point_tracks_field_values() {
        set_fixed_timestamp(TEST_TIMESTAMP);

        let counter = IntField::new(0);
        let point = Point::new("reqs", Tags::new(), Fields::new());
        point.set_field("count", counter.clone().into());
        let compiled = point.compiled().unwrap();

        counter.add(7);
        assert_eq!(line_of(&compiled), "reqs count=7i 1136214245000000000\n");
    }

    #[test]
    fn compiled_point_hides_its_parts() {
        let compiled = sample_point().compiled().unwrap();
        assert_eq!(Measurement::key(&compiled), "");
        assert!(compiled.tags().is_empty());
        assert!(compiled.fields().is_empty());
    }

    #[test]
    fn compiled_requires_fields() {
        let point = Point::new("bare", Tags::new(), Fields::new());
        assert!(point.compiled().is_none());
    }

    #[test]
    fn snapshot_freezes_timestamp() {
        set_fixed_timestamp(TEST_TIMESTAMP);

        let compiled = sample_point().compiled().unwrap();
        let snapshot = compiled.snapshot();
        assert_eq!(snapshot.timestamp(), Some(TEST_TIMESTAMP));
        assert_eq!(line_of(&snapshot), GOLDEN_LINE);
    }

    #[test]
    fn empty_tag_value_removes_tag() {
        set_fixed_timestamp(TEST_TIMESTAMP);

        let point = sample_point();
        point.set_tag("host", "");
        point.set_tag("pid", "");
        assert_eq!(
            line_of(&point),
            "service.some_event depth=123.456,msg=\"a \\\"string\\\" of sorts\",on=T,value=123i 1136214245000000000\n"
        );
    }

    #[test]
    fn empty_names_are_noops() {
        let point = sample_point();
        point.set_tag("", "value");
        point.set_field("", IntField::new(1).into());
        point.remove_tag("");
        point.remove_field("");
        assert_eq!(point.tags().len(), 2);
        assert_eq!(Measurement::fields(&point).len(), 4);
    }

    #[test]
    fn mutation_keeps_names_sorted() {
        let point = sample_point();
        point.set_field("aardvark", IntField::new(1).into());
        point.remove_field("msg");
        point.set_tag("zone", "us-east");

        let field_names: Vec<String> = Measurement::fields(&point).into_keys().collect();
        assert_eq!(field_names, ["aardvark", "depth", "on", "value"]);
        let tag_names: Vec<String> = point.tags().into_keys().collect();
        assert_eq!(tag_names, ["host", "pid", "zone"]);
    }

    #[test]
    #[should_panic(expected = "key is empty")]
    fn empty_key_panics() {
        let _ = Point::new("", Tags::new(), Fields::new());
    }

    #[test]
    fn escaped_key_and_tags() {
        set_fixed_timestamp(TEST_TIMESTAMP);

        let point = Point::new("disk usage", Tags::new(), Fields::new());
        point.set_tag("mount point", "/var,tmp");
        point.set_field("used pct", FloatField::new(42.5).into());

        assert_eq!(
            line_of(&point),
            "disk\\ usage,mount\\ point=/var\\,tmp used\\ pct=42.5 1136214245000000000\n"
        );
    }
}
