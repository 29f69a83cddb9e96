use std::fmt;
use std::io::Write as _;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::error::ProtocolError;
use crate::escape::quote_text_value;

/// A user-defined field value.
///
/// Implementations produce their own wire form and decide how to capture an
/// immutable copy of themselves. Unlike the built-in variants, a dynamic
/// field may fail to encode, in which case the in-progress measurement is
/// rewound rather than half-written.
pub trait DynamicField: Send + Sync {
    /// Writes the field's current wire form to `out`.
    fn encode_value(&self, out: &mut Vec<u8>) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Returns an immutable field carrying the value sampled at this instant.
    fn snapshot(&self) -> Field;
}

/// A boolean field, mutable from any number of threads.
///
/// Encoded as `T` or `F`. Clones share the same underlying value.
#[derive(Clone, Debug, Default)]
pub struct BoolField(Arc<AtomicBool>);

impl BoolField {
    /// Creates a new `BoolField` holding `value`.
    pub fn new(value: bool) -> Self {
        Self(Arc::new(AtomicBool::new(value)))
    }

    /// Replaces the held value.
    pub fn set(&self, value: bool) {
        self.0.store(value, Relaxed);
    }

    /// Samples the current value.
    pub fn get(&self) -> bool {
        self.0.load(Relaxed)
    }
}

/// A signed 64-bit integer field, mutable from any number of threads.
///
/// Encoded as a decimal integer with the `i` suffix (e.g. `123i`). Clones
/// share the same underlying value.
#[derive(Clone, Debug, Default)]
pub struct IntField(Arc<AtomicI64>);

impl IntField {
    /// Creates a new `IntField` holding `value`.
    pub fn new(value: i64) -> Self {
        Self(Arc::new(AtomicI64::new(value)))
    }

    /// Replaces the held value.
    pub fn set(&self, value: i64) {
        self.0.store(value, Relaxed);
    }

    /// Atomically adds `delta` to the held value.
    pub fn add(&self, delta: i64) {
        self.0.fetch_add(delta, Relaxed);
    }

    /// Samples the current value.
    pub fn get(&self) -> i64 {
        self.0.load(Relaxed)
    }
}

/// A 64-bit float field, mutable from any number of threads.
///
/// Encoded as the shortest decimal form that round-trips the value. Stored
/// as the raw bit pattern so that updates are a single atomic operation;
/// `add` runs a compare-exchange loop over the bits. Clones share the same
/// underlying value.
#[derive(Clone, Debug, Default)]
pub struct FloatField(Arc<AtomicU64>);

impl FloatField {
    /// Creates a new `FloatField` holding `value`.
    pub fn new(value: f64) -> Self {
        Self(Arc::new(AtomicU64::new(value.to_bits())))
    }

    /// Replaces the held value.
    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Relaxed);
    }

    /// Atomically adds `delta` to the held value.
    pub fn add(&self, delta: f64) {
        let mut current = self.0.load(Relaxed);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match self.0.compare_exchange_weak(current, next, Relaxed, Relaxed) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Samples the current value.
    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Relaxed))
    }
}

/// A string field, mutable from any number of threads.
///
/// The wire form (quoted, `"` escaped, truncated to
/// [`MAX_TEXT_FIELD_LEN`][crate::MAX_TEXT_FIELD_LEN] bytes) is built once on
/// `set` and swapped in as a single atomic reference, so serialization never
/// observes a torn value. Sets are treated as the common case and write-outs
/// as the uncommon one.
#[derive(Clone, Debug)]
pub struct TextField(Arc<ArcSwap<Vec<u8>>>);

impl TextField {
    /// Creates a new `TextField` holding `value`.
    pub fn new(value: &str) -> Self {
        Self(Arc::new(ArcSwap::from_pointee(quote_text_value(value))))
    }

    /// Replaces the held value.
    pub fn set(&self, value: &str) {
        self.0.store(Arc::new(quote_text_value(value)));
    }

    pub(crate) fn encoded(&self) -> Arc<Vec<u8>> {
        self.0.load_full()
    }
}

impl Default for TextField {
    fn default() -> Self {
        Self::new("")
    }
}

/// A field value carried by a measurement.
///
/// The mutable variants wrap shared, atomically updated storage and are what
/// application code holds onto between flushes. The `Fixed*` variants are
/// immutable samples used for snapshotting. `Dynamic` admits user-defined
/// field implementations.
#[derive(Clone)]
pub enum Field {
    /// A shared mutable boolean.
    Bool(BoolField),
    /// A shared mutable integer.
    Int(IntField),
    /// A shared mutable float.
    Float(FloatField),
    /// A shared mutable string.
    Text(TextField),
    /// An immutable boolean sample.
    FixedBool(bool),
    /// An immutable integer sample.
    FixedInt(i64),
    /// An immutable float sample.
    FixedFloat(f64),
    /// An immutable string sample, stored pre-escaped and quoted.
    FixedText(Arc<Vec<u8>>),
    /// A user-defined field.
    Dynamic(Arc<dyn DynamicField>),
}

impl Field {
    /// Creates an immutable string field from `value`, escaping and quoting
    /// it up front.
    pub fn fixed_text(value: &str) -> Self {
        Self::FixedText(Arc::new(quote_text_value(value)))
    }

    /// Writes the field's current wire form to `out`.
    pub fn encode_value(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        match self {
            Self::Bool(b) => out.push(if b.get() { b'T' } else { b'F' }),
            Self::Int(i) => write!(out, "{}i", i.get()).expect("write to Vec cannot fail"),
            Self::Float(f) => write!(out, "{}", f.get()).expect("write to Vec cannot fail"),
            Self::Text(t) => out.extend_from_slice(&t.encoded()),
            Self::FixedBool(b) => out.push(if *b { b'T' } else { b'F' }),
            Self::FixedInt(i) => write!(out, "{}i", i).expect("write to Vec cannot fail"),
            Self::FixedFloat(f) => write!(out, "{}", f).expect("write to Vec cannot fail"),
            Self::FixedText(bytes) => out.extend_from_slice(bytes),
            Self::Dynamic(field) => {
                field.encode_value(out).map_err(|source| ProtocolError::FieldEncode { source })?
            }
        }
        Ok(())
    }

    /// Returns an immutable field carrying the value sampled at this instant.
    pub fn snapshot(&self) -> Field {
        match self {
            Self::Bool(b) => Self::FixedBool(b.get()),
            Self::Int(i) => Self::FixedInt(i.get()),
            Self::Float(f) => Self::FixedFloat(f.get()),
            Self::Text(t) => Self::FixedText(t.encoded()),
            Self::Dynamic(field) => field.snapshot(),
            fixed => fixed.clone(),
        }
    }

    /// Returns an independent copy of the field.
    ///
    /// Mutable variants get fresh storage seeded with the current sample, so
    /// the copy and the original diverge under further mutation. Immutable
    /// variants are shared as-is.
    pub fn dup(&self) -> Field {
        match self {
            Self::Bool(b) => Self::Bool(BoolField::new(b.get())),
            Self::Int(i) => Self::Int(IntField::new(i.get())),
            Self::Float(f) => Self::Float(FloatField::new(f.get())),
            Self::Text(t) => Self::Text(TextField(Arc::new(ArcSwap::new(t.encoded())))),
            Self::Dynamic(field) => field.snapshot(),
            fixed => fixed.clone(),
        }
    }

    /// Adds `delta` to an `Int` or `Float` field, converting as needed.
    ///
    /// Returns whether the field accepted the increment.
    pub fn add_i64(&self, delta: i64) -> bool {
        match self {
            Self::Int(i) => i.add(delta),
            Self::Float(f) => f.add(delta as f64),
            _ => return false,
        }
        true
    }

    /// Adds `delta` to a `Float` or `Int` field, converting as needed.
    ///
    /// Returns whether the field accepted the increment.
    pub fn add_f64(&self, delta: f64) -> bool {
        match self {
            Self::Int(i) => i.add(delta as i64),
            Self::Float(f) => f.add(delta),
            _ => return false,
        }
        true
    }

    /// Returns the inner [`BoolField`] handle, if this is a `Bool` field.
    pub fn as_bool(&self) -> Option<&BoolField> {
        match self {
            Self::Bool(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the inner [`IntField`] handle, if this is an `Int` field.
    pub fn as_int(&self) -> Option<&IntField> {
        match self {
            Self::Int(i) => Some(i),
            _ => None,
        }
    }

    /// Returns the inner [`FloatField`] handle, if this is a `Float` field.
    pub fn as_float(&self) -> Option<&FloatField> {
        match self {
            Self::Float(f) => Some(f),
            _ => None,
        }
    }

    /// Returns the inner [`TextField`] handle, if this is a `Text` field.
    pub fn as_text(&self) -> Option<&TextField> {
        match self {
            Self::Text(t) => Some(t),
            _ => None,
        }
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => f.debug_tuple("Bool").field(&b.get()).finish(),
            Self::Int(i) => f.debug_tuple("Int").field(&i.get()).finish(),
            Self::Float(v) => f.debug_tuple("Float").field(&v.get()).finish(),
            Self::Text(t) => f.debug_tuple("Text").field(&String::from_utf8_lossy(&t.encoded())).finish(),
            Self::FixedBool(b) => f.debug_tuple("FixedBool").field(b).finish(),
            Self::FixedInt(i) => f.debug_tuple("FixedInt").field(i).finish(),
            Self::FixedFloat(v) => f.debug_tuple("FixedFloat").field(v).finish(),
            Self::FixedText(bytes) => f.debug_tuple("FixedText").field(&String::from_utf8_lossy(bytes)).finish(),
            Self::Dynamic(_) => f.debug_tuple("Dynamic").finish(),
        }
    }
}

impl From<BoolField> for Field {
    fn from(field: BoolField) -> Self {
        Self::Bool(field)
    }
}

impl From<IntField> for Field {
    fn from(field: IntField) -> Self {
        Self::Int(field)
    }
}

impl From<FloatField> for Field {
    fn from(field: FloatField) -> Self {
        Self::Float(field)
    }
}

impl From<TextField> for Field {
    fn from(field: TextField) -> Self {
        Self::Text(field)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn encoded(field: &Field) -> Vec<u8> {
        let mut out = Vec::new();
        field.encode_value(&mut out).expect("built-in fields cannot fail");
        out
    }

    #[test]
    fn bool_wire_form() {
        let b = BoolField::new(true);
        assert_eq!(encoded(&Field::Bool(b.clone())), b"T");
        b.set(false);
        assert_eq!(encoded(&Field::Bool(b)), b"F");
    }

    #[test]
    fn int_wire_form() {
        let i = IntField::new(123);
        assert_eq!(encoded(&Field::Int(i.clone())), b"123i");
        i.add(-246);
        assert_eq!(encoded(&Field::Int(i)), b"-123i");
    }

    #[test]
    fn float_wire_form_is_shortest_roundtrip() {
        assert_eq!(encoded(&Field::FixedFloat(123.456)), b"123.456");
        assert_eq!(encoded(&Field::FixedFloat(123.0)), b"123");
        assert_eq!(encoded(&Field::FixedFloat(0.1)), b"0.1");
    }

    #[test]
    fn text_wire_form_pre_escaped() {
        let t = TextField::new(r#"a "string" of sorts"#);
        assert_eq!(encoded(&Field::Text(t)), br#""a \"string\" of sorts""#);
    }

    #[test]
    fn dup_detaches_mutable_fields() {
        let original = IntField::new(1);
        let field = Field::Int(original.clone());
        let copy = field.dup();
        original.add(10);
        assert_eq!(encoded(&copy), b"1i");
        assert_eq!(encoded(&field), b"11i");
    }

    #[test]
    fn snapshot_is_fixed() {
        let f = FloatField::new(1.5);
        let snap = Field::Float(f.clone()).snapshot();
        f.set(9.0);
        assert_eq!(encoded(&snap), b"1.5");
    }

    #[test]
    fn add_dispatch_converts() {
        let int_field = Field::Int(IntField::new(0));
        let float_field = Field::Float(FloatField::new(0.0));
        assert!(int_field.add_f64(2.9));
        assert!(float_field.add_i64(2));
        assert!(!Field::FixedInt(1).add_i64(1));
        assert_eq!(encoded(&int_field), b"2i");
        assert_eq!(encoded(&float_field), b"2");
    }

    #[test]
    fn concurrent_adds_are_lossless() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 1000;

        let int_field = IntField::new(0);
        let float_field = FloatField::new(0.0);

        thread::scope(|s| {
            for _ in 0..THREADS {
                let i = int_field.clone();
                let f = float_field.clone();
                s.spawn(move || {
                    for _ in 0..PER_THREAD {
                        i.add(1);
                        f.add(1.0);
                    }
                });
            }
        });

        assert_eq!(int_field.get(), (THREADS * PER_THREAD) as i64);
        assert_eq!(float_field.get(), (THREADS * PER_THREAD) as f64);
    }
}
