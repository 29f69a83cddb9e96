use std::any::Any;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::ProtocolError;
use crate::field::TextField;
use crate::measurement::{dup_fields, Fields, Measurement, Tags};
use crate::point::{CompiledPoint, Point};

/// The shape of a newly allocated point: its key, tags, and fields.
#[derive(Debug, Default)]
pub struct PointSpec {
    /// The measurement key shared by points of the set.
    pub key: String,
    /// Tags for the new point.
    pub tags: Tags,
    /// Fields for the new point. Must be non-empty for the point to be
    /// usable.
    pub fields: Fields,
}

/// Prepares a point for an identifier that has not been seen before.
///
/// Returning `None`, an empty key, or an empty field set declines the
/// identifier: no point is created and the caller receives nothing. Declined
/// identifiers are not cached, so the allocator will be asked again the next
/// time the identifier shows up.
///
/// The opaque value is passed through from the lookup unchanged; it can
/// carry request-scoped context (say, the request itself) into the
/// allocation decision.
pub trait PointAllocator: Send + Sync {
    /// Produces the key, tags, and fields for `identifier`, or declines it.
    fn allocate(&self, identifier: &str, opaque: Option<&dyn Any>) -> Option<PointSpec>;
}

impl<F> PointAllocator for F
where
    F: Fn(&str, Option<&dyn Any>) -> Option<PointSpec> + Send + Sync,
{
    fn allocate(&self, identifier: &str, opaque: Option<&dyn Any>) -> Option<PointSpec> {
        self(identifier, opaque)
    }
}

/// A [`PointAllocator`] that stamps out points from one fixed template.
///
/// Tags are copied shallowly with one slot optionally overwritten by the
/// identifier; fields are deep-duplicated so that counters are not shared
/// across the points of a set.
#[derive(Default)]
pub struct StaticPointAllocator {
    /// Key assigned to every allocated point.
    pub key: String,
    /// Tag template.
    pub tags: Tags,
    /// Field template. Every allocation duplicates these values.
    pub fields: Fields,
    /// When set, the tag with this name carries the identifier.
    pub identifier_tag: Option<String>,
    /// When set, a string field with this name carries the identifier.
    pub identifier_field: Option<String>,
}

impl PointAllocator for StaticPointAllocator {
    fn allocate(&self, identifier: &str, _opaque: Option<&dyn Any>) -> Option<PointSpec> {
        let mut tags = self.tags.clone();
        if let Some(name) = &self.identifier_tag {
            tags.insert(name.clone(), identifier.to_string());
        }

        let mut fields = dup_fields(&self.fields, true);
        if let Some(name) = &self.identifier_field {
            fields.insert(name.clone(), TextField::new(identifier).into());
        }

        Some(PointSpec {
            key: self.key.clone(),
            tags,
            fields,
        })
    }
}

struct SetEntry {
    compiled: CompiledPoint,
    fields: Fields,
}

/// A collection of compiled points allocated on demand, keyed by an
/// application-supplied identifier.
///
/// Intended for a single point shape varying across one dimension, such as a
/// request path. The common lookup path takes only a read lock; first use of
/// an identifier takes the write lock, re-checks, and runs the allocator.
///
/// Note that because declined identifiers are never cached, an allocator
/// that declines a frequently used identifier forces the write lock on every
/// lookup of that identifier. That is by contract, but worth considering
/// when writing allocators.
pub struct PointSet {
    allocator: Box<dyn PointAllocator>,
    entries: RwLock<HashMap<String, SetEntry>>,
}

impl PointSet {
    /// Creates a new `PointSet` using `allocator` for unknown identifiers.
    pub fn new(allocator: impl PointAllocator + 'static) -> Self {
        Self {
            allocator: Box::new(allocator),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the field map for the identified point, allocating the point
    /// on first use.
    ///
    /// Returns `None` when the allocator declines the identifier. The
    /// returned map is detached, but the field values it holds are shared
    /// with the stored point, so mutating them updates what the set writes.
    pub fn fields_for(&self, identifier: &str, opaque: Option<&dyn Any>) -> Option<Fields> {
        {
            let entries = self.entries.read().unwrap();
            if let Some(entry) = entries.get(identifier) {
                return Some(dup_fields(&entry.fields, false));
            }
        }

        self.alloc(identifier, opaque)
    }

    fn alloc(&self, identifier: &str, opaque: Option<&dyn Any>) -> Option<Fields> {
        let mut entries = self.entries.write().unwrap();

        // Another lookup may have allocated while we waited for the lock.
        if let Some(entry) = entries.get(identifier) {
            return Some(dup_fields(&entry.fields, false));
        }

        let spec = self.allocator.allocate(identifier, opaque)?;
        if spec.key.is_empty() || spec.fields.is_empty() {
            return None;
        }

        let point = Point::new(spec.key, spec.tags, spec.fields);
        let compiled = point.compiled()?;
        let fields = point.fields();

        entries.insert(
            identifier.to_string(),
            SetEntry {
                compiled,
                fields: dup_fields(&fields, false),
            },
        );

        Some(fields)
    }

    /// Removes the point for `identifier`, if present.
    pub fn remove(&self, identifier: &str) {
        let mut entries = self.entries.write().unwrap();
        entries.remove(identifier);
    }

    /// Erases all points held by the set.
    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap();
        entries.clear();
    }

    /// Returns the number of points currently held.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Returns whether the set holds no points.
    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}

impl Measurement for PointSet {
    // A point set is a collection and only serializes through its own write
    // path; the part accessors return empty sentinels.
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
        let head = out.len();
        let entries = self.entries.read().unwrap();

        for entry in entries.values() {
            match entry.compiled.write_line(out) {
                Ok(_) | Err(ProtocolError::NoFields) => {}
                Err(e) => {
                    out.truncate(head);
                    return Err(e);
                }
            }
        }

        Ok(out.len() - head)
    }
}
