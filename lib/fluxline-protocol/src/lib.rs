//! Measurement model and line-protocol encoder.
//!
//! This crate holds the in-process half of fluxline: concurrently mutable
//! field primitives, the measurement/point model, and the text encoder that
//! turns measurements into line-protocol output. Measurements are written in
//! the InfluxDB line protocol format:
//!
//! ```text
//! <key>[,<tag>=<value>]* <field>=<value>[,<field>=<value>]* <unix-nanos>\n
//! ```
//!
//! Field primitives ([`BoolField`], [`IntField`], [`FloatField`],
//! [`TextField`]) are safe to mutate from any number of threads while a
//! background task serializes them, so application hot paths never block on
//! delivery.
#![deny(warnings)]
#![deny(missing_docs)]

mod encode;
mod escape;
mod field;
mod measurement;
mod point;
mod point_set;
mod snapshot;

pub mod time;

mod error;

pub use self::encode::{write_measurement, write_measurements, write_measurements_to};
pub use self::error::ProtocolError;
pub use self::escape::{escape_component, escape_component_into, unescape_component, MAX_TEXT_FIELD_LEN};
pub use self::field::{BoolField, DynamicField, Field, FloatField, IntField, TextField};
pub use self::measurement::{Fields, Measurement, RawMeasurement, Tags};
pub use self::point::{CompiledPoint, CompiledSnapshot, Point};
pub use self::point_set::{PointAllocator, PointSet, PointSpec, StaticPointAllocator};
pub use self::snapshot::snapshot;
