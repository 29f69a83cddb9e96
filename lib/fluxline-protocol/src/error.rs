use std::io;

use snafu::Snafu;

/// A measurement encoding error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum ProtocolError {
    /// Measurement had no fields.
    ///
    /// A measurement with zero fields cannot be represented in the line
    /// protocol, so nothing is written for it.
    #[snafu(display("measurement has no fields"))]
    NoFields,

    /// Measurement key was empty.
    #[snafu(display("measurement key is empty"))]
    EmptyKey,

    /// A field failed to produce its wire form.
    ///
    /// Only dynamic (user-defined) fields can fail here; the built-in field
    /// variants are infallible. The output is rewound to the start of the
    /// measurement when this is returned.
    #[snafu(display("field failed to encode"))]
    FieldEncode {
        /// Error reported by the field.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The downstream writer failed.
    #[snafu(display("failed to write encoded measurements"))]
    Io {
        /// Error source.
        source: io::Error,
    },
}
