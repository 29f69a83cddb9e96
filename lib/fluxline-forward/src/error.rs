use std::fmt;

use fluxline_protocol::ProtocolError;
use snafu::Snafu;

/// A failed-request error from an HTTP destination: the response code, the
/// (possibly empty) response body, and any error hit while reading it.
#[derive(Debug)]
pub struct BadStatusError {
    /// HTTP status code of the response.
    pub code: u16,
    /// Response body, as much of it as could be read.
    pub body: Vec<u8>,
    /// Error encountered while reading the body, if any.
    pub read_error: Option<reqwest::Error>,
}

impl fmt::Display for BadStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Long bodies are truncated for display; the full body is retained
        // on the error itself.
        const DISPLAY_LIMIT: usize = 300;

        write!(f, "bad status returned: code={}", self.code)?;

        if !self.body.is_empty() {
            let (shown, suffix) = if self.body.len() > DISPLAY_LIMIT {
                (&self.body[..DISPLAY_LIMIT], " (truncated)")
            } else {
                (&self.body[..], "")
            };
            write!(
                f,
                " len={} body={:?}{}",
                self.body.len(),
                String::from_utf8_lossy(shown),
                suffix
            )?;
        }

        if let Some(err) = &self.read_error {
            write!(f, " err={:?}", err.to_string())?;
        }

        Ok(())
    }
}

impl std::error::Error for BadStatusError {}

/// A delivery error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum ForwardError {
    /// No sender is registered for the destination URL's scheme.
    #[snafu(display("no sender registered for scheme '{scheme}'"))]
    NoSender {
        /// The unrecognized scheme.
        scheme: String,
    },

    /// The destination URL could not be parsed.
    #[snafu(display("invalid destination url"))]
    InvalidUrl {
        /// Error source.
        source: url::ParseError,
    },

    /// The destination URL is missing a component the sender requires.
    #[snafu(display("destination url is unusable: {reason}"))]
    UnusableUrl {
        /// What is wrong with the URL.
        reason: String,
    },

    /// The destination answered with a non-success status.
    #[snafu(display("request rejected"))]
    Status {
        /// Error source.
        source: BadStatusError,
    },

    /// The proxy (or sender) has been closed.
    #[snafu(display("closed"))]
    Closed,

    /// The operation was canceled before it completed.
    #[snafu(display("canceled"))]
    Canceled,

    /// A send attempt exceeded the configured soft timeout.
    #[snafu(display("send timed out"))]
    Timeout,

    /// A measurement failed to encode.
    #[snafu(display("failed to encode measurements"))]
    Encode {
        /// Error source.
        source: ProtocolError,
    },

    /// The transport failed to deliver the payload.
    #[snafu(display("transport error"))]
    Transport {
        /// Error source.
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// An error from a [`Sender`][crate::Sender], carrying the sender's advice
/// on whether the payload may succeed on a later attempt.
#[derive(Debug)]
pub struct SendError {
    retry: bool,
    source: ForwardError,
}

impl SendError {
    /// Wraps `source` as an error worth retrying.
    pub fn retryable(source: ForwardError) -> Self {
        Self { retry: true, source }
    }

    /// Wraps `source` as a terminal error.
    pub fn terminal(source: ForwardError) -> Self {
        Self { retry: false, source }
    }

    /// Whether the sender advises that a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        self.retry
    }

    /// Consumes the error, returning the underlying delivery error.
    pub fn into_inner(self) -> ForwardError {
        self.source
    }

    /// The underlying delivery error.
    pub fn inner(&self) -> &ForwardError {
        &self.source
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.source.fmt(f)
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}
