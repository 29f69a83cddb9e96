use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;
use url::Url;

use super::Sender;
use crate::error::{BadStatusError, ForwardError, SendError};

/// Adjusts an outgoing HTTP request before it is dispatched, e.g. to attach
/// authentication headers. Returning an error discards the attempt without
/// retry.
pub type HttpDirector = Arc<dyn Fn(&mut reqwest::Request) -> Result<(), ForwardError> + Send + Sync>;

/// Sends batches as `POST` requests to an HTTP(S) endpoint.
pub(crate) struct HttpSender {
    url: Url,
    client: reqwest::Client,
    director: Option<HttpDirector>,
}

impl HttpSender {
    pub fn new(url: Url, director: Option<HttpDirector>) -> Result<Self, ForwardError> {
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ForwardError::NoSender {
                    scheme: other.to_string(),
                })
            }
        }

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ForwardError::Transport { source: Box::new(e) })?;

        Ok(Self { url, client, director })
    }
}

fn transport(e: reqwest::Error) -> ForwardError {
    ForwardError::Transport { source: Box::new(e) }
}

#[async_trait]
impl Sender for HttpSender {
    async fn send(&self, payload: Bytes) -> Result<(), SendError> {
        let mut request = self
            .client
            .post(self.url.clone())
            .body(payload)
            .build()
            .map_err(|e| SendError::terminal(transport(e)))?;

        if let Some(director) = &self.director {
            director(&mut request).map_err(SendError::terminal)?;
        }

        let response = match self.client.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                // Connection-level problems may clear up; anything else is
                // on us and will not.
                let retryable = e.is_timeout() || e.is_connect();
                let err = transport(e);
                return Err(if retryable {
                    SendError::retryable(err)
                } else {
                    SendError::terminal(err)
                });
            }
        };

        let status = response.status();
        if status.is_success() {
            // Drain the body so the connection can be reused.
            if let Err(e) = response.bytes().await {
                debug!(host = %self.url.host_str().unwrap_or(""), error = %e, "Error discarding response body.");
            }
            return Ok(());
        }

        let (body, read_error) = match response.bytes().await {
            Ok(body) => (body.to_vec(), None),
            Err(e) => (Vec::new(), Some(e)),
        };

        Err(SendError::terminal(ForwardError::Status {
            source: BadStatusError {
                code: status.as_u16(),
                body,
                read_error,
            },
        }))
    }

    async fn close(&self) -> Result<(), ForwardError> {
        Ok(())
    }
}
