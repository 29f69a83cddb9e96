use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, LazyLock, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::error::{ForwardError, SendError};

pub(crate) mod http;
pub(crate) mod udp;
pub(crate) mod writer;

use self::http::HttpSender;
use self::udp::UdpSender;
use self::writer::WriterSender;

/// Delivers drained batches to a destination.
///
/// `send` must block until the payload has been fully delivered or has
/// failed, and should deliver the whole payload in one piece rather than
/// chunking it. On failure the returned [`SendError`] advises whether the
/// payload may succeed on a later attempt; the advice is ignored once the
/// caller's context has been cancelled.
///
/// `close` must be safe to call more than once.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Delivers `payload` to the destination.
    async fn send(&self, payload: Bytes) -> Result<(), SendError>;

    /// Releases the sender's resources.
    async fn close(&self) -> Result<(), ForwardError>;
}

impl std::fmt::Debug for dyn Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Sender")
    }
}

/// Configuration handed to sender factories.
#[derive(Clone, Default)]
pub struct SenderConfig {
    /// Hook invoked on each outgoing HTTP request before dispatch.
    pub director: Option<http::HttpDirector>,
}

/// Builds a sender for a destination URL.
pub type SenderFactory = Arc<
    dyn Fn(Url, SenderConfig) -> Pin<Box<dyn Future<Output = Result<Arc<dyn Sender>, ForwardError>> + Send>>
        + Send
        + Sync,
>;

static REGISTRY: LazyLock<RwLock<HashMap<String, SenderFactory>>> = LazyLock::new(|| {
    let mut senders: HashMap<String, SenderFactory> = HashMap::new();

    let http_factory: SenderFactory = Arc::new(|url, config| {
        Box::pin(async move { HttpSender::new(url, config.director).map(|s| Arc::new(s) as Arc<dyn Sender>) })
    });
    for scheme in ["http", "https"] {
        senders.insert(scheme.to_string(), Arc::clone(&http_factory));
    }

    let udp_factory: SenderFactory = Arc::new(|url, _config| {
        Box::pin(async move { UdpSender::connect(&url).await.map(|s| Arc::new(s) as Arc<dyn Sender>) })
    });
    for scheme in ["udp", "udp4", "udp6"] {
        senders.insert(scheme.to_string(), Arc::clone(&udp_factory));
    }

    let writer_factory: SenderFactory = Arc::new(|url, _config| {
        Box::pin(async move { WriterSender::open(&url).map(|s| Arc::new(s) as Arc<dyn Sender>) })
    });
    for scheme in ["file", "fd"] {
        senders.insert(scheme.to_string(), Arc::clone(&writer_factory));
    }

    RwLock::new(senders)
});

/// Registers a sender factory for a URL scheme.
///
/// # Panics
///
/// Panics if the scheme already has a factory, built-in or registered;
/// competing registrations for one scheme are a contract violation.
pub fn register_sender(scheme: &str, factory: SenderFactory) {
    let already_registered = REGISTRY.read().unwrap().contains_key(scheme);
    if already_registered {
        panic!("conflict on sender scheme {scheme:?}");
    }

    REGISTRY.write().unwrap().insert(scheme.to_string(), factory);
}

/// Builds a sender for `url` using the factory registered for its scheme.
pub(crate) async fn alloc_sender(url: &Url, config: &SenderConfig) -> Result<Arc<dyn Sender>, ForwardError> {
    let factory = REGISTRY.read().unwrap().get(url.scheme()).cloned();
    match factory {
        Some(factory) => factory(url.clone(), config.clone()).await,
        None => Err(ForwardError::NoSender {
            scheme: url.scheme().to_string(),
        }),
    }
}
