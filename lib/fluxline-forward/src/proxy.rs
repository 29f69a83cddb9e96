use std::io;
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use fluxline_protocol::{Fields, Measurement, ProtocolError, RawMeasurement, Tags};
use snafu::ResultExt as _;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use url::Url;

use crate::chain::{default_slot_count, BufferChain, ChainWriter};
use crate::error::{self, ForwardError};
use crate::retry::{default_backoff, send_with_retries, BackoffFn, SendPolicy};
use crate::sender::{alloc_sender, http::HttpDirector, Sender, SenderConfig};

const DEFAULT_RETRY_LIMIT: u32 = 3;
const DEFAULT_CHAIN_CAPACITY: usize = 64_000;
const OPS_CHANNEL_CAPACITY: usize = 8;

/// A counted limit on concurrently outstanding sends.
///
/// Cloning the limiter shares the underlying count, so one limiter handed to
/// several proxies makes them compete for the same slots (say, one budget
/// across different databases or retention policies). A limit of zero
/// disables limiting.
#[derive(Clone, Default)]
pub struct RequestLimiter {
    semaphore: Option<Arc<Semaphore>>,
}

impl RequestLimiter {
    /// Creates a limiter allowing at most `limit` concurrent sends; zero
    /// means unlimited.
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: (limit > 0).then(|| Arc::new(Semaphore::new(limit))),
        }
    }

    fn semaphore(&self) -> Option<Arc<Semaphore>> {
        self.semaphore.clone()
    }
}

struct FlushOp {
    /// Minimum buffered length for the flush to proceed; `None` flushes
    /// unconditionally.
    threshold: Option<usize>,
    /// Acknowledged exactly once with the batch's final disposition.
    ack: Option<oneshot::Sender<Result<(), ForwardError>>>,
}

fn ack(op_ack: Option<oneshot::Sender<Result<(), ForwardError>>>, result: Result<(), ForwardError>) {
    if let Some(tx) = op_ack {
        // The flush caller may have stopped waiting; that is fine.
        let _ = tx.send(result);
    }
}

struct ProxyShared {
    chain: BufferChain,
    sender: Arc<dyn Sender>,
    policy: SendPolicy,
    flush_size: usize,
    ops_tx: mpsc::Sender<FlushOp>,
    // Single-flight for threshold-triggered flushes: competing over-threshold
    // writers collapse into one flush op.
    excess_flush: Mutex<()>,
    token: CancellationToken,
}

impl ProxyShared {
    fn flush_excess(&self) {
        if self.flush_size == 0 {
            return;
        }
        if self.chain.len() < self.flush_size {
            return;
        }

        let Ok(_guard) = self.excess_flush.try_lock() else {
            // Someone else is already arranging the flush.
            return;
        };

        // Re-check while holding the single-flight lock; a racing flush may
        // have drained the chain below the threshold already.
        let current = self.chain.len();
        if current < self.flush_size {
            return;
        }

        let op = FlushOp {
            threshold: Some(current),
            ack: None,
        };
        if self.ops_tx.try_send(op).is_err() {
            debug!("Skipped threshold flush: drainer is backed up.");
        }
    }
}

struct RuntimeState {
    started: AtomicBool,
    ops_rx: Mutex<Option<mpsc::Receiver<FlushOp>>>,
    drainer: Mutex<Option<JoinHandle<()>>>,
}

/// The delivery engine: accumulates bytes across a buffer chain and drains
/// them to a [`Sender`] from a background task.
///
/// Writers never wait on the network. A write appends to one of several
/// lock-segmented sub-buffers; the background drainer swaps the accumulated
/// bytes out as a single batch on a timer tick, when a threshold is crossed
/// ([`ProxyBuilder::with_flush_size`]), or on an explicit [`flush`][Proxy::flush],
/// and dispatches the batch under the configured retry policy.
///
/// Delivery is at-most-once: a batch that exhausts its attempts is logged
/// and dropped.
///
/// Cloning a `Proxy` produces another handle to the same engine.
#[derive(Clone)]
pub struct Proxy {
    shared: Arc<ProxyShared>,
    runtime: Arc<RuntimeState>,
}

impl Proxy {
    /// Creates a builder for configuring a proxy.
    pub fn builder() -> ProxyBuilder {
        ProxyBuilder::default()
    }

    /// Creates a proxy for `url` with default options, selecting the sender
    /// by the URL's scheme.
    pub async fn from_url(url: &str) -> Result<Self, ForwardError> {
        ProxyBuilder::default().build(url).await
    }

    fn ensure_open(&self) -> Result<(), ForwardError> {
        if self.shared.token.is_cancelled() {
            return Err(ForwardError::Closed);
        }
        Ok(())
    }

    /// Appends raw bytes to the proxy's buffers.
    ///
    /// Prefer [`write_measurement`][Proxy::write_measurement] to guarantee
    /// the buffered data is well-formed line protocol; this is the raw
    /// escape hatch.
    pub fn write(&self, data: &[u8]) -> Result<usize, ForwardError> {
        self.ensure_open()?;
        let written = self.shared.chain.write(data);
        self.shared.flush_excess();
        Ok(written)
    }

    /// Returns a scoped writer holding one sub-buffer.
    ///
    /// Writes through the handle stay in order and end up contiguous in the
    /// next batch. Dropping the handle releases the sub-buffer and evaluates
    /// the opportunistic-flush threshold.
    pub fn writer(&self) -> Result<ProxyWriter<'_>, ForwardError> {
        self.ensure_open()?;
        Ok(ProxyWriter {
            writer: Some(self.shared.chain.take()),
            shared: &self.shared,
        })
    }

    /// Runs `f` with a scoped writer, releasing it when `f` returns.
    pub fn transaction<F, R>(&self, f: F) -> Result<R, ForwardError>
    where
        F: FnOnce(&mut ProxyWriter<'_>) -> R,
    {
        let mut writer = self.writer()?;
        Ok(f(&mut writer))
    }

    /// Encodes a measurement into the proxy's buffers.
    pub fn write_measurement<M>(&self, measurement: &M) -> Result<usize, ForwardError>
    where
        M: Measurement + ?Sized,
    {
        let mut writer = self.writer()?;
        writer.write_measurement(measurement)
    }

    /// Encodes multiple measurements into the proxy's buffers as one
    /// contiguous group.
    pub fn write_measurements<I>(&self, measurements: I) -> Result<usize, ForwardError>
    where
        I: IntoIterator,
        I::Item: Measurement,
    {
        let mut writer = self.writer()?;
        writer.write_measurements(measurements)
    }

    /// Encodes a one-shot point into the proxy's buffers.
    ///
    /// A timestamp of `None` (or zero) resolves to the clock at encode time.
    /// An empty key or an empty field map is rejected.
    pub fn write_point(
        &self, key: &str, timestamp: Option<i64>, tags: Tags, fields: Fields,
    ) -> Result<usize, ForwardError> {
        self.ensure_open()?;

        if key.is_empty() {
            debug!("Dropping point with an empty key.");
            return Err(ForwardError::Encode {
                source: ProtocolError::EmptyKey,
            });
        }
        if fields.is_empty() {
            debug!(key, "Dropping point with no fields.");
            return Err(ForwardError::Encode {
                source: ProtocolError::NoFields,
            });
        }

        let measurement = RawMeasurement {
            key: key.to_string(),
            tags,
            fields,
            timestamp: timestamp.filter(|ts| *ts != 0),
        };
        self.write_measurement(&measurement)
    }

    /// Forces a flush and waits until the drained batch has been sent
    /// (successfully or finally). Equivalent to
    /// [`flush_with`][Proxy::flush_with] with a context that never cancels.
    pub async fn flush(&self) -> Result<(), ForwardError> {
        self.flush_with(&CancellationToken::new()).await
    }

    /// Forces a flush and waits until the drained batch has been sent, the
    /// proxy closes, or `ctx` is cancelled.
    ///
    /// `ctx` bounds only the wait: once the buffers have been swapped the
    /// batch is on its way regardless, and cancelling here does not roll it
    /// back. Requires [`start`][Proxy::start] to have been called for the
    /// flush to make progress.
    pub async fn flush_with(&self, ctx: &CancellationToken) -> Result<(), ForwardError> {
        self.ensure_open()?;

        let (ack_tx, ack_rx) = oneshot::channel();
        let op = FlushOp {
            threshold: None,
            ack: Some(ack_tx),
        };

        tokio::select! {
            sent = self.shared.ops_tx.send(op) => {
                if sent.is_err() {
                    return Err(ForwardError::Closed);
                }
            }
            _ = ctx.cancelled() => return Err(ForwardError::Canceled),
            _ = self.shared.token.cancelled() => return Err(ForwardError::Closed),
        }

        tokio::select! {
            result = ack_rx => result.unwrap_or(Err(ForwardError::Closed)),
            _ = ctx.cancelled() => Err(ForwardError::Canceled),
        }
    }

    /// Launches the background drainer, at most once.
    ///
    /// `interval` of zero disables periodic flushing; forced flushes and the
    /// shutdown flush still work. Subsequent calls are no-ops. Returns the
    /// proxy's cancellation token: cancelling it shuts the drainer down
    /// after one final flush.
    pub fn start(&self, period: Duration) -> CancellationToken {
        if !self.runtime.started.swap(true, SeqCst) {
            let ops_rx = self
                .runtime
                .ops_rx
                .lock()
                .unwrap()
                .take()
                .expect("ops receiver is present until first start");
            let shared = Arc::clone(&self.shared);
            let handle = tokio::spawn(run_drainer(shared, ops_rx, period));
            *self.runtime.drainer.lock().unwrap() = Some(handle);
        }

        self.shared.token.clone()
    }

    /// Shuts the proxy down: cancels the drainer, waits for its final flush,
    /// and closes the sender. The proxy is unusable afterwards.
    pub async fn close(&self) {
        self.shared.token.cancel();

        let handle = self.runtime.drainer.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.await.is_err() {
                error!("Drainer task did not shut down cleanly.");
            }
        }

        if let Err(e) = self.shared.sender.close().await {
            debug!(error = %e, "Error closing sender.");
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered_len(&self) -> usize {
        self.shared.chain.len()
    }
}

/// A scoped, exclusive write handle on one of a proxy's sub-buffers.
///
/// Released exactly once, on drop; releasing evaluates the
/// opportunistic-flush threshold.
pub struct ProxyWriter<'a> {
    writer: Option<ChainWriter<'a>>,
    shared: &'a ProxyShared,
}

impl ProxyWriter<'_> {
    /// Encodes a measurement into the held sub-buffer.
    pub fn write_measurement<M>(&mut self, measurement: &M) -> Result<usize, ForwardError>
    where
        M: Measurement + ?Sized,
    {
        self.writer
            .as_mut()
            .expect("writer held until drop")
            .encode_measurement(measurement)
            .context(error::Encode)
    }

    /// Encodes multiple measurements into the held sub-buffer.
    pub fn write_measurements<I>(&mut self, measurements: I) -> Result<usize, ForwardError>
    where
        I: IntoIterator,
        I::Item: Measurement,
    {
        self.writer
            .as_mut()
            .expect("writer held until drop")
            .encode_measurements(measurements)
            .context(error::Encode)
    }
}

impl io::Write for ProxyWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        io::Write::write(self.writer.as_mut().expect("writer held until drop"), data)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for ProxyWriter<'_> {
    fn drop(&mut self) {
        // Release the sub-buffer first so the flush sees settled state.
        self.writer.take();
        self.shared.flush_excess();
    }
}

async fn run_drainer(shared: Arc<ProxyShared>, mut ops_rx: mpsc::Receiver<FlushOp>, period: Duration) {
    debug!(period_ms = period.as_millis() as u64, "Delivery drainer started.");

    let mut ticker = (!period.is_zero()).then(|| {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    });
    let token = shared.token.clone();

    loop {
        let tick = async {
            match ticker.as_mut() {
                Some(ticker) => {
                    ticker.tick().await;
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tick => drain(&shared, FlushOp { threshold: None, ack: None }),
            op = ops_rx.recv() => match op {
                Some(op) => drain(&shared, op),
                None => break,
            },
        }
    }

    shutdown_flush(&shared).await;
    debug!("Delivery drainer stopped.");
}

fn drain(shared: &Arc<ProxyShared>, op: FlushOp) {
    if let Some(threshold) = op.threshold {
        // The trigger raced against another flush; if the chain has shrunk
        // below the threshold in the meantime, there is nothing left to do.
        if shared.chain.len() < threshold {
            ack(op.ack, Ok(()));
            return;
        }
    }

    let Some(batch) = shared.chain.flush() else {
        ack(op.ack, Ok(()));
        return;
    };

    let batch = Bytes::from(batch);
    let shared = Arc::clone(shared);
    let token = shared.token.clone();
    tokio::spawn(async move {
        let batch_len = batch.len();
        let result = send_with_retries(shared.sender.as_ref(), &shared.policy, batch, &token).await;
        if let Err(e) = &result {
            // The batch is gone; there is no durable queue to park it in.
            error!(error = %e, batch_len, "Failed to deliver batch.");
        }
        ack(op.ack, result);
    });
}

async fn shutdown_flush(shared: &Arc<ProxyShared>) {
    let Some(batch) = shared.chain.flush() else {
        return;
    };
    let batch = Bytes::from(batch);
    let batch_len = batch.len();
    debug!(batch_len, "Sending final batch before shutdown.");

    // The proxy token is already cancelled; the final send runs under a
    // detached context bounded by the configured timeout.
    let detached = CancellationToken::new();
    let send = send_with_retries(shared.sender.as_ref(), &shared.policy, batch, &detached);
    let result = match shared.policy.timeout {
        Some(limit) if !limit.is_zero() => match tokio::time::timeout(limit, send).await {
            Ok(result) => result,
            Err(_) => Err(ForwardError::Timeout),
        },
        _ => send.await,
    };

    if let Err(e) = result {
        error!(error = %e, batch_len, "Failed to deliver final batch.");
    }
}

/// Configures and builds a [`Proxy`].
pub struct ProxyBuilder {
    flush_size: usize,
    timeout: Option<Duration>,
    retry_limit: u32,
    backoff: BackoffFn,
    request_limiter: RequestLimiter,
    director: Option<HttpDirector>,
    chain_slots: Option<usize>,
    chain_capacity: usize,
}

impl Default for ProxyBuilder {
    fn default() -> Self {
        Self {
            flush_size: 0,
            timeout: None,
            retry_limit: DEFAULT_RETRY_LIMIT,
            backoff: Arc::new(default_backoff),
            request_limiter: RequestLimiter::default(),
            director: None,
            chain_slots: None,
            chain_capacity: DEFAULT_CHAIN_CAPACITY,
        }
    }
}

impl ProxyBuilder {
    /// Sets the buffered-byte threshold above which a write triggers an
    /// opportunistic flush. Zero (the default) disables threshold flushing.
    pub fn with_flush_size(mut self, flush_size: usize) -> Self {
        self.flush_size = flush_size;
        self
    }

    /// Sets a soft deadline applied to each send attempt, and to the final
    /// shutdown flush. Zero disables it.
    ///
    /// This does not replace transport-level timeouts; it caps how long the
    /// retry loop waits on any single attempt.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Sets how many times a failed send is retried after the first attempt.
    ///
    /// Keep this low enough that an outage does not build up a deep backlog
    /// of in-flight batches, or bound the backlog with
    /// [`with_request_limiter`][ProxyBuilder::with_request_limiter].
    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Sets the function computing the delay before each retry. A returned
    /// zero duration retries immediately.
    pub fn with_backoff<F>(mut self, backoff: F) -> Self
    where
        F: Fn(u32, u32) -> Duration + Send + Sync + 'static,
    {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Bounds the number of concurrently outstanding sends. A limiter can be
    /// shared across proxies to make them compete for the same slots.
    pub fn with_request_limiter(mut self, limiter: RequestLimiter) -> Self {
        self.request_limiter = limiter;
        self
    }

    /// Sets a hook that adjusts each outgoing HTTP request before dispatch.
    /// Only meaningful for `http`/`https` destinations.
    pub fn with_director(mut self, director: HttpDirector) -> Self {
        self.director = Some(director);
        self
    }

    /// Overrides the number of sub-buffers in the buffer chain. Defaults to
    /// `max(6, ceil(1.7 × CPUs))`.
    pub fn with_chain_slots(mut self, slots: usize) -> Self {
        self.chain_slots = Some(slots);
        self
    }

    /// Overrides the preallocated capacity of each sub-buffer.
    pub fn with_chain_capacity(mut self, capacity: usize) -> Self {
        self.chain_capacity = capacity;
        self
    }

    /// Builds the proxy, selecting a sender by the destination URL's scheme.
    pub async fn build(self, url: &str) -> Result<Proxy, ForwardError> {
        let url = Url::parse(url).context(error::InvalidUrl)?;
        let sender = alloc_sender(
            &url,
            &SenderConfig {
                director: self.director.clone(),
            },
        )
        .await?;
        Ok(self.build_with_sender(sender))
    }

    /// Builds the proxy around an explicit sender.
    pub fn build_with_sender(self, sender: Arc<dyn Sender>) -> Proxy {
        let (ops_tx, ops_rx) = mpsc::channel(OPS_CHANNEL_CAPACITY);
        let slots = self.chain_slots.unwrap_or_else(default_slot_count);

        let shared = Arc::new(ProxyShared {
            chain: BufferChain::new(slots, self.chain_capacity),
            sender,
            policy: SendPolicy {
                retry_limit: self.retry_limit,
                timeout: self.timeout,
                backoff: self.backoff,
                request_limit: self.request_limiter.semaphore(),
            },
            flush_size: self.flush_size,
            ops_tx,
            excess_flush: Mutex::new(()),
            token: CancellationToken::new(),
        });

        Proxy {
            shared,
            runtime: Arc::new(RuntimeState {
                started: AtomicBool::new(false),
                ops_rx: Mutex::new(Some(ops_rx)),
                drainer: Mutex::new(None),
            }),
        }
    }
}
