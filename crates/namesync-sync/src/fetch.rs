//! Segmented fetch.
//!
//! A [`SegmentFetcher`] retrieves a numbered range of items under one name
//! prefix: sequence numbers for published items, segment numbers for blobs.
//! Requests are pipelined up to the congestion window, timed out at the
//! current retransmission timeout (RTO) and retried until a per-name budget
//! is spent. Items are yielded in arrival order through a bounded channel,
//! so a slow consumer throttles the fetcher.
//!
//! ## RTO
//!
//! [`RttEstimator`] follows RFC 6298: smoothed RTT plus four deviations,
//! clamped to the policy's bounds and doubled on every loss.
//!
//! ## Congestion window
//!
//! [`TcpCubic`] by default, wrapped in [`LimitedCwnd`] so the window never
//! exceeds `max_cwnd`. Any [`CongestionControl`] can be substituted.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use futures::FutureExt;
use namesync_core::{Component, Name, NamedItem, Verifier};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{FetchError, TransportError};
use crate::transport::{Interest, Transport};

/// Timing and retry knobs for a fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchPolicy {
    #[serde(with = "namesync_core::millis")]
    pub init_rto: Duration,
    #[serde(with = "namesync_core::millis")]
    pub min_rto: Duration,
    #[serde(with = "namesync_core::millis")]
    pub max_rto: Duration,
    /// Request lifetime is the RTO plus this.
    #[serde(with = "namesync_core::millis")]
    pub lifetime_after_rto: Duration,
    /// Retransmissions allowed per name.
    pub retx_limit: u32,
    /// Ceiling on the congestion window.
    pub max_cwnd: f64,
    /// Items buffered ahead of the consumer.
    pub buffer: usize,
}

impl FetchPolicy {
    /// Policy for fetching published sequence items.
    pub fn sequence() -> Self {
        Self {
            init_rto: Duration::from_millis(50),
            min_rto: Duration::from_millis(50),
            max_rto: Duration::from_millis(2000),
            lifetime_after_rto: Duration::from_millis(1000),
            retx_limit: 600,
            max_cwnd: 10.0,
            buffer: 32,
        }
    }

    /// Policy for fetching blob segments on demand.
    pub fn blob() -> Self {
        Self {
            retx_limit: 150,
            lifetime_after_rto: Duration::from_millis(2000),
            ..Self::sequence()
        }
    }
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self::sequence()
    }
}

/// RFC 6298 retransmission timeout estimator.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
}

impl RttEstimator {
    pub fn new(policy: &FetchPolicy) -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: policy.init_rto,
            min_rto: policy.min_rto,
            max_rto: policy.max_rto,
        }
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Feed a sample from a request that was not retransmitted.
    pub fn add_measurement(&mut self, rtt: Duration) {
        let srtt = match self.srtt {
            None => {
                self.rttvar = rtt / 2;
                rtt
            }
            Some(srtt) => {
                let diff = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                self.rttvar = self.rttvar * 3 / 4 + diff / 4;
                srtt * 7 / 8 + rtt / 8
            }
        };
        self.srtt = Some(srtt);
        self.rto = (srtt + self.rttvar * 4).clamp(self.min_rto, self.max_rto);
    }

    /// Double the RTO, up to the ceiling.
    pub fn backoff(&mut self) {
        self.rto = (self.rto * 2).min(self.max_rto);
    }
}

/// Window-based congestion control.
pub trait CongestionControl: Send + Sync {
    /// Requests allowed in flight.
    fn window(&self) -> f64;
    fn on_ack(&mut self, now: Instant);
    fn on_loss(&mut self, now: Instant);
}

/// TCP CUBIC window growth.
#[derive(Debug, Clone)]
pub struct TcpCubic {
    cwnd: f64,
    ssthresh: f64,
    w_max: f64,
    epoch_start: Option<Instant>,
    c: f64,
    beta: f64,
}

impl Default for TcpCubic {
    fn default() -> Self {
        Self {
            cwnd: 2.0,
            ssthresh: f64::INFINITY,
            w_max: 0.0,
            epoch_start: None,
            c: 0.4,
            beta: 0.7,
        }
    }
}

impl CongestionControl for TcpCubic {
    fn window(&self) -> f64 {
        self.cwnd
    }

    fn on_ack(&mut self, now: Instant) {
        if self.cwnd < self.ssthresh {
            self.cwnd += 1.0;
            return;
        }
        let start = *self.epoch_start.get_or_insert(now);
        let t = now.duration_since(start).as_secs_f64();
        let k = (self.w_max * (1.0 - self.beta) / self.c).cbrt();
        let target = self.c * (t - k).powi(3) + self.w_max;
        if target > self.cwnd {
            self.cwnd += (target - self.cwnd) / self.cwnd;
        } else {
            self.cwnd += 0.01 / self.cwnd;
        }
    }

    fn on_loss(&mut self, now: Instant) {
        self.w_max = self.cwnd;
        self.cwnd = (self.cwnd * self.beta).max(1.0);
        self.ssthresh = self.cwnd;
        self.epoch_start = Some(now);
    }
}

/// Caps another controller's window.
pub struct LimitedCwnd {
    inner: Box<dyn CongestionControl>,
    max: f64,
}

impl LimitedCwnd {
    pub fn new(inner: Box<dyn CongestionControl>, max: f64) -> Self {
        Self { inner, max }
    }
}

impl CongestionControl for LimitedCwnd {
    fn window(&self) -> f64 {
        self.inner.window().min(self.max)
    }

    fn on_ack(&mut self, now: Instant) {
        self.inner.on_ack(now);
    }

    fn on_loss(&mut self, now: Instant) {
        self.inner.on_loss(now);
    }
}

/// A constant window.
#[derive(Debug, Clone, Copy)]
pub struct FixedCwnd(pub f64);

impl CongestionControl for FixedCwnd {
    fn window(&self) -> f64 {
        self.0
    }

    fn on_ack(&mut self, _now: Instant) {}

    fn on_loss(&mut self, _now: Instant) {}
}

/// How numbers map to names under the prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    /// `<prefix>/seq=N`
    Sequence,
    /// `<prefix>/seg=N`
    Segment,
}

impl Convention {
    fn name(&self, prefix: &Name, n: u64) -> Name {
        match self {
            Convention::Sequence => prefix.append(Component::sequence(n)),
            Convention::Segment => prefix.append(Component::segment(n)),
        }
    }

    fn index(&self, name: &Name) -> Option<u64> {
        match self {
            Convention::Sequence => name.sequence(),
            Convention::Segment => name.segment(),
        }
    }
}

/// Builder for a segmented fetch.
pub struct SegmentFetcher {
    transport: Arc<dyn Transport>,
    prefix: Name,
    verifier: Arc<dyn Verifier>,
    convention: Convention,
    start: u64,
    end: Option<u64>,
    policy: FetchPolicy,
    cancel: CancellationToken,
    congestion: Option<Box<dyn CongestionControl>>,
}

impl SegmentFetcher {
    /// Fetch segments `0..` of `prefix`, discovering the end from the first
    /// item's final block.
    pub fn new(transport: Arc<dyn Transport>, prefix: Name, verifier: Arc<dyn Verifier>) -> Self {
        Self {
            transport,
            prefix,
            verifier,
            convention: Convention::Segment,
            start: 0,
            end: None,
            policy: FetchPolicy::default(),
            cancel: CancellationToken::new(),
            congestion: None,
        }
    }

    pub fn convention(mut self, convention: Convention) -> Self {
        self.convention = convention;
        self
    }

    /// Fetch `start..=end`. With no end, the first item's final block decides.
    pub fn range(mut self, start: u64, end: Option<u64>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn policy(mut self, policy: FetchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Abort the fetch when `token` is cancelled.
    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Replace the default CUBIC controller. The policy cap still applies.
    pub fn congestion_control(mut self, cc: Box<dyn CongestionControl>) -> Self {
        self.congestion = Some(cc);
        self
    }

    /// Start fetching. Items arrive in completion order.
    pub fn start(self) -> FetchStream {
        let (tx, rx) = mpsc::channel(self.policy.buffer.max(1));
        let (pause_tx, pause_rx) = watch::channel(false);
        let token = self.cancel.child_token();
        let inner = self.congestion.unwrap_or_else(|| Box::new(TcpCubic::default()));

        let job = FetchJob {
            transport: self.transport,
            prefix: self.prefix,
            verifier: self.verifier,
            convention: self.convention,
            start: self.start,
            end: self.end,
            cc: LimitedCwnd::new(inner, self.policy.max_cwnd),
            rtt: RttEstimator::new(&self.policy),
            policy: self.policy,
            cancel: token.clone(),
        };
        tokio::spawn(job.run(tx, pause_rx));

        FetchStream {
            rx,
            pause: pause_tx,
            cancel: token.clone(),
            _guard: token.drop_guard(),
        }
    }

    /// Fetch everything and return the items ordered by number.
    pub async fn fetch_all(self) -> Result<Vec<NamedItem>, FetchError> {
        let convention = self.convention;
        let mut stream = self.start();
        let mut items = BTreeMap::new();
        while let Some(result) = stream.recv().await {
            let item = result?;
            if let Some(n) = convention.index(&item.name) {
                items.insert(n, item);
            }
        }
        Ok(items.into_values().collect())
    }
}

/// Receiving end of a running fetch. Dropping it cancels the fetch.
pub struct FetchStream {
    rx: mpsc::Receiver<Result<NamedItem, FetchError>>,
    pause: watch::Sender<bool>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl FetchStream {
    /// The next item, or `None` when the range is complete or the fetch
    /// stopped after yielding an error.
    pub async fn recv(&mut self) -> Option<Result<NamedItem, FetchError>> {
        self.rx.recv().await
    }

    /// Stop issuing new requests. Outstanding ones still complete.
    pub fn pause(&self) {
        self.pause.send_replace(true);
    }

    pub fn resume(&self) {
        self.pause.send_replace(false);
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for FetchStream {
    type Item = Result<NamedItem, FetchError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

type Attempt = (u64, Duration, Result<NamedItem, TransportError>);

struct FetchJob {
    transport: Arc<dyn Transport>,
    prefix: Name,
    verifier: Arc<dyn Verifier>,
    convention: Convention,
    start: u64,
    end: Option<u64>,
    policy: FetchPolicy,
    cc: LimitedCwnd,
    rtt: RttEstimator,
    cancel: CancellationToken,
}

impl FetchJob {
    async fn run(
        mut self,
        tx: mpsc::Sender<Result<NamedItem, FetchError>>,
        mut paused: watch::Receiver<bool>,
    ) {
        let mut next = self.start;
        let mut delivered = 0u64;
        let mut retx: VecDeque<u64> = VecDeque::new();
        let mut retries: HashMap<u64, u32> = HashMap::new();
        let mut inflight: FuturesUnordered<BoxFuture<'static, Attempt>> = FuturesUnordered::new();

        loop {
            let complete = match self.end {
                Some(end) => end < self.start || delivered > end - self.start,
                None => false,
            };
            if complete {
                return;
            }

            if !*paused.borrow() {
                let window = (self.cc.window().floor() as usize).max(1);
                while inflight.len() < window {
                    let n = if let Some(n) = retx.pop_front() {
                        n
                    } else if self.end.map_or(next == self.start && delivered == 0, |end| next <= end)
                        && (self.end.is_some() || inflight.is_empty())
                    {
                        next += 1;
                        next - 1
                    } else {
                        break;
                    };
                    inflight.push(self.request(n));
                }
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    let _ = tx.try_send(Err(FetchError::Cancelled));
                    return;
                }
                changed = paused.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                Some((n, elapsed, result)) = inflight.next(), if !inflight.is_empty() => {
                    let name = self.convention.name(&self.prefix, n);
                    match result {
                        Ok(item) => {
                            if let Err(reason) = self.check(&name, &item) {
                                tracing::warn!(%name, %reason, "fetched item rejected");
                                self.emit(&tx, Err(FetchError::Verification {
                                    name: name.to_string(),
                                    reason,
                                })).await;
                                return;
                            }
                            if !retries.contains_key(&n) {
                                self.rtt.add_measurement(elapsed);
                            }
                            self.cc.on_ack(Instant::now());
                            if self.end.is_none() {
                                self.end = Some(item.final_block.unwrap_or(n).max(n));
                            }
                            delivered += 1;
                            if !self.emit(&tx, Ok(item)).await {
                                return;
                            }
                        }
                        Err(e) if e.is_retryable() => {
                            self.cc.on_loss(Instant::now());
                            self.rtt.backoff();
                            let attempts = retries.entry(n).or_insert(0);
                            *attempts += 1;
                            if *attempts > self.policy.retx_limit {
                                tracing::debug!(%name, attempts = *attempts, "retry budget exhausted");
                                let attempts = *attempts;
                                self.emit(&tx, Err(FetchError::RetryBudgetExhausted {
                                    name: name.to_string(),
                                    attempts,
                                    last: e,
                                })).await;
                                return;
                            }
                            tracing::trace!(%name, rto = ?self.rtt.rto(), "retransmitting");
                            retx.push_back(n);
                        }
                        Err(e) => {
                            self.emit(&tx, Err(FetchError::Transport(e))).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    fn request(&self, n: u64) -> BoxFuture<'static, Attempt> {
        let transport = Arc::clone(&self.transport);
        let name = self.convention.name(&self.prefix, n);
        let rto = self.rtt.rto();
        let interest = Interest::new(name.clone()).with_lifetime(rto + self.policy.lifetime_after_rto);

        async move {
            let sent = Instant::now();
            let result = match tokio::time::timeout(rto, transport.express(interest)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(name.to_string())),
            };
            // Space out retries of requests that failed before the RTO.
            if result.as_ref().is_err_and(TransportError::is_retryable) {
                tokio::time::sleep_until(sent + rto).await;
            }
            (n, sent.elapsed(), result)
        }
        .boxed()
    }

    fn check(&self, name: &Name, item: &NamedItem) -> Result<(), String> {
        if &item.name != name {
            return Err(format!("answered with {}", item.name));
        }
        self.verifier.verify(item).map_err(|e| e.to_string())
    }

    /// Send to the consumer unless cancelled. Returns whether it was sent.
    async fn emit(
        &self,
        tx: &mpsc::Sender<Result<NamedItem, FetchError>>,
        value: Result<NamedItem, FetchError>,
    ) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = tx.send(value) => sent.is_ok(),
        }
    }
}
