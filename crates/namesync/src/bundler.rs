//! Coalescing of small updates.
//!
//! A [`Bundler`] collects chunks and emits them merged: immediately once the
//! batch exceeds `threshold` bytes, otherwise after `delay` of quiet. Each
//! new chunk pushes the deadline out again, but never past `max_delay` from
//! the start of the batch.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Deadlines closer than this to the ceiling are left alone.
const CEILING_SLACK: Duration = Duration::from_millis(10);

/// Combines a batch of chunks into one payload.
pub type Merge = Arc<dyn Fn(Vec<Bytes>) -> Bytes + Send + Sync>;

/// Receives each merged payload.
pub type Emit = Arc<dyn Fn(Bytes) -> BoxFuture<'static, ()> + Send + Sync>;

/// Bundler tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundlerConfig {
    /// Flush as soon as the batch grows past this many bytes.
    pub threshold: usize,
    #[serde(with = "namesync_core::millis")]
    pub delay: Duration,
    #[serde(with = "namesync_core::millis")]
    pub max_delay: Duration,
}

impl Default for BundlerConfig {
    fn default() -> Self {
        Self {
            threshold: 3000,
            delay: Duration::from_millis(400),
            max_delay: Duration::from_millis(1600),
        }
    }
}

struct Batch {
    chunks: Vec<Bytes>,
    size: usize,
    started: Instant,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every rearm so a superseded timer does nothing.
    generation: u64,
}

struct Inner {
    merge: Merge,
    emit: Emit,
    config: BundlerConfig,
    batch: Mutex<Batch>,
}

/// Time- and size-bounded batching in front of an emit callback.
#[derive(Clone)]
pub struct Bundler {
    inner: Arc<Inner>,
}

impl Bundler {
    pub fn new(merge: Merge, emit: Emit, config: BundlerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                merge,
                emit,
                config,
                batch: Mutex::new(Batch {
                    chunks: Vec::new(),
                    size: 0,
                    started: Instant::now(),
                    timer: None,
                    generation: 0,
                }),
            }),
        }
    }

    pub fn config(&self) -> &BundlerConfig {
        &self.inner.config
    }

    /// Add a chunk to the current batch.
    pub async fn produce(&self, chunk: Bytes) {
        let ready = {
            let mut batch = self.inner.lock();
            batch.size += chunk.len();
            batch.chunks.push(chunk);

            if batch.size > self.inner.config.threshold {
                self.inner.take(&mut batch)
            } else if batch.timer.is_none() {
                batch.started = Instant::now();
                self.arm(&mut batch, self.inner.config.delay);
                None
            } else {
                let remaining = self
                    .inner
                    .config
                    .max_delay
                    .saturating_sub(batch.started.elapsed());
                if remaining > CEILING_SLACK {
                    self.arm(&mut batch, self.inner.config.delay.min(remaining));
                }
                None
            }
        };
        if let Some(payload) = ready {
            (self.inner.emit)(payload).await;
        }
    }

    /// Emit whatever is buffered now.
    pub async fn issue(&self) {
        let ready = {
            let mut batch = self.inner.lock();
            self.inner.take(&mut batch)
        };
        if let Some(payload) = ready {
            (self.inner.emit)(payload).await;
        }
    }

    /// Number of bytes waiting in the current batch.
    pub fn pending(&self) -> usize {
        self.inner.lock().size
    }

    fn arm(&self, batch: &mut Batch, after: Duration) {
        if let Some(timer) = batch.timer.take() {
            timer.abort();
        }
        batch.generation += 1;
        let generation = batch.generation;
        let inner = Arc::downgrade(&self.inner);
        batch.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            Inner::expire(inner, generation).await;
        }));
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Batch> {
        match self.batch.lock() {
            Ok(batch) => batch,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Cancel the timer and take the merged batch. `None` when empty.
    fn take(&self, batch: &mut Batch) -> Option<Bytes> {
        if let Some(timer) = batch.timer.take() {
            timer.abort();
        }
        batch.generation += 1;
        self.drain(batch)
    }

    fn drain(&self, batch: &mut Batch) -> Option<Bytes> {
        batch.started = Instant::now();
        batch.size = 0;
        let mut chunks = std::mem::take(&mut batch.chunks);
        match chunks.len() {
            0 => None,
            1 => chunks.pop(),
            _ => Some((self.merge)(chunks)),
        }
    }

    async fn expire(inner: Weak<Inner>, generation: u64) {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let ready = {
            let mut batch = inner.lock();
            if batch.generation != generation {
                return;
            }
            // Running inside this timer; release the handle without aborting.
            batch.timer = None;
            inner.drain(&mut batch)
        };
        if let Some(payload) = ready {
            (inner.emit)(payload).await;
        }
    }
}
