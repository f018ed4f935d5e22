//! Single-item fetch with verification, retries and cancellation.

use std::sync::Arc;
use std::time::Duration;

use namesync_core::{Name, NamedItem, Verifier};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;
use crate::transport::{Interest, Transport};

/// Options for [`consume`].
#[derive(Clone)]
pub struct ConsumeOptions {
    pub verifier: Arc<dyn Verifier>,
    /// Retransmissions after the first attempt.
    pub retx_limit: u32,
    /// Lifetime of each request.
    pub lifetime: Duration,
    /// Minimum spacing between attempts when a request fails quickly.
    pub retry_interval: Duration,
    pub cancel: CancellationToken,
}

impl ConsumeOptions {
    pub fn new(verifier: Arc<dyn Verifier>) -> Self {
        Self {
            verifier,
            retx_limit: 3,
            lifetime: Duration::from_secs(1),
            retry_interval: Duration::from_millis(50),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_retx_limit(mut self, retx_limit: u32) -> Self {
        self.retx_limit = retx_limit;
        self
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Fetch and verify the item named `name`.
///
/// Retryable transport errors are retried up to `retx_limit` times.
/// A verification failure is returned immediately.
pub async fn consume(
    transport: &dyn Transport,
    name: Name,
    opts: &ConsumeOptions,
) -> Result<NamedItem, FetchError> {
    let mut attempts = 0u32;
    loop {
        if opts.cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        attempts += 1;
        let sent = Instant::now();
        let interest = Interest::new(name.clone()).with_lifetime(opts.lifetime);

        let result = tokio::select! {
            _ = opts.cancel.cancelled() => return Err(FetchError::Cancelled),
            result = transport.express(interest) => result,
        };

        match result {
            Ok(item) => {
                if item.name != name {
                    return Err(FetchError::Verification {
                        name: name.to_string(),
                        reason: format!("answered with {}", item.name),
                    });
                }
                opts.verifier
                    .verify(&item)
                    .map_err(|e| FetchError::Verification {
                        name: name.to_string(),
                        reason: e.to_string(),
                    })?;
                return Ok(item);
            }
            Err(e) if e.is_retryable() => {
                if attempts > opts.retx_limit {
                    return Err(FetchError::RetryBudgetExhausted {
                        name: name.to_string(),
                        attempts,
                        last: e,
                    });
                }
                tracing::trace!(%name, attempts, error = %e, "retrying");
                tokio::select! {
                    _ = opts.cancel.cancelled() => return Err(FetchError::Cancelled),
                    _ = tokio::time::sleep_until(sent + opts.retry_interval) => {}
                }
            }
            Err(e) => return Err(FetchError::Transport(e)),
        }
    }
}
