//! Circuit breakers guarding per-endpoint attempts.

use crate::error::{ClientError, Result};

use parking_lot::Mutex;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Decides whether an endpoint may be tried.
pub trait Breaker: Send + Sync {
    /// Whether an attempt may go ahead now.
    fn ready(&self) -> bool;

    /// Record a successful attempt.
    fn success(&self);

    /// Record a failed attempt.
    fn fail(&self);
}

/// Run `call` through `breaker`.
///
/// Fails fast with [`ClientError::BreakerOpen`] when the breaker is not
/// ready, bounds the call by `timeout`, then records the outcome. A
/// service error means the endpoint answered, so it counts as a success.
/// Dropping the returned future before it completes counts as a failure.
///
/// # Errors
///
/// Returns [`ClientError::BreakerOpen`], [`ClientError::Timeout`], or the
/// call's own error.
pub async fn attempt<T, F>(breaker: &dyn Breaker, timeout: Option<Duration>, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if !breaker.ready() {
        return Err(ClientError::BreakerOpen);
    }
    let mut outcome = Outcome {
        breaker,
        recorded: false,
    };

    let result = match timeout {
        Some(deadline) => tokio::time::timeout(deadline, call)
            .await
            .unwrap_or_else(|_| Err(ClientError::Timeout(deadline))),
        None => call.await,
    };

    outcome.recorded = true;
    match &result {
        Ok(_) => breaker.success(),
        Err(e) if e.is_service_error() => breaker.success(),
        Err(_) => breaker.fail(),
    }
    result
}

/// Records a failure for an attempt that never reached an outcome.
struct Outcome<'a> {
    breaker: &'a dyn Breaker,
    recorded: bool,
}

impl Drop for Outcome<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            debug!("Attempt dropped before completing");
            self.breaker.fail();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct Counters {
    state: State,
    failures: u32,
}

/// Opens after `threshold` consecutive failures.
///
/// While open every attempt is refused. After `open_timeout` one probe is let
/// through: success closes the breaker, failure opens it again.
#[derive(Debug)]
pub struct ConsecutiveBreaker {
    threshold: u32,
    open_timeout: Duration,
    counters: Mutex<Counters>,
}

impl ConsecutiveBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub fn new(threshold: u32, open_timeout: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            open_timeout,
            counters: Mutex::new(Counters {
                state: State::Closed,
                failures: 0,
            }),
        }
    }

    /// True while attempts are being refused.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self.counters.lock().state, State::Open { until } if Instant::now() < until)
    }

    /// Consecutive failures recorded since the last success.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.counters.lock().failures
    }
}

impl Default for ConsecutiveBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(5))
    }
}

impl Breaker for ConsecutiveBreaker {
    fn ready(&self) -> bool {
        let mut counters = self.counters.lock();
        match counters.state {
            State::Closed => true,
            State::Open { until } if Instant::now() < until => false,
            State::Open { .. } => {
                debug!("Breaker half-open, letting one probe through");
                counters.state = State::HalfOpen;
                true
            }
            State::HalfOpen => false,
        }
    }

    fn success(&self) {
        let mut counters = self.counters.lock();
        counters.failures = 0;
        counters.state = State::Closed;
    }

    fn fail(&self) {
        let mut counters = self.counters.lock();
        counters.failures = counters.failures.saturating_add(1);
        let trip = match counters.state {
            State::HalfOpen => true,
            State::Closed => counters.failures >= self.threshold,
            State::Open { .. } => false,
        };
        if trip {
            warn!(
                "Breaker open after {} consecutive failures",
                counters.failures
            );
            counters.state = State::Open {
                until: Instant::now() + self.open_timeout,
            };
        }
    }
}
