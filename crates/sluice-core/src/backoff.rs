//! Jittered exponential backoff and the retry harness.
//!
//! Every long-running loop in the control plane (master reconciliation,
//! per-pipeline monitors, worker upserts) runs under this harness:
//! infinite retry by default, with a per-attempt notify callback that can
//! abort the retry cycle by returning the error.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff schedule with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    /// An infinite backoff: delays grow from 200ms up to a 60s ceiling
    /// and never stop being produced.
    pub fn infinite() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(60), 2.0)
    }

    /// Build a schedule with explicit bounds.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self { current: initial, initial, max, multiplier }
    }

    /// Next delay: the current interval plus up to 50% jitter, then the
    /// interval grows toward the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        let jitter_ms = rand::rng().random_range(0..base.as_millis() as u64 / 2 + 1);
        let delay = base + Duration::from_millis(jitter_ms);

        let grown = self.current.mul_f64(self.multiplier);
        self.current = if grown > self.max { self.max } else { grown };
        delay
    }

    /// Reset the schedule to its initial interval.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Retry `op` under `backoff` until it succeeds or `notify` aborts.
///
/// After each failed attempt, `notify` receives the error and the delay
/// that will be slept before the next attempt. Returning `Err` from
/// `notify` stops the cycle and surfaces that error; returning `Ok(())`
/// sleeps and retries. With [`Backoff::infinite`] this retries forever
/// unless the callback aborts.
pub async fn retry_notify<T, E, Op, Fut, N>(
    mut backoff: Backoff,
    mut op: Op,
    mut notify: N,
) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    N: FnMut(E, Duration) -> Result<(), E>,
{
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let delay = backoff.next_delay();
                notify(err, delay)?;
                tokio::time::sleep(delay).await;
            }
        }
    }
}
