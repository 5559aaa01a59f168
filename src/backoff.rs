use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Exponential backoff with jitter. The first delay is zero, every following one is drawn from `[d/2, d]` where `d` doubles from
/// `base` up to `max`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base) }
    }

    pub fn take(&self, attempts: usize) -> BackoffIter {
        BackoffIter { backoff: self.clone(), remaining: attempts, ceiling: None }
    }
}

pub struct BackoffIter {
    backoff: Backoff,
    remaining: usize,
    // `None` until the first, immediate attempt was handed out.
    ceiling: Option<Duration>,
}

impl BackoffIter {
    /// Sleeps for the next delay. Returns `false` once the attempts are used up or the token is cancelled.
    pub async fn wait_or_cancelled(&mut self, cancel: &CancellationToken) -> bool {
        let Some(delay) = self.next() else { return false };
        if cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            () = sleep(delay) => true,
        }
    }
}

impl Iterator for BackoffIter {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.remaining = self.remaining.checked_sub(1)?;
        let Some(ceiling) = self.ceiling else {
            self.ceiling = Some(self.backoff.base);
            return Some(Duration::ZERO);
        };
        self.ceiling = Some(ceiling.saturating_mul(2).min(self.backoff.max));
        Some(rand::thread_rng().gen_range(ceiling / 2..=ceiling))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for BackoffIter {}
