//! Throughput limiting for released batches.
//!
//! A leaky bucket with no burst slack: after a batch is admitted the next one
//! waits at least `per / rate`. The window `per` is the smallest of
//! second → minute → hour → day → week in which
//!
//!   rate = max_throughput * per / avg_batch_bytes
//!
//! is at least one batch, so slow links still get a sensible interval.
//! A throughput of 0 disables limiting.

use std::time::Duration;

use tokio::time::Instant;

const WINDOWS: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(60),
    Duration::from_secs(60 * 60),
    Duration::from_secs(24 * 60 * 60),
    Duration::from_secs(7 * 24 * 60 * 60),
];

#[derive(Debug)]
pub struct RateLimiter {
    interval: Option<Duration>,
    last: Option<Instant>,
}

impl RateLimiter {
    /// `message_size` is the payload size of one message; batches average
    /// `(min_parts + max_parts) / 2` messages.
    pub fn new(max_throughput: u64, min_parts: usize, max_parts: usize, message_size: usize) -> Self {
        Self {
            interval: admission_interval(max_throughput, min_parts, max_parts, message_size),
            last: None,
        }
    }

    pub fn unlimited() -> Self {
        Self {
            interval: None,
            last: None,
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Wait until the next batch may be released.
    pub async fn take(&mut self) {
        let Some(interval) = self.interval else {
            return;
        };

        let now = Instant::now();
        let at = match self.last {
            Some(last) if last + interval > now => last + interval,
            _ => now,
        };
        if at > now {
            tokio::time::sleep_until(at).await;
        }
        self.last = Some(at);
    }
}

fn admission_interval(
    max_throughput: u64,
    min_parts: usize,
    max_parts: usize,
    message_size: usize,
) -> Option<Duration> {
    if max_throughput == 0 {
        return None;
    }

    let avg_batch_bytes = ((min_parts + max_parts) / 2).max(1) as u64 * message_size.max(1) as u64;

    let mut chosen = (WINDOWS[WINDOWS.len() - 1], 1u64);
    for per in WINDOWS {
        let rate = u128::from(max_throughput) * u128::from(per.as_secs()) / u128::from(avg_batch_bytes);
        if rate >= 1 {
            chosen = (per, u64::try_from(rate).unwrap_or(u64::MAX));
            break;
        }
    }

    let (per, rate) = chosen;
    Some(per / u32::try_from(rate).unwrap_or(u32::MAX))
}
