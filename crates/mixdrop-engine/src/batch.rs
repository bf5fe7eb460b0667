//! Batch builder — groups ready parts into rounds.
//!
//! Each batch targets a random size in `[min, max]`. A batch is released as
//! soon as it is full, or when no new part has arrived for the idle timeout
//! and the batch holds at least one part. Every release waits on the rate
//! limiter first.

use std::time::Duration;

use mixdrop_store::Part;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::rate_limit::RateLimiter;

pub(crate) struct BatchBuilder {
    part_rx: mpsc::Receiver<Part>,
    batch_tx: mpsc::Sender<Vec<Part>>,
    limiter: RateLimiter,
    min_parts: usize,
    max_parts: usize,
    idle: Duration,
    cancel: CancellationToken,
    rng: StdRng,
}

impl BatchBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        part_rx: mpsc::Receiver<Part>,
        batch_tx: mpsc::Sender<Vec<Part>>,
        limiter: RateLimiter,
        min_parts: usize,
        max_parts: usize,
        idle: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            part_rx,
            batch_tx,
            limiter,
            min_parts: min_parts.max(1),
            max_parts: max_parts.max(min_parts.max(1)),
            idle,
            cancel,
            rng: StdRng::from_entropy(),
        }
    }

    pub async fn run(mut self) {
        loop {
            let target = self.rng.gen_range(self.min_parts..=self.max_parts);
            let Some(batch) = self.collect(target).await else {
                tracing::debug!("batch builder shutting down");
                return;
            };

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.limiter.take() => {}
            }

            tracing::trace!(parts = batch.len(), "releasing batch");
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                sent = self.batch_tx.send(batch) => {
                    if sent.is_err() {
                        tracing::debug!("batch queue closed, batch builder exiting");
                        return;
                    }
                }
            }
        }
    }

    /// Gather up to `target` parts. `None` on shutdown or when the part
    /// queue closes with nothing gathered.
    async fn collect(&mut self, target: usize) -> Option<Vec<Part>> {
        let mut batch = Vec::with_capacity(target);
        let mut deadline = Instant::now() + self.idle;

        while batch.len() < target {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,

                part = self.part_rx.recv() => match part {
                    Some(part) => {
                        batch.push(part);
                        deadline = Instant::now() + self.idle;
                    }
                    None if batch.is_empty() => return None,
                    None => break,
                },

                _ = tokio::time::sleep_until(deadline) => {
                    if !batch.is_empty() {
                        break;
                    }
                    deadline = Instant::now() + self.idle;
                }
            }
        }
        Some(batch)
    }
}
