// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_WAIT_UNIT: Duration = Duration::from_millis(10);
pub const MAX_COUNTER: u32 = 500;

/// Doubling retry delay for delivery failures.
///
/// The counter starts at 1, doubles on every failure up to [`MAX_COUNTER`] and
/// drops back to 1 on the first success. Each failure waits `counter` units.
#[derive(Debug, Clone)]
pub struct Backoff {
    counter: u32,
    wait_unit: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(wait_unit: Duration) -> Self {
        Backoff {
            counter: 1,
            wait_unit,
        }
    }

    #[must_use]
    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn reset(&mut self) {
        self.counter = 1;
    }

    /// Bumps the counter and returns how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.counter = self.counter.saturating_mul(2).min(MAX_COUNTER);
        self.wait_unit * self.counter
    }

    /// Sleeps for the next delay. Returns false if cancelled while waiting.
    pub async fn wait(&mut self, cancel_token: &CancellationToken) -> bool {
        let delay = self.next_delay();
        tokio::select! {
            _ = sleep(delay) => true,
            _ = cancel_token.cancelled() => false,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(DEFAULT_WAIT_UNIT)
    }
}
