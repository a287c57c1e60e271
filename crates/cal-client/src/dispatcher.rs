// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background delivery of encoded frames.
//!
//! Producers push frames into a bounded in-memory queue and return
//! immediately; a single worker thread drains the queue into a
//! [`FrameSink`]. When the queue is full the oldest frame is evicted, so a
//! stalled collector costs memory up to the capacity and nothing more.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::backoff::{Backoff, DEFAULT_WAIT_UNIT};
use crate::codec::{self, Frame};
use crate::status::Status;

pub const DEFAULT_QUEUE_SIZE: usize = 10 * 1024;
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);
/// Identity heartbeats are sent under. Never 0, which collectors treat
/// specially.
pub const HEARTBEAT_IDENTITY: u32 = 7;

const THREAD_NAME: &str = "cal-dispatcher";

/// Destination of dispatched frames.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Delivers one frame. An error makes the dispatcher back off and retry
    /// the same frame.
    async fn deliver(&mut self, frame: &Frame) -> io::Result<()>;

    /// Called once when the worker exits.
    async fn close(&mut self) {}
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub queue_size: usize,
    /// Longest idle wait for a frame before a heartbeat is sent instead.
    pub poll_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Unit of the retry delay; the delay is this times the backoff counter.
    pub wait_unit: Duration,
    /// How long a delivery in progress may continue after stop before it is
    /// abandoned.
    pub shutdown_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            queue_size: DEFAULT_QUEUE_SIZE,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            wait_unit: DEFAULT_WAIT_UNIT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// Snapshot of the dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub enqueued: u64,
    pub delivered: u64,
    /// Evicted on overflow or rejected after stop.
    pub dropped: u64,
    pub failures: u64,
    pub heartbeats: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    failures: AtomicU64,
    heartbeats: AtomicU64,
}

#[derive(Debug, Default)]
struct QueueState {
    frames: VecDeque<Frame>,
    /// Frames enqueued and not yet delivered or evicted, in-flight included.
    unfinished: usize,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<QueueState>,
    drained: Condvar,
    notify: Notify,
    capacity: usize,
    counters: Counters,
    cancel_token: CancellationToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop(&self) -> Option<Frame> {
        self.lock().frames.pop_front()
    }

    fn finish_one(&self) {
        let mut state = self.lock();
        state.unfinished = state.unfinished.saturating_sub(1);
        if state.unfinished == 0 {
            self.drained.notify_all();
        }
    }

    fn discard_remaining(&self) {
        let mut state = self.lock();
        let discarded = state.frames.len();
        state.frames.clear();
        state.unfinished = 0;
        self.drained.notify_all();
        drop(state);
        if discarded > 0 {
            self.counters
                .dropped
                .fetch_add(discarded as u64, Ordering::Relaxed);
            debug!("Discarded {discarded} undelivered CAL frames on shutdown");
        }
    }
}

enum Item {
    Queued(Frame),
    Heartbeat(Frame),
}

impl Item {
    fn frame(&self) -> &Frame {
        match self {
            Item::Queued(frame) | Item::Heartbeat(frame) => frame,
        }
    }
}

/// The keep-alive frame sent when the queue has been idle.
#[must_use]
pub fn heartbeat_frame() -> Frame {
    codec::pack(
        &codec::heartbeat("STATE", "LOG", &Status::success(), "(no-data)"),
        HEARTBEAT_IDENTITY,
        true,
    )
}

/// Bounded frame queue with one background delivery worker.
#[derive(Debug)]
pub struct Dispatcher {
    shared: Arc<Shared>,
    config: DispatcherConfig,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(config: DispatcherConfig) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            drained: Condvar::new(),
            notify: Notify::new(),
            capacity: config.queue_size.max(1),
            counters: Counters::default(),
            cancel_token: CancellationToken::new(),
        });
        Dispatcher {
            shared,
            config,
            worker: Mutex::new(None),
        }
    }

    /// Spawns the worker thread delivering into `sink`. Starting a running
    /// or stopped dispatcher is a no-op.
    pub fn start<S: FrameSink>(&self, sink: S) -> io::Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() || self.shared.cancel_token.is_cancelled() {
            return Ok(());
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        let handle = std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || runtime.block_on(run(shared, config, sink)))?;
        *worker = Some(handle);
        Ok(())
    }

    /// Queues one frame without blocking.
    pub fn enqueue(&self, frame: Frame) {
        self.enqueue_batch(std::iter::once(frame));
    }

    /// Queues `frames` back to back under one lock, so no other producer's
    /// frames land in between.
    pub fn enqueue_batch(&self, frames: impl IntoIterator<Item = Frame>) {
        let mut added = 0u64;
        let mut evicted = 0u64;
        let mut rejected = 0u64;
        {
            let mut state = self.shared.lock();
            // checked under the lock: the worker clears the queue under it after cancelling
            let stopped = self.shared.cancel_token.is_cancelled();
            for frame in frames {
                if stopped {
                    rejected += 1;
                    continue;
                }
                if state.frames.len() >= self.shared.capacity
                    && state.frames.pop_front().is_some()
                {
                    state.unfinished = state.unfinished.saturating_sub(1);
                    evicted += 1;
                }
                state.frames.push_back(frame);
                state.unfinished += 1;
                added += 1;
            }
        }

        let counters = &self.shared.counters;
        if added > 0 {
            counters.enqueued.fetch_add(added, Ordering::Relaxed);
            self.shared.notify.notify_one();
        }
        if evicted > 0 {
            counters.dropped.fetch_add(evicted, Ordering::Relaxed);
            debug!("CAL queue full, evicted {evicted} oldest frames");
        }
        if rejected > 0 {
            counters.dropped.fetch_add(rejected, Ordering::Relaxed);
            debug!("CAL dispatcher stopped, dropped {rejected} frames");
        }
    }

    /// Signals the worker to exit. A frame being written gets the shutdown
    /// grace period to finish, waits are interrupted and queued frames are
    /// discarded.
    pub fn stop(&self) {
        self.shared.cancel_token.cancel();
        let started = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if !started {
            self.shared.discard_remaining();
        }
    }

    /// Waits until every queued frame is delivered or evicted. A zero timeout
    /// waits indefinitely. Returns whether the queue drained in time.
    pub fn drain(&self, timeout: Duration) -> bool {
        let state = self.shared.lock();
        if timeout.is_zero() {
            let _state = self
                .shared
                .drained
                .wait_while(state, |s| s.unfinished > 0)
                .unwrap_or_else(PoisonError::into_inner);
            return true;
        }
        let (state, _) = self
            .shared
            .drained
            .wait_timeout_while(state, timeout, |s| s.unfinished > 0)
            .unwrap_or_else(PoisonError::into_inner);
        state.unfinished == 0
    }

    /// Stops the worker and waits for its thread to exit, which takes at most
    /// the shutdown grace period plus closing the sink.
    pub fn join(&self) {
        self.stop();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("CAL dispatcher thread panicked");
            }
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.cancel_token.is_cancelled()
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.shared.lock().frames.len()
    }

    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        let counters = &self.shared.counters;
        DispatcherStats {
            enqueued: counters.enqueued.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            heartbeats: counters.heartbeats.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shared.cancel_token.cancel();
    }
}

async fn run<S: FrameSink>(shared: Arc<Shared>, config: DispatcherConfig, mut sink: S) {
    debug!("CAL dispatcher started");
    let mut backoff = Backoff::new(config.wait_unit);
    let mut last_heartbeat = Instant::now();

    'frames: while let Some(item) = next_item(&shared, &config, &mut last_heartbeat).await {
        loop {
            let delivered = tokio::select! {
                result = sink.deliver(item.frame()) => Some(result),
                () = shutdown_deadline(&shared.cancel_token, config.shutdown_grace) => None,
            };
            let Some(delivered) = delivered else {
                debug!("Abandoned CAL frame still being delivered at shutdown");
                break 'frames;
            };
            match delivered {
                Ok(()) => {
                    backoff.reset();
                    break;
                }
                Err(e) => {
                    shared.counters.failures.fetch_add(1, Ordering::Relaxed);
                    if backoff.counter() == 1 {
                        warn!("Failed to deliver CAL frame, retrying: {e}");
                    } else {
                        debug!(
                            "CAL delivery still failing (backoff {}): {e}",
                            backoff.counter()
                        );
                    }
                    if !backoff.wait(&shared.cancel_token).await {
                        break 'frames;
                    }
                }
            }
        }

        match item {
            Item::Queued(_) => {
                shared.counters.delivered.fetch_add(1, Ordering::Relaxed);
                shared.finish_one();
            }
            Item::Heartbeat(_) => {
                shared.counters.heartbeats.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    sink.close().await;
    shared.discard_remaining();
    debug!("CAL dispatcher stopped");
}

/// Completes `grace` after `cancel_token` is cancelled.
async fn shutdown_deadline(cancel_token: &CancellationToken, grace: Duration) {
    cancel_token.cancelled().await;
    tokio::time::sleep(grace).await;
}

/// Next frame to deliver, a heartbeat when one is due or the queue stayed
/// idle for the whole poll timeout, or `None` once stopped.
async fn next_item(
    shared: &Shared,
    config: &DispatcherConfig,
    last_heartbeat: &mut Instant,
) -> Option<Item> {
    if shared.cancel_token.is_cancelled() {
        return None;
    }
    if last_heartbeat.elapsed() >= config.heartbeat_interval {
        *last_heartbeat = Instant::now();
        return Some(Item::Heartbeat(heartbeat_frame()));
    }

    let deadline = Instant::now() + config.poll_timeout;
    loop {
        if shared.cancel_token.is_cancelled() {
            return None;
        }
        if let Some(frame) = shared.pop() {
            return Some(Item::Queued(frame));
        }
        tokio::select! {
            _ = shared.cancel_token.cancelled() => return None,
            _ = shared.notify.notified() => {}
            _ = sleep_until(deadline) => {
                *last_heartbeat = Instant::now();
                return Some(Item::Heartbeat(heartbeat_frame()));
            }
        }
    }
}
