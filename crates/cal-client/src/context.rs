// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-execution-context state.
//!
//! A context is either an OS thread or a future wrapped with [`scope`]. Each
//! context owns the identity guards registered through it and a cached
//! correlation id; both go away with the context.

use std::cell::RefCell;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::identity::{ContextKey, Reclaim};

static NEXT_TASK_TOKEN: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct ContextState {
    reclaims: Vec<Reclaim>,
    correlation_id: Option<String>,
}

impl ContextState {
    fn register(&mut self, reclaim: Reclaim) {
        self.reclaims.retain(|r| !r.is_orphaned());
        if self.reclaims.iter().any(|r| r.same_target(&reclaim)) {
            reclaim.disarm();
        } else {
            self.reclaims.push(reclaim);
        }
    }
}

struct TaskContext {
    key: ContextKey,
    state: RefCell<ContextState>,
}

impl TaskContext {
    fn new() -> Self {
        TaskContext {
            key: ContextKey::Task(NEXT_TASK_TOKEN.fetch_add(1, Ordering::Relaxed)),
            state: RefCell::default(),
        }
    }
}

tokio::task_local! {
    static TASK_CONTEXT: TaskContext;
}

thread_local! {
    static THREAD_CONTEXT: RefCell<ContextState> = RefCell::default();
}

/// Key of the innermost context the caller runs in.
#[must_use]
pub fn current_key() -> ContextKey {
    TASK_CONTEXT
        .try_with(|ctx| ctx.key)
        .unwrap_or_else(|_| ContextKey::Thread(std::thread::current().id()))
}

/// Whether the caller runs inside [`scope`] or [`run_in_context`].
#[must_use]
pub fn in_task_context() -> bool {
    TASK_CONTEXT.try_with(|_| ()).is_ok()
}

fn with_state<R>(f: impl FnOnce(&mut ContextState) -> R) -> Option<R> {
    if in_task_context() {
        return TASK_CONTEXT
            .try_with(|ctx| ctx.state.try_borrow_mut().ok().map(|mut s| f(&mut s)))
            .ok()
            .flatten();
    }
    // fails while the thread is tearing down its locals
    THREAD_CONTEXT
        .try_with(|cell| cell.try_borrow_mut().ok().map(|mut s| f(&mut s)))
        .ok()
        .flatten()
}

/// Ties `reclaim` to the current context. If the context can no longer hold
/// state the guard is dropped, releasing its identity right away.
pub(crate) fn reclaim_on_exit(reclaim: Reclaim) {
    with_state(move |state| state.register(reclaim));
}

/// The context's cached correlation id, created with `generate` on first use.
pub fn correlation_id(generate: impl Fn() -> String) -> String {
    with_state(|state| {
        state
            .correlation_id
            .get_or_insert_with(&generate)
            .clone()
    })
    .unwrap_or_else(generate)
}

/// Replaces the context's correlation id, typically with one received from
/// an upstream caller.
pub fn set_correlation_id(id: impl Into<String>) {
    let id = id.into();
    with_state(move |state| state.correlation_id = Some(id));
}

/// Runs `fut` as its own context. Identities acquired inside are released
/// when the future completes or is dropped.
pub async fn scope<F: Future>(fut: F) -> F::Output {
    TASK_CONTEXT.scope(TaskContext::new(), fut).await
}

/// Synchronous counterpart of [`scope`].
pub fn run_in_context<R>(f: impl FnOnce() -> R) -> R {
    TASK_CONTEXT.sync_scope(TaskContext::new(), f)
}
