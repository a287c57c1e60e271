// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Small-integer identities for execution contexts.
//!
//! Every thread or task that logs through the client gets the smallest
//! integer not held by another live context. The collector uses these
//! integers to tell concurrent transaction trees apart, and the wire format
//! only leaves a handful of them routable per process, so freed numbers are
//! recycled lowest-first.
//!
//! Identities are reclaimed without polling: the first acquisition from a
//! context registers a [`Reclaim`] guard with that context (a thread-local for
//! threads, the task context for tasks, see [`crate::context`]) and the guard
//! frees the integer when the context goes away.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::ThreadId;

use tracing::trace;

use crate::context;

/// Stable handle for one execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKey {
    Thread(ThreadId),
    Task(u64),
}

#[derive(Debug, Default)]
struct Slots {
    assigned: HashMap<ContextKey, u32>,
    free: BinaryHeap<Reverse<u32>>,
}

impl Slots {
    /// Returns the identity and whether it was newly assigned.
    fn acquire(&mut self, key: ContextKey) -> (u32, bool) {
        if let Some(&identity) = self.assigned.get(&key) {
            return (identity, false);
        }
        // every integer below the live count is either assigned or on the heap
        let identity = match self.free.pop() {
            Some(Reverse(identity)) => identity,
            None => self.assigned.len() as u32,
        };
        self.assigned.insert(key, identity);
        (identity, true)
    }

    fn release(&mut self, key: ContextKey) -> Option<u32> {
        let identity = self.assigned.remove(&key)?;
        self.free.push(Reverse(identity));
        Some(identity)
    }
}

/// Assigns and recycles context identities. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct IdentityAllocator {
    slots: Arc<Mutex<Slots>>,
}

impl IdentityAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity for `key`, assigning the smallest free integer on first use.
    pub fn acquire(&self, key: ContextKey) -> u32 {
        self.lock().acquire(key).0
    }

    /// Frees the identity held by `key`. Unknown keys are ignored.
    pub fn release(&self, key: ContextKey) -> Option<u32> {
        self.lock().release(key)
    }

    #[must_use]
    pub fn contains(&self, key: ContextKey) -> bool {
        self.lock().assigned.contains_key(&key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().assigned.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identity of the calling context, released automatically when the
    /// context ends.
    pub fn acquire_current(&self) -> u32 {
        let key = context::current_key();
        let (identity, fresh) = self.lock().acquire(key);
        if fresh {
            trace!("Assigned CAL identity {identity} to {key:?}");
            context::reclaim_on_exit(Reclaim {
                slots: Arc::downgrade(&self.slots),
                key,
            });
        }
        identity
    }

    /// Releases the calling context's identity ahead of its exit.
    pub fn release_current(&self) -> Option<u32> {
        self.release(context::current_key())
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Frees one context's identity when dropped.
///
/// Holds the allocator weakly so an abandoned client is not kept alive by the
/// threads that once logged through it.
pub(crate) struct Reclaim {
    slots: Weak<Mutex<Slots>>,
    key: ContextKey,
}

impl Reclaim {
    pub(crate) fn same_target(&self, other: &Reclaim) -> bool {
        self.key == other.key && Weak::ptr_eq(&self.slots, &other.slots)
    }

    /// The allocator this guard points at no longer exists.
    pub(crate) fn is_orphaned(&self) -> bool {
        self.slots.strong_count() == 0
    }

    /// Drops the guard without releasing anything.
    pub(crate) fn disarm(mut self) {
        self.slots = Weak::new();
    }
}

impl Drop for Reclaim {
    fn drop(&mut self) {
        let Some(slots) = self.slots.upgrade() else {
            return;
        };
        let released = slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release(self.key);
        if let Some(identity) = released {
            trace!("Reclaimed CAL identity {identity} from {:?}", self.key);
        }
    }
}
