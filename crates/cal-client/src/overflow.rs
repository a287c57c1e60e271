// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Deferred delivery for identities the wire cannot route.
//!
//! Only the first [`MAX_ROUTABLE_IDENTITY`] identities of a process get their
//! own tag. Everything above shares one tag, so the collector could not tell
//! their transaction trees apart if their frames interleaved. Instead each
//! overloaded identity buffers its frames until its outermost transaction
//! ends and the whole tree is sent as one contiguous burst.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tracing::warn;

use crate::codec::{Frame, MessageKind, IDENTITY_MASK};

pub const MAX_ROUTABLE_IDENTITY: u32 = 64;
/// Buffers holding more frames than this are dropped.
pub const MAX_PENDING_FRAMES: usize = 512;

#[must_use]
pub fn is_overloaded(identity: u32) -> bool {
    identity & 0xFFFF > MAX_ROUTABLE_IDENTITY
}

/// Wire tag shared by every overloaded identity of the same process.
#[must_use]
pub fn overflow_tag(identity: u32) -> u32 {
    (identity | 0xFFFF) & IDENTITY_MASK
}

#[derive(Debug, Default)]
struct OverflowRecord {
    pending: Vec<Frame>,
    depth: i64,
}

impl OverflowRecord {
    /// Appends `frame`; returns the whole buffer once the depth is back to 0.
    fn push(&mut self, frame: Frame) -> Option<Vec<Frame>> {
        match frame.kind() {
            Some(MessageKind::StartTransaction) => self.depth += 1,
            Some(MessageKind::EndTransaction) => self.depth -= 1,
            _ => {}
        }
        self.pending.push(frame);
        (self.depth == 0).then(|| std::mem::take(&mut self.pending))
    }
}

/// Overflow records for every currently overloaded identity.
#[derive(Debug, Default)]
pub struct OverflowBuffers {
    records: Mutex<HashMap<u32, OverflowRecord>>,
}

impl OverflowBuffers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers `frame` for `identity` and returns whatever is now sendable.
    ///
    /// The result is empty while a transaction is open, and the complete
    /// buffered tree, in order, once the outermost one closes.
    pub fn record(&self, identity: u32, frame: Frame) -> Vec<Frame> {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let record = records.entry(identity).or_default();

        if let Some(burst) = record.push(frame) {
            records.remove(&identity);
            return burst;
        }
        if record.pending.len() > MAX_PENDING_FRAMES {
            warn!(
                "Dropping {} buffered CAL frames for overloaded identity {identity}",
                record.pending.len()
            );
            // depth is kept so the tree's own end frame still closes the record
            record.pending.clear();
        }
        Vec::new()
    }

    /// Frames currently held back for `identity`.
    #[must_use]
    pub fn pending(&self, identity: u32) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&identity)
            .map_or(0, |record| record.pending.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::status::Status;
    use tracing_test::traced_test;

    const TAG: u32 = 0xFFFF;

    fn start(name: &str) -> Frame {
        codec::pack(&codec::start_transaction("API", name), TAG, true)
    }

    fn end(name: &str) -> Frame {
        codec::pack(
            &codec::end_transaction("API", name, &Status::success(), "1.00", ""),
            TAG,
            true,
        )
    }

    fn event(name: &str) -> Frame {
        codec::pack(&codec::event("E", name, &Status::success(), ""), TAG, true)
    }

    #[test]
    fn test_routable_range() {
        assert!(!is_overloaded(0));
        assert!(!is_overloaded(64));
        assert!(is_overloaded(65));
        assert!(!is_overloaded((12 << 16) + 3));
        assert!(is_overloaded((12 << 16) + 70));
        assert_eq!(overflow_tag((1 << 16) + 70), 0x1_FFFF);
        assert_eq!(overflow_tag((1 << 16) + 900), 0x1_FFFF);
        assert_eq!(overflow_tag(0xFFFF_0041), IDENTITY_MASK);
    }

    #[test]
    fn test_nested_tree_released_as_one_burst() {
        let buffers = OverflowBuffers::new();
        let tree = [
            start("outer"),
            event("a"),
            start("inner"),
            event("b"),
            end("inner"),
        ];
        for frame in tree.iter().cloned() {
            assert!(buffers.record(70, frame).is_empty());
        }
        assert_eq!(buffers.pending(70), 5);

        let burst = buffers.record(70, end("outer"));
        assert_eq!(burst.len(), 6);
        assert_eq!(&burst[..5], &tree);
        assert_eq!(burst[5].kind(), Some(MessageKind::EndTransaction));
        assert!(buffers.is_empty());
    }

    #[test]
    fn test_frame_outside_transaction_passes_through() {
        let buffers = OverflowBuffers::new();
        let burst = buffers.record(80, event("lonely"));
        assert_eq!(burst.len(), 1);
        assert!(buffers.is_empty());
    }

    #[test]
    fn test_identities_buffer_independently() {
        let buffers = OverflowBuffers::new();
        assert!(buffers.record(70, start("a")).is_empty());
        assert!(buffers.record(71, start("b")).is_empty());
        assert_eq!(buffers.record(71, end("b")).len(), 2);
        assert_eq!(buffers.pending(70), 1);
        assert_eq!(buffers.record(70, end("a")).len(), 2);
    }

    #[test]
    #[traced_test]
    fn test_runaway_buffer_is_discarded() {
        let buffers = OverflowBuffers::new();
        assert!(buffers.record(90, start("leak")).is_empty());
        for i in 0..MAX_PENDING_FRAMES {
            assert!(buffers.record(90, event(&i.to_string())).is_empty());
        }
        // 513 frames exceed the limit
        assert_eq!(buffers.pending(90), 0);
        assert!(logs_contain("Dropping 513 buffered CAL frames"));

        // the dropped tree's end frame still closes the record
        let tail = buffers.record(90, end("leak"));
        assert_eq!(tail.len(), 1);
        assert!(buffers.is_empty());
    }
}
