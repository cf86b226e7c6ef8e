//! Bounded frame hand-off between an engine callback thread and a render pull loop.
//!
//! The producer never blocks: when the ring is full the oldest frame is
//! evicted. The consumer never waits: an empty ring yields `None` and the sink
//! decides what to show. One mutex guards the ring, the first-frame flag and
//! the counters together, and it is only held for the queue mutation.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use crate::{Frame, Resolution, StreamKind};

pub const LOCAL_BRIDGE_CAPACITY: usize = 3;
pub const REMOTE_BRIDGE_CAPACITY: usize = 5;

/// Counters for one bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub pushed: u64,
    pub pulled: u64,
    /// Frames evicted by drop-oldest, discarded after detach or rejected for
    /// having no pixels.
    pub dropped: u64,
    /// Pulls that found the ring empty.
    pub empty_pulls: u64,
    pub buffered: usize,
}

/// Result of a push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushOutcome {
    /// Set on the first frame this bridge ever accepted.
    pub first_frame: Option<Resolution>,
    /// An older frame was evicted to make room.
    pub evicted: bool,
}

/// A frame handed to the render side, stamped on the live presentation clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub frame: Frame,
    pub presentation_time: Duration,
    pub duration: Duration,
}

#[derive(Debug, Default)]
struct Slot {
    queue: VecDeque<Frame>,
    initialized: bool,
    detached: bool,
    clock: Duration,
    stats: BridgeStats,
}

#[derive(Debug)]
pub struct FrameBridge {
    kind: StreamKind,
    capacity: usize,
    slot: Mutex<Slot>,
}

impl FrameBridge {
    /// Create a bridge with the capacity assigned to `kind`.
    pub fn new(kind: StreamKind) -> Self {
        Self::with_capacity(kind, kind.bridge_capacity())
    }

    pub fn with_capacity(kind: StreamKind, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            kind,
            capacity,
            slot: Mutex::new(Slot {
                queue: VecDeque::with_capacity(capacity),
                ..Slot::default()
            }),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // A panic on the other side must not take the bridge down with it.
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Producer side. Never blocks beyond the queue mutation.
    ///
    /// Zero-sized frames are dropped and never count as the first frame.
    pub fn push(&self, frame: Frame) -> PushOutcome {
        let mut slot = self.slot();
        if slot.detached {
            slot.stats.dropped += 1;
            return PushOutcome::default();
        }
        if frame.resolution().is_empty() {
            slot.stats.dropped += 1;
            drop(slot);
            debug!("{} bridge dropped empty {} frame", self.kind, frame.resolution());
            return PushOutcome::default();
        }

        let mut outcome = PushOutcome::default();
        if !slot.initialized {
            slot.initialized = true;
            outcome.first_frame = Some(frame.resolution());
        }

        if slot.queue.len() >= self.capacity {
            slot.queue.pop_front();
            slot.stats.dropped += 1;
            outcome.evicted = true;
        }
        slot.queue.push_back(frame);
        slot.stats.pushed += 1;
        slot.stats.buffered = slot.queue.len();
        drop(slot);

        if outcome.evicted {
            debug!("{} bridge full, evicted oldest frame", self.kind);
        }
        outcome
    }

    /// Consumer side. Returns the oldest buffered frame, if any, stamped with
    /// the presentation clock; the clock advances by `requested` per sample.
    pub fn pull(&self, requested: Duration) -> Option<Sample> {
        let mut slot = self.slot();
        let Some(frame) = slot.queue.pop_front() else {
            slot.stats.empty_pulls += 1;
            return None;
        };
        let presentation_time = slot.clock;
        slot.clock += requested;
        slot.stats.pulled += 1;
        slot.stats.buffered = slot.queue.len();
        Some(Sample {
            frame,
            presentation_time,
            duration: requested,
        })
    }

    /// Disconnect the consumer: buffered frames are released and later pushes
    /// are discarded. The first-frame flag is kept, so no second notification
    /// can ever be produced.
    pub fn detach(&self) {
        let mut slot = self.slot();
        if slot.detached {
            return;
        }
        slot.detached = true;
        slot.stats.dropped += slot.queue.len() as u64;
        slot.queue.clear();
        slot.stats.buffered = 0;
    }

    pub fn is_initialized(&self) -> bool {
        self.slot().initialized
    }

    pub fn is_detached(&self) -> bool {
        self.slot().detached
    }

    pub fn len(&self) -> usize {
        self.slot().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> BridgeStats {
        self.slot().stats
    }
}
