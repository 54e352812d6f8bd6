//! Bounded slot array between the thread calling `add_frame` and the
//! consumer thread.
//!
//! Slot indices travel through two channels: the free list (consumer to
//! producer) and the filled queue (producer to consumer). Both are bounded by
//! the number of slots, so the only place the producer can block is waiting
//! for a free slot. The filled queue is FIFO, which keeps frames in sequence
//! order.

use std::sync::{Arc, Mutex};

use crossbeam::channel::{bounded, Receiver, Sender};
use log::trace;
use ndarray::ArrayD;

use crate::frame::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Filled,
    InUse,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    #[error("the other side of the ring buffer is gone")]
    Disconnected,

    #[error("slot {slot} is {actual:?}, expected {expected:?}")]
    SlotState {
        slot: usize,
        expected: SlotState,
        actual: SlotState,
    },

    #[error("expected frame {expected}, got frame {actual}")]
    OutOfOrder { expected: u64, actual: u64 },

    #[error("slot {slot} lock is poisoned")]
    Poisoned { slot: usize },
}

struct Slot<T> {
    state: SlotState,
    frame: Option<Frame<T>>,
}

type Slots<T> = Arc<Vec<Mutex<Slot<T>>>>;

fn transition<T>(
    slots: &Slots<T>,
    slot: usize,
    expected: SlotState,
    next: SlotState,
    frame: Option<Frame<T>>,
) -> Result<Option<Frame<T>>, RingError> {
    let mut guard = slots[slot]
        .lock()
        .map_err(|_| RingError::Poisoned { slot })?;
    if guard.state != expected {
        return Err(RingError::SlotState {
            slot,
            expected,
            actual: guard.state,
        });
    }
    guard.state = next;
    Ok(std::mem::replace(&mut guard.frame, frame))
}

/// Create a ring buffer with `depth` slots.
pub fn ring_buffer<T>(depth: usize) -> (FrameProducer<T>, FrameConsumer<T>) {
    let slots: Slots<T> = Arc::new(
        (0..depth)
            .map(|_| {
                Mutex::new(Slot {
                    state: SlotState::Empty,
                    frame: None,
                })
            })
            .collect(),
    );
    let (free_s, free_r) = bounded(depth);
    let (filled_s, filled_r) = bounded(depth);
    for idx in 0..depth {
        // can't fail: the channel has room for every index and we hold the receiver
        let _ = free_s.send(idx);
    }
    (
        FrameProducer {
            slots: Arc::clone(&slots),
            free: free_r,
            filled: filled_s,
            next_sequence: 0,
        },
        FrameConsumer {
            slots,
            free: free_s,
            filled: filled_r,
            expected_sequence: 0,
        },
    )
}

/// Producing half. Dropping it tells the consumer that no more frames
/// follow; frames already queued are still delivered.
pub struct FrameProducer<T> {
    slots: Slots<T>,
    free: Receiver<usize>,
    filled: Sender<usize>,
    next_sequence: u64,
}

impl<T> FrameProducer<T> {
    /// Put `data` into the next free slot, blocking while all slots are
    /// occupied. Returns the sequence index assigned to the frame.
    pub fn submit(&mut self, data: ArrayD<T>) -> Result<u64, RingError> {
        let slot = self.free.recv().map_err(|_| RingError::Disconnected)?;
        let sequence = self.next_sequence;
        transition(
            &self.slots,
            slot,
            SlotState::Empty,
            SlotState::Filled,
            Some(Frame::new(sequence, data)),
        )?;
        self.filled
            .send(slot)
            .map_err(|_| RingError::Disconnected)?;
        trace!("frame {sequence} queued in slot {slot}");
        self.next_sequence += 1;
        Ok(sequence)
    }

    /// Number of frames accepted so far.
    pub fn submitted(&self) -> u64 {
        self.next_sequence
    }

    /// Slots that can be filled right now without blocking.
    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// A frame taken out of its slot; the slot stays reserved until the frame
/// is handed back with [`FrameConsumer::release`].
#[derive(Debug)]
pub struct InUse<T> {
    slot: usize,
    frame: Frame<T>,
}

impl<T> InUse<T> {
    pub fn frame(&self) -> &Frame<T> {
        &self.frame
    }

    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// Consuming half.
pub struct FrameConsumer<T> {
    slots: Slots<T>,
    free: Sender<usize>,
    filled: Receiver<usize>,
    expected_sequence: u64,
}

impl<T> FrameConsumer<T> {
    /// Take the next frame in sequence order, blocking until one is queued.
    /// Returns `None` once the producer is gone and every queued frame has
    /// been taken.
    pub fn recv(&mut self) -> Result<Option<InUse<T>>, RingError> {
        let slot = match self.filled.recv() {
            Ok(slot) => slot,
            Err(_) => return Ok(None),
        };
        let frame = transition(&self.slots, slot, SlotState::Filled, SlotState::InUse, None)?
            .ok_or(RingError::SlotState {
                slot,
                expected: SlotState::Filled,
                actual: SlotState::Empty,
            })?;
        if frame.sequence() != self.expected_sequence {
            return Err(RingError::OutOfOrder {
                expected: self.expected_sequence,
                actual: frame.sequence(),
            });
        }
        self.expected_sequence += 1;
        Ok(Some(InUse { slot, frame }))
    }

    /// Drop the frame and recycle its slot.
    pub fn release(&mut self, in_use: InUse<T>) -> Result<(), RingError> {
        let InUse { slot, frame } = in_use;
        drop(frame);
        transition(&self.slots, slot, SlotState::InUse, SlotState::Empty, None)?;
        if self.free.send(slot).is_err() {
            // producer is gone, we are draining
            trace!("slot {slot} released after producer hung up");
        }
        Ok(())
    }

    /// Number of frames taken so far.
    pub fn received(&self) -> u64 {
        self.expected_sequence
    }
}
