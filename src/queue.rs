//! Per-synapse spike delivery queue: one 32-bit ring per slot.
//!
//! Bit `t mod RING_LENGTH` of a slot's word is set when a pre-synaptic spike
//! must be delivered at tick `t`. The scheduler sets the bit, the per-tick
//! delivery pass reads and clears it. Each word has exactly one producer and
//! one consumer, and slots never share a word.
//!
//! A delay of `RING_LENGTH` or more would wrap onto a bit that may already be
//! in use, so such requests are rejected. Synapse creation caps delays to
//! `RING_LENGTH - 1`.

use crate::device::{BufferId, DeviceArena};
use crate::error::{Error, Result};

/// Number of future ticks one ring can represent.
pub const RING_LENGTH: u32 = u32::BITS;

/// Largest delay a synapse may carry.
pub const MAX_DELAY: u32 = RING_LENGTH - 1;

#[inline]
fn ring_bit(tick: u64) -> u32 {
    1u32 << (tick % RING_LENGTH as u64)
}

/// Set the delivery bit for `tick + delay` in `word`. Returns `false` when
/// the delay can't be represented.
#[inline]
pub(crate) fn schedule_bits(word: &mut u32, tick: u64, delay: u32) -> bool {
    if delay == 0 || delay >= RING_LENGTH {
        return false;
    }
    *word |= ring_bit(tick + delay as u64);
    true
}

/// Test and clear the bit for `tick`.
#[inline]
pub(crate) fn check_and_clear_bits(word: &mut u32, tick: u64) -> bool {
    let bit = ring_bit(tick);
    let hit = *word & bit != 0;
    *word &= !bit;
    hit
}

/// Ring storage for every synapse slot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpikeEventQueue {
    pub(crate) bits: Vec<u32>,
}

impl SpikeEventQueue {
    /// All-clear queue for `slots` synapses.
    pub fn new(slots: usize) -> Self {
        Self { bits: vec![0; slots] }
    }

    /// Number of slots covered.
    #[inline]
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Raw ring word for a slot.
    #[inline]
    pub fn pending(&self, slot: usize) -> u32 {
        self.bits[slot]
    }

    /// Schedule delivery on `slot` at `tick + delay`.
    ///
    /// Returns `false` and leaves the ring untouched when `delay` is zero or
    /// not below `RING_LENGTH`.
    pub fn schedule_delivery(&mut self, slot: usize, tick: u64, delay: u32) -> bool {
        let accepted = schedule_bits(&mut self.bits[slot], tick, delay);
        if !accepted {
            log::trace!("[QUEUE] slot {slot}: delay {delay} outside ring, dropped");
        }
        accepted
    }

    /// If a delivery is due on `slot` at `tick`, clear it and return `true`.
    #[inline]
    pub fn check_and_clear(&mut self, slot: usize, tick: u64) -> bool {
        check_and_clear_bits(&mut self.bits[slot], tick)
    }

    /// Drop every pending delivery on `slot`.
    #[inline]
    pub fn clear(&mut self, slot: usize) {
        self.bits[slot] = 0;
    }

    /// Drop every pending delivery on every slot.
    pub fn clear_all(&mut self) {
        self.bits.iter_mut().for_each(|w| *w = 0);
    }

    /// Allocate a device ring of the same size. The returned handle owns the
    /// buffer and must be released with `free_mirror`.
    pub fn allocate_mirror(&self, arena: &mut DeviceArena) -> Result<QueueMirror> {
        let buffer = arena.alloc::<u32>(self.bits.len())?;
        log::debug!("[MIRROR] queue: allocated {} ring words as {}", self.bits.len(), buffer);
        Ok(QueueMirror { buffer: Some(buffer), slots: self.bits.len() })
    }

    /// Host → device.
    pub fn copy_to_mirror(&self, arena: &mut DeviceArena, mirror: &QueueMirror) -> Result<()> {
        let id = mirror.checked(self.bits.len())?;
        arena.upload(id, &self.bits)?;
        Ok(())
    }

    /// Device → host.
    pub fn copy_from_mirror(&mut self, arena: &DeviceArena, mirror: &QueueMirror) -> Result<()> {
        let id = mirror.checked(self.bits.len())?;
        arena.download(id, &mut self.bits)?;
        Ok(())
    }

    /// Schedule deliveries directly on the device ring. `events` yields
    /// `(slot, delay)` pairs for spikes emitted at `tick`. Returns how many
    /// were accepted.
    pub fn schedule_on_mirror(
        arena: &mut DeviceArena,
        mirror: &QueueMirror,
        tick: u64,
        events: impl IntoIterator<Item = (usize, u32)>,
    ) -> Result<usize> {
        let id = mirror.buffer.ok_or(Error::QueueDetached)?;
        let ring = arena.view_mut::<u32>(id)?;
        let len = ring.len();
        let mut accepted = 0;
        for (slot, delay) in events {
            let Some(word) = ring.get_mut(slot) else {
                return Err(Error::SizeMismatch { expected: slot + 1, got: len });
            };
            if schedule_bits(word, tick, delay) {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    /// Release the device ring.
    pub fn free_mirror(arena: &mut DeviceArena, mut mirror: QueueMirror) -> Result<()> {
        mirror.slots = 0;
        if let Some(id) = mirror.buffer.take() {
            arena.free(id)?;
            log::debug!("[MIRROR] queue: freed {id}");
        }
        Ok(())
    }
}

/// Handle to a device-resident queue. Owns its buffer.
#[derive(Debug)]
#[must_use = "a queue mirror must be released with SpikeEventQueue::free_mirror"]
pub struct QueueMirror {
    buffer: Option<BufferId>,
    slots: usize,
}

impl QueueMirror {
    /// Device buffer id, if still allocated.
    #[inline]
    pub fn buffer(&self) -> Option<BufferId> {
        self.buffer
    }

    /// Recorded slot count.
    #[inline]
    pub fn slots(&self) -> usize {
        self.slots
    }

    fn checked(&self, host_slots: usize) -> Result<BufferId> {
        match self.buffer {
            Some(id) if self.slots == host_slots => Ok(id),
            _ => Err(Error::SizeMismatch { expected: host_slots, got: self.slots }),
        }
    }
}
