//! Slot record: inline key, value, per-slot lock, generation counter.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use hashbrown::HashSet;

use crate::group::SlotRef;
use crate::value::Value;

/// Longest key a slot stores. Keys live inline in the slot so the table
/// path never allocates for them; the empty key is the vacancy sentinel.
pub const MAX_KEY_LEN: usize = 255;

/// Fixed inline key storage.
#[derive(Clone, Copy)]
pub(crate) struct KeyBuf {
    len: u8,
    buf: [u8; MAX_KEY_LEN],
}

impl KeyBuf {
    pub(crate) const fn empty() -> Self {
        Self {
            len: 0,
            buf: [0; MAX_KEY_LEN],
        }
    }

    /// Caller has already checked `1..=MAX_KEY_LEN`.
    pub(crate) fn set(&mut self, key: &[u8]) {
        debug_assert!(!key.is_empty() && key.len() <= MAX_KEY_LEN);
        self.len = key.len() as u8;
        self.buf[..key.len()].copy_from_slice(key);
    }

    pub(crate) fn clear(&mut self) {
        self.len = 0;
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Everything the slot lock protects: key, value, group back references,
/// and the touch/ttl metadata.
pub(crate) struct SlotState {
    pub(crate) key: KeyBuf,
    pub(crate) value: Value,
    /// Groups that currently reference this slot, keyed by the group's
    /// index and its generation at link time.
    pub(crate) backrefs: HashSet<SlotRef>,
    pub(crate) last_touch: Instant,
    pub(crate) ttl: Duration,
}

/// One cell of the table. The generation is readable without the lock;
/// writers advance it under the write lock only after the new key and
/// value are installed, and lock holders re-check it before trusting a
/// previously observed value.
pub(crate) struct Slot {
    generation: AtomicU16,
    state: RwLock<SlotState>,
}

impl Slot {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            generation: AtomicU16::new(0),
            state: RwLock::new(SlotState {
                key: KeyBuf::empty(),
                value: Value::default(),
                backrefs: HashSet::new(),
                last_touch: now,
                ttl: Duration::ZERO,
            }),
        }
    }

    pub(crate) fn generation(&self) -> u16 {
        self.generation.load(Ordering::Acquire)
    }

    /// Advance the generation. Only called while holding the write lock,
    /// so the load cannot race another writer.
    pub(crate) fn bump_generation(&self) -> u16 {
        let next = self.generation.load(Ordering::Relaxed).wrapping_add(1);
        self.generation.store(next, Ordering::Release);
        next
    }

    // A panicking caller callback must not wedge the slot, so poison is
    // absorbed rather than propagated.
    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, SlotState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_state(&self) -> RwLockWriteGuard<'_, SlotState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
