//! Generation-checked, lock-scoped cursors into slots.

use core::fmt;
use std::time::{Duration, Instant};

use crate::group;
use crate::slot_map::SlotMap;
use crate::value::Value;

/// The slot was rewritten or removed after this handle captured its
/// generation. Re-lookup to get a current handle.
#[derive(Debug, Eq, PartialEq)]
pub struct Invalidated;

impl fmt::Display for Invalidated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("slot changed since the handle was taken")
    }
}

impl std::error::Error for Invalidated {}

/// Cursor bound to one slot and the generation observed when the handle
/// was made. Values are reached only through [`read`](Self::read) and
/// [`write`](Self::write), which take the slot lock, re-check the
/// generation, and scope the borrows they hand out to the callback, so
/// no pointer into the inlined value can outlive the lock.
///
/// Handles are cheap to copy and may be retried until they report
/// [`Invalidated`]. A successful `write` advances the slot generation
/// and re-captures it, so the writing handle stays current while every
/// other handle to the slot turns stale.
#[derive(Clone, Copy)]
pub struct SlotHandle<'m> {
    pub(crate) map: &'m SlotMap,
    pub(crate) index: usize,
    pub(crate) generation: u16,
}

impl<'m> SlotHandle<'m> {
    pub(crate) fn new(map: &'m SlotMap, index: usize, generation: u16) -> Self {
        Self {
            map,
            index,
            generation,
        }
    }

    /// Physical slot index this handle is bound to.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Generation captured when the handle was made.
    pub fn generation(&self) -> u16 {
        self.generation
    }

    /// Run `f` with shared access to the slot's value and key.
    pub fn read<R>(&self, f: impl FnOnce(&Value, &[u8]) -> R) -> Result<R, Invalidated> {
        let slot = self.map.slot(self.index);
        // Unlocked pre-check; the authoritative one follows under the lock.
        if slot.generation() != self.generation {
            return Err(Invalidated);
        }
        let st = slot.read_state();
        if slot.generation() != self.generation {
            return Err(Invalidated);
        }
        Ok(f(&st.value, st.key.as_bytes()))
    }

    /// Run `f` with exclusive access to the slot's value. On return the
    /// generation advances; this handle re-captures it, all others to
    /// the slot invalidate. Replacing a group value through `f` unlinks
    /// the former members' back references afterwards, outside the lock.
    pub fn write<R>(&mut self, f: impl FnOnce(&mut Value, &[u8]) -> R) -> Result<R, Invalidated> {
        let slot = self.map.slot(self.index);
        if slot.generation() != self.generation {
            return Err(Invalidated);
        }
        let mut st = slot.write_state();
        if slot.generation() != self.generation {
            return Err(Invalidated);
        }
        let old_members = match &st.value {
            Value::Group(g) => Some(g.snapshot()),
            _ => None,
        };
        let state = &mut *st;
        let r = f(&mut state.value, state.key.as_bytes());
        st.last_touch = Instant::now();
        self.generation = slot.bump_generation();
        let demoted = match (&st.value, old_members) {
            (Value::Group(_), _) => None,
            (_, members) => members,
        };
        drop(st);
        if let Some(members) = demoted {
            group::unlink_group_from_members(self.map, self.index, members);
        }
        Ok(r)
    }

    /// Copy of the slot's key.
    pub fn key(&self) -> Result<Vec<u8>, Invalidated> {
        self.read(|_, k| k.to_vec())
    }

    /// When the slot was last written.
    pub fn touched(&self) -> Result<Instant, Invalidated> {
        let slot = self.map.slot(self.index);
        let st = slot.read_state();
        if slot.generation() != self.generation {
            return Err(Invalidated);
        }
        Ok(st.last_touch)
    }

    /// The slot's time-to-live. Zero means no expiry. The core only
    /// stores this; enforcing expiry is the caller's concern.
    pub fn ttl(&self) -> Result<Duration, Invalidated> {
        let slot = self.map.slot(self.index);
        let st = slot.read_state();
        if slot.generation() != self.generation {
            return Err(Invalidated);
        }
        Ok(st.ttl)
    }

    /// Set the time-to-live. Metadata only: the generation does not
    /// advance, so outstanding handles stay valid.
    pub fn set_ttl(&self, ttl: Duration) -> Result<(), Invalidated> {
        let slot = self.map.slot(self.index);
        let mut st = slot.write_state();
        if slot.generation() != self.generation {
            return Err(Invalidated);
        }
        st.ttl = ttl;
        Ok(())
    }
}

impl fmt::Debug for SlotHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotHandle")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}
