//! Fixed-capacity open-addressing table with per-slot locks.

use core::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::group;
use crate::handle::SlotHandle;
use crate::hash::hash32;
use crate::slot::{Slot, MAX_KEY_LEN};
use crate::value::Value;

/// Smallest accepted table capacity.
pub const MIN_CAPACITY: usize = 2;
/// Largest accepted table capacity.
pub const MAX_CAPACITY: usize = 1 << 16;

/// Capacity was not a power of two inside `[MIN_CAPACITY, MAX_CAPACITY]`.
#[derive(Debug, Eq, PartialEq)]
pub struct BadCapacity(pub usize);

impl fmt::Display for BadCapacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "capacity {} is not a power of two in [{}, {}]",
            self.0, MIN_CAPACITY, MAX_CAPACITY
        )
    }
}

impl std::error::Error for BadCapacity {}

/// Error from [`SlotMap::insert`].
#[derive(Debug, Eq, PartialEq)]
pub enum InsertError {
    /// Every slot along the probe path is taken by another key.
    TableFull,
    /// The empty key is the vacancy sentinel and cannot be stored.
    EmptyKey,
    /// Key longer than [`MAX_KEY_LEN`].
    KeyTooLong,
}

impl fmt::Display for InsertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsertError::TableFull => f.write_str("no free slot along the probe path"),
            InsertError::EmptyKey => f.write_str("the empty key is reserved for vacant slots"),
            InsertError::KeyTooLong => write!(f, "key exceeds {} bytes", MAX_KEY_LEN),
        }
    }
}

impl std::error::Error for InsertError {}

/// Where a probe walk ended.
enum Probe {
    /// Slot holding the probed key, with the generation observed while
    /// the key still matched.
    Match { idx: usize, generation: u16 },
    /// First vacant slot on the path; the key is not in the table.
    Vacant(usize),
    /// The whole path is occupied by other keys.
    Exhausted,
}

/// Fixed-capacity table of [`Slot`]s addressed by byte keys.
///
/// The slot array is allocated once at construction and never moves or
/// grows; table operations themselves allocate nothing. Callers get
/// [`SlotHandle`]s and go through their locked, generation-checked
/// accessors to reach values. All operations take `&self`; per-slot
/// writes serialize on the slot's own lock.
pub struct SlotMap {
    slots: Box<[Slot]>,
    mask: usize,
    occupied: AtomicUsize,
}

impl SlotMap {
    /// Build a table with `capacity` slots, all vacant. The capacity is
    /// fixed for the table's lifetime and must be a power of two in
    /// `[MIN_CAPACITY, MAX_CAPACITY]`.
    pub fn with_capacity(capacity: usize) -> Result<Self, BadCapacity> {
        if !capacity.is_power_of_two() || !(MIN_CAPACITY..=MAX_CAPACITY).contains(&capacity) {
            return Err(BadCapacity(capacity));
        }
        let now = Instant::now();
        let slots: Box<[Slot]> = (0..capacity).map(|_| Slot::new(now)).collect();
        Ok(Self {
            slots,
            mask: capacity - 1,
            occupied: AtomicUsize::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Occupied slot count. Maintained with relaxed atomics; advisory
    /// only, callers must not derive correctness from it.
    pub fn load(&self) -> usize {
        self.occupied.load(Ordering::Relaxed)
    }

    pub(crate) fn slot(&self, idx: usize) -> &Slot {
        &self.slots[idx]
    }

    /// Probe order for `key`: the quadratic walk `(H + a + 3a²) mod N`
    /// for N attempts, then a linear sweep from the home bucket. The
    /// quadratic offsets `a + 3a²` are even for every `a`, so on a
    /// power-of-two table that phase alone reaches at most half the
    /// slots; the linear phase guarantees the remainder is covered and
    /// a non-full table always terminates a probe.
    fn probe_order(&self, key: &[u8]) -> impl Iterator<Item = usize> + '_ {
        let n = self.slots.len() as u64;
        let mask = self.mask as u64;
        let home = hash32(key) as u64;
        let quad = (0..n).map(move |a| ((home + a + 3 * a * a) & mask) as usize);
        let linear = (0..n).map(move |a| ((home + a) & mask) as usize);
        quad.chain(linear)
    }

    fn probe_for(&self, key: &[u8]) -> Probe {
        for idx in self.probe_order(key) {
            let slot = &self.slots[idx];
            let st = slot.read_state();
            if st.key.is_empty() {
                return Probe::Vacant(idx);
            }
            if st.key.as_bytes() == key {
                // Generation read while the read lock pins the key.
                return Probe::Match {
                    idx,
                    generation: slot.generation(),
                };
            }
        }
        Probe::Exhausted
    }

    /// Find `key` and return a handle bound to its slot and current
    /// generation. No lock is held on return; a later mutation of the
    /// slot turns the handle stale rather than dangling.
    pub fn lookup(&self, key: &[u8]) -> Option<SlotHandle<'_>> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return None;
        }
        match self.probe_for(key) {
            Probe::Match { idx, generation } => Some(SlotHandle::new(self, idx, generation)),
            _ => None,
        }
    }

    /// Insert or overwrite `key`. Overwriting runs the group unlink
    /// passes for whatever the slot held before, then advances the
    /// generation, so previously issued handles turn stale.
    pub fn insert(&self, key: &[u8], value: Value) -> Result<SlotHandle<'_>, InsertError> {
        if key.is_empty() {
            return Err(InsertError::EmptyKey);
        }
        if key.len() > MAX_KEY_LEN {
            return Err(InsertError::KeyTooLong);
        }
        let mut value = Some(value);
        loop {
            match self.probe_for(key) {
                Probe::Exhausted => return Err(InsertError::TableFull),
                Probe::Match { idx, .. } => {
                    let slot = &self.slots[idx];
                    let mut st = slot.write_state();
                    if st.key.as_bytes() != key {
                        // Slot changed between probe and lock; re-probe.
                        continue;
                    }
                    let old_backrefs: Vec<_> = st.backrefs.drain().collect();
                    let old_members = match &st.value {
                        Value::Group(g) => Some(g.snapshot()),
                        _ => None,
                    };
                    st.value = value.take().unwrap_or_default();
                    st.last_touch = Instant::now();
                    let generation = slot.bump_generation();
                    drop(st);
                    group::unlink_member_from_groups(self, idx, old_backrefs);
                    if let Some(members) = old_members {
                        group::unlink_group_from_members(self, idx, members);
                    }
                    return Ok(SlotHandle::new(self, idx, generation));
                }
                Probe::Vacant(idx) => {
                    let slot = &self.slots[idx];
                    let mut st = slot.write_state();
                    if !st.key.is_empty() {
                        // Lost the slot to a concurrent insert; re-probe.
                        continue;
                    }
                    st.key.set(key);
                    st.value = value.take().unwrap_or_default();
                    st.last_touch = Instant::now();
                    st.ttl = Duration::ZERO;
                    let generation = slot.bump_generation();
                    drop(st);
                    self.occupied.fetch_add(1, Ordering::Relaxed);
                    return Ok(SlotHandle::new(self, idx, generation));
                }
            }
        }
    }

    /// Remove `key` if present: unlink its group references, reset the
    /// slot to vacant, advance the generation, and close any probe-path
    /// gap the vacancy opened. Removing an absent key is a no-op.
    pub fn remove(&self, key: &[u8]) {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return;
        }
        loop {
            match self.probe_for(key) {
                Probe::Match { idx, .. } => {
                    let slot = &self.slots[idx];
                    let mut st = slot.write_state();
                    if st.key.as_bytes() != key {
                        continue;
                    }
                    let old_backrefs: Vec<_> = st.backrefs.drain().collect();
                    let old_members = match &st.value {
                        Value::Group(g) => Some(g.snapshot()),
                        _ => None,
                    };
                    st.key.clear();
                    st.value = Value::default();
                    st.last_touch = Instant::now();
                    st.ttl = Duration::ZERO;
                    slot.bump_generation();
                    drop(st);
                    self.occupied.fetch_sub(1, Ordering::Relaxed);
                    group::unlink_member_from_groups(self, idx, old_backrefs);
                    if let Some(members) = old_members {
                        group::unlink_group_from_members(self, idx, members);
                    }
                    self.reseat();
                    return;
                }
                _ => return,
            }
        }
    }

    /// Handles for every occupied slot, in physical slot order. The
    /// iterator locks one slot at a time while stepping and holds
    /// nothing between steps, so yielded handles may already be stale
    /// by the time they are used.
    pub fn iter(&self) -> Iter<'_> {
        Iter { map: self, idx: 0 }
    }

    /// Close probe-path gaps: re-probe every occupied slot's key and
    /// move it back into the first vacant slot its own probe order
    /// reaches before its current position. Runs to fixpoint because a
    /// move can vacate a slot some other key probes through.
    fn reseat(&self) {
        loop {
            let mut moved = false;
            for idx in 0..self.slots.len() {
                let slot = &self.slots[idx];
                let key = {
                    let st = slot.read_state();
                    if st.key.is_empty() {
                        continue;
                    }
                    st.key
                };
                if let Some(dest) = self.earlier_seat(key.as_bytes(), idx) {
                    if self.relocate(idx, dest, key.as_bytes()) {
                        moved = true;
                    }
                }
            }
            if !moved {
                return;
            }
        }
    }

    /// First vacant slot in `key`'s probe order, if it comes before
    /// `current`. `None` means the key is already optimally seated.
    fn earlier_seat(&self, key: &[u8], current: usize) -> Option<usize> {
        for idx in self.probe_order(key) {
            if idx == current {
                return None;
            }
            if self.slots[idx].read_state().key.is_empty() {
                return Some(idx);
            }
        }
        None
    }

    /// Move the occupant of `from` into the vacant `to`. Takes both
    /// write locks in ascending index order, re-validates, and advances
    /// both generations. Group links naming the old position are
    /// re-pointed afterwards, one slot lock at a time.
    fn relocate(&self, from: usize, to: usize, key: &[u8]) -> bool {
        debug_assert_ne!(from, to);
        let (lo, hi) = if from < to { (from, to) } else { (to, from) };
        let lo_guard = self.slots[lo].write_state();
        let hi_guard = self.slots[hi].write_state();
        let (mut src, mut dst) = if from < to {
            (lo_guard, hi_guard)
        } else {
            (hi_guard, lo_guard)
        };
        if src.key.as_bytes() != key || !dst.key.is_empty() {
            return false;
        }
        let old_gen = self.slots[from].generation();
        dst.key = src.key;
        dst.value = core::mem::take(&mut src.value);
        dst.backrefs = core::mem::take(&mut src.backrefs);
        dst.last_touch = src.last_touch;
        dst.ttl = src.ttl;
        src.key.clear();
        src.ttl = Duration::ZERO;
        let backrefs: Vec<_> = dst.backrefs.iter().copied().collect();
        let members = match &dst.value {
            Value::Group(g) => Some(g.snapshot()),
            _ => None,
        };
        self.slots[from].bump_generation();
        let new_gen = self.slots[to].bump_generation();
        drop(src);
        drop(dst);
        group::repoint_member_in_groups(self, from, old_gen, to, new_gen, backrefs);
        if let Some(members) = members {
            group::repoint_group_in_members(self, from, old_gen, to, new_gen, members);
        }
        true
    }
}

/// Iterator over occupied slots. See [`SlotMap::iter`].
pub struct Iter<'m> {
    map: &'m SlotMap,
    idx: usize,
}

impl<'m> Iterator for Iter<'m> {
    type Item = SlotHandle<'m>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.idx < self.map.slots.len() {
            let idx = self.idx;
            self.idx += 1;
            let slot = &self.map.slots[idx];
            let st = slot.read_state();
            if !st.key.is_empty() {
                let generation = slot.generation();
                drop(st);
                return Some(SlotHandle::new(self.map, idx, generation));
            }
        }
        None
    }
}
