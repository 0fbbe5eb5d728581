//! Group linkage: bi-directional slot references validated by generation.
//!
//! A group's member set and each member's back-reference set store
//! `SlotRef`s, an index plus the generation captured at link time. The
//! two directions are maintained best-effort: the triggering write never
//! blocks on the whole linkage, and every reader re-validates a
//! reference against the referent's current generation before exposing
//! it. Maintenance passes take one slot lock at a time, in ascending
//! index order, and never run user code under a lock.

use core::fmt;

use crate::handle::SlotHandle;
use crate::slot_map::SlotMap;
use crate::value::{Kind, Value};

/// Reference to one slot occupancy. Stale the moment the slot's
/// generation moves past the captured one.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) struct SlotRef {
    pub(crate) index: usize,
    pub(crate) generation: u16,
}

/// Error from a group linkage operation.
#[derive(Debug, Eq, PartialEq)]
pub enum GroupError {
    /// The group or member handle no longer matches its slot.
    Invalidated,
    /// The receiving handle's slot does not hold a group.
    WrongKind { found: Kind },
}

impl fmt::Display for GroupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupError::Invalidated => f.write_str("slot changed since the handle was taken"),
            GroupError::WrongKind { found } => {
                write!(f, "wrong kind: expected group, found {}", found)
            }
        }
    }
}

impl std::error::Error for GroupError {}

/// Iterator over a membership snapshot. Yields one handle per stored
/// reference; the generation captured at link time travels with the
/// handle, so a stale reference surfaces as `Invalidated` on first use
/// instead of exposing the slot's new occupant.
pub struct GroupMembers<'m> {
    map: &'m SlotMap,
    refs: std::vec::IntoIter<SlotRef>,
}

impl<'m> Iterator for GroupMembers<'m> {
    type Item = SlotHandle<'m>;

    fn next(&mut self) -> Option<Self::Item> {
        self.refs
            .next()
            .map(|r| SlotHandle::new(self.map, r.index, r.generation))
    }
}

impl<'m> SlotHandle<'m> {
    /// Link `member` into this group and record the back reference on
    /// the member's slot. Both handles must still be current. Locks are
    /// taken in ascending slot-index order; a group may contain itself.
    pub fn group_add(&self, member: &SlotHandle<'m>) -> Result<(), GroupError> {
        let (gi, mi) = (self.index, member.index);
        if gi == mi {
            let slot = self.map.slot(gi);
            let mut st = slot.write_state();
            if slot.generation() != self.generation || self.generation != member.generation {
                return Err(GroupError::Invalidated);
            }
            let state = &mut *st;
            match &mut state.value {
                Value::Group(g) => {
                    g.members.insert(SlotRef {
                        index: mi,
                        generation: member.generation,
                    });
                }
                other => {
                    return Err(GroupError::WrongKind {
                        found: other.kind(),
                    })
                }
            }
            state.backrefs.insert(SlotRef {
                index: gi,
                generation: self.generation,
            });
            return Ok(());
        }

        let (lo, hi) = if gi < mi { (gi, mi) } else { (mi, gi) };
        let lo_guard = self.map.slot(lo).write_state();
        let hi_guard = self.map.slot(hi).write_state();
        let (mut gst, mut mst) = if gi < mi {
            (lo_guard, hi_guard)
        } else {
            (hi_guard, lo_guard)
        };
        if self.map.slot(gi).generation() != self.generation
            || self.map.slot(mi).generation() != member.generation
        {
            return Err(GroupError::Invalidated);
        }
        let g = match &mut gst.value {
            Value::Group(g) => g,
            other => {
                return Err(GroupError::WrongKind {
                    found: other.kind(),
                })
            }
        };
        g.members.insert(SlotRef {
            index: mi,
            generation: member.generation,
        });
        mst.backrefs.insert(SlotRef {
            index: gi,
            generation: self.generation,
        });
        Ok(())
    }

    /// Unlink `member` from this group: the forward reference and the
    /// member's back reference both go, along with any stale leftovers
    /// naming the same slots.
    pub fn group_remove(&self, member: &SlotHandle<'m>) -> Result<(), GroupError> {
        let (gi, mi) = (self.index, member.index);
        if gi == mi {
            let slot = self.map.slot(gi);
            let mut st = slot.write_state();
            if slot.generation() != self.generation || self.generation != member.generation {
                return Err(GroupError::Invalidated);
            }
            let state = &mut *st;
            match &mut state.value {
                Value::Group(g) => {
                    g.members.retain(|r| r.index != mi);
                }
                other => {
                    return Err(GroupError::WrongKind {
                        found: other.kind(),
                    })
                }
            }
            state.backrefs.retain(|r| r.index != gi);
            return Ok(());
        }

        let (lo, hi) = if gi < mi { (gi, mi) } else { (mi, gi) };
        let lo_guard = self.map.slot(lo).write_state();
        let hi_guard = self.map.slot(hi).write_state();
        let (mut gst, mut mst) = if gi < mi {
            (lo_guard, hi_guard)
        } else {
            (hi_guard, lo_guard)
        };
        if self.map.slot(gi).generation() != self.generation
            || self.map.slot(mi).generation() != member.generation
        {
            return Err(GroupError::Invalidated);
        }
        match &mut gst.value {
            Value::Group(g) => {
                g.members.retain(|r| r.index != mi);
            }
            other => {
                return Err(GroupError::WrongKind {
                    found: other.kind(),
                })
            }
        }
        mst.backrefs.retain(|r| r.index != gi);
        Ok(())
    }

    /// Snapshot the membership and return a lazy iterator of handles.
    /// Entries whose referent moved on since link time yield handles
    /// that report `Invalidated` when used.
    pub fn group_members(&self) -> Result<GroupMembers<'m>, GroupError> {
        let slot = self.map.slot(self.index);
        let st = slot.read_state();
        if slot.generation() != self.generation {
            return Err(GroupError::Invalidated);
        }
        let refs = match &st.value {
            Value::Group(g) => g.snapshot(),
            other => {
                return Err(GroupError::WrongKind {
                    found: other.kind(),
                })
            }
        };
        Ok(GroupMembers {
            map: self.map,
            refs: refs.into_iter(),
        })
    }
}

/// A member at `member_idx` was removed or overwritten: visit each group
/// its back references name and drop forward entries for that index that
/// no longer match the slot's current generation. A back reference whose
/// own generation check fails is skipped; that group was itself
/// rewritten and its stored reference is already observably stale.
pub(crate) fn unlink_member_from_groups(
    map: &SlotMap,
    member_idx: usize,
    mut backrefs: Vec<SlotRef>,
) {
    backrefs.sort_unstable_by_key(|r| r.index);
    for r in backrefs {
        let slot = map.slot(r.index);
        let mut st = slot.write_state();
        if slot.generation() != r.generation {
            continue;
        }
        if let Value::Group(g) = &mut st.value {
            let live = map.slot(member_idx).generation();
            g.members.retain(|m| m.index != member_idx || m.generation == live);
        }
    }
}

/// A group at `group_idx` was removed or overwritten into a non-group:
/// visit each member it referenced and drop back references for that
/// index that no longer match the slot's current generation.
pub(crate) fn unlink_group_from_members(
    map: &SlotMap,
    group_idx: usize,
    mut members: Vec<SlotRef>,
) {
    members.sort_unstable_by_key(|r| r.index);
    for r in members {
        let slot = map.slot(r.index);
        let mut st = slot.write_state();
        if slot.generation() != r.generation {
            continue;
        }
        let live = map.slot(group_idx).generation();
        st.backrefs.retain(|b| b.index != group_idx || b.generation == live);
    }
}

/// A compaction move carried the occupant of `from` to `to`: rewrite
/// links in referencing groups so membership survives the move. A link
/// set naming `from` itself (self-membership) is looked up at `to`,
/// where the moved state now lives.
pub(crate) fn repoint_member_in_groups(
    map: &SlotMap,
    from: usize,
    old_gen: u16,
    to: usize,
    new_gen: u16,
    mut backrefs: Vec<SlotRef>,
) {
    backrefs.sort_unstable_by_key(|r| r.index);
    for r in backrefs {
        let (g_idx, g_gen) = if r.index == from {
            (to, new_gen)
        } else {
            (r.index, r.generation)
        };
        let slot = map.slot(g_idx);
        let mut st = slot.write_state();
        if slot.generation() != g_gen {
            continue;
        }
        if let Value::Group(g) = &mut st.value {
            if g.members.remove(&SlotRef {
                index: from,
                generation: old_gen,
            }) {
                g.members.insert(SlotRef {
                    index: to,
                    generation: new_gen,
                });
            }
        }
    }
}

/// Mirror of [`repoint_member_in_groups`] for a moved group: rewrite the
/// back references its members hold.
pub(crate) fn repoint_group_in_members(
    map: &SlotMap,
    from: usize,
    old_gen: u16,
    to: usize,
    new_gen: u16,
    mut members: Vec<SlotRef>,
) {
    members.sort_unstable_by_key(|r| r.index);
    for r in members {
        let (m_idx, m_gen) = if r.index == from {
            (to, new_gen)
        } else {
            (r.index, r.generation)
        };
        let slot = map.slot(m_idx);
        let mut st = slot.write_state();
        if slot.generation() != m_gen {
            continue;
        }
        if st.backrefs.remove(&SlotRef {
            index: from,
            generation: old_gen,
        }) {
            st.backrefs.insert(SlotRef {
                index: to,
                generation: new_gen,
            });
        }
    }
}
