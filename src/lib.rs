//! slotcache: a fixed-capacity, open-addressing slot table with
//! generation-checked handles.
//!
//! The table is built once at a power-of-two capacity and never grows;
//! values (byte blobs, wrapping counters, member groups) live inlined in
//! preallocated slots. Callers address slots through [`SlotHandle`]s,
//! short-lived cursors that take the slot's reader/writer lock, re-check
//! a captured generation, and scope value access to a callback, so no
//! reference into a slot can outlive a concurrent rewrite.
//!
//! ```
//! use slotcache::{SlotMap, Value};
//!
//! let map = SlotMap::with_capacity(8).unwrap();
//! map.insert(b"hits", Value::count(0)).unwrap();
//!
//! let mut h = map.lookup(b"hits").unwrap();
//! let n = h.write(|v, _key| v.incr(3).unwrap()).unwrap();
//! assert_eq!(n, 3);
//! ```

mod group;
mod handle;
mod hash;
mod slot;
mod slot_map;
mod value;

#[cfg(test)]
mod slot_map_proptest;

pub use group::{GroupError, GroupMembers};
pub use handle::{Invalidated, SlotHandle};
pub use hash::hash32;
pub use slot::MAX_KEY_LEN;
pub use slot_map::{BadCapacity, InsertError, Iter, SlotMap, MAX_CAPACITY, MIN_CAPACITY};
pub use value::{BlobValue, GroupValue, Kind, Value, ValueError, BLOB_MAX, BLOB_QUICK_CAP};
