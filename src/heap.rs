//! Host-side value table.
//!
//! Module code cannot hold host values, so the host keeps them in this table
//! and hands the module integer keys instead. The first [`RESERVED_SLOTS`]
//! entries hold constants and are never recycled; the rest are reused
//! through a free list threaded through the vacant entries themselves.
//!
//! Keys carry a generation next to the slot index. A slot's generation is
//! bumped every time it is freed, so a key that outlived its value is
//! rejected instead of silently aliasing whatever reused the slot. A slot
//! whose generation is exhausted is retired instead of wrapping back to 0.

use crate::error::{BridgeError, Result};
use tracing::debug;

/// Number of slots in the reserved sentinel region
pub const RESERVED_SLOTS: u32 = 36;

const INDEX_BITS: u32 = 20;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const GENERATION_MASK: u32 = (1 << (32 - INDEX_BITS)) - 1;

/// Host value stored in the table
#[derive(Debug, Clone, PartialEq, Default)]
pub enum HostValue {
    /// Absence of a value
    #[default]
    Undefined,
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// Decoded structured value
    Json(serde_json::Value),
}

impl HostValue {
    /// Check if value is undefined
    pub fn is_undefined(&self) -> bool {
        matches!(self, HostValue::Undefined)
    }

    /// Check if value is null
    pub fn is_null(&self) -> bool {
        matches!(self, HostValue::Null)
    }

    /// Get as boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as structured value
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            HostValue::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Convert into a JSON value (undefined becomes null)
    pub fn into_json(self) -> serde_json::Value {
        match self {
            HostValue::Undefined | HostValue::Null => serde_json::Value::Null,
            HostValue::Bool(b) => serde_json::Value::Bool(b),
            HostValue::Json(value) => value,
        }
    }
}

impl From<serde_json::Value> for HostValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => HostValue::Null,
            serde_json::Value::Bool(b) => HostValue::Bool(b),
            other => HostValue::Json(other),
        }
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        HostValue::Bool(b)
    }
}

/// Key into the heap table: slot index plus generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey(u32);

impl SlotKey {
    /// The constant `undefined`
    pub const UNDEFINED: SlotKey = SlotKey(32);
    /// The constant `null`
    pub const NULL: SlotKey = SlotKey(33);
    /// The constant `true`
    pub const TRUE: SlotKey = SlotKey(34);
    /// The constant `false`
    pub const FALSE: SlotKey = SlotKey(35);

    /// Largest slot index a key can address
    pub const MAX_INDEX: u32 = INDEX_MASK;

    fn new(index: u32, generation: u32) -> Self {
        SlotKey((generation & GENERATION_MASK) << INDEX_BITS | (index & INDEX_MASK))
    }

    /// Reinterpret an integer received from the module
    pub fn from_raw(raw: u32) -> Self {
        SlotKey(raw)
    }

    /// Integer handed to the module
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Slot index
    pub fn index(self) -> u32 {
        self.0 & INDEX_MASK
    }

    /// Slot generation
    pub fn generation(self) -> u32 {
        self.0 >> INDEX_BITS
    }

    /// Whether the key addresses the reserved sentinel region
    pub fn is_reserved(self) -> bool {
        self.index() < RESERVED_SLOTS
    }
}

impl std::fmt::Display for SlotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.index(), self.generation())
    }
}

#[derive(Debug)]
enum Entry {
    Occupied { value: HostValue, generation: u32 },
    Vacant { next: u32, generation: u32 },
    /// Generation space exhausted; never handed out again
    Retired,
}

/// Slot table of host values
#[derive(Debug)]
pub struct HeapTable {
    entries: Vec<Entry>,
    /// Head of the free list; equal to `entries.len()` when the list is empty
    free_head: u32,
}

impl Default for HeapTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapTable {
    /// Create a table holding only the sentinel region
    pub fn new() -> Self {
        let mut entries = Vec::with_capacity(RESERVED_SLOTS as usize * 2);
        entries.resize_with(SlotKey::UNDEFINED.index() as usize, || Entry::Occupied {
            value: HostValue::Undefined,
            generation: 0,
        });
        for value in [
            HostValue::Undefined,
            HostValue::Null,
            HostValue::Bool(true),
            HostValue::Bool(false),
        ] {
            entries.push(Entry::Occupied {
                value,
                generation: 0,
            });
        }

        Self {
            entries,
            free_head: RESERVED_SLOTS,
        }
    }

    /// Store a value and return its key
    pub fn add(&mut self, value: HostValue) -> Result<SlotKey> {
        let len = self.entries.len() as u32;
        if self.free_head == len {
            if len > SlotKey::MAX_INDEX {
                return Err(BridgeError::AllocationFailure(format!(
                    "heap table is full ({} slots)",
                    len
                )));
            }
            self.entries.push(Entry::Vacant {
                next: len + 1,
                generation: 0,
            });
        }

        let index = self.free_head;
        let slot = &mut self.entries[index as usize];
        let (next, generation) = match slot {
            Entry::Vacant { next, generation } => (*next, *generation),
            Entry::Occupied { .. } | Entry::Retired => {
                return Err(BridgeError::SlotMisuse {
                    slot: index,
                    reason: "is on the free list but not vacant",
                })
            }
        };
        *slot = Entry::Occupied { value, generation };
        self.free_head = next;

        Ok(SlotKey::new(index, generation))
    }

    fn check(&self, key: SlotKey) -> Result<usize> {
        let index = key.index() as usize;
        match self.entries.get(index) {
            Some(Entry::Occupied { generation, .. }) if *generation == key.generation() => {
                Ok(index)
            }
            Some(Entry::Occupied { .. }) => Err(BridgeError::SlotMisuse {
                slot: key.raw(),
                reason: "is stale (slot was freed and reused)",
            }),
            Some(Entry::Vacant { .. }) => Err(BridgeError::SlotMisuse {
                slot: key.raw(),
                reason: "is not occupied",
            }),
            Some(Entry::Retired) => Err(BridgeError::SlotMisuse {
                slot: key.raw(),
                reason: "is stale (slot was retired)",
            }),
            None => Err(BridgeError::SlotMisuse {
                slot: key.raw(),
                reason: "was never assigned",
            }),
        }
    }

    /// Borrow the value behind a key
    pub fn get(&self, key: SlotKey) -> Result<&HostValue> {
        let index = self.check(key)?;
        match &self.entries[index] {
            Entry::Occupied { value, .. } => Ok(value),
            Entry::Vacant { .. } | Entry::Retired => Err(BridgeError::SlotMisuse {
                slot: key.raw(),
                reason: "is not occupied",
            }),
        }
    }

    /// Remove the value behind a key and free its slot.
    ///
    /// Sentinel slots are never freed; taking one returns a copy.
    pub fn take(&mut self, key: SlotKey) -> Result<HostValue> {
        let index = self.check(key)?;
        if key.is_reserved() {
            return self.get(key).cloned();
        }

        let generation = key.generation();
        let exhausted = generation == GENERATION_MASK;
        let freed = if exhausted {
            Entry::Retired
        } else {
            Entry::Vacant {
                next: self.free_head,
                generation: generation + 1,
            }
        };
        match std::mem::replace(&mut self.entries[index], freed) {
            Entry::Occupied { value, .. } => {
                if exhausted {
                    debug!(slot = index, "Heap slot retired");
                } else {
                    self.free_head = index as u32;
                }
                Ok(value)
            }
            Entry::Vacant { .. } | Entry::Retired => Err(BridgeError::SlotMisuse {
                slot: key.raw(),
                reason: "is not occupied",
            }),
        }
    }

    /// Free a slot without returning its value
    pub fn drop_slot(&mut self, key: SlotKey) -> Result<()> {
        self.take(key).map(|_| ())
    }

    /// Number of occupied slots outside the sentinel region
    pub fn live_count(&self) -> usize {
        self.entries[RESERVED_SLOTS as usize..]
            .iter()
            .filter(|entry| matches!(entry, Entry::Occupied { .. }))
            .count()
    }

    /// Number of slots retired after exhausting their generations
    pub fn retired_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry, Entry::Retired))
            .count()
    }

    /// Total number of slots, including the sentinel region
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}
