//! Views over the module's linear memory.
//!
//! Linear memory can be grown (and therefore relocated) by any call into the
//! module. Every buffer carries a [`MemoryGeneration`] that changes whenever
//! that happens; views are tagged with the generation they were derived at
//! and [`MemoryViews`] re-derives them as soon as the generation moves.
//!
//! Live views borrow the memory, so the borrow checker already prevents
//! holding one across a call that may allocate. A [`ViewStamp`] records the
//! generation of a view without borrowing and can be checked later.

use crate::error::{BridgeError, Result};
use std::ops::Range;
use tracing::trace;

/// Identity version of a linear memory buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MemoryGeneration(u64);

impl MemoryGeneration {
    /// Generation of a freshly created buffer
    pub const INITIAL: MemoryGeneration = MemoryGeneration(0);

    /// Raw counter value
    pub fn get(self) -> u64 {
        self.0
    }

    /// The generation that follows this one
    pub fn next(self) -> Self {
        MemoryGeneration(self.0 + 1)
    }
}

impl std::fmt::Display for MemoryGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A module's linear memory
pub trait LinearMemory {
    /// Current contents
    fn bytes(&self) -> &[u8];

    /// Current contents, mutable
    fn bytes_mut(&mut self) -> &mut [u8];

    /// Current identity version
    fn generation(&self) -> MemoryGeneration;

    /// Current size in bytes
    fn size(&self) -> usize {
        self.bytes().len()
    }
}

/// Derives generations from buffer identity.
///
/// For engines that do not version their memory, the base address and length
/// of the buffer stand in for its identity.
#[derive(Debug, Default)]
pub struct GenerationTracker {
    identity: Option<(usize, usize)>,
    generation: MemoryGeneration,
}

impl GenerationTracker {
    /// Create a tracker that has not observed any buffer yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe the buffer, bumping the generation if its identity changed
    pub fn observe(&mut self, bytes: &[u8]) -> MemoryGeneration {
        let identity = (bytes.as_ptr() as usize, bytes.len());
        match self.identity {
            Some(previous) if previous == identity => {}
            Some(_) => {
                self.identity = Some(identity);
                self.generation = self.generation.next();
            }
            None => self.identity = Some(identity),
        }
        self.generation
    }

    /// Last observed generation
    pub fn current(&self) -> MemoryGeneration {
        self.generation
    }
}

fn checked_range(ptr: u32, len: u32, memory_len: usize) -> Result<Range<usize>> {
    let start = ptr as usize;
    match start.checked_add(len as usize) {
        Some(end) if end <= memory_len => Ok(start..end),
        _ => Err(BridgeError::out_of_bounds(ptr as u64, len as u64, memory_len)),
    }
}

/// Generation recorded from a view, detached from the memory borrow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewStamp {
    generation: MemoryGeneration,
}

impl ViewStamp {
    /// Generation the stamp was taken at
    pub fn generation(&self) -> MemoryGeneration {
        self.generation
    }

    /// Whether the memory still has the stamped identity
    pub fn is_current<M: LinearMemory + ?Sized>(&self, memory: &M) -> bool {
        memory.generation() == self.generation
    }

    /// Fail with [`BridgeError::StaleView`] if the memory moved since the stamp
    pub fn ensure_current<M: LinearMemory + ?Sized>(&self, memory: &M) -> Result<()> {
        let current = memory.generation();
        if current == self.generation {
            Ok(())
        } else {
            Err(BridgeError::StaleView {
                captured: self.generation.get(),
                current: current.get(),
            })
        }
    }
}

/// Byte-addressable, read-only window over linear memory
#[derive(Debug, Clone, Copy)]
pub struct ByteView<'m> {
    bytes: &'m [u8],
    generation: MemoryGeneration,
}

impl<'m> ByteView<'m> {
    /// Wrap a buffer observed at `generation`
    pub fn new(bytes: &'m [u8], generation: MemoryGeneration) -> Self {
        Self { bytes, generation }
    }

    /// Generation this view was derived at
    pub fn generation(&self) -> MemoryGeneration {
        self.generation
    }

    /// Detached stamp of this view
    pub fn stamp(&self) -> ViewStamp {
        ViewStamp {
            generation: self.generation,
        }
    }

    /// Size of the underlying memory
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the memory is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bounds-checked sub-slice `[ptr, ptr + len)`
    pub fn slice(&self, ptr: u32, len: u32) -> Result<&'m [u8]> {
        let range = checked_range(ptr, len, self.bytes.len())?;
        Ok(&self.bytes[range])
    }
}

/// Byte-addressable, writable window over linear memory
#[derive(Debug)]
pub struct ByteViewMut<'m> {
    bytes: &'m mut [u8],
    generation: MemoryGeneration,
}

impl<'m> ByteViewMut<'m> {
    /// Wrap a buffer observed at `generation`
    pub fn new(bytes: &'m mut [u8], generation: MemoryGeneration) -> Self {
        Self { bytes, generation }
    }

    /// Generation this view was derived at
    pub fn generation(&self) -> MemoryGeneration {
        self.generation
    }

    /// Bounds-checked mutable sub-slice `[ptr, ptr + len)`
    pub fn slice_mut(&mut self, ptr: u32, len: u32) -> Result<&mut [u8]> {
        let range = checked_range(ptr, len, self.bytes.len())?;
        Ok(&mut self.bytes[range])
    }

    /// Copy `data` into memory at `ptr`
    pub fn write(&mut self, ptr: u32, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len())
            .map_err(|_| BridgeError::out_of_bounds(ptr as u64, data.len() as u64, self.bytes.len()))?;
        self.slice_mut(ptr, len)?.copy_from_slice(data);
        Ok(())
    }

    /// Store a little-endian 32-bit word at `ptr`
    pub fn write_u32(&mut self, ptr: u32, value: u32) -> Result<()> {
        self.write(ptr, &value.to_le_bytes())
    }
}

/// Word-addressable (32-bit, little-endian) window over linear memory
#[derive(Debug, Clone, Copy)]
pub struct WordView<'m> {
    bytes: &'m [u8],
    generation: MemoryGeneration,
}

impl<'m> WordView<'m> {
    /// Wrap a buffer observed at `generation`
    pub fn new(bytes: &'m [u8], generation: MemoryGeneration) -> Self {
        Self { bytes, generation }
    }

    /// Generation this view was derived at
    pub fn generation(&self) -> MemoryGeneration {
        self.generation
    }

    /// Number of whole words in memory
    pub fn len(&self) -> usize {
        self.bytes.len() / 4
    }

    /// Whether memory holds no whole word
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Word at word index `index`
    pub fn get(&self, index: u32) -> Result<i32> {
        let offset = index
            .checked_mul(4)
            .ok_or_else(|| BridgeError::out_of_bounds(index as u64 * 4, 4, self.bytes.len()))?;
        self.read_i32(offset)
    }

    /// Word at 4-byte aligned byte offset `offset`
    pub fn read_i32(&self, offset: u32) -> Result<i32> {
        if offset % 4 != 0 {
            return Err(BridgeError::out_of_bounds(offset as u64, 4, self.bytes.len()));
        }
        let range = checked_range(offset, 4, self.bytes.len())?;
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.bytes[range]);
        Ok(i32::from_le_bytes(word))
    }

    /// Two consecutive words starting at `offset`, as unsigned values
    pub fn read_pair(&self, offset: u32) -> Result<(u32, u32)> {
        let second = offset
            .checked_add(4)
            .ok_or_else(|| BridgeError::out_of_bounds(offset as u64, 8, self.bytes.len()))?;
        Ok((self.read_i32(offset)? as u32, self.read_i32(second)? as u32))
    }
}

/// Cache of the last observed memory generation.
///
/// Every accessor compares the buffer's current generation with the cached
/// one and refreshes on mismatch, so a view handed out is always derived
/// from the buffer as it is now.
#[derive(Debug, Default)]
pub struct MemoryViews {
    observed: Option<MemoryGeneration>,
    refreshes: u64,
}

impl MemoryViews {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    fn observe(&mut self, generation: MemoryGeneration) {
        if self.observed != Some(generation) {
            if let Some(previous) = self.observed {
                trace!(from = %previous, to = %generation, "Memory relocated, refreshing views");
            }
            self.observed = Some(generation);
            self.refreshes += 1;
        }
    }

    /// Byte view over the current buffer
    pub fn bytes<'m, M: LinearMemory + ?Sized>(&mut self, memory: &'m M) -> ByteView<'m> {
        let generation = memory.generation();
        self.observe(generation);
        ByteView::new(memory.bytes(), generation)
    }

    /// Writable byte view over the current buffer
    pub fn bytes_mut<'m, M: LinearMemory + ?Sized>(&mut self, memory: &'m mut M) -> ByteViewMut<'m> {
        let generation = memory.generation();
        self.observe(generation);
        ByteViewMut::new(memory.bytes_mut(), generation)
    }

    /// Word view over the current buffer
    pub fn words<'m, M: LinearMemory + ?Sized>(&mut self, memory: &'m M) -> WordView<'m> {
        let generation = memory.generation();
        self.observe(generation);
        WordView::new(memory.bytes(), generation)
    }

    /// Last observed generation
    pub fn observed(&self) -> Option<MemoryGeneration> {
        self.observed
    }

    /// How many times the views were re-derived
    pub fn refreshes(&self) -> u64 {
        self.refreshes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Memory that relocates into a fresh buffer on every growth
    struct MovingMemory {
        bytes: Vec<u8>,
        generation: MemoryGeneration,
    }

    impl MovingMemory {
        fn new(size: usize) -> Self {
            Self {
                bytes: vec![0; size],
                generation: MemoryGeneration::INITIAL,
            }
        }

        fn grow(&mut self, extra: usize) {
            let mut next = vec![0; self.bytes.len() + extra];
            next[..self.bytes.len()].copy_from_slice(&self.bytes);
            self.bytes = next;
            self.generation = self.generation.next();
        }
    }

    impl LinearMemory for MovingMemory {
        fn bytes(&self) -> &[u8] {
            &self.bytes
        }

        fn bytes_mut(&mut self) -> &mut [u8] {
            &mut self.bytes
        }

        fn generation(&self) -> MemoryGeneration {
            self.generation
        }
    }

    #[test]
    fn test_views_refresh_after_growth() {
        let mut memory = MovingMemory::new(16);
        let mut views = MemoryViews::new();

        let stamp = views.bytes(&memory).stamp();
        assert_eq!(views.refreshes(), 1);
        views.bytes(&memory);
        assert_eq!(views.refreshes(), 1);

        memory.grow(64);
        assert!(!stamp.is_current(&memory));
        assert!(matches!(
            stamp.ensure_current(&memory),
            Err(BridgeError::StaleView { captured: 0, current: 1 })
        ));

        views.bytes_mut(&mut memory).write(70, b"late").unwrap();
        let fresh = views.bytes(&memory);
        assert_eq!(fresh.slice(70, 4).unwrap(), b"late");
        assert_eq!(fresh.generation(), MemoryGeneration(1));
        assert_eq!(views.refreshes(), 2);
    }

    #[test]
    fn test_out_of_bounds_is_an_error() {
        let memory = MovingMemory::new(8);
        let view = ByteView::new(memory.bytes(), memory.generation());
        assert!(view.slice(4, 4).is_ok());
        assert!(matches!(
            view.slice(6, 4),
            Err(BridgeError::MemoryAccess { offset: 6, len: 4, memory_len: 8 })
        ));
        assert!(view.slice(u32::MAX, 2).is_err());
    }

    #[test]
    fn test_word_view_reads_little_endian_pairs() {
        let mut memory = MovingMemory::new(16);
        let mut views = MemoryViews::new();
        {
            let mut bytes = views.bytes_mut(&mut memory);
            bytes.write_u32(8, 0x1234).unwrap();
            bytes.write_u32(12, 7).unwrap();
        }
        let words = views.words(&memory);
        assert_eq!(words.len(), 4);
        assert_eq!(words.get(2).unwrap(), 0x1234);
        assert_eq!(words.read_pair(8).unwrap(), (0x1234, 7));
        assert!(words.read_i32(6).is_err());
        assert!(words.read_pair(12).is_err());
    }

    #[test]
    fn test_generation_tracker_follows_identity() {
        let mut tracker = GenerationTracker::new();
        let first = vec![0u8; 32];
        assert_eq!(tracker.observe(&first), MemoryGeneration::INITIAL);
        assert_eq!(tracker.observe(&first), MemoryGeneration::INITIAL);

        let second = vec![0u8; 64];
        assert_eq!(tracker.observe(&second), MemoryGeneration(1));
        assert_eq!(tracker.current(), MemoryGeneration(1));
    }
}
