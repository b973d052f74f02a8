//! The integer calling convention between host and module.
//!
//! A module can only exchange integers with the host. [`GuestAllocator`] and
//! [`ModuleExports`] describe the fixed export table the bridge calls;
//! [`HostState`] is the host-side state the module's imports operate on
//! while one of those exports is running.

pub mod imports;

use crate::error::{BridgeError, Result};
use crate::heap::HeapTable;
use crate::memory::LinearMemory;

/// Allocator exports of a module
pub trait GuestAllocator: LinearMemory {
    /// Fresh allocation of `len` bytes
    fn allocate(&mut self, len: u32) -> Result<u32>;

    /// Grow or shrink an allocation; may move it
    fn reallocate(&mut self, ptr: u32, old_len: u32, new_len: u32) -> Result<u32>;

    /// Release an allocation
    fn free(&mut self, ptr: u32, len: u32) -> Result<()>;
}

/// Full export table of an interpreter module
pub trait ModuleExports: GuestAllocator + Send {
    /// Build a new instance from the UTF-8 source at `[src_ptr, src_ptr + src_len)`.
    ///
    /// The module takes ownership of the source allocation.
    fn construct(&mut self, src_ptr: u32, src_len: u32) -> Result<u32>;

    /// Release an instance
    fn destroy(&mut self, handle: u32) -> Result<()>;

    /// Token stream, registered in the heap table
    fn tokenize(&mut self, handle: u32) -> Result<u32>;

    /// Parse tree, registered in the heap table
    fn parse_tree(&mut self, handle: u32) -> Result<u32>;

    /// Interpreter output, registered in the heap table
    fn interpret(&mut self, handle: u32) -> Result<u32>;

    /// Non-zero when scanning or parsing reported errors
    fn has_errors(&mut self, handle: u32) -> Result<i32>;

    /// Write `(str_ptr, str_len)` of the environment text at `ret_ptr`
    fn environment_dump(&mut self, ret_ptr: u32, handle: u32) -> Result<()>;

    /// Move the auxiliary stack pointer by `delta` and return the new value
    fn adjust_stack_pointer(&mut self, delta: i32) -> Result<u32>;

    /// Host state shared with the module's imports
    fn host_state(&self) -> &HostState;

    /// Host state shared with the module's imports, mutable
    fn host_state_mut(&mut self) -> &mut HostState;
}

/// Host-side state reachable from module imports
#[derive(Debug, Default)]
pub struct HostState {
    heap: HeapTable,
    pending: Option<BridgeError>,
    import_calls: u64,
}

impl HostState {
    /// Create state with an empty heap table
    pub fn new() -> Self {
        Self::default()
    }

    /// The heap table
    pub fn heap(&self) -> &HeapTable {
        &self.heap
    }

    /// The heap table, mutable
    pub fn heap_mut(&mut self) -> &mut HeapTable {
        &mut self.heap
    }

    /// Remember an error raised inside an import until the export returns
    pub fn set_pending(&mut self, error: BridgeError) {
        self.pending = Some(error);
    }

    /// Error raised inside an import during the last export call, if any
    pub fn take_pending(&mut self) -> Option<BridgeError> {
        self.pending.take()
    }

    /// Number of import calls served
    pub fn import_calls(&self) -> u64 {
        self.import_calls
    }

    fn count_import(&mut self) {
        self.import_calls += 1;
    }
}
