//! In-process module backend.
//!
//! [`NativeModule`] runs a [`GuestProgram`] written in Rust behind the same
//! integer export table a compiled module offers. It owns a simulated linear
//! memory with an auxiliary stack at the bottom and a first-fit heap above
//! it. Growing the heap moves the whole buffer to a new allocation and bumps
//! its generation, exactly like a real module's memory growth.
//!
//! Memory layout:
//!
//! ```text
//! 0 ............ stack_size ....................... len
//! | aux stack (grows down) | heap (first fit, bump) |
//! ```

use crate::abi::{imports, GuestAllocator, HostState, ModuleExports};
use crate::config::{BridgeConfig, ExportNames, WASM_PAGE_BYTES};
use crate::error::{BridgeError, Result};
use crate::memory::{ByteView, ByteViewMut, LinearMemory, MemoryGeneration};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info};

/// Alignment and minimum size of heap blocks
const BLOCK_ALIGN: u32 = 8;

/// Size of the cell backing each instance pointer
const INSTANCE_CELL_BYTES: u32 = 8;

/// An interpreter implemented natively.
///
/// Results are structured values; `Err` carries the message the module
/// raises to the host.
pub trait GuestProgram: Send {
    /// Per-source interpreter state
    type Instance: Send;

    /// Scan, parse and prepare `source`
    fn construct(&mut self, source: String) -> Self::Instance;

    /// Token stream
    fn tokens(&mut self, instance: &mut Self::Instance) -> std::result::Result<Value, String>;

    /// Parse tree
    fn parse_tree(&mut self, instance: &mut Self::Instance) -> std::result::Result<Value, String>;

    /// Interpreter output lines, including error reports
    fn interpret(&mut self, instance: &mut Self::Instance) -> std::result::Result<Value, String>;

    /// Whether scanning or parsing reported errors
    fn had_errors(&self, instance: &Self::Instance) -> bool;

    /// Textual dump of the variable bindings
    fn environment(&self, instance: &Self::Instance) -> String;
}

fn align(len: u32) -> Option<u32> {
    len.max(BLOCK_ALIGN)
        .checked_add(BLOCK_ALIGN - 1)
        .map(|n| n & !(BLOCK_ALIGN - 1))
}

/// Simulated linear memory with an auxiliary stack and a heap
#[derive(Debug)]
struct NativeMemory {
    bytes: Vec<u8>,
    generation: MemoryGeneration,
    max_bytes: usize,
    stack_top: u32,
    stack_pointer: u32,
    heap_top: u32,
    /// Live blocks: pointer -> block size
    blocks: HashMap<u32, u32>,
    /// Freed blocks as (pointer, size)
    free_blocks: Vec<(u32, u32)>,
}

impl NativeMemory {
    fn new(config: &BridgeConfig) -> Result<Self> {
        let stack_top = u32::try_from(config.stack_size_bytes).map_err(|_| {
            BridgeError::AllocationFailure("auxiliary stack does not fit in linear memory".into())
        })?;
        let initial = config.stack_size_bytes + config.initial_memory_pages as u64 * WASM_PAGE_BYTES;

        Ok(Self {
            bytes: vec![0; initial as usize],
            generation: MemoryGeneration::INITIAL,
            max_bytes: config.max_memory_bytes as usize,
            stack_top,
            stack_pointer: stack_top,
            heap_top: stack_top,
            blocks: HashMap::new(),
            free_blocks: Vec::new(),
        })
    }

    fn view(&self) -> ByteView<'_> {
        ByteView::new(&self.bytes, self.generation)
    }

    fn view_mut(&mut self) -> ByteViewMut<'_> {
        ByteViewMut::new(&mut self.bytes, self.generation)
    }

    /// Grow to at least `end` bytes, relocating the buffer
    fn ensure(&mut self, end: u32) -> Result<()> {
        let end = end as usize;
        if end <= self.bytes.len() {
            return Ok(());
        }

        let page = WASM_PAGE_BYTES as usize;
        let target = end.div_ceil(page) * page;
        if target > self.max_bytes {
            return Err(BridgeError::AllocationFailure(format!(
                "cannot grow memory to {} bytes (limit {})",
                target, self.max_bytes
            )));
        }

        let mut grown = Vec::with_capacity(target);
        grown.extend_from_slice(&self.bytes);
        grown.resize(target, 0);
        self.bytes = grown;
        self.generation = self.generation.next();
        debug!(bytes = target, generation = %self.generation, "Grew linear memory");
        Ok(())
    }

    fn allocate(&mut self, len: u32) -> Result<u32> {
        let size = align(len)
            .ok_or_else(|| BridgeError::AllocationFailure(format!("{} bytes is too large", len)))?;

        if let Some(index) = self.free_blocks.iter().position(|&(_, free)| free >= size) {
            let (ptr, free) = self.free_blocks.swap_remove(index);
            if free > size {
                self.free_blocks.push((ptr + size, free - size));
            }
            self.blocks.insert(ptr, size);
            return Ok(ptr);
        }

        let ptr = self.heap_top;
        let end = ptr.checked_add(size).ok_or_else(|| {
            BridgeError::AllocationFailure("address space exhausted".into())
        })?;
        self.ensure(end)?;
        self.heap_top = end;
        self.blocks.insert(ptr, size);
        Ok(ptr)
    }

    fn block(&self, export: &str, ptr: u32) -> Result<u32> {
        self.blocks
            .get(&ptr)
            .copied()
            .ok_or_else(|| BridgeError::trap(export, format!("{:#x} is not an allocated block", ptr)))
    }

    fn reallocate(&mut self, export: &str, ptr: u32, old_len: u32, new_len: u32) -> Result<u32> {
        let size = self.block(export, ptr)?;
        let new_size = align(new_len).ok_or_else(|| {
            BridgeError::AllocationFailure(format!("{} bytes is too large", new_len))
        })?;

        if new_size <= size {
            if new_size < size {
                self.free_blocks.push((ptr + new_size, size - new_size));
                self.blocks.insert(ptr, new_size);
            }
            return Ok(ptr);
        }

        if ptr + size == self.heap_top {
            let end = ptr.checked_add(new_size).ok_or_else(|| {
                BridgeError::AllocationFailure("address space exhausted".into())
            })?;
            self.ensure(end)?;
            self.heap_top = end;
            self.blocks.insert(ptr, new_size);
            return Ok(ptr);
        }

        let moved = self.allocate(new_len)?;
        let keep = old_len.min(new_len).min(size) as usize;
        let from = ptr as usize;
        self.bytes.copy_within(from..from + keep, moved as usize);
        self.release(export, ptr)?;
        Ok(moved)
    }

    fn release(&mut self, export: &str, ptr: u32) -> Result<()> {
        let size = self.block(export, ptr)?;
        self.blocks.remove(&ptr);
        if ptr + size == self.heap_top {
            self.heap_top = ptr;
        } else {
            self.free_blocks.push((ptr, size));
        }
        Ok(())
    }

    fn write_string(&mut self, text: &str) -> Result<(u32, u32)> {
        let len = u32::try_from(text.len()).map_err(|_| {
            BridgeError::AllocationFailure(format!("{} bytes do not fit in linear memory", text.len()))
        })?;
        let ptr = self.allocate(len)?;
        self.view_mut().write(ptr, text.as_bytes())?;
        Ok((ptr, len))
    }
}

fn lookup<'a, I>(instances: &'a mut HashMap<u32, I>, export: &str, handle: u32) -> Result<&'a mut I> {
    if handle == 0 {
        return Err(BridgeError::trap(export, "null pointer passed to module"));
    }
    instances
        .get_mut(&handle)
        .ok_or_else(|| BridgeError::trap(export, format!("{:#x} is not a live instance", handle)))
}

/// A [`GuestProgram`] behind the module export table
pub struct NativeModule<P: GuestProgram> {
    program: P,
    instances: HashMap<u32, P::Instance>,
    memory: NativeMemory,
    host: HostState,
    names: ExportNames,
}

impl<P: GuestProgram> NativeModule<P> {
    /// Create a module with the memory layout from `config`
    pub fn new(program: P, config: &BridgeConfig) -> Result<Self> {
        config.validate()?;
        let memory = NativeMemory::new(config)?;

        info!(
            stack_bytes = config.stack_size_bytes,
            memory_bytes = memory.bytes.len(),
            max_memory = config.max_memory_bytes,
            "Created native module"
        );

        Ok(Self {
            program,
            instances: HashMap::new(),
            memory,
            host: HostState::new(),
            names: config.exports.clone(),
        })
    }

    /// Number of live instances
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// The guest program
    pub fn program(&self) -> &P {
        &self.program
    }

    /// Hand a structured result to the host through the parse import
    fn deliver(&mut self, result: std::result::Result<Value, String>) -> Result<u32> {
        match result {
            Ok(value) => {
                let text = serde_json::to_string(&value)?;
                let (ptr, len) = self.memory.write_string(&text)?;
                let key = imports::parse_structured(&mut self.host, self.memory.view(), ptr, len);
                self.memory.release(&self.names.free, ptr)?;
                Ok(key?.raw())
            }
            Err(message) => {
                let (ptr, len) = self.memory.write_string(&message)?;
                let error = imports::raise(&mut self.host, self.memory.view(), ptr, len);
                self.memory.release(&self.names.free, ptr)?;
                Err(error)
            }
        }
    }
}

impl<P: GuestProgram> LinearMemory for NativeModule<P> {
    fn bytes(&self) -> &[u8] {
        &self.memory.bytes
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.memory.bytes
    }

    fn generation(&self) -> MemoryGeneration {
        self.memory.generation
    }
}

impl<P: GuestProgram> GuestAllocator for NativeModule<P> {
    fn allocate(&mut self, len: u32) -> Result<u32> {
        self.memory.allocate(len)
    }

    fn reallocate(&mut self, ptr: u32, old_len: u32, new_len: u32) -> Result<u32> {
        self.memory
            .reallocate(&self.names.reallocate, ptr, old_len, new_len)
    }

    fn free(&mut self, ptr: u32, _len: u32) -> Result<()> {
        self.memory.release(&self.names.free, ptr)
    }
}

impl<P: GuestProgram> ModuleExports for NativeModule<P> {
    fn construct(&mut self, src_ptr: u32, src_len: u32) -> Result<u32> {
        let source = crate::codec::decode(self.memory.view(), src_ptr, src_len)?;
        self.memory.release(&self.names.free, src_ptr)?;

        let instance = self.program.construct(source);
        let handle = self.memory.allocate(INSTANCE_CELL_BYTES)?;
        self.memory.view_mut().write_u32(handle, src_len)?;
        self.instances.insert(handle, instance);
        Ok(handle)
    }

    fn destroy(&mut self, handle: u32) -> Result<()> {
        lookup(&mut self.instances, &self.names.destroy, handle)?;
        self.instances.remove(&handle);
        self.memory.release(&self.names.destroy, handle)
    }

    fn tokenize(&mut self, handle: u32) -> Result<u32> {
        let instance = lookup(&mut self.instances, &self.names.tokenize, handle)?;
        let result = self.program.tokens(instance);
        self.deliver(result)
    }

    fn parse_tree(&mut self, handle: u32) -> Result<u32> {
        let instance = lookup(&mut self.instances, &self.names.parse_tree, handle)?;
        let result = self.program.parse_tree(instance);
        self.deliver(result)
    }

    fn interpret(&mut self, handle: u32) -> Result<u32> {
        let instance = lookup(&mut self.instances, &self.names.interpret, handle)?;
        let result = self.program.interpret(instance);
        self.deliver(result)
    }

    fn has_errors(&mut self, handle: u32) -> Result<i32> {
        let instance = lookup(&mut self.instances, &self.names.has_errors, handle)?;
        Ok(self.program.had_errors(instance) as i32)
    }

    fn environment_dump(&mut self, ret_ptr: u32, handle: u32) -> Result<()> {
        let instance = lookup(&mut self.instances, &self.names.environment_dump, handle)?;
        let text = self.program.environment(instance);
        let (ptr, len) = self.memory.write_string(&text)?;

        let mut view = self.memory.view_mut();
        view.write_u32(ret_ptr, ptr)?;
        view.write_u32(ret_ptr.saturating_add(4), len)
    }

    fn adjust_stack_pointer(&mut self, delta: i32) -> Result<u32> {
        let target = self.memory.stack_pointer as i64 + delta as i64;
        if target < 0 || target > self.memory.stack_top as i64 {
            return Err(BridgeError::trap(
                self.names.adjust_stack_pointer.as_str(),
                format!(
                    "stack pointer {} moved by {} leaves the auxiliary stack",
                    self.memory.stack_pointer, delta
                ),
            ));
        }
        self.memory.stack_pointer = target as u32;
        Ok(self.memory.stack_pointer)
    }

    fn host_state(&self) -> &HostState {
        &self.host
    }

    fn host_state_mut(&mut self) -> &mut HostState {
        &mut self.host
    }
}
