//! String marshalling across the module boundary.
//!
//! Host strings are written into memory obtained from the module's own
//! allocator; the module then owns that allocation. Strings coming back are
//! decoded strictly: malformed UTF-8 is an error, never a replacement
//! character, because the decoded text is frequently parsed further.

use crate::abi::GuestAllocator;
use crate::config::StringEncoding;
use crate::error::{BridgeError, Result};
use crate::memory::{ByteView, LinearMemory, MemoryViews};

/// Upper bound of UTF-8 bytes per character
pub const MAX_UTF8_BYTES_PER_CHAR: usize = 4;

/// A `(ptr, len)` UTF-8 range inside linear memory.
///
/// Only valid until the next call that may allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedString {
    /// Start of the range
    pub ptr: u32,
    /// Length in bytes
    pub len: u32,
}

fn to_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        BridgeError::AllocationFailure(format!("{} bytes do not fit in linear memory", len))
    })
}

/// Write `text` into freshly allocated module memory
pub fn encode<A: GuestAllocator + ?Sized>(
    module: &mut A,
    views: &mut MemoryViews,
    text: &str,
    encoding: StringEncoding,
) -> Result<EncodedString> {
    match encoding {
        StringEncoding::Streaming => encode_streaming(module, views, text),
        StringEncoding::Exact => encode_exact(module, views, text),
    }
}

fn encode_exact<A: GuestAllocator + ?Sized>(
    module: &mut A,
    views: &mut MemoryViews,
    text: &str,
) -> Result<EncodedString> {
    let len = to_u32(text.len())?;
    let ptr = module.allocate(len)?;
    views.bytes_mut(module).write(ptr, text.as_bytes())?;
    Ok(EncodedString { ptr, len })
}

fn encode_streaming<A: GuestAllocator + ?Sized>(
    module: &mut A,
    views: &mut MemoryViews,
    text: &str,
) -> Result<EncodedString> {
    let estimate = to_u32(text.chars().count())?;
    let mut ptr = module.allocate(estimate)?;

    // ASCII prefix: one byte per character
    let mut offset = 0usize;
    {
        let mut view = views.bytes_mut(module);
        let region = view.slice_mut(ptr, estimate)?;
        for (byte, ch) in region.iter_mut().zip(text.chars()) {
            if !ch.is_ascii() {
                break;
            }
            *byte = ch as u8;
            offset += 1;
        }
    }

    if offset == text.len() {
        return Ok(EncodedString { ptr, len: estimate });
    }

    let remainder = &text[offset..];
    let capacity = to_u32(offset + remainder.chars().count() * MAX_UTF8_BYTES_PER_CHAR)?;
    ptr = module.reallocate(ptr, estimate, capacity)?;

    let head = to_u32(offset)?;
    let tail_start = ptr
        .checked_add(head)
        .ok_or_else(|| BridgeError::out_of_bounds(ptr as u64, capacity as u64, module.size()))?;
    let mut written = 0usize;
    {
        let mut view = views.bytes_mut(module);
        let tail = view.slice_mut(tail_start, capacity - head)?;
        for ch in remainder.chars() {
            written += ch.encode_utf8(&mut tail[written..]).len();
        }
    }
    offset += written;

    let len = to_u32(offset)?;
    if len < capacity {
        ptr = module.reallocate(ptr, capacity, len)?;
    }
    Ok(EncodedString { ptr, len })
}

/// Strictly decode `[ptr, ptr + len)` as UTF-8
pub fn decode(memory: ByteView<'_>, ptr: u32, len: u32) -> Result<String> {
    let bytes = memory.slice(ptr, len)?;
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|err| BridgeError::Decode {
            ptr,
            len,
            valid_up_to: err.valid_up_to(),
        })
}

/// Decode through a fresh view of `memory`
pub fn decode_from<M: LinearMemory + ?Sized>(
    memory: &M,
    views: &mut MemoryViews,
    ptr: u32,
    len: u32,
) -> Result<String> {
    decode(views.bytes(memory), ptr, len)
}
