//! Scoped reservations on the module's auxiliary stack.
//!
//! Multi-word results are written by the module into a caller-reserved
//! region of its own stack. A [`ScratchFrame`] moves the stack pointer down
//! on creation and back up exactly once, either through [`ScratchFrame::finish`]
//! or when dropped during unwinding.

use crate::abi::ModuleExports;
use crate::error::{BridgeError, Result};
use tracing::{error, trace};

/// A reserved region on the module's auxiliary stack.
///
/// Dereferences to the module so calls can be made while the frame is held.
pub struct ScratchFrame<'a, M: ModuleExports + ?Sized> {
    module: &'a mut M,
    size: i32,
    ptr: u32,
    released: bool,
}

impl<'a, M: ModuleExports + ?Sized> ScratchFrame<'a, M> {
    /// Reserve `size` bytes
    pub fn reserve(module: &'a mut M, size: u32) -> Result<Self> {
        let size = i32::try_from(size).map_err(|_| {
            BridgeError::AllocationFailure(format!("scratch frame of {} bytes is too large", size))
        })?;
        let ptr = module.adjust_stack_pointer(-size)?;
        trace!(ptr, size, "Reserved scratch frame");

        Ok(Self {
            module,
            size,
            ptr,
            released: false,
        })
    }

    /// Start of the reserved region
    pub fn ptr(&self) -> u32 {
        self.ptr
    }

    /// Release the frame, surfacing a failure to restore the stack pointer
    pub fn finish(mut self) -> Result<()> {
        self.released = true;
        self.module.adjust_stack_pointer(self.size).map(|_| ())
    }
}

impl<M: ModuleExports + ?Sized> std::ops::Deref for ScratchFrame<'_, M> {
    type Target = M;

    fn deref(&self) -> &Self::Target {
        self.module
    }
}

impl<M: ModuleExports + ?Sized> std::ops::DerefMut for ScratchFrame<'_, M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.module
    }
}

impl<M: ModuleExports + ?Sized> Drop for ScratchFrame<'_, M> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.module.adjust_stack_pointer(self.size) {
            error!(ptr = self.ptr, size = self.size, error = %e, "Failed to release scratch frame");
        }
    }
}
