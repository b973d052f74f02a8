//! Lifecycle of a module-side instance pointer.
//!
//! ```text
//! Unbound --bind--> Bound --begin_release--> Released
//! ```
//!
//! Every operation except `bind` requires the bound state. Releasing moves
//! to the terminal state *before* the module's destructor runs, so a
//! re-entrant or repeated release is rejected instead of destroying twice.

use crate::error::{BridgeError, Result};
use std::num::NonZeroU32;

/// Lifecycle state of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// No instance attached yet
    Unbound,
    /// Owns a live instance
    Bound,
    /// Instance was released; terminal
    Released,
}

/// Exclusive owner of one module-side instance pointer
#[derive(Debug)]
pub struct InstanceHandle {
    state: HandleState,
    pointer: Option<NonZeroU32>,
}

impl Default for InstanceHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceHandle {
    /// Create an unbound handle
    pub fn new() -> Self {
        Self {
            state: HandleState::Unbound,
            pointer: None,
        }
    }

    /// Attach the pointer returned by the module's constructor
    pub fn bind(&mut self, raw: u32) -> Result<()> {
        if self.state != HandleState::Unbound {
            return Err(BridgeError::InvalidHandle(format!(
                "cannot bind a handle that is {:?}",
                self.state
            )));
        }
        let pointer = NonZeroU32::new(raw).ok_or_else(|| {
            BridgeError::InvalidHandle("module returned a null instance pointer".into())
        })?;

        self.pointer = Some(pointer);
        self.state = HandleState::Bound;
        Ok(())
    }

    /// Current state
    pub fn state(&self) -> HandleState {
        self.state
    }

    /// Whether the handle owns a live instance
    pub fn is_bound(&self) -> bool {
        self.state == HandleState::Bound
    }

    /// Pointer of the live instance
    pub fn pointer(&self) -> Result<NonZeroU32> {
        match (self.state, self.pointer) {
            (HandleState::Bound, Some(pointer)) => Ok(pointer),
            (HandleState::Released, _) => Err(BridgeError::InvalidHandle(
                "instance was already released".into(),
            )),
            _ => Err(BridgeError::InvalidHandle("instance was never bound".into())),
        }
    }

    /// Raw pointer value; zero unless bound
    pub fn raw(&self) -> u32 {
        self.pointer.map_or(0, NonZeroU32::get)
    }

    /// Enter the released state and hand back the pointer to destroy.
    ///
    /// The caller must pass the pointer to the module's destructor exactly once.
    pub fn begin_release(&mut self) -> Result<NonZeroU32> {
        let pointer = self.pointer()?;
        self.pointer = None;
        self.state = HandleState::Released;
        Ok(pointer)
    }
}
