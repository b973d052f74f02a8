//! The interpreter object exposed to host code.

use crate::engine::Bridge;
use crate::error::Result;
use crate::handle::{HandleState, InstanceHandle};
use crate::metrics::Operation;
use serde_json::Value;
use tracing::{debug, instrument, warn};

/// One interpreter instance living inside a module.
///
/// Every method fails with `InvalidHandle` once [`Rulox::free`] was called.
/// Dropping a still-live instance releases it.
#[derive(Debug)]
pub struct Rulox {
    bridge: Bridge,
    handle: InstanceHandle,
}

impl Rulox {
    /// Scan and parse `source` inside the module
    #[instrument(skip(bridge, source), fields(bridge = %bridge.id(), source_len = source.len()))]
    pub fn new(bridge: &Bridge, source: &str) -> Result<Self> {
        let handle = bridge.call(Operation::Construct, |core| core.construct(source))?;
        debug!(handle = handle.raw(), "Constructed instance");

        Ok(Self {
            bridge: bridge.clone(),
            handle,
        })
    }

    /// Token stream as a structured value
    #[instrument(skip(self), fields(handle = self.handle.raw()))]
    pub fn tokens(&self) -> Result<Value> {
        let ptr = self.handle.pointer()?.get();
        self.bridge.call(Operation::Tokenize, |core| core.tokens(ptr))
    }

    /// Parse tree as a structured value
    #[instrument(skip(self), fields(handle = self.handle.raw()))]
    pub fn parse_tree(&self) -> Result<Value> {
        let ptr = self.handle.pointer()?.get();
        self.bridge.call(Operation::ParseTree, |core| core.parse_tree(ptr))
    }

    /// Run the program; the value holds the printed lines and error reports
    #[instrument(skip(self), fields(handle = self.handle.raw()))]
    pub fn interpret(&self) -> Result<Value> {
        let ptr = self.handle.pointer()?.get();
        self.bridge.call(Operation::Interpret, |core| core.interpret(ptr))
    }

    /// Run the program and collect its output as lines
    pub fn interpret_lines(&self) -> Result<Vec<String>> {
        Ok(serde_json::from_value(self.interpret()?)?)
    }

    /// Whether scanning or parsing reported errors
    #[instrument(skip(self), fields(handle = self.handle.raw()))]
    pub fn had_errors(&self) -> Result<bool> {
        let ptr = self.handle.pointer()?.get();
        self.bridge.call(Operation::HasErrors, |core| core.has_errors(ptr))
    }

    /// Textual dump of the variable bindings
    #[instrument(skip(self), fields(handle = self.handle.raw()))]
    pub fn environment(&self) -> Result<String> {
        let ptr = self.handle.pointer()?.get();
        self.bridge
            .call(Operation::EnvironmentDump, |core| core.environment(ptr))
    }

    /// Release the instance. A second call fails with `InvalidHandle`.
    #[instrument(skip(self), fields(handle = self.handle.raw()))]
    pub fn free(&mut self) -> Result<()> {
        let ptr = self.handle.begin_release()?.get();
        debug!(handle = ptr, "Releasing instance");
        self.bridge.call(Operation::Destroy, |core| core.destroy(ptr))
    }

    /// Whether the instance is still live
    pub fn is_live(&self) -> bool {
        self.handle.is_bound()
    }

    /// Lifecycle state of the handle
    pub fn state(&self) -> HandleState {
        self.handle.state()
    }

    /// Module-side pointer; zero once released
    pub fn raw_handle(&self) -> u32 {
        self.handle.raw()
    }

    /// The bridge this instance lives in
    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }
}

impl Drop for Rulox {
    fn drop(&mut self) {
        if !self.handle.is_bound() {
            return;
        }
        let raw = self.handle.raw();
        if let Err(e) = self.free() {
            warn!(handle = raw, error = %e, "Failed to release instance on drop");
        }
    }
}
