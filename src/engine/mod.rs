//! Bridge engine management.
//!
//! A [`Bridge`] owns one module backend together with its heap table and
//! memory views. Every handle created from it shares that state; calls are
//! serialized behind a mutex so the module is never entered concurrently.

pub mod native;
pub mod scratch;
pub mod wasmi_module;

use crate::abi::{GuestAllocator, ModuleExports};
use crate::codec;
use crate::config::{BridgeConfig, ConfigError};
use crate::error::{BridgeError, Result};
use crate::facade::Rulox;
use crate::handle::InstanceHandle;
use crate::heap::{HostValue, SlotKey};
use crate::memory::{LinearMemory, MemoryViews};
use crate::metrics::{BridgeStats, ExecutionTimer, MetricsCollector, Operation};
use native::{GuestProgram, NativeModule};
use parking_lot::Mutex;
use scratch::ScratchFrame;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use wasmi_module::{ModuleLoader, WasmiModule};

/// Module state behind the bridge lock
pub(crate) struct BridgeCore {
    module: Box<dyn ModuleExports>,
    views: MemoryViews,
    config: BridgeConfig,
}

impl BridgeCore {
    /// Encode `source`, construct an instance and bind its pointer
    pub(crate) fn construct(&mut self, source: &str) -> Result<InstanceHandle> {
        let encoded = codec::encode(
            &mut *self.module,
            &mut self.views,
            source,
            self.config.string_encoding,
        )?;
        let raw = self.module.construct(encoded.ptr, encoded.len)?;

        let mut handle = InstanceHandle::new();
        handle.bind(raw)?;
        Ok(handle)
    }

    fn take_value(&mut self, raw: u32) -> Result<Value> {
        self.module
            .host_state_mut()
            .heap_mut()
            .take(SlotKey::from_raw(raw))
            .map(HostValue::into_json)
    }

    pub(crate) fn tokens(&mut self, handle: u32) -> Result<Value> {
        let raw = self.module.tokenize(handle)?;
        self.take_value(raw)
    }

    pub(crate) fn parse_tree(&mut self, handle: u32) -> Result<Value> {
        let raw = self.module.parse_tree(handle)?;
        self.take_value(raw)
    }

    pub(crate) fn interpret(&mut self, handle: u32) -> Result<Value> {
        let raw = self.module.interpret(handle)?;
        self.take_value(raw)
    }

    pub(crate) fn has_errors(&mut self, handle: u32) -> Result<bool> {
        Ok(self.module.has_errors(handle)? != 0)
    }

    /// Read the environment text through a scratch frame.
    ///
    /// The frame is released on every path; the module-owned string is freed
    /// before a decode failure is reported, and a failure to free it never
    /// masks the decode error.
    pub(crate) fn environment(&mut self, handle: u32) -> Result<String> {
        let mut frame = ScratchFrame::reserve(&mut *self.module, self.config.scratch_frame_bytes)?;
        let ret_ptr = frame.ptr();
        frame.environment_dump(ret_ptr, handle)?;

        let (ptr, len) = self.views.words(&*frame).read_pair(ret_ptr)?;
        let decoded = codec::decode_from(&*frame, &mut self.views, ptr, len);
        let freed = frame.free(ptr, len);
        let text = match (decoded, freed) {
            (Ok(text), Ok(())) => text,
            (Ok(_), Err(e)) => return Err(e),
            (Err(e), freed) => {
                if let Err(free_error) = freed {
                    warn!(ptr, len, error = %free_error, "Failed to free environment string");
                }
                return Err(e);
            }
        };

        frame.finish()?;
        Ok(text)
    }

    pub(crate) fn destroy(&mut self, handle: u32) -> Result<()> {
        self.module.destroy(handle)
    }
}

/// Shared handle to a module backend.
///
/// Cloning is cheap; all clones refer to the same module, heap table and
/// metrics.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Mutex<BridgeCore>>,
    metrics: Arc<MetricsCollector>,
    id: String,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge").field("id", &self.id).finish()
    }
}

impl Bridge {
    /// Wrap an instantiated module backend
    pub fn new(module: Box<dyn ModuleExports>, config: BridgeConfig) -> Result<Self> {
        config.validate()?;

        let id = uuid::Uuid::new_v4().to_string();
        info!(
            bridge = %id,
            memory_bytes = module.size(),
            encoding = ?config.string_encoding,
            scratch_frame = config.scratch_frame_bytes,
            "Initializing bridge"
        );

        let core = BridgeCore {
            module,
            views: MemoryViews::new(),
            config,
        };

        Ok(Self {
            inner: Arc::new(Mutex::new(core)),
            metrics: Arc::new(MetricsCollector::new()),
            id,
        })
    }

    /// Bridge over a natively implemented interpreter
    pub fn native<P: GuestProgram + 'static>(program: P, config: BridgeConfig) -> Result<Self> {
        let module = NativeModule::new(program, &config)?;
        Self::new(Box::new(module), config)
    }

    /// Bridge over a module binary, compiled with a fresh loader
    pub fn from_wasm_bytes(bytes: &[u8], config: BridgeConfig) -> Result<Self> {
        Self::from_loader(&ModuleLoader::new(), bytes, config)
    }

    /// Bridge over a module binary, compiled through `loader`'s cache
    pub fn from_loader(loader: &ModuleLoader, bytes: &[u8], config: BridgeConfig) -> Result<Self> {
        let module = WasmiModule::from_bytes(loader, bytes, &config)?;
        Self::new(Box::new(module), config)
    }

    /// Bridge over a module binary on disk
    pub fn from_wasm_file(path: impl AsRef<Path>, config: BridgeConfig) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        info!(path = %path.as_ref().display(), bytes = bytes.len(), "Read module binary");
        Self::from_wasm_bytes(&bytes, config)
    }

    /// Bridge over the module named by `config.module_path`
    pub fn from_config(config: BridgeConfig) -> Result<Self> {
        let path = config.module_path.clone().ok_or_else(|| ConfigError::MissingField {
            field: "modulePath".into(),
        })?;
        Self::from_wasm_file(path, config)
    }

    /// Create an interpreter instance for `source`
    pub fn construct(&self, source: &str) -> Result<Rulox> {
        Rulox::new(self, source)
    }

    /// Unique id of this bridge
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of call counters and module state
    pub fn stats(&self) -> BridgeStats {
        let core = self.inner.lock();
        BridgeStats {
            total_calls: self.metrics.total_calls(),
            failed_calls: self.metrics.failed_calls(),
            live_instances: self.metrics.live_instances(),
            live_heap_slots: core.module.host_state().heap().live_count(),
            memory_bytes: core.module.size(),
            memory_generation: core.module.generation().get(),
            view_refreshes: core.views.refreshes(),
        }
    }

    /// The metrics collector
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Export Prometheus-format metrics
    pub fn prometheus_metrics(&self) -> String {
        let stats = self.stats();
        let mut output = self.metrics.to_prometheus();

        output.push_str("\n# HELP rulox_bridge_heap_slots Occupied heap table slots\n");
        output.push_str("# TYPE rulox_bridge_heap_slots gauge\n");
        output.push_str(&format!("rulox_bridge_heap_slots {}\n", stats.live_heap_slots));

        output.push_str("\n# HELP rulox_bridge_memory_bytes Linear memory size\n");
        output.push_str("# TYPE rulox_bridge_memory_bytes gauge\n");
        output.push_str(&format!("rulox_bridge_memory_bytes {}\n", stats.memory_bytes));

        output.push_str("\n# HELP rulox_bridge_memory_relocations_total Memory generation changes\n");
        output.push_str("# TYPE rulox_bridge_memory_relocations_total counter\n");
        output.push_str(&format!(
            "rulox_bridge_memory_relocations_total {}\n",
            stats.memory_generation
        ));

        output
    }

    /// Run `f` against the module while holding the bridge lock
    pub fn with_module<R>(&self, f: impl FnOnce(&mut dyn ModuleExports) -> R) -> R {
        let mut core = self.inner.lock();
        f(&mut *core.module)
    }

    /// Run one metered operation under the lock
    pub(crate) fn call<T>(
        &self,
        operation: Operation,
        f: impl FnOnce(&mut BridgeCore) -> Result<T>,
    ) -> Result<T> {
        let timer = ExecutionTimer::start();
        let (result, verbose) = {
            let mut core = self.inner.lock();
            (f(&mut core), core.config.debug)
        };
        let elapsed = timer.elapsed();
        if verbose {
            debug!(
                operation = operation.as_str(),
                elapsed_us = elapsed.as_micros() as u64,
                ok = result.is_ok(),
                "Bridge call finished"
            );
        }
        self.metrics.record_call(
            operation,
            elapsed,
            result.as_ref().err().map(BridgeError::code),
        );
        result
    }
}
