//! Compiled module backend on the `wasmi` interpreter.
//!
//! [`ModuleLoader`] compiles module binaries and caches them by SHA-256
//! digest; [`WasmiModule`] instantiates one with the two host imports linked
//! and exposes its export table.

use crate::abi::{imports, GuestAllocator, HostState, ModuleExports};
use crate::config::{BridgeConfig, ExportNames};
use crate::error::{BridgeError, Result};
use crate::memory::{ByteView, GenerationTracker, LinearMemory, MemoryGeneration};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use wasmi::{
    Caller, Engine, Extern, Linker, Memory, Module, Store, StoreLimits, StoreLimitsBuilder,
    TypedFunc, WasmParams, WasmResults,
};

/// A compiled module and its digest
#[derive(Clone)]
pub struct CompiledModule {
    /// The compiled module
    pub module: Arc<Module>,
    /// Hex SHA-256 digest of the binary
    pub digest: String,
    /// Whether this was a cache hit
    pub cache_hit: bool,
}

/// Module compiler with a digest-keyed cache
pub struct ModuleLoader {
    engine: Engine,
    cache: RwLock<HashMap<String, Arc<Module>>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl Default for ModuleLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleLoader {
    /// Create a loader with a fresh engine
    pub fn new() -> Self {
        Self {
            engine: Engine::default(),
            cache: RwLock::new(HashMap::new()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    /// The engine modules are compiled for
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Compile `bytes`, or return the cached module with the same digest
    pub fn load(&self, bytes: &[u8]) -> Result<CompiledModule> {
        let digest = compute_digest(bytes);

        if let Some(module) = self.cache.read().get(&digest) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(digest = %digest, "Module cache hit");
            return Ok(CompiledModule {
                module: Arc::clone(module),
                digest,
                cache_hit: true,
            });
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        debug!(digest = %digest, bytes = bytes.len(), "Module cache miss, compiling");

        let module = Module::new(&self.engine, bytes)
            .map_err(|e| BridgeError::Instantiation(format!("failed to compile module: {}", e)))?;
        let module = Arc::new(module);
        self.cache.write().insert(digest.clone(), Arc::clone(&module));

        Ok(CompiledModule {
            module,
            digest,
            cache_hit: false,
        })
    }

    /// Cache hits so far
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Cache misses so far
    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    /// Number of cached modules
    pub fn cached_modules(&self) -> usize {
        self.cache.read().len()
    }

    /// Drop all cached modules
    pub fn clear_cache(&self) {
        self.cache.write().clear();
        info!("Module cache cleared");
    }
}

fn compute_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Store data reachable from the host imports
struct StoreData {
    host: HostState,
    tracker: GenerationTracker,
    limits: StoreLimits,
}

struct Exports {
    allocate: TypedFunc<i32, i32>,
    reallocate: TypedFunc<(i32, i32, i32), i32>,
    free: TypedFunc<(i32, i32), ()>,
    construct: TypedFunc<(i32, i32), i32>,
    destroy: TypedFunc<i32, ()>,
    tokenize: TypedFunc<i32, i32>,
    parse_tree: TypedFunc<i32, i32>,
    interpret: TypedFunc<i32, i32>,
    has_errors: TypedFunc<i32, i32>,
    environment_dump: TypedFunc<(i32, i32), ()>,
    adjust_stack_pointer: TypedFunc<i32, i32>,
}

/// An instantiated module
pub struct WasmiModule {
    store: Store<StoreData>,
    memory: Memory,
    exports: Exports,
    names: ExportNames,
    digest: String,
}

fn caller_memory(
    caller: &Caller<'_, StoreData>,
    name: &str,
) -> std::result::Result<Memory, wasmi::Error> {
    caller
        .get_export(name)
        .and_then(Extern::into_memory)
        .ok_or_else(|| wasmi::Error::new(format!("module does not export memory '{}'", name)))
}

fn link_error(e: impl std::fmt::Display) -> BridgeError {
    BridgeError::Instantiation(format!("failed to link host imports: {}", e))
}

fn link_imports(linker: &mut Linker<StoreData>, config: &BridgeConfig) -> Result<()> {
    let memory_name = config.exports.memory.clone();
    linker
        .func_wrap(
            &config.import_module,
            imports::PARSE_STRUCTURED,
            move |mut caller: Caller<'_, StoreData>,
                  ptr: i32,
                  len: i32|
                  -> std::result::Result<i32, wasmi::Error> {
                let memory = caller_memory(&caller, &memory_name)?;
                let (bytes, data) = memory.data_and_store_mut(&mut caller);
                let generation = data.tracker.observe(bytes);
                let view = ByteView::new(bytes, generation);
                match imports::parse_structured(&mut data.host, view, ptr as u32, len as u32) {
                    Ok(key) => Ok(key.raw() as i32),
                    Err(e) => {
                        let message = e.to_string();
                        data.host.set_pending(e);
                        Err(wasmi::Error::new(message))
                    }
                }
            },
        )
        .map_err(link_error)?;

    let memory_name = config.exports.memory.clone();
    linker
        .func_wrap(
            &config.import_module,
            imports::RAISE,
            move |mut caller: Caller<'_, StoreData>,
                  ptr: i32,
                  len: i32|
                  -> std::result::Result<(), wasmi::Error> {
                let memory = caller_memory(&caller, &memory_name)?;
                let (bytes, data) = memory.data_and_store_mut(&mut caller);
                let generation = data.tracker.observe(bytes);
                let view = ByteView::new(bytes, generation);
                let error = imports::raise(&mut data.host, view, ptr as u32, len as u32);
                let message = error.to_string();
                data.host.set_pending(error);
                Err(wasmi::Error::new(message))
            },
        )
        .map_err(link_error)?;

    Ok(())
}

fn typed<P: WasmParams, R: WasmResults>(
    instance: &wasmi::Instance,
    store: &Store<StoreData>,
    name: &str,
) -> Result<TypedFunc<P, R>> {
    instance
        .get_typed_func::<P, R>(store, name)
        .map_err(|e| BridgeError::Instantiation(format!("export '{}': {}", name, e)))
}

/// Call an export and translate a failure into the error that caused it
fn invoke<P: WasmParams, R: WasmResults>(
    store: &mut Store<StoreData>,
    memory: Memory,
    func: &TypedFunc<P, R>,
    export: &str,
    params: P,
) -> Result<R> {
    store.data_mut().host.take_pending();
    let outcome = func.call(&mut *store, params);

    let (bytes, data) = memory.data_and_store_mut(&mut *store);
    data.tracker.observe(bytes);

    outcome.map_err(|e| {
        store
            .data_mut()
            .host
            .take_pending()
            .unwrap_or_else(|| BridgeError::trap(export, e.to_string()))
    })
}

fn allocation_failure(error: BridgeError) -> BridgeError {
    match error {
        BridgeError::Trap { export, message } => {
            BridgeError::AllocationFailure(format!("'{}' trapped: {}", export, message))
        }
        other => other,
    }
}

impl WasmiModule {
    /// Instantiate a compiled module
    pub fn instantiate(
        loader: &ModuleLoader,
        compiled: &CompiledModule,
        config: &BridgeConfig,
    ) -> Result<Self> {
        config.validate()?;

        let data = StoreData {
            host: HostState::new(),
            tracker: GenerationTracker::new(),
            limits: StoreLimitsBuilder::new()
                .memory_size(config.max_memory_bytes as usize)
                .build(),
        };
        let mut store = Store::new(loader.engine(), data);
        store.limiter(|data| &mut data.limits);

        let mut linker = Linker::<StoreData>::new(loader.engine());
        link_imports(&mut linker, config)?;

        let instance = linker
            .instantiate(&mut store, &compiled.module)
            .and_then(|pre| pre.start(&mut store))
            .map_err(|e| BridgeError::Instantiation(format!("failed to instantiate module: {}", e)))?;

        let names = config.exports.clone();
        let memory = instance.get_memory(&store, &names.memory).ok_or_else(|| {
            BridgeError::Instantiation(format!("module does not export memory '{}'", names.memory))
        })?;

        let exports = Exports {
            allocate: typed(&instance, &store, &names.allocate)?,
            reallocate: typed(&instance, &store, &names.reallocate)?,
            free: typed(&instance, &store, &names.free)?,
            construct: typed(&instance, &store, &names.construct)?,
            destroy: typed(&instance, &store, &names.destroy)?,
            tokenize: typed(&instance, &store, &names.tokenize)?,
            parse_tree: typed(&instance, &store, &names.parse_tree)?,
            interpret: typed(&instance, &store, &names.interpret)?,
            has_errors: typed(&instance, &store, &names.has_errors)?,
            environment_dump: typed(&instance, &store, &names.environment_dump)?,
            adjust_stack_pointer: typed(&instance, &store, &names.adjust_stack_pointer)?,
        };

        let (bytes, data) = memory.data_and_store_mut(&mut store);
        data.tracker.observe(bytes);

        info!(
            digest = %compiled.digest,
            cache_hit = compiled.cache_hit,
            memory_bytes = memory.data(&store).len(),
            "Instantiated module"
        );

        Ok(Self {
            store,
            memory,
            exports,
            names,
            digest: compiled.digest.clone(),
        })
    }

    /// Compile (or fetch from the cache) and instantiate `bytes`
    pub fn from_bytes(loader: &ModuleLoader, bytes: &[u8], config: &BridgeConfig) -> Result<Self> {
        let compiled = loader.load(bytes)?;
        Self::instantiate(loader, &compiled, config)
    }

    /// Digest of the module binary
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl LinearMemory for WasmiModule {
    fn bytes(&self) -> &[u8] {
        self.memory.data(&self.store)
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self.memory.data_mut(&mut self.store)
    }

    fn generation(&self) -> MemoryGeneration {
        self.store.data().tracker.current()
    }
}

impl GuestAllocator for WasmiModule {
    fn allocate(&mut self, len: u32) -> Result<u32> {
        invoke(
            &mut self.store,
            self.memory,
            &self.exports.allocate,
            &self.names.allocate,
            len as i32,
        )
        .map(|ptr| ptr as u32)
        .map_err(allocation_failure)
    }

    fn reallocate(&mut self, ptr: u32, old_len: u32, new_len: u32) -> Result<u32> {
        invoke(
            &mut self.store,
            self.memory,
            &self.exports.reallocate,
            &self.names.reallocate,
            (ptr as i32, old_len as i32, new_len as i32),
        )
        .map(|ptr| ptr as u32)
        .map_err(allocation_failure)
    }

    fn free(&mut self, ptr: u32, len: u32) -> Result<()> {
        invoke(
            &mut self.store,
            self.memory,
            &self.exports.free,
            &self.names.free,
            (ptr as i32, len as i32),
        )
    }
}

impl ModuleExports for WasmiModule {
    fn construct(&mut self, src_ptr: u32, src_len: u32) -> Result<u32> {
        invoke(
            &mut self.store,
            self.memory,
            &self.exports.construct,
            &self.names.construct,
            (src_ptr as i32, src_len as i32),
        )
        .map(|handle| handle as u32)
    }

    fn destroy(&mut self, handle: u32) -> Result<()> {
        invoke(
            &mut self.store,
            self.memory,
            &self.exports.destroy,
            &self.names.destroy,
            handle as i32,
        )
    }

    fn tokenize(&mut self, handle: u32) -> Result<u32> {
        invoke(
            &mut self.store,
            self.memory,
            &self.exports.tokenize,
            &self.names.tokenize,
            handle as i32,
        )
        .map(|key| key as u32)
    }

    fn parse_tree(&mut self, handle: u32) -> Result<u32> {
        invoke(
            &mut self.store,
            self.memory,
            &self.exports.parse_tree,
            &self.names.parse_tree,
            handle as i32,
        )
        .map(|key| key as u32)
    }

    fn interpret(&mut self, handle: u32) -> Result<u32> {
        invoke(
            &mut self.store,
            self.memory,
            &self.exports.interpret,
            &self.names.interpret,
            handle as i32,
        )
        .map(|key| key as u32)
    }

    fn has_errors(&mut self, handle: u32) -> Result<i32> {
        invoke(
            &mut self.store,
            self.memory,
            &self.exports.has_errors,
            &self.names.has_errors,
            handle as i32,
        )
    }

    fn environment_dump(&mut self, ret_ptr: u32, handle: u32) -> Result<()> {
        invoke(
            &mut self.store,
            self.memory,
            &self.exports.environment_dump,
            &self.names.environment_dump,
            (ret_ptr as i32, handle as i32),
        )
    }

    fn adjust_stack_pointer(&mut self, delta: i32) -> Result<u32> {
        invoke(
            &mut self.store,
            self.memory,
            &self.exports.adjust_stack_pointer,
            &self.names.adjust_stack_pointer,
            delta,
        )
        .map(|sp| sp as u32)
    }

    fn host_state(&self) -> &HostState {
        &self.store.data().host
    }

    fn host_state_mut(&mut self) -> &mut HostState {
        &mut self.store.data_mut().host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_stable() {
        let a = compute_digest(b"\0asm\x01\0\0\0");
        assert_eq!(a, compute_digest(b"\0asm\x01\0\0\0"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, compute_digest(b"\0asm\x01\0\0\x01"));
    }

    #[test]
    fn test_invalid_binary_is_an_instantiation_error() {
        let loader = ModuleLoader::new();
        let err = loader.load(b"not a module").err().unwrap();
        assert!(matches!(err, BridgeError::Instantiation(_)));
        assert_eq!(loader.cached_modules(), 0);
        assert_eq!(loader.cache_misses(), 1);
    }
}
