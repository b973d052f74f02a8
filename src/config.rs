//! Bridge configuration types and defaults.
//!
//! This module defines the configuration options for the bridge, including
//! the string encoding strategy, scratch frame size, memory limits and the
//! names of the module's exports and imports.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// WebAssembly page size in bytes
pub const WASM_PAGE_BYTES: u64 = 64 * 1024;

/// Default memory limit per module (32 MB)
pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 32 * 1024 * 1024;

/// Default auxiliary stack size for the native backend (64 KB)
pub const DEFAULT_STACK_SIZE_BYTES: u64 = 64 * 1024;

/// Default initial heap pages for the native backend
pub const DEFAULT_INITIAL_MEMORY_PAGES: u32 = 1;

/// Default scratch frame reserved for multi-word results
pub const DEFAULT_SCRATCH_FRAME_BYTES: u32 = 16;

/// Default import module name of wasm-bindgen output
pub const DEFAULT_IMPORT_MODULE: &str = "__wbindgen_placeholder__";

/// Free-standing constructor export, interchangeable with `webrulox_new`
pub const RUN_EXPORT: &str = "run";

/// How host strings are written into module memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StringEncoding {
    /// One byte per character first, grow once on the first non-ASCII character
    #[default]
    Streaming,
    /// Allocate the exact UTF-8 length up front
    Exact,
}

/// Names of the module exports the bridge calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExportNames {
    /// Linear memory
    pub memory: String,
    /// `len -> ptr`
    pub allocate: String,
    /// `ptr, old_len, new_len -> ptr`
    pub reallocate: String,
    /// `ptr, len -> ()`
    pub free: String,
    /// `src_ptr, src_len -> handle`; [`RUN_EXPORT`] has the same signature
    pub construct: String,
    /// `handle -> ()`
    pub destroy: String,
    /// `handle -> slot`
    pub tokenize: String,
    /// `handle -> slot`
    pub parse_tree: String,
    /// `handle -> slot`
    pub interpret: String,
    /// `handle -> i32`
    pub has_errors: String,
    /// `ret_ptr, handle -> ()`
    pub environment_dump: String,
    /// `delta -> ptr`
    pub adjust_stack_pointer: String,
}

impl Default for ExportNames {
    fn default() -> Self {
        Self {
            memory: "memory".into(),
            allocate: "__wbindgen_malloc".into(),
            reallocate: "__wbindgen_realloc".into(),
            free: "__wbindgen_free".into(),
            construct: "webrulox_new".into(),
            destroy: "__wbg_webrulox_free".into(),
            tokenize: "webrulox_tokens".into(),
            parse_tree: "webrulox_parse_tree".into(),
            interpret: "webrulox_interpret".into(),
            has_errors: "webrulox_had_errors".into(),
            environment_dump: "webrulox_get_environment".into(),
            adjust_stack_pointer: "__wbindgen_add_to_stack_pointer".into(),
        }
    }
}

impl ExportNames {
    /// Construct instances through the free-standing `run` export
    pub fn with_run_constructor(mut self) -> Self {
        self.construct = RUN_EXPORT.into();
        self
    }
}

/// Configuration for the bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// String encoding strategy (default: streaming)
    #[serde(default)]
    pub string_encoding: StringEncoding,

    /// Bytes reserved on the auxiliary stack for multi-word results (default: 16)
    #[serde(default = "default_scratch_frame")]
    pub scratch_frame_bytes: u32,

    /// Maximum linear memory size in bytes (default: 32MB)
    #[serde(default = "default_max_memory")]
    pub max_memory_bytes: u64,

    /// Auxiliary stack size of the native backend (default: 64KB)
    #[serde(default = "default_stack_size")]
    pub stack_size_bytes: u64,

    /// Initial heap pages of the native backend (default: 1)
    #[serde(default = "default_initial_pages")]
    pub initial_memory_pages: u32,

    /// Path to the module binary (optional)
    #[serde(default)]
    pub module_path: Option<PathBuf>,

    /// Import module name the host functions are registered under
    #[serde(default = "default_import_module")]
    pub import_module: String,

    /// Export names
    #[serde(default)]
    pub exports: ExportNames,

    /// Log every bridge call with its timing at debug level (default: false)
    #[serde(default)]
    pub debug: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            string_encoding: StringEncoding::default(),
            scratch_frame_bytes: DEFAULT_SCRATCH_FRAME_BYTES,
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            stack_size_bytes: DEFAULT_STACK_SIZE_BYTES,
            initial_memory_pages: DEFAULT_INITIAL_MEMORY_PAGES,
            module_path: None,
            import_module: DEFAULT_IMPORT_MODULE.to_string(),
            exports: ExportNames::default(),
            debug: false,
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: BridgeConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the string encoding strategy
    pub fn with_string_encoding(mut self, encoding: StringEncoding) -> Self {
        self.string_encoding = encoding;
        self
    }

    /// Set the scratch frame size
    pub fn with_scratch_frame(mut self, bytes: u32) -> Self {
        self.scratch_frame_bytes = bytes;
        self
    }

    /// Set the memory limit
    pub fn with_max_memory(mut self, bytes: u64) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    /// Set the native stack size
    pub fn with_stack_size(mut self, bytes: u64) -> Self {
        self.stack_size_bytes = bytes;
        self
    }

    /// Set the native initial heap pages
    pub fn with_initial_pages(mut self, pages: u32) -> Self {
        self.initial_memory_pages = pages;
        self
    }

    /// Set the module path
    pub fn with_module_path(mut self, path: PathBuf) -> Self {
        self.module_path = Some(path);
        self
    }

    /// Set the import module name
    pub fn with_import_module(mut self, name: impl Into<String>) -> Self {
        self.import_module = name.into();
        self
    }

    /// Enable debug mode
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scratch_frame_bytes == 0 || self.scratch_frame_bytes % 8 != 0 {
            return Err(ConfigError::InvalidValue {
                field: "scratch_frame_bytes".into(),
                reason: "must be a positive multiple of 8".into(),
            });
        }

        if self.scratch_frame_bytes > i32::MAX as u32 {
            return Err(ConfigError::InvalidValue {
                field: "scratch_frame_bytes".into(),
                reason: "must fit in a signed 32-bit delta".into(),
            });
        }

        if self.max_memory_bytes < WASM_PAGE_BYTES || self.max_memory_bytes > u32::MAX as u64 + 1 {
            return Err(ConfigError::InvalidValue {
                field: "max_memory_bytes".into(),
                reason: "must be between one 64KB page and 4GB".into(),
            });
        }

        if self.stack_size_bytes < 1024 {
            return Err(ConfigError::InvalidValue {
                field: "stack_size_bytes".into(),
                reason: "must be at least 1KB".into(),
            });
        }

        if self.initial_memory_pages == 0 {
            return Err(ConfigError::InvalidValue {
                field: "initial_memory_pages".into(),
                reason: "must be greater than 0".into(),
            });
        }

        let initial = (self.initial_memory_pages as u64)
            .checked_mul(WASM_PAGE_BYTES)
            .and_then(|heap| heap.checked_add(self.stack_size_bytes))
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "stack_size_bytes".into(),
                reason: "stack plus initial heap overflows".into(),
            })?;
        if initial > self.max_memory_bytes {
            return Err(ConfigError::InvalidValue {
                field: "initial_memory_pages".into(),
                reason: format!(
                    "stack plus initial heap ({} bytes) exceeds max_memory_bytes ({})",
                    initial, self.max_memory_bytes
                ),
            });
        }

        if self.import_module.is_empty() {
            return Err(ConfigError::MissingField {
                field: "import_module".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// The field name
        field: String,
        /// The reason it's invalid
        reason: String,
    },

    /// Missing required field
    #[error("Missing required configuration field: {field}")]
    MissingField {
        /// The field name
        field: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Default value functions for serde
fn default_scratch_frame() -> u32 {
    DEFAULT_SCRATCH_FRAME_BYTES
}

fn default_max_memory() -> u64 {
    DEFAULT_MAX_MEMORY_BYTES
}

fn default_stack_size() -> u64 {
    DEFAULT_STACK_SIZE_BYTES
}

fn default_initial_pages() -> u32 {
    DEFAULT_INITIAL_MEMORY_PAGES
}

fn default_import_module() -> String {
    DEFAULT_IMPORT_MODULE.to_string()
}
