//! Error types for the bridge.
//!
//! This module defines the error codes, the serializable error report handed
//! to host consumers, and the main error type used throughout the crate.

use serde::{Deserialize, Serialize};

/// Error codes for categorizing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed UTF-8 where a string was expected
    DecodeError,
    /// Module allocator or reallocator failed
    AllocationFailure,
    /// Method invoked on a released or never-bound handle
    InvalidHandle,
    /// Heap table key that is freed, stale or never assigned
    SlotMisuse,
    /// The module raised an error through the host import
    ModuleFault,
    /// Pointer range outside linear memory or misaligned word access
    MemoryAccess,
    /// View used after the memory it was derived from was relocated
    StaleView,
    /// Any other trap raised by the execution engine
    Trap,
    /// Module failed to compile, link or instantiate
    Instantiation,
    /// Invalid configuration
    InvalidConfig,
    /// IO failure
    IoError,
    /// Serialization/deserialization error
    SerializationError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::DecodeError => write!(f, "DECODE_ERROR"),
            ErrorCode::AllocationFailure => write!(f, "ALLOCATION_FAILURE"),
            ErrorCode::InvalidHandle => write!(f, "INVALID_HANDLE"),
            ErrorCode::SlotMisuse => write!(f, "SLOT_MISUSE"),
            ErrorCode::ModuleFault => write!(f, "MODULE_FAULT"),
            ErrorCode::MemoryAccess => write!(f, "MEMORY_ACCESS"),
            ErrorCode::StaleView => write!(f, "STALE_VIEW"),
            ErrorCode::Trap => write!(f, "TRAP"),
            ErrorCode::Instantiation => write!(f, "INSTANTIATION"),
            ErrorCode::InvalidConfig => write!(f, "INVALID_CONFIG"),
            ErrorCode::IoError => write!(f, "IO_ERROR"),
            ErrorCode::SerializationError => write!(f, "SERIALIZATION_ERROR"),
        }
    }
}

/// Error report handed to host consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    /// Error code
    pub code: ErrorCode,

    /// Human-readable message
    pub message: String,
}

impl std::fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Main error type for the bridge
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Byte range is not valid UTF-8
    #[error("Decode error: {len} bytes at {ptr} are not valid UTF-8 (valid up to {valid_up_to})")]
    Decode {
        /// Start of the range
        ptr: u32,
        /// Length of the range
        len: u32,
        /// Length of the longest valid prefix
        valid_up_to: usize,
    },

    /// Module allocator failure
    #[error("Allocation failure: {0}")]
    AllocationFailure(String),

    /// Handle not in the bound state
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// Heap table misuse
    #[error("Slot misuse: slot {slot:#x} {reason}")]
    SlotMisuse {
        /// The raw key that was rejected
        slot: u32,
        /// Why it was rejected
        reason: &'static str,
    },

    /// Error raised by the module itself
    #[error("{0}")]
    ModuleFault(String),

    /// Out-of-bounds or misaligned memory access
    #[error("Memory access out of bounds: offset {offset}, length {len}, memory size {memory_len}")]
    MemoryAccess {
        /// Requested offset
        offset: u64,
        /// Requested length
        len: u64,
        /// Current memory size in bytes
        memory_len: usize,
    },

    /// Stale view
    #[error("Stale view: captured at memory generation {captured}, memory is at generation {current}")]
    StaleView {
        /// Generation the view was captured at
        captured: u64,
        /// Current generation
        current: u64,
    },

    /// Engine trap
    #[error("Trap in '{export}': {message}")]
    Trap {
        /// Export that was running
        export: String,
        /// Engine message
        message: String,
    },

    /// Module could not be compiled, linked or instantiated
    #[error("Instantiation error: {0}")]
    Instantiation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BridgeError {
    /// Create a trap error for an export
    pub fn trap(export: impl Into<String>, message: impl Into<String>) -> Self {
        BridgeError::Trap {
            export: export.into(),
            message: message.into(),
        }
    }

    /// Create an out-of-bounds error
    pub fn out_of_bounds(offset: u64, len: u64, memory_len: usize) -> Self {
        BridgeError::MemoryAccess {
            offset,
            len,
            memory_len,
        }
    }

    /// Classify the error
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::Decode { .. } => ErrorCode::DecodeError,
            BridgeError::AllocationFailure(_) => ErrorCode::AllocationFailure,
            BridgeError::InvalidHandle(_) => ErrorCode::InvalidHandle,
            BridgeError::SlotMisuse { .. } => ErrorCode::SlotMisuse,
            BridgeError::ModuleFault(_) => ErrorCode::ModuleFault,
            BridgeError::MemoryAccess { .. } => ErrorCode::MemoryAccess,
            BridgeError::StaleView { .. } => ErrorCode::StaleView,
            BridgeError::Trap { .. } => ErrorCode::Trap,
            BridgeError::Instantiation(_) => ErrorCode::Instantiation,
            BridgeError::Config(_) => ErrorCode::InvalidConfig,
            BridgeError::Io(_) => ErrorCode::IoError,
            BridgeError::Serialization(_) => ErrorCode::SerializationError,
        }
    }

    /// Convert to a report for host consumers
    pub fn to_report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Serialization(e.to_string())
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
