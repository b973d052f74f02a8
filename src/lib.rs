//! # Rulox Bridge
//!
//! Host-side binding for a Rulox (Lox) interpreter compiled to a
//! linear-memory module. The bridge marshals strings and structured values
//! across the module boundary and manages the lifetime of interpreter
//! instances living inside the module.
//!
//! ## Architecture
//!
//! ```text
//! Host code
//!     │
//!     │ Rulox (facade)
//!     ▼
//! Bridge ── codec / heap table / memory views
//!     │
//!     │ integer ABI (exports + two imports)
//!     ▼
//! Module backend (wasmi or native)
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use rulox_bridge::{Bridge, BridgeConfig};
//!
//! # fn main() -> rulox_bridge::Result<()> {
//! let bridge = Bridge::from_wasm_file("rulox_web_bg.wasm", BridgeConfig::default())?;
//! let mut rulox = bridge.construct("print 1 + 1;")?;
//! println!("{:?}", rulox.interpret_lines()?);
//! rulox.free()?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

pub mod abi;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod facade;
pub mod handle;
pub mod heap;
pub mod memory;
pub mod metrics;

// Re-export commonly used types
pub use abi::{GuestAllocator, HostState, ModuleExports};
pub use config::{BridgeConfig, ExportNames, StringEncoding};
pub use engine::native::{GuestProgram, NativeModule};
pub use engine::wasmi_module::{ModuleLoader, WasmiModule};
pub use engine::Bridge;
pub use error::{BridgeError, ErrorCode, ErrorReport, Result};
pub use facade::Rulox;
pub use handle::HandleState;
pub use heap::{HeapTable, HostValue, SlotKey};
pub use metrics::BridgeStats;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default log filter when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "rulox_bridge=info";

/// Install a `tracing` subscriber filtered by `RUST_LOG`.
///
/// Safe to call more than once; only the first call installs.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "0.1.0");
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
