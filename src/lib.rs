//! Kiln - streaming JIT code emission with deferred relocation
//!
//! Functions are emitted one at a time into executable buffers; every
//! reference to an address that is not known yet is logged and patched by
//! a resolution pass once the whole batch is out.

pub mod batch;
pub mod config;
pub mod error;
pub mod ir;
pub mod jit;
pub mod target;

// Re-export commonly used types
pub use config::EmitterConfig;
pub use error::{ErrorKind, JitError};
pub use jit::{Emitter, FunctionEmitter, MachineRelocation, RelocTarget};
pub use target::{Target, TargetData, TargetJitInfo, ValueInit};
