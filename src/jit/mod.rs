//! Code emission and relocation.
//!
//! - Executable memory blocks and the fixed-size code buffer
//! - Per-function emission sessions with overflow retry
//! - Relocation logs, resolved in a second pass after a batch
//! - The global arena for global variable storage

pub mod arena;
mod codebuf;
pub mod diagnostics;
mod emitter;
mod function_table;
pub mod layout;
mod locations;
pub mod memory;
mod reloc;
mod resolve;
mod symbols;

pub use arena::{ARENA_TAG, ArenaOffset, GlobalArena};
pub use codebuf::CodeBuffer;
pub use diagnostics::{DiagnosticsSink, EmittedCode, HexDump, LogSink, NullSink, hex_dump};
pub use emitter::{EmitStats, Emitter, FunctionEmitter, SessionState};
pub use function_table::{FunctionRecord, FunctionTable};
pub use layout::{JumpTableLayout, PoolLayout};
pub use locations::LocationTable;
pub use memory::{ExecutableMemory, MemoryError};
pub use reloc::{MachineRelocation, RelocTarget};
pub use symbols::SymbolTable;
