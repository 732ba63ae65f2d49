//! Batch files: a module, host symbols and the functions to emit.
//!
//! A batch is what the `kiln` binary feeds through the emitter. It can be
//! written as TOML (`.toml`) or JSON (`.json`).

use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::config::EmitterConfig;
use crate::ir::{BlockId, FuncId, MachineFunction, Module};
use crate::jit::{EmitStats, Emitter};
use crate::target::x86_64::{Inst, X86_64};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Batch {
    #[serde(default)]
    pub module: Module,
    /// Addresses for external symbols, checked before the process namespace
    #[serde(default)]
    pub symbols: HashMap<String, u64>,
    #[serde(default)]
    pub functions: Vec<MachineFunction<Inst>>,
}

impl Batch {
    pub const FILE_NAME: &'static str = "batch.toml";

    /// Load a batch, picking the format from the file extension
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        let is_json = path.extension().is_some_and(|ext| ext == "json");
        if is_json {
            serde_json::from_str(&content)
                .map_err(|e| format!("failed to parse {}: {}", path.display(), e))
        } else {
            toml::from_str(&content).map_err(|e| format!("failed to parse {}: {}", path.display(), e))
        }
    }
}

/// What came out of one emitted function.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionReport {
    pub id: FuncId,
    pub name: String,
    pub address: u64,
    pub size: usize,
    pub relocations: usize,
    pub blocks: Vec<(BlockId, usize)>,
    #[serde(serialize_with = "serialize_hex")]
    pub code: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub functions: Vec<FunctionReport>,
    pub stats: EmitStats,
    pub arena_bytes: usize,
}

fn serialize_hex<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    s.serialize_str(&hex)
}

/// Emit every function of the batch, then resolve all relocations.
pub fn emit_batch(batch: &Batch, config: EmitterConfig) -> Result<BatchReport, String> {
    let mut emitter = Emitter::new(X86_64::new(), batch.module.clone(), config);
    for (name, &addr) in &batch.symbols {
        emitter.define_symbol(name, addr);
    }
    for func in &batch.functions {
        emitter
            .emit_function(func)
            .map_err(|e| format!("failed to emit '{}': {}", func.name, e))?;
    }
    emitter
        .resolve_relocations()
        .map_err(|e| format!("failed to resolve relocations: {}", e))?;

    let functions = emitter
        .functions()
        .iter()
        .map(|rec| FunctionReport {
            id: rec.id,
            name: rec.name.clone(),
            address: rec.code_address(),
            size: rec.size,
            relocations: rec.relocations.len(),
            blocks: rec
                .locations
                .blocks()
                .map(|(block, off)| (block, off - rec.code_offset))
                .collect(),
            code: rec.code().to_vec(),
        })
        .collect();

    Ok(BatchReport {
        functions,
        stats: emitter.stats().clone(),
        arena_bytes: emitter.arena().len(),
    })
}

pub const SAMPLE_BATCH: &str = r#"# Functions to emit, in order. Relocations are resolved after the last one.

[[module.globals]]
id = 0
name = "counter"
ty = "i64"
init = { int = { ty = "i64", value = 41 } }

[symbols]
host_log = 0x1000

[[functions]]
id = 0
name = "main"
constant_pool = [{ value = { constant = { f64 = 2.5 } }, align = 8 }]
jump_tables = { kind = "label_difference32", tables = [{ targets = [1, 2] }] }

[[functions.blocks]]
number = 0
insts = [
    { op = "debug_loc", line = 1, col = 1 },
    { op = "load_const", dst = "rax", index = 0 },
    { op = "load_global", dst = "rdi", global = { variable = 0 } },
    { op = "call", func = 1 },
    { op = "call_symbol", name = "host_log" },
    { op = "lea_jump_table", dst = "r11", index = 0 },
    { op = "load_table_entry", dst = "rax", table = "r11", index = "rcx" },
    { op = "jmp_reg", reg = "rax" },
]

[[functions.blocks]]
number = 1
insts = [{ op = "mov_ri", dst = "rax", imm = 1 }, { op = "ret" }]

[[functions.blocks]]
number = 2
insts = [{ op = "mov_ri", dst = "rax", imm = 2 }, { op = "jmp", target = 1 }]

[[functions]]
id = 1
name = "helper"

[[functions.blocks]]
number = 0
insts = [{ op = "label", label = 0 }, { op = "mov_ri", dst = "rax", imm = 7 }, { op = "ret" }]
"#;

/// Write a sample batch and a default config into `dir`
pub fn init_batch(dir: &Path) -> Result<(), String> {
    let batch_path = dir.join(Batch::FILE_NAME);
    if batch_path.exists() {
        return Err(format!("{} already exists in {}", Batch::FILE_NAME, dir.display()));
    }
    fs::create_dir_all(dir).map_err(|e| format!("failed to create {}: {}", dir.display(), e))?;
    fs::write(&batch_path, SAMPLE_BATCH)
        .map_err(|e| format!("failed to write {}: {}", Batch::FILE_NAME, e))?;

    let config_path = dir.join(EmitterConfig::FILE_NAME);
    if !config_path.exists() {
        EmitterConfig::default().save(&config_path)?;
    }

    println!("Created sample batch in {}", dir.display());
    Ok(())
}
