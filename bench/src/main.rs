use kiln::config::EmitterConfig;
use kiln::ir::{
    BlockId, Constant, ConstantPoolEntry, FuncId, GlobalId, GlobalRef, GlobalVariable, JumpTable,
    JumpTableInfo, JumpTableKind, MachineFunction, Module, Type,
};
use kiln::jit::Emitter;
use kiln::target::x86_64::{Cond, Inst, Reg, X86_64};
use serde::Serialize;
use std::time::Instant;

#[derive(Serialize)]
struct BenchmarkResult {
    name: String,
    functions: usize,
    code_bytes: usize,
    relocations: usize,
    retries: usize,
    emit_secs: f64,
    resolve_secs: f64,
}

#[derive(Serialize)]
struct BenchmarkOutput {
    results: Vec<BenchmarkResult>,
}

// Synthetic workloads

/// Straight-line arithmetic, no relocations.
fn straight_line(id: u32, len: usize) -> MachineFunction<Inst> {
    let mut func = MachineFunction::new(FuncId(id), &format!("straight{}", id));
    let mut insts = Vec::with_capacity(len + 1);
    for i in 0..len {
        insts.push(match i % 3 {
            0 => Inst::AddRi {
                dst: Reg::Rax,
                imm: i as i32,
            },
            1 => Inst::ImulRr {
                dst: Reg::Rax,
                src: Reg::Rcx,
            },
            _ => Inst::MovRr {
                dst: Reg::Rdx,
                src: Reg::Rax,
            },
        });
    }
    insts.push(Inst::Ret);
    func.push_block(insts);
    func
}

/// Many small blocks branching forward and backward, plus a switch table.
fn branchy(id: u32, blocks: u32) -> MachineFunction<Inst> {
    let mut func = MachineFunction::new(FuncId(id), &format!("branchy{}", id));
    func.jump_tables = Some(JumpTableInfo {
        kind: JumpTableKind::LabelDifference32,
        tables: vec![JumpTable {
            targets: (0..blocks).map(BlockId).collect(),
        }],
    });
    for b in 0..blocks {
        func.push_block(vec![
            Inst::CmpRi {
                dst: Reg::Rdi,
                imm: b as i32,
            },
            Inst::Jcc {
                cond: Cond::E,
                target: BlockId((b + 1) % blocks),
            },
            Inst::LeaJumpTable {
                dst: Reg::R11,
                index: 0,
            },
            Inst::Jmp {
                target: BlockId(b / 2),
            },
        ]);
    }
    func
}

/// Constant loads and global references.
fn pool_heavy(id: u32, entries: usize) -> MachineFunction<Inst> {
    let mut func = MachineFunction::new(FuncId(id), &format!("pool{}", id));
    let mut insts = Vec::new();
    for i in 0..entries {
        func.constant_pool
            .push(ConstantPoolEntry::new(Constant::F64(i as f64 * 0.5), 8));
        insts.push(Inst::LoadConst {
            dst: Reg::Rax,
            index: i,
        });
        insts.push(Inst::LoadGlobal {
            dst: Reg::Rcx,
            global: GlobalRef::Variable(GlobalId((i % 8) as u32)),
        });
    }
    insts.push(Inst::Ret);
    func.push_block(insts);
    func
}

/// Each function calls the next one.
fn call_chain(id: u32, last: u32) -> MachineFunction<Inst> {
    let mut func = MachineFunction::new(FuncId(id), &format!("chain{}", id));
    let next = if id + 1 < last { id + 1 } else { id };
    func.push_block(vec![
        Inst::Push { reg: Reg::Rbx },
        Inst::Call {
            func: FuncId(next),
        },
        Inst::LoadGlobal {
            dst: Reg::Rax,
            global: GlobalRef::Function(FuncId(next)),
        },
        Inst::Pop { reg: Reg::Rbx },
        Inst::Ret,
    ]);
    func
}

fn module() -> Module {
    Module {
        globals: (0..8)
            .map(|i| {
                GlobalVariable::new(
                    GlobalId(i),
                    &format!("g{}", i),
                    Type::I64,
                    Some(Constant::i64(i as i64)),
                )
            })
            .collect(),
        aliases: Vec::new(),
    }
}

fn run_benchmark(
    name: &str,
    functions: &[MachineFunction<Inst>],
    config: EmitterConfig,
) -> BenchmarkResult {
    let mut emitter = Emitter::new(X86_64::new(), module(), config);

    let start = Instant::now();
    for func in functions {
        if let Err(e) = emitter.emit_function(func) {
            eprintln!("benchmark {} failed to emit '{}': {}", name, func.name, e);
        }
    }
    let emit_secs = start.elapsed().as_secs_f64();

    let start = Instant::now();
    if let Err(e) = emitter.resolve_relocations() {
        eprintln!("benchmark {} failed to resolve: {}", name, e);
    }
    let resolve_secs = start.elapsed().as_secs_f64();

    let stats = emitter.stats();
    BenchmarkResult {
        name: name.to_string(),
        functions: stats.functions,
        code_bytes: stats.code_bytes,
        relocations: stats.relocations,
        retries: stats.retries,
        emit_secs,
        resolve_secs,
    }
}

fn main() {
    let mut results = Vec::new();

    let straight: Vec<_> = (0..200).map(|i| straight_line(i, 400)).collect();
    results.push(run_benchmark("straight_line", &straight, EmitterConfig::default()));

    // Same workload, forced through the retry path
    let tiny = EmitterConfig {
        initial_buffer_size: 64,
        ..EmitterConfig::default()
    };
    results.push(run_benchmark("straight_line_retry", &straight, tiny));

    let sized = EmitterConfig {
        initial_buffer_size: 1 << 16,
        ..EmitterConfig::default()
    };
    results.push(run_benchmark("straight_line_sized", &straight, sized));

    let branches: Vec<_> = (0..200).map(|i| branchy(i, 64)).collect();
    results.push(run_benchmark("branchy", &branches, EmitterConfig::default()));

    let pools: Vec<_> = (0..200).map(|i| pool_heavy(i, 128)).collect();
    results.push(run_benchmark("pool_heavy", &pools, EmitterConfig::default()));

    let chain: Vec<_> = (0..1000).map(|i| call_chain(i, 1000)).collect();
    results.push(run_benchmark("call_chain", &chain, EmitterConfig::default()));

    let output = BenchmarkOutput { results };
    match serde_json::to_string_pretty(&output) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("failed to serialize results: {}", e),
    }
}
