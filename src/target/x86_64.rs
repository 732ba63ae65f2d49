//! x86-64 reference target.
//!
//! Encodes a small instruction set into a [`CodeBuffer`] and patches two
//! relocation forms: rel32 fields measured from the end of the field, and
//! absolute 64-bit immediates. Uses System V AMD64 register conventions.

use serde::{Deserialize, Serialize};

use super::{DataLayout, TargetData, TargetJitInfo, ValueInit, write_constant};
use crate::error::JitError;
use crate::ir::{BlockId, Constant, FuncId, GlobalRef, LabelId, SourceLoc, Type};
use crate::jit::{CodeBuffer, FunctionEmitter, MachineRelocation};

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Reg {
    Rax = 0, // Return value
    Rcx = 1, // 4th argument
    Rdx = 2, // 3rd argument
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6, // 2nd argument
    Rdi = 7, // 1st argument
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11, // Scratch for far calls
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Register code (lower 3 bits).
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }

    /// REX.B bit for this register as base/rm.
    pub fn rex_b(self) -> u8 {
        if self.needs_rex_ext() { 0x01 } else { 0x00 }
    }

    /// REX.R bit for this register as reg.
    pub fn rex_r(self) -> u8 {
        if self.needs_rex_ext() { 0x04 } else { 0x00 }
    }
}

/// Condition codes for Jcc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,  // unsigned <
    Ae = 0x3, // unsigned >=
    E = 0x4,
    Ne = 0x5,
    Be = 0x6, // unsigned <=
    A = 0x7,  // unsigned >
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,  // signed <
    Ge = 0xD, // signed >=
    Le = 0xE, // signed <=
    G = 0xF,  // signed >
}

impl Cond {
    pub fn invert(self) -> Self {
        match self {
            Cond::O => Cond::No,
            Cond::No => Cond::O,
            Cond::B => Cond::Ae,
            Cond::Ae => Cond::B,
            Cond::E => Cond::Ne,
            Cond::Ne => Cond::E,
            Cond::Be => Cond::A,
            Cond::A => Cond::Be,
            Cond::S => Cond::Ns,
            Cond::Ns => Cond::S,
            Cond::P => Cond::Np,
            Cond::Np => Cond::P,
            Cond::L => Cond::Ge,
            Cond::Ge => Cond::L,
            Cond::Le => Cond::G,
            Cond::G => Cond::Le,
        }
    }
}

/// Raw instruction encoder. Address fields are emitted as zero
/// placeholders; the caller records the relocation.
pub struct X86_64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X86_64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    /// REX.W prefix for a reg/rm pair.
    fn rex_w(&mut self, reg: Reg, rm: Reg) {
        self.buf.emit_u8(0x48 | reg.rex_r() | rm.rex_b());
    }

    fn rex_w_single(&mut self, rm: Reg) {
        self.buf.emit_u8(0x48 | rm.rex_b());
    }

    /// REX.B alone, only when the register needs it.
    fn rex_b_if_needed(&mut self, rm: Reg) {
        if rm.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
    }

    /// ModR/M (+SIB, +disp) for `[base + disp]`.
    fn mem_operand(&mut self, reg: u8, base: Reg, disp: i32) {
        let needs_sib = base.code() == 0b100; // rsp, r12
        let mode = if disp == 0 && base.code() != 0b101 {
            0b00
        } else if (-128..=127).contains(&disp) {
            0b01
        } else {
            0b10
        };
        self.buf.emit_u8(Self::modrm(mode, reg, base.code()));
        if needs_sib {
            self.buf.emit_u8(0x24);
        }
        match mode {
            0b01 => self.buf.emit_u8(disp as u8),
            0b10 => self.buf.emit_u32(disp as u32),
            _ => {}
        }
    }

    /// Binary op with opcode `op` in its `r/m64, r64` form.
    fn alu_rr(&mut self, op: u8, dst: Reg, src: Reg) {
        self.rex_w(src, dst);
        self.buf.emit_u8(op);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// Group-1 op (`/ext`) with a sign-extended immediate.
    fn alu_ri(&mut self, ext: u8, dst: Reg, imm: i32) {
        self.rex_w_single(dst);
        if (-128..=127).contains(&imm) {
            self.buf.emit_u8(0x83);
            self.buf.emit_u8(Self::modrm(0b11, ext, dst.code()));
            self.buf.emit_u8(imm as u8);
        } else {
            self.buf.emit_u8(0x81);
            self.buf.emit_u8(Self::modrm(0b11, ext, dst.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    /// MOV r64, r64
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x89, dst, src);
    }

    /// MOV r64, imm64. The immediate starts 2 bytes into the instruction.
    pub fn mov_ri64(&mut self, dst: Reg, imm: i64) {
        self.rex_w_single(dst);
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u64(imm as u64);
    }

    /// MOV r64, imm32 (sign-extended)
    pub fn mov_ri32(&mut self, dst: Reg, imm: i32) {
        self.rex_w_single(dst);
        self.buf.emit_u8(0xC7);
        self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
        self.buf.emit_u32(imm as u32);
    }

    /// MOV r64, [base + disp]
    pub fn mov_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex_w(dst, base);
        self.buf.emit_u8(0x8B);
        self.mem_operand(dst.code(), base, disp);
    }

    /// MOV [base + disp], r64
    pub fn mov_mr(&mut self, base: Reg, disp: i32, src: Reg) {
        self.rex_w(src, base);
        self.buf.emit_u8(0x89);
        self.mem_operand(src.code(), base, disp);
    }

    /// MOV r64, [rip + disp32]. The displacement starts 3 bytes in.
    pub fn mov_r_riprel(&mut self, dst: Reg, disp: i32) {
        self.buf.emit_u8(0x48 | dst.rex_r());
        self.buf.emit_u8(0x8B);
        self.buf.emit_u8(Self::modrm(0b00, dst.code(), 0b101));
        self.buf.emit_u32(disp as u32);
    }

    /// LEA r64, [rip + disp32]. The displacement starts 3 bytes in.
    pub fn lea_r_riprel(&mut self, dst: Reg, disp: i32) {
        self.buf.emit_u8(0x48 | dst.rex_r());
        self.buf.emit_u8(0x8D);
        self.buf.emit_u8(Self::modrm(0b00, dst.code(), 0b101));
        self.buf.emit_u32(disp as u32);
    }

    /// ADD r64, r64
    pub fn add_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x01, dst, src);
    }

    /// ADD r64, imm32
    pub fn add_ri32(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(0, dst, imm);
    }

    /// SUB r64, r64
    pub fn sub_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x29, dst, src);
    }

    /// SUB r64, imm32
    pub fn sub_ri32(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(5, dst, imm);
    }

    /// IMUL r64, r64
    pub fn imul_rr(&mut self, dst: Reg, src: Reg) {
        self.rex_w(dst, src);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xAF);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// CMP r64, r64
    pub fn cmp_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x39, dst, src);
    }

    /// CMP r64, imm32
    pub fn cmp_ri32(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(7, dst, imm);
    }

    /// MOVSXD r64, DWORD [base + index*4]
    pub fn movsxd_rm_scale4(&mut self, dst: Reg, base: Reg, index: Reg) {
        let rex_x = if index.needs_rex_ext() { 0x02 } else { 0 };
        self.buf.emit_u8(0x48 | dst.rex_r() | rex_x | base.rex_b());
        self.buf.emit_u8(0x63);
        if base.code() == 0b101 {
            // rbp/r13 as base needs an explicit disp8
            self.buf.emit_u8(Self::modrm(0b01, dst.code(), 0b100));
            self.buf.emit_u8((0b10 << 6) | (index.code() << 3) | base.code());
            self.buf.emit_u8(0);
        } else {
            self.buf.emit_u8(Self::modrm(0b00, dst.code(), 0b100));
            self.buf.emit_u8((0b10 << 6) | (index.code() << 3) | base.code());
        }
    }

    pub fn push(&mut self, reg: Reg) {
        self.rex_b_if_needed(reg);
        self.buf.emit_u8(0x50 + reg.code());
    }

    pub fn pop(&mut self, reg: Reg) {
        self.rex_b_if_needed(reg);
        self.buf.emit_u8(0x58 + reg.code());
    }

    /// JMP rel32. The displacement starts 1 byte in.
    pub fn jmp_rel32(&mut self, offset: i32) {
        self.buf.emit_u8(0xE9);
        self.buf.emit_u32(offset as u32);
    }

    /// Jcc rel32. The displacement starts 2 bytes in.
    pub fn jcc_rel32(&mut self, cond: Cond, offset: i32) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8);
        self.buf.emit_u32(offset as u32);
    }

    /// CALL rel32. The displacement starts 1 byte in.
    pub fn call_rel32(&mut self, offset: i32) {
        self.buf.emit_u8(0xE8);
        self.buf.emit_u32(offset as u32);
    }

    /// CALL r64
    pub fn call_r(&mut self, reg: Reg) {
        self.rex_b_if_needed(reg);
        self.buf.emit_u8(0xFF);
        self.buf.emit_u8(Self::modrm(0b11, 2, reg.code()));
    }

    /// JMP r64
    pub fn jmp_r(&mut self, reg: Reg) {
        self.rex_b_if_needed(reg);
        self.buf.emit_u8(0xFF);
        self.buf.emit_u8(Self::modrm(0b11, 4, reg.code()));
    }

    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    pub fn nop(&mut self) {
        self.buf.emit_u8(0x90);
    }
}

/// Instructions accepted by the x86-64 target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Inst {
    MovRr { dst: Reg, src: Reg },
    /// Uses the short form when the value fits in 32 bits.
    MovRi { dst: Reg, imm: i64 },
    Load { dst: Reg, base: Reg, disp: i32 },
    Store { base: Reg, disp: i32, src: Reg },
    AddRr { dst: Reg, src: Reg },
    AddRi { dst: Reg, imm: i32 },
    SubRr { dst: Reg, src: Reg },
    SubRi { dst: Reg, imm: i32 },
    ImulRr { dst: Reg, src: Reg },
    CmpRr { dst: Reg, src: Reg },
    CmpRi { dst: Reg, imm: i32 },
    Push { reg: Reg },
    Pop { reg: Reg },
    Nop,
    Ret,
    Jmp { target: BlockId },
    Jcc { cond: Cond, target: BlockId },
    /// Direct call to a function of the batch.
    Call { func: FuncId },
    /// Call through r11 to an external symbol.
    CallSymbol { name: String },
    /// Absolute address of a global into `dst`.
    LoadGlobal { dst: Reg, global: GlobalRef },
    LoadIndirect { dst: Reg, global: GlobalRef },
    LoadBlockAddress { dst: Reg, block: BlockId },
    /// Load a constant pool entry, rip-relative.
    LoadConst { dst: Reg, index: usize },
    /// Address of a jump table, rip-relative.
    LeaJumpTable { dst: Reg, index: usize },
    /// `dst = sign_extend(table[index]) + table`, for 32-bit relative tables.
    LoadTableEntry { dst: Reg, table: Reg, index: Reg },
    JmpReg { reg: Reg },
    Label { label: LabelId },
    DebugLoc { line: u32, col: u32 },
}

/// How a resolved address is written into x86-64 code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum X86Reloc {
    /// Signed 32-bit displacement from the end of the field.
    PcRel32,
    /// Absolute 64-bit value.
    Abs64,
}

impl X86Reloc {
    pub fn width(self) -> usize {
        match self {
            X86Reloc::PcRel32 => 4,
            X86Reloc::Abs64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct X86_64 {
    layout: DataLayout,
}

impl X86_64 {
    pub fn new() -> Self {
        Self {
            layout: DataLayout::new(8),
        }
    }
}

impl Default for X86_64 {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetData for X86_64 {
    fn pointer_size(&self) -> usize {
        self.layout.pointer_size()
    }

    fn store_size(&self, ty: &Type) -> usize {
        self.layout.store_size(ty)
    }

    fn abi_align(&self, ty: &Type) -> usize {
        self.layout.abi_align(ty)
    }

    fn preferred_align(&self, ty: &Type) -> usize {
        // Aggregates of 16 bytes or more are 16-byte aligned when possible.
        match ty {
            Type::Array { .. } | Type::Struct { .. } if self.alloc_size(ty) >= 16 => {
                self.abi_align(ty).max(16)
            }
            _ => self.abi_align(ty),
        }
    }
}

impl ValueInit for X86_64 {
    fn initialize_memory(&self, value: &Constant, dest: &mut [u8]) -> Result<(), JitError> {
        write_constant(self, value, dest)
    }
}

/// `mov dst, imm64` with a zero placeholder; returns the offset of the imm64.
fn mov_abs(cx: &mut FunctionEmitter<X86Reloc>, dst: Reg) -> usize {
    let at = cx.offset() + 2;
    X86_64Assembler::new(cx.buffer_mut()).mov_ri64(dst, 0);
    at
}

impl TargetJitInfo for X86_64 {
    type Inst = Inst;
    type RelocKind = X86Reloc;

    fn emit_inst(&self, inst: &Inst, cx: &mut FunctionEmitter<X86Reloc>) -> Result<(), JitError> {
        let start = cx.offset();
        match inst {
            Inst::MovRr { dst, src } => X86_64Assembler::new(cx.buffer_mut()).mov_rr(*dst, *src),
            Inst::MovRi { dst, imm } => {
                let mut asm = X86_64Assembler::new(cx.buffer_mut());
                match i32::try_from(*imm) {
                    Ok(imm) => asm.mov_ri32(*dst, imm),
                    Err(_) => asm.mov_ri64(*dst, *imm),
                }
            }
            Inst::Load { dst, base, disp } => {
                X86_64Assembler::new(cx.buffer_mut()).mov_rm(*dst, *base, *disp)
            }
            Inst::Store { base, disp, src } => {
                X86_64Assembler::new(cx.buffer_mut()).mov_mr(*base, *disp, *src)
            }
            Inst::AddRr { dst, src } => X86_64Assembler::new(cx.buffer_mut()).add_rr(*dst, *src),
            Inst::AddRi { dst, imm } => X86_64Assembler::new(cx.buffer_mut()).add_ri32(*dst, *imm),
            Inst::SubRr { dst, src } => X86_64Assembler::new(cx.buffer_mut()).sub_rr(*dst, *src),
            Inst::SubRi { dst, imm } => X86_64Assembler::new(cx.buffer_mut()).sub_ri32(*dst, *imm),
            Inst::ImulRr { dst, src } => X86_64Assembler::new(cx.buffer_mut()).imul_rr(*dst, *src),
            Inst::CmpRr { dst, src } => X86_64Assembler::new(cx.buffer_mut()).cmp_rr(*dst, *src),
            Inst::CmpRi { dst, imm } => X86_64Assembler::new(cx.buffer_mut()).cmp_ri32(*dst, *imm),
            Inst::Push { reg } => X86_64Assembler::new(cx.buffer_mut()).push(*reg),
            Inst::Pop { reg } => X86_64Assembler::new(cx.buffer_mut()).pop(*reg),
            Inst::Nop => X86_64Assembler::new(cx.buffer_mut()).nop(),
            Inst::Ret => X86_64Assembler::new(cx.buffer_mut()).ret(),
            Inst::Jmp { target } => {
                X86_64Assembler::new(cx.buffer_mut()).jmp_rel32(0);
                cx.add_relocation(MachineRelocation::basic_block(
                    start + 1,
                    X86Reloc::PcRel32,
                    *target,
                ));
            }
            Inst::Jcc { cond, target } => {
                X86_64Assembler::new(cx.buffer_mut()).jcc_rel32(*cond, 0);
                cx.add_relocation(MachineRelocation::basic_block(
                    start + 2,
                    X86Reloc::PcRel32,
                    *target,
                ));
            }
            Inst::Call { func } => {
                X86_64Assembler::new(cx.buffer_mut()).call_rel32(0);
                cx.add_relocation(
                    MachineRelocation::global_value(
                        start + 1,
                        X86Reloc::PcRel32,
                        GlobalRef::Function(*func),
                    )
                    .with_far_stub(),
                );
            }
            Inst::CallSymbol { name } => {
                let at = mov_abs(cx, Reg::R11);
                cx.add_relocation(MachineRelocation::external_symbol(at, X86Reloc::Abs64, name));
                X86_64Assembler::new(cx.buffer_mut()).call_r(Reg::R11);
            }
            Inst::LoadGlobal { dst, global } => {
                let at = mov_abs(cx, *dst);
                cx.add_relocation(MachineRelocation::global_value(at, X86Reloc::Abs64, *global));
            }
            Inst::LoadIndirect { dst, global } => {
                let at = mov_abs(cx, *dst);
                cx.add_relocation(MachineRelocation::indirect_symbol(at, X86Reloc::Abs64, *global));
            }
            Inst::LoadBlockAddress { dst, block } => {
                let at = mov_abs(cx, *dst);
                cx.add_relocation(MachineRelocation::basic_block(at, X86Reloc::Abs64, *block));
            }
            Inst::LoadConst { dst, index } => {
                X86_64Assembler::new(cx.buffer_mut()).mov_r_riprel(*dst, 0);
                cx.add_relocation(MachineRelocation::constant_pool(
                    start + 3,
                    X86Reloc::PcRel32,
                    *index,
                ));
            }
            Inst::LeaJumpTable { dst, index } => {
                X86_64Assembler::new(cx.buffer_mut()).lea_r_riprel(*dst, 0);
                cx.add_relocation(MachineRelocation::jump_table(
                    start + 3,
                    X86Reloc::PcRel32,
                    *index,
                ));
            }
            Inst::LoadTableEntry { dst, table, index } => {
                let mut asm = X86_64Assembler::new(cx.buffer_mut());
                asm.movsxd_rm_scale4(*dst, *table, *index);
                asm.add_rr(*dst, *table);
            }
            Inst::JmpReg { reg } => X86_64Assembler::new(cx.buffer_mut()).jmp_r(*reg),
            Inst::Label { label } => cx.emit_label(*label)?,
            Inst::DebugLoc { line, col } => cx.process_debug_loc(SourceLoc {
                line: *line,
                col: *col,
            }),
        }
        Ok(())
    }

    fn relocate(
        &self,
        code: &mut [u8],
        base: u64,
        relocs: &mut [MachineRelocation<X86Reloc>],
    ) -> Result<(), JitError> {
        for reloc in relocs.iter() {
            // No x86-64 relocation is resolved by the target itself.
            let Some(result) = reloc.result.filter(|_| !reloc.let_target_resolve) else {
                return Err(JitError::UnhandledRelocation {
                    offset: reloc.offset,
                });
            };
            let target = result.wrapping_add(reloc.addend as u64);
            let width = reloc.kind.width();
            let field = code
                .get_mut(reloc.offset..reloc.offset + width)
                .ok_or(JitError::RelocationOutOfBounds {
                    offset: reloc.offset,
                })?;
            match reloc.kind {
                X86Reloc::Abs64 => field.copy_from_slice(&target.to_le_bytes()),
                X86Reloc::PcRel32 => {
                    let pc = base + (reloc.offset + width) as u64;
                    let disp = i32::try_from((target as i64).wrapping_sub(pc as i64)).map_err(|_| {
                        JitError::RelocationRange {
                            offset: reloc.offset,
                            target,
                        }
                    })?;
                    field.copy_from_slice(&disp.to_le_bytes());
                }
            }
        }
        Ok(())
    }
}
