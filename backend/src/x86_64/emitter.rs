//! x86-64 instruction encoding primitives.
//!
//! Opcode constants carry prefix/extension requirements in their
//! high bits (the `P_*` flags); `emit_opc` turns them into the
//! right prefix bytes and REX.

#![allow(non_upper_case_globals)]

use crate::code_buffer::CodeBuffer;
use crate::x86_64::regs::Reg;
use qdbt_core::CondCode;

// -- Prefix flags --

pub const P_EXT: u32 = 0x100; // 0x0F escape
pub const P_DATA16: u32 = 0x400; // 0x66 prefix
pub const P_REXW: u32 = 0x1000; // REX.W
pub const P_REXB_R: u32 = 0x2000; // reg field is a byte register
pub const P_REXB_RM: u32 = 0x4000; // r/m field is a byte register

// -- Opcodes --

pub const OPC_ARITH_GvEv: u32 = 0x03; // + op << 3
pub const OPC_ARITH_EvIz: u32 = 0x81;
pub const OPC_ARITH_EvIb: u32 = 0x83;
pub const OPC_MOVB_EvGv: u32 = 0x88;
pub const OPC_MOVL_EvGv: u32 = 0x89;
pub const OPC_MOVL_GvEv: u32 = 0x8b;
pub const OPC_MOVB_EvIz: u32 = 0xc6;
pub const OPC_MOVL_EvIz: u32 = 0xc7;
pub const OPC_MOVZBL: u32 = 0xb6 | P_EXT;
pub const OPC_MOVZWL: u32 = 0xb7 | P_EXT;
pub const OPC_MOVSBL: u32 = 0xbe | P_EXT;
pub const OPC_MOVSWL: u32 = 0xbf | P_EXT;
pub const OPC_SHIFT_Ib: u32 = 0xc1;
pub const OPC_SHIFT_cl: u32 = 0xd3;
pub const OPC_TESTL: u32 = 0x85;
pub const OPC_SETCC: u32 = 0x90 | P_EXT | P_REXB_RM;
pub const OPC_JCC_long: u32 = 0x80 | P_EXT;
pub const OPC_JMP_long: u32 = 0xe9;
pub const OPC_GRP5: u32 = 0xff;
pub const OPC_PUSH_r: u32 = 0x50;
pub const OPC_POP_r: u32 = 0x58;
pub const OPC_RET: u32 = 0xc3;

/// Arithmetic group sub-opcodes (the /r extension of 0x81/0x83,
/// also the row selector of the short reg-reg forms).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ArithOp {
    Add = 0,
    Or = 1,
    Adc = 2,
    Sbb = 3,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

/// Shift group sub-opcodes (the /r extension of 0xC1/0xD3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShiftOp {
    Shl = 4,
    Shr = 5,
    Sar = 7,
}

/// Group 5 extension codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Ext5Op {
    CallN = 2,
    JmpN = 4,
}

/// x86 condition codes for Jcc/SETcc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum X86Cond {
    Jb = 0x2,
    Jae = 0x3,
    Je = 0x4,
    Jne = 0x5,
    Jbe = 0x6,
    Ja = 0x7,
    Jl = 0xc,
    Jge = 0xd,
    Jle = 0xe,
    Jg = 0xf,
}

impl X86Cond {
    pub fn from_cc(cc: CondCode) -> X86Cond {
        match cc {
            CondCode::Eq => X86Cond::Je,
            CondCode::Ne => X86Cond::Jne,
            CondCode::Lt => X86Cond::Jl,
            CondCode::Ge => X86Cond::Jge,
            CondCode::Le => X86Cond::Jle,
            CondCode::Gt => X86Cond::Jg,
            CondCode::Ltu => X86Cond::Jb,
            CondCode::Geu => X86Cond::Jae,
            CondCode::Leu => X86Cond::Jbe,
            CondCode::Gtu => X86Cond::Ja,
        }
    }
}

// -- Core encoding --

/// Emit prefixes + opcode byte. `r` is the reg field, `rm` the r/m
/// field, `index` the SIB index (0 when unused - REX.X for plain
/// RAX index never matters since RSP cannot be an index).
fn emit_opc_full(buf: &mut CodeBuffer, opc: u32, r: u8, rm: u8, index: u8) {
    let mut rex: u8 = 0;
    if opc & P_REXW != 0 {
        rex |= 0x08;
    }
    if r >= 8 {
        rex |= 0x04;
    }
    if index >= 8 {
        rex |= 0x02;
    }
    if rm >= 8 {
        rex |= 0x01;
    }
    // Byte access to SPL/BPL/SIL/DIL needs a bare REX prefix.
    if rex == 0
        && ((opc & P_REXB_R != 0 && (4..8).contains(&r))
            || (opc & P_REXB_RM != 0 && (4..8).contains(&rm)))
    {
        rex = 0x40;
    }

    if opc & P_DATA16 != 0 {
        buf.emit_u8(0x66);
    }
    if rex != 0 {
        buf.emit_u8(0x40 | rex);
    }
    if opc & P_EXT != 0 {
        buf.emit_u8(0x0f);
    }
    buf.emit_u8(opc as u8);
}

pub fn emit_opc(buf: &mut CodeBuffer, opc: u32, r: u8, rm: u8) {
    emit_opc_full(buf, opc, r, rm, 0);
}

/// opcode + ModR/M, register-register.
pub fn emit_modrm(buf: &mut CodeBuffer, opc: u32, r: Reg, rm: Reg) {
    emit_opc(buf, opc, r as u8, rm as u8);
    buf.emit_u8(0xc0 | (r.low3() << 3) | rm.low3());
}

/// opcode + ModR/M with /ext, register form.
pub fn emit_modrm_ext(buf: &mut CodeBuffer, opc: u32, ext: u8, rm: Reg) {
    emit_opc(buf, opc, 0, rm as u8);
    buf.emit_u8(0xc0 | (ext << 3) | rm.low3());
}

fn emit_mem_tail(buf: &mut CodeBuffer, r3: u8, base: Reg, offset: i32) {
    let b3 = base.low3();
    if offset == 0 && b3 != 5 {
        // mod=00 ([RBP/R13] always needs a displacement)
        if b3 == 4 {
            buf.emit_u8((r3 << 3) | 0x04);
            buf.emit_u8(0x24); // SIB: no index, base=RSP/R12
        } else {
            buf.emit_u8((r3 << 3) | b3);
        }
    } else if (-128..=127).contains(&offset) {
        if b3 == 4 {
            buf.emit_u8(0x44 | (r3 << 3));
            buf.emit_u8(0x24);
        } else {
            buf.emit_u8(0x40 | (r3 << 3) | b3);
        }
        buf.emit_u8(offset as u8);
    } else {
        if b3 == 4 {
            buf.emit_u8(0x84 | (r3 << 3));
            buf.emit_u8(0x24);
        } else {
            buf.emit_u8(0x80 | (r3 << 3) | b3);
        }
        buf.emit_u32(offset as u32);
    }
}

/// opcode + ModR/M + displacement for `[base + offset]`.
pub fn emit_modrm_offset(buf: &mut CodeBuffer, opc: u32, r: Reg, base: Reg, offset: i32) {
    emit_opc(buf, opc, r as u8, base as u8);
    emit_mem_tail(buf, r.low3(), base, offset);
}

/// /ext variant of `emit_modrm_offset`.
pub fn emit_modrm_ext_offset(buf: &mut CodeBuffer, opc: u32, ext: u8, base: Reg, offset: i32) {
    emit_opc(buf, opc, 0, base as u8);
    emit_mem_tail(buf, ext, base, offset);
}

fn emit_sib_tail(buf: &mut CodeBuffer, r3: u8, base: Reg, index: Reg, scale: u8, offset: i32) {
    assert!(index != Reg::Rsp, "RSP cannot be an index");
    let sib = (scale << 6) | (index.low3() << 3) | base.low3();
    if offset == 0 && base.low3() != 5 {
        buf.emit_u8((r3 << 3) | 0x04);
        buf.emit_u8(sib);
    } else if (-128..=127).contains(&offset) {
        buf.emit_u8(0x44 | (r3 << 3));
        buf.emit_u8(sib);
        buf.emit_u8(offset as u8);
    } else {
        buf.emit_u8(0x84 | (r3 << 3));
        buf.emit_u8(sib);
        buf.emit_u32(offset as u32);
    }
}

/// opcode + ModR/M + SIB for `[base + index << scale + offset]`.
pub fn emit_modrm_sib(
    buf: &mut CodeBuffer,
    opc: u32,
    r: Reg,
    base: Reg,
    index: Reg,
    scale: u8,
    offset: i32,
) {
    emit_opc_full(buf, opc, r as u8, base as u8, index as u8);
    emit_sib_tail(buf, r.low3(), base, index, scale, offset);
}

/// /ext variant of `emit_modrm_sib`.
pub fn emit_modrm_ext_sib(
    buf: &mut CodeBuffer,
    opc: u32,
    ext: u8,
    base: Reg,
    index: Reg,
    scale: u8,
    offset: i32,
) {
    emit_opc_full(buf, opc, 0, base as u8, index as u8);
    emit_sib_tail(buf, ext, base, index, scale, offset);
}

// -- Data movement --

pub fn emit_mov_rr(buf: &mut CodeBuffer, rexw: bool, dst: Reg, src: Reg) {
    if dst == src {
        return;
    }
    let opc = OPC_MOVL_GvEv | if rexw { P_REXW } else { 0 };
    emit_modrm(buf, opc, dst, src);
}

/// mov immediate into register: `B8+r imm32` (zero-extends), or
/// movabs for 64-bit payloads.
pub fn emit_mov_ri(buf: &mut CodeBuffer, rexw: bool, dst: Reg, val: u64) {
    let mut rex: u8 = 0;
    if rexw {
        rex |= 0x48;
    }
    if (dst as u8) >= 8 {
        rex |= 0x41;
    }
    if rex != 0 {
        buf.emit_u8(0x40 | (rex & 0x0f));
    }
    buf.emit_u8(0xb8 + dst.low3());
    if rexw {
        buf.emit_u64(val);
    } else {
        buf.emit_u32(val as u32);
    }
}

pub fn emit_load(buf: &mut CodeBuffer, rexw: bool, dst: Reg, base: Reg, offset: i32) {
    let opc = OPC_MOVL_GvEv | if rexw { P_REXW } else { 0 };
    emit_modrm_offset(buf, opc, dst, base, offset);
}

pub fn emit_store(buf: &mut CodeBuffer, rexw: bool, src: Reg, base: Reg, offset: i32) {
    let opc = OPC_MOVL_EvGv | if rexw { P_REXW } else { 0 };
    emit_modrm_offset(buf, opc, src, base, offset);
}

pub fn emit_store8(buf: &mut CodeBuffer, src: Reg, base: Reg, offset: i32) {
    emit_modrm_offset(buf, OPC_MOVB_EvGv | P_REXB_R, src, base, offset);
}

pub fn emit_store16(buf: &mut CodeBuffer, src: Reg, base: Reg, offset: i32) {
    emit_modrm_offset(buf, OPC_MOVL_EvGv | P_DATA16, src, base, offset);
}

pub fn emit_load_zx8(buf: &mut CodeBuffer, dst: Reg, base: Reg, offset: i32) {
    emit_modrm_offset(buf, OPC_MOVZBL, dst, base, offset);
}

pub fn emit_load_zx16(buf: &mut CodeBuffer, dst: Reg, base: Reg, offset: i32) {
    emit_modrm_offset(buf, OPC_MOVZWL, dst, base, offset);
}

pub fn emit_load_sx8(buf: &mut CodeBuffer, dst: Reg, base: Reg, offset: i32) {
    emit_modrm_offset(buf, OPC_MOVSBL, dst, base, offset);
}

pub fn emit_load_sx16(buf: &mut CodeBuffer, dst: Reg, base: Reg, offset: i32) {
    emit_modrm_offset(buf, OPC_MOVSWL, dst, base, offset);
}

pub fn emit_load_sib(
    buf: &mut CodeBuffer,
    rexw: bool,
    dst: Reg,
    base: Reg,
    index: Reg,
    scale: u8,
) {
    let opc = OPC_MOVL_GvEv | if rexw { P_REXW } else { 0 };
    emit_modrm_sib(buf, opc, dst, base, index, scale, 0);
}

pub fn emit_load_zx8_sib(buf: &mut CodeBuffer, dst: Reg, base: Reg, index: Reg) {
    emit_modrm_sib(buf, OPC_MOVZBL, dst, base, index, 0, 0);
}

pub fn emit_load_zx16_sib(buf: &mut CodeBuffer, dst: Reg, base: Reg, index: Reg) {
    emit_modrm_sib(buf, OPC_MOVZWL, dst, base, index, 0, 0);
}

pub fn emit_load_sx8_sib(buf: &mut CodeBuffer, dst: Reg, base: Reg, index: Reg) {
    emit_modrm_sib(buf, OPC_MOVSBL, dst, base, index, 0, 0);
}

pub fn emit_load_sx16_sib(buf: &mut CodeBuffer, dst: Reg, base: Reg, index: Reg) {
    emit_modrm_sib(buf, OPC_MOVSWL, dst, base, index, 0, 0);
}

pub fn emit_store8_sib(buf: &mut CodeBuffer, src: Reg, base: Reg, index: Reg) {
    emit_modrm_sib(buf, OPC_MOVB_EvGv | P_REXB_R, src, base, index, 0, 0);
}

pub fn emit_store16_sib(buf: &mut CodeBuffer, src: Reg, base: Reg, index: Reg) {
    emit_modrm_sib(buf, OPC_MOVL_EvGv | P_DATA16, src, base, index, 0, 0);
}

pub fn emit_store32_sib(buf: &mut CodeBuffer, src: Reg, base: Reg, index: Reg) {
    emit_modrm_sib(buf, OPC_MOVL_EvGv, src, base, index, 0, 0);
}

/// Store an immediate of the given byte width to `[base + offset]`.
pub fn emit_store_imm(buf: &mut CodeBuffer, size: u32, base: Reg, offset: i32, imm: u32) {
    match size {
        1 => {
            emit_modrm_ext_offset(buf, OPC_MOVB_EvIz, 0, base, offset);
            buf.emit_u8(imm as u8);
        }
        2 => {
            emit_modrm_ext_offset(buf, OPC_MOVL_EvIz | P_DATA16, 0, base, offset);
            buf.emit_u16(imm as u16);
        }
        4 => {
            emit_modrm_ext_offset(buf, OPC_MOVL_EvIz, 0, base, offset);
            buf.emit_u32(imm);
        }
        _ => panic!("emit_store_imm: bad size {size}"),
    }
}

/// Store an immediate of the given byte width to `[base + index]`.
pub fn emit_store_imm_sib(
    buf: &mut CodeBuffer,
    size: u32,
    base: Reg,
    index: Reg,
    imm: u32,
) {
    match size {
        1 => {
            emit_modrm_ext_sib(buf, OPC_MOVB_EvIz, 0, base, index, 0, 0);
            buf.emit_u8(imm as u8);
        }
        2 => {
            emit_modrm_ext_sib(buf, OPC_MOVL_EvIz | P_DATA16, 0, base, index, 0, 0);
            buf.emit_u16(imm as u16);
        }
        4 => {
            emit_modrm_ext_sib(buf, OPC_MOVL_EvIz, 0, base, index, 0, 0);
            buf.emit_u32(imm);
        }
        _ => panic!("emit_store_imm_sib: bad size {size}"),
    }
}

// -- ALU --

pub fn emit_arith_rr(buf: &mut CodeBuffer, op: ArithOp, rexw: bool, dst: Reg, src: Reg) {
    let opc = (OPC_ARITH_GvEv + ((op as u32) << 3)) | if rexw { P_REXW } else { 0 };
    emit_modrm(buf, opc, dst, src);
}

pub fn emit_arith_ri(buf: &mut CodeBuffer, op: ArithOp, rexw: bool, dst: Reg, imm: i32) {
    let w = if rexw { P_REXW } else { 0 };
    if (-128..=127).contains(&imm) {
        emit_modrm_ext(buf, OPC_ARITH_EvIb | w, op as u8, dst);
        buf.emit_u8(imm as u8);
    } else {
        emit_modrm_ext(buf, OPC_ARITH_EvIz | w, op as u8, dst);
        buf.emit_u32(imm as u32);
    }
}

/// cmp reg, [base + offset].
pub fn emit_cmp_rm(buf: &mut CodeBuffer, rexw: bool, reg: Reg, base: Reg, offset: i32) {
    let opc = (OPC_ARITH_GvEv + ((ArithOp::Cmp as u32) << 3)) | if rexw { P_REXW } else { 0 };
    emit_modrm_offset(buf, opc, reg, base, offset);
}

pub fn emit_test_rr(buf: &mut CodeBuffer, rexw: bool, a: Reg, b: Reg) {
    let opc = OPC_TESTL | if rexw { P_REXW } else { 0 };
    emit_modrm(buf, opc, b, a);
}

pub fn emit_xor_self(buf: &mut CodeBuffer, dst: Reg) {
    emit_arith_rr(buf, ArithOp::Xor, false, dst, dst);
}

pub fn emit_setcc(buf: &mut CodeBuffer, cc: X86Cond, dst: Reg) {
    emit_modrm_ext(buf, OPC_SETCC + cc as u32, 0, dst);
}

/// movzx r32, r8.
pub fn emit_movzx_b(buf: &mut CodeBuffer, dst: Reg, src: Reg) {
    emit_modrm(buf, OPC_MOVZBL | P_REXB_RM, dst, src);
}

pub fn emit_shift_ri(buf: &mut CodeBuffer, op: ShiftOp, rexw: bool, dst: Reg, imm: u8) {
    let w = if rexw { P_REXW } else { 0 };
    emit_modrm_ext(buf, OPC_SHIFT_Ib | w, op as u8, dst);
    buf.emit_u8(imm);
}

pub fn emit_shift_cl(buf: &mut CodeBuffer, op: ShiftOp, rexw: bool, dst: Reg) {
    let w = if rexw { P_REXW } else { 0 };
    emit_modrm_ext(buf, OPC_SHIFT_cl | w, op as u8, dst);
}

// -- Control flow --

/// `jmp rel32` with a zero placeholder; returns the patch offset.
pub fn emit_jmp_rel32(buf: &mut CodeBuffer) -> usize {
    buf.emit_u8(OPC_JMP_long as u8);
    let pos = buf.offset();
    buf.emit_u32(0);
    pos
}

/// `jcc rel32` with a zero placeholder; returns the patch offset.
pub fn emit_jcc_rel32(buf: &mut CodeBuffer, cc: X86Cond) -> usize {
    buf.emit_u8(0x0f);
    buf.emit_u8(0x80 + cc as u8);
    let pos = buf.offset();
    buf.emit_u32(0);
    pos
}

/// Resolve a rel32 patch slot against a target buffer offset.
pub fn patch_rel32(buf: &mut CodeBuffer, patch_pos: usize, target: usize) {
    let disp = (target as i64) - (patch_pos as i64 + 4);
    assert!(
        disp == disp as i32 as i64,
        "intra-region displacement out of range"
    );
    buf.patch_u32(patch_pos, disp as u32);
}

pub fn emit_jmp_reg(buf: &mut CodeBuffer, r: Reg) {
    emit_modrm_ext(buf, OPC_GRP5, Ext5Op::JmpN as u8, r);
}

pub fn emit_call_reg(buf: &mut CodeBuffer, r: Reg) {
    emit_modrm_ext(buf, OPC_GRP5, Ext5Op::CallN as u8, r);
}

pub fn emit_call_mem(buf: &mut CodeBuffer, base: Reg, offset: i32) {
    emit_modrm_ext_offset(buf, OPC_GRP5, Ext5Op::CallN as u8, base, offset);
}

pub fn emit_jmp_mem(buf: &mut CodeBuffer, base: Reg, offset: i32) {
    emit_modrm_ext_offset(buf, OPC_GRP5, Ext5Op::JmpN as u8, base, offset);
}

pub fn emit_push(buf: &mut CodeBuffer, r: Reg) {
    if (r as u8) >= 8 {
        buf.emit_u8(0x41);
    }
    buf.emit_u8(OPC_PUSH_r as u8 + r.low3());
}

pub fn emit_pop(buf: &mut CodeBuffer, r: Reg) {
    if (r as u8) >= 8 {
        buf.emit_u8(0x41);
    }
    buf.emit_u8(OPC_POP_r as u8 + r.low3());
}

pub fn emit_ret(buf: &mut CodeBuffer) {
    buf.emit_u8(OPC_RET as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(f: impl FnOnce(&mut CodeBuffer)) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        f(&mut buf);
        buf.as_slice().to_vec()
    }

    #[test]
    fn mov_rr_32() {
        // mov edi, esi
        assert_eq!(bytes(|b| emit_mov_rr(b, false, Reg::Rdi, Reg::Rsi)), [0x8b, 0xfe]);
        // mov r13 -> rdi (64-bit)
        assert_eq!(
            bytes(|b| emit_mov_rr(b, true, Reg::Rdi, Reg::R13)),
            [0x49, 0x8b, 0xfd]
        );
    }

    #[test]
    fn mov_ri_forms() {
        // mov eax, 1
        assert_eq!(
            bytes(|b| emit_mov_ri(b, false, Reg::Rax, 1)),
            [0xb8, 1, 0, 0, 0]
        );
        // movabs rax, 0x1122334455667788
        assert_eq!(
            bytes(|b| emit_mov_ri(b, true, Reg::Rax, 0x1122334455667788)),
            [0x48, 0xb8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
        // mov r9d, 2
        assert_eq!(
            bytes(|b| emit_mov_ri(b, false, Reg::R9, 2)),
            [0x41, 0xb9, 2, 0, 0, 0]
        );
    }

    #[test]
    fn state_relative_load_store() {
        // mov eax, [r13 + 0x80]: R13 low3 == 5 forces disp
        assert_eq!(
            bytes(|b| emit_load(b, false, Reg::Rax, Reg::R13, 0x80)),
            [0x41, 0x8b, 0x85, 0x80, 0, 0, 0]
        );
        // mov [r13 + 0x28], ebx
        assert_eq!(
            bytes(|b| emit_store(b, false, Reg::Rbx, Reg::R13, 0x28)),
            [0x41, 0x89, 0x5d, 0x28]
        );
    }

    #[test]
    fn rsp_relative_needs_sib() {
        // mov eax, [rsp + 8]
        assert_eq!(
            bytes(|b| emit_load(b, false, Reg::Rax, Reg::Rsp, 8)),
            [0x8b, 0x44, 0x24, 0x08]
        );
    }

    #[test]
    fn arith_rr_and_ri() {
        // add eax, ebx
        assert_eq!(
            bytes(|b| emit_arith_rr(b, ArithOp::Add, false, Reg::Rax, Reg::Rbx)),
            [0x03, 0xc3]
        );
        // cmp esi, edi
        assert_eq!(
            bytes(|b| emit_arith_rr(b, ArithOp::Cmp, false, Reg::Rsi, Reg::Rdi)),
            [0x3b, 0xf7]
        );
        // add eax, 1 (imm8 form)
        assert_eq!(
            bytes(|b| emit_arith_ri(b, ArithOp::Add, false, Reg::Rax, 1)),
            [0x83, 0xc0, 0x01]
        );
        // and edi, 0xfff (imm32 form)
        assert_eq!(
            bytes(|b| emit_arith_ri(b, ArithOp::And, false, Reg::Rdi, 0xfff)),
            [0x81, 0xe7, 0xff, 0x0f, 0, 0]
        );
        // sub rsp, 248
        assert_eq!(
            bytes(|b| emit_arith_ri(b, ArithOp::Sub, true, Reg::Rsp, 248)),
            [0x48, 0x81, 0xec, 0xf8, 0, 0, 0]
        );
    }

    #[test]
    fn sib_guest_access() {
        // movzx eax, byte [r12 + rsi]
        assert_eq!(
            bytes(|b| emit_load_zx8_sib(b, Reg::Rax, Reg::R12, Reg::Rsi)),
            [0x41, 0x0f, 0xb6, 0x04, 0x34]
        );
        // mov [r12 + rax], ebx
        assert_eq!(
            bytes(|b| emit_store32_sib(b, Reg::Rbx, Reg::R12, Reg::Rax)),
            [0x41, 0x89, 0x1c, 0x04]
        );
    }

    #[test]
    fn setcc_and_movzx() {
        // sete al
        assert_eq!(
            bytes(|b| emit_setcc(b, X86Cond::Je, Reg::Rax)),
            [0x0f, 0x94, 0xc0]
        );
        // setb sil needs bare REX
        assert_eq!(
            bytes(|b| emit_setcc(b, X86Cond::Jb, Reg::Rsi)),
            [0x40, 0x0f, 0x92, 0xc6]
        );
        // movzx eax, al
        assert_eq!(
            bytes(|b| emit_movzx_b(b, Reg::Rax, Reg::Rax)),
            [0x0f, 0xb6, 0xc0]
        );
    }

    #[test]
    fn shifts() {
        // shl eax, 3
        assert_eq!(
            bytes(|b| emit_shift_ri(b, ShiftOp::Shl, false, Reg::Rax, 3)),
            [0xc1, 0xe0, 0x03]
        );
        // sar edx, cl
        assert_eq!(
            bytes(|b| emit_shift_cl(b, ShiftOp::Sar, false, Reg::Rdx)),
            [0xd3, 0xfa]
        );
    }

    #[test]
    fn control_flow() {
        // jmp rdi / call rax
        assert_eq!(bytes(|b| emit_jmp_reg(b, Reg::Rdi)), [0xff, 0xe7]);
        assert_eq!(bytes(|b| emit_call_reg(b, Reg::Rax)), [0xff, 0xd0]);
        // call [r13 + 0x100]
        assert_eq!(
            bytes(|b| emit_call_mem(b, Reg::R13, 0x100)),
            [0x41, 0xff, 0x95, 0x00, 0x01, 0, 0]
        );
        // rel32 patching
        let mut buf = CodeBuffer::new();
        let pos = emit_jmp_rel32(&mut buf);
        patch_rel32(&mut buf, pos, 5);
        assert_eq!(buf.as_slice(), [0xe9, 0, 0, 0, 0]);
    }

    #[test]
    fn push_pop() {
        assert_eq!(bytes(|b| emit_push(b, Reg::Rbp)), [0x55]);
        assert_eq!(bytes(|b| emit_push(b, Reg::R15)), [0x41, 0x57]);
        assert_eq!(bytes(|b| emit_pop(b, Reg::Rbx)), [0x5b]);
        assert_eq!(bytes(|b| emit_ret(b)), [0xc3]);
    }
}
