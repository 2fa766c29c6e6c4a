//! Runtime stubs for rare RV32 operations - fences, environment
//! calls, and the A-extension. Called from generated code with the
//! raw instruction word; guest-observable effects are defined here.
//!
//! The register allocator syncs and releases all globals around
//! every helper call, so stubs may read and write `CPUState.gpr`
//! freely.

use super::cpu::{trap, CPUState};
use super::insn::Insn;

#[inline]
unsafe fn read_gpr(state: *const CPUState, r: u8) -> u32 {
    (*state).gpr[r as usize]
}

#[inline]
unsafe fn write_gpr(state: *mut CPUState, r: u8, val: u32) {
    if r != 0 {
        (*state).gpr[r as usize] = val;
    }
}

#[inline]
unsafe fn load_u32(gaddr: u32) -> u32 {
    (qdbt_mmu::g2h(gaddr) as *const u32).read_unaligned()
}

#[inline]
unsafe fn store_u32(gaddr: u32, val: u32) {
    (qdbt_mmu::g2h(gaddr) as *mut u32).write_unaligned(val)
}

pub unsafe extern "C" fn stub_fence(_state: *mut CPUState, _insn: u32) {
    // Single host thread: program order is already guaranteed.
}

pub unsafe extern "C" fn stub_fencei(_state: *mut CPUState, _insn: u32) {
    // No self-modifying-code support; translated code is immutable.
}

pub unsafe extern "C" fn stub_ecall(state: *mut CPUState, _insn: u32) {
    (*state).trapno = trap::ECALL;
}

pub unsafe extern "C" fn stub_ebreak(state: *mut CPUState, _insn: u32) {
    (*state).trapno = trap::EBREAK;
}

pub unsafe extern "C" fn stub_illegal(state: *mut CPUState, _insn: u32) {
    (*state).trapno = trap::ILLEGAL_INSN;
}

pub unsafe extern "C" fn stub_lr_w(state: *mut CPUState, insn: u32) {
    let i = Insn(insn);
    let addr = read_gpr(state, i.rs1());
    let val = load_u32(addr);
    write_gpr(state, i.rd(), val);
    (*state).load_res = addr;
    (*state).load_val = val;
}

pub unsafe extern "C" fn stub_sc_w(state: *mut CPUState, insn: u32) {
    let i = Insn(insn);
    let addr = read_gpr(state, i.rs1());
    if (*state).load_res == addr && load_u32(addr) == (*state).load_val {
        store_u32(addr, read_gpr(state, i.rs2()));
        write_gpr(state, i.rd(), 0);
    } else {
        write_gpr(state, i.rd(), 1);
    }
    (*state).load_res = u32::MAX;
}

unsafe fn amo(state: *mut CPUState, insn: u32, f: impl Fn(u32, u32) -> u32) {
    let i = Insn(insn);
    let addr = read_gpr(state, i.rs1());
    let src = read_gpr(state, i.rs2());
    let old = load_u32(addr);
    store_u32(addr, f(old, src));
    write_gpr(state, i.rd(), old);
}

pub unsafe extern "C" fn stub_amoswap_w(state: *mut CPUState, insn: u32) {
    amo(state, insn, |_, b| b);
}

pub unsafe extern "C" fn stub_amoadd_w(state: *mut CPUState, insn: u32) {
    amo(state, insn, |a, b| a.wrapping_add(b));
}

pub unsafe extern "C" fn stub_amoxor_w(state: *mut CPUState, insn: u32) {
    amo(state, insn, |a, b| a ^ b);
}

pub unsafe extern "C" fn stub_amoand_w(state: *mut CPUState, insn: u32) {
    amo(state, insn, |a, b| a & b);
}

pub unsafe extern "C" fn stub_amoor_w(state: *mut CPUState, insn: u32) {
    amo(state, insn, |a, b| a | b);
}

pub unsafe extern "C" fn stub_amomin_w(state: *mut CPUState, insn: u32) {
    amo(state, insn, |a, b| (a as i32).min(b as i32) as u32);
}

pub unsafe extern "C" fn stub_amomax_w(state: *mut CPUState, insn: u32) {
    amo(state, insn, |a, b| (a as i32).max(b as i32) as u32);
}

pub unsafe extern "C" fn stub_amominu_w(state: *mut CPUState, insn: u32) {
    amo(state, insn, |a, b| a.min(b));
}

pub unsafe extern "C" fn stub_amomaxu_w(state: *mut CPUState, insn: u32) {
    amo(state, insn, |a, b| a.max(b));
}
