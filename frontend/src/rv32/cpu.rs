//! RV32 guest CPU state.
//!
//! Layout is `#[repr(C)]`: generated code addresses individual
//! fields at fixed byte offsets from the STATE register, and the
//! AOT code path calls helpers through the stub table embedded in
//! the struct.

use std::sync::OnceLock;

use qdbt_core::{StateInfo, StateReg, VType};

pub const NUM_GPRS: usize = 32;

/// Guest trap numbers stored in `CPUState::trapno`.
pub mod trap {
    pub const NONE: u32 = 0;
    pub const ECALL: u32 = 1;
    pub const EBREAK: u32 = 2;
    pub const ILLEGAL_INSN: u32 = 3;
    pub const UNALIGNED_IP: u32 = 4;
    pub const TERMINATED: u32 = 5;
}

/// Indices into the runtime stub table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RuntimeStubId {
    LinkBranch = 0,
    Brind,
    Escape,
    Illegal,
    Fence,
    FenceI,
    Ecall,
    Ebreak,
    LrW,
    ScW,
    AmoswapW,
    AmoaddW,
    AmoxorW,
    AmoandW,
    AmoorW,
    AmominW,
    AmomaxW,
    AmominuW,
    AmomaxuW,

    Count,
}

pub const NUM_STUBS: usize = RuntimeStubId::Count as usize;

impl RuntimeStubId {
    /// Byte offset of this stub's entry within the table.
    pub const fn offs(self) -> u16 {
        self as u16 * 8
    }

    /// Stubs that raise a guest trap: generated code exits to the
    /// execute loop right after calling one.
    pub const fn traps(self) -> bool {
        matches!(
            self,
            RuntimeStubId::Ecall | RuntimeStubId::Ebreak | RuntimeStubId::Illegal
        )
    }

    pub fn from_u16(v: u16) -> RuntimeStubId {
        assert!(v < RuntimeStubId::Count as u16, "bad stub id {v}");
        // SAFETY: checked in range, repr(u16).
        unsafe { std::mem::transmute(v) }
    }
}

/// Host addresses of the runtime stubs, indexed by `RuntimeStubId`.
#[repr(C)]
#[derive(Clone)]
pub struct RuntimeStubTab(pub [usize; NUM_STUBS]);

impl RuntimeStubTab {
    pub const fn empty() -> Self {
        Self([0; NUM_STUBS])
    }

    #[inline]
    pub fn get(&self, id: RuntimeStubId) -> usize {
        self.0[id as usize]
    }
}

/// Guest CPU state, one per guest thread. Mutated only by generated
/// code and by the execute loop on trap.
#[repr(C)]
pub struct CPUState {
    /// x0..x31; x0 is the constant zero and never written.
    pub gpr: [u32; NUM_GPRS],
    pub ip: u32,
    pub trapno: u32,
    /// Stub table used by AOT-compiled code (JIT code embeds
    /// absolute addresses instead).
    pub stub_tab: RuntimeStubTab,
    /// Host address of the indirect-branch jump cache table.
    pub jmp_cache: usize,
    /// LR/SC reservation address (`u32::MAX` when absent) and the
    /// value observed by the reservation load.
    pub load_res: u32,
    pub load_val: u32,
}

pub const fn gpr_offs(i: usize) -> u16 {
    (i * 4) as u16
}

pub const IP_OFFS: u16 = (NUM_GPRS * 4) as u16; // 128
pub const TRAPNO_OFFS: u16 = IP_OFFS + 4; // 132
pub const STUB_TAB_OFFS: u16 = TRAPNO_OFFS + 4; // 136
pub const JMP_CACHE_OFFS: u16 = STUB_TAB_OFFS + (NUM_STUBS * 8) as u16;

impl CPUState {
    pub fn new() -> Self {
        Self {
            gpr: [0; NUM_GPRS],
            ip: 0,
            trapno: trap::NONE,
            stub_tab: RuntimeStubTab::empty(),
            jmp_cache: 0,
            load_res: u32::MAX,
            load_val: 0,
        }
    }
}

impl Default for CPUState {
    fn default() -> Self {
        Self::new()
    }
}

/// ABI register names, for IR dumps.
pub static GPR_NAMES: [&str; NUM_GPRS] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1",
    "a2", "a3", "a4", "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7",
    "s8", "s9", "s10", "s11", "t3", "t4", "t5", "t6",
];

/// Global virtual register numbering: vreg `i` is guest GPR `i+1`
/// for `i < 31`, and vreg 31 is the guest IP.
pub const IP_VREG: u16 = 31;
pub const NUM_GLOBALS: u16 = 32;

/// The read-only table binding every global virtual register to its
/// CPUState slot.
pub fn state_info() -> &'static StateInfo {
    static INFO: OnceLock<StateInfo> = OnceLock::new();
    INFO.get_or_init(|| {
        let mut regs = Vec::with_capacity(NUM_GLOBALS as usize);
        for i in 1..NUM_GPRS {
            regs.push(StateReg {
                offs: gpr_offs(i),
                ty: VType::I32,
                name: GPR_NAMES[i],
            });
        }
        regs.push(StateReg {
            offs: IP_OFFS,
            ty: VType::I32,
            name: "ip",
        });
        StateInfo { regs }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn state_layout_matches_consts() {
        assert_eq!(offset_of!(CPUState, ip), IP_OFFS as usize);
        assert_eq!(offset_of!(CPUState, trapno), TRAPNO_OFFS as usize);
        assert_eq!(offset_of!(CPUState, stub_tab), STUB_TAB_OFFS as usize);
        assert_eq!(offset_of!(CPUState, jmp_cache), JMP_CACHE_OFFS as usize);
        assert_eq!(size_of::<RuntimeStubTab>(), NUM_STUBS * 8);
    }

    #[test]
    fn state_info_binds_gprs_and_ip() {
        let si = state_info();
        assert_eq!(si.n_regs(), NUM_GLOBALS);
        assert_eq!(si.reg(0).offs, gpr_offs(1));
        assert_eq!(si.reg(0).name, "ra");
        assert_eq!(si.reg(IP_VREG).offs, IP_OFFS);
        assert_eq!(si.reg(IP_VREG).name, "ip");
    }
}
