/// x86-64 general-purpose register indices, in ModR/M + REX
/// numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    #[inline]
    pub const fn low3(self) -> u8 {
        (self as u8) & 0x7
    }

    pub fn from_u8(v: u8) -> Reg {
        assert!(v < 16);
        // SAFETY: checked in range, repr(u8).
        unsafe { std::mem::transmute(v) }
    }

    #[inline]
    pub const fn bit(self) -> u16 {
        1 << (self as u8)
    }
}

/// Fixed register contract shared with the trampolines: the enter
/// trampoline pins these before jumping into generated code.
pub const STATE: Reg = Reg::R13;
pub const MEMBASE: Reg = Reg::R12;
pub const SP: Reg = Reg::Rsp;
/// Scratch for variable shift counts; never allocated.
pub const TMP_SHIFT: Reg = Reg::Rcx;

/// Bitmask over the 16 physical registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegMask(pub u16);

impl RegMask {
    pub const NONE: RegMask = RegMask(0);
    pub const ALL: RegMask = RegMask(0xffff);

    #[inline]
    pub const fn test(self, r: Reg) -> bool {
        self.0 & r.bit() != 0
    }

    #[inline]
    pub const fn set(self, r: Reg) -> RegMask {
        RegMask(self.0 | r.bit())
    }

    #[inline]
    pub const fn and(self, o: RegMask) -> RegMask {
        RegMask(self.0 & o.0)
    }

    #[inline]
    pub const fn or(self, o: RegMask) -> RegMask {
        RegMask(self.0 | o.0)
    }

    #[inline]
    pub const fn not(self) -> RegMask {
        RegMask(!self.0)
    }

    /// Lowest set register, if any.
    pub const fn first(self) -> Option<Reg> {
        if self.0 == 0 {
            None
        } else {
            Some(unsafe { std::mem::transmute::<u8, Reg>(self.0.trailing_zeros() as u8) })
        }
    }
}

/// Registers never handed to the allocator: the stack pointer, the
/// pinned STATE/MEMBASE pair, and the shift-count scratch.
pub const PREGS_RESERVED: RegMask =
    RegMask(SP.bit() | STATE.bit() | MEMBASE.bit() | TMP_SHIFT.bit());

pub const PREGS_ALLOCATABLE: RegMask = RegMask(RegMask::ALL.0 & !PREGS_RESERVED.0);

/// System V caller-clobbered set.
pub const PREGS_CALL_CLOBBER: RegMask = RegMask(
    Reg::Rax.bit()
        | Reg::Rcx.bit()
        | Reg::Rdx.bit()
        | Reg::Rsi.bit()
        | Reg::Rdi.bit()
        | Reg::R8.bit()
        | Reg::R9.bit()
        | Reg::R10.bit()
        | Reg::R11.bit(),
);

/// Saved and restored by the enter/exit trampolines, in push order.
pub const CALLEE_SAVED: &[Reg] = &[Reg::Rbp, Reg::Rbx, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

/// Fixed scratch frame reserved by the enter trampoline; local
/// spill slots live here. The enter/exit trampolines and this
/// constant must change together.
pub const FRAME_SIZE: i32 = 248;
