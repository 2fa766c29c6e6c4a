/// QIR opcodes - the closed operation set of the IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    // unop
    Mov = 0,
    // binop
    Add,
    Sub,
    And,
    Or,
    Xor,
    Sll,
    Srl,
    Sra,
    // compare
    Setcc,
    // control flow
    Br,
    Brcc,
    Gbr,
    Gbrind,
    // guest memory
    Vmload,
    Vmstore,
    // helper call
    Hcall,

    Count,
}

/// Per-instruction flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstFlags(u8);

impl InstFlags {
    pub const NONE: InstFlags = InstFlags(0);
    /// May not be reordered or eliminated.
    pub const SIDEEFF: InstFlags = InstFlags(1 << 0);
    /// Leaves the region (guest branch or trap).
    pub const REXIT: InstFlags = InstFlags(1 << 1);

    pub const fn contains(self, other: InstFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: InstFlags) -> InstFlags {
        InstFlags(self.0 | other.0)
    }
}

/// Static opcode definition - operand arity and default flags.
#[derive(Debug, Clone, Copy)]
pub struct OpDef {
    pub name: &'static str,
    pub n_out: u8,
    pub n_in: u8,
    pub flags: InstFlags,
}

const N: InstFlags = InstFlags::NONE;
const SE: InstFlags = InstFlags::SIDEEFF;
const RX: InstFlags = InstFlags::REXIT;

const fn def(name: &'static str, n_out: u8, n_in: u8, flags: InstFlags) -> OpDef {
    OpDef {
        name,
        n_out,
        n_in,
        flags,
    }
}

/// Opcode definitions, indexed by `Op as usize`.
pub static OP_DEFS: [OpDef; Op::Count as usize] = [
    def("mov", 1, 1, N),
    def("add", 1, 2, N),
    def("sub", 1, 2, N),
    def("and", 1, 2, N),
    def("or", 1, 2, N),
    def("xor", 1, 2, N),
    def("sll", 1, 2, N),
    def("srl", 1, 2, N),
    def("sra", 1, 2, N),
    def("setcc", 1, 2, N),
    def("br", 0, 0, N),
    def("brcc", 0, 2, N),
    def("gbr", 0, 1, RX),
    def("gbrind", 0, 1, RX),
    def("vmload", 1, 1, SE),
    def("vmstore", 0, 2, SE),
    def("hcall", 0, 1, SE),
];

impl Op {
    #[inline]
    pub fn def(self) -> &'static OpDef {
        &OP_DEFS[self as usize]
    }

    #[inline]
    pub fn name(self) -> &'static str {
        self.def().name
    }

    /// Two-input ALU operations (everything folded by the builder).
    #[inline]
    pub fn is_binop(self) -> bool {
        matches!(
            self,
            Op::Add | Op::Sub | Op::And | Op::Or | Op::Xor | Op::Sll | Op::Srl | Op::Sra
        )
    }

    /// Operand order does not matter.
    #[inline]
    pub fn is_commutative(self) -> bool {
        matches!(self, Op::Add | Op::And | Op::Or | Op::Xor)
    }

    #[inline]
    pub fn is_shift(self) -> bool {
        matches!(self, Op::Sll | Op::Srl | Op::Sra)
    }
}
