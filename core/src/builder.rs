//! Region builder - every create_* call inserts one instruction at
//! the current block's cursor and returns the (possibly folded)
//! instruction. Constant folding happens here, on insert; it is the
//! only IR optimization in the pipeline.

use crate::inst::{Inst, InstAux, InstRef};
use crate::ops::Op;
use crate::region::{BlockId, Region};
use crate::types::{CondCode, RegN, VSign, VType};
use crate::voperand::VOperand;

/// Evaluate a binop over two 32-bit constants. Shift counts take
/// the low five bits, as in the guest ISA.
pub fn eval_binop(op: Op, a: u32, b: u32) -> u32 {
    match op {
        Op::Add => a.wrapping_add(b),
        Op::Sub => a.wrapping_sub(b),
        Op::And => a & b,
        Op::Or => a | b,
        Op::Xor => a ^ b,
        Op::Sll => a.wrapping_shl(b & 31),
        Op::Srl => a.wrapping_shr(b & 31),
        Op::Sra => ((a as i32).wrapping_shr(b & 31)) as u32,
        _ => panic!("eval_binop: {} is not a binop", op.name()),
    }
}

/// Evaluate a condition over two 32-bit constants.
pub fn eval_cond(cc: CondCode, a: u32, b: u32) -> bool {
    match cc {
        CondCode::Eq => a == b,
        CondCode::Ne => a != b,
        CondCode::Lt => (a as i32) < (b as i32),
        CondCode::Ge => (a as i32) >= (b as i32),
        CondCode::Le => (a as i32) <= (b as i32),
        CondCode::Gt => (a as i32) > (b as i32),
        CondCode::Ltu => a < b,
        CondCode::Geu => a >= b,
        CondCode::Leu => a <= b,
        CondCode::Gtu => a > b,
    }
}

impl Region {
    /// Allocate a fresh region-local virtual register.
    pub fn new_local(&mut self, ty: VType) -> VOperand {
        let idx: RegN = self.vregs_mut().add_local(ty);
        VOperand::make_vgpr(ty, idx)
    }

    fn insert(
        &mut self,
        op: Op,
        out: &[VOperand],
        ins: &[VOperand],
        aux: InstAux,
    ) -> InstRef {
        let def = op.def();
        assert_eq!(out.len(), def.n_out as usize);
        assert_eq!(ins.len(), def.n_in as usize);
        let mut inst = Inst::new(self.next_inst_id(), op);
        inst.out[..out.len()].copy_from_slice(out);
        inst.ins[..ins.len()].copy_from_slice(ins);
        inst.aux = aux;
        self.push_inst(inst)
    }

    pub fn create_mov(&mut self, d: VOperand, s: VOperand) -> InstRef {
        self.insert(Op::Mov, &[d], &[s], InstAux::None)
    }

    /// Insert a binop, folding on the way in:
    /// - two constant inputs become a const-producing mov;
    /// - `x op 0` / `x op x` identities collapse;
    /// - a constant left operand of a commutative op is normalized
    ///   to the right.
    pub fn create_binop(
        &mut self,
        op: Op,
        d: VOperand,
        mut a: VOperand,
        mut b: VOperand,
    ) -> InstRef {
        assert!(op.is_binop());

        if a.is_const() && b.is_const() {
            let val = eval_binop(op, a.const_val(), b.const_val());
            return self.create_mov(d, VOperand::make_const(d.ty(), val));
        }

        if op.is_commutative() && a.is_const() {
            std::mem::swap(&mut a, &mut b);
        }

        if b.is_const() && b.const_val() == 0 {
            match op {
                Op::Add | Op::Sub | Op::Or | Op::Xor | Op::Sll | Op::Srl | Op::Sra => {
                    return self.create_mov(d, a);
                }
                Op::And => {
                    return self.create_mov(d, VOperand::make_const(d.ty(), 0));
                }
                _ => {}
            }
        }

        if a == b && a.is_gpr() {
            match op {
                Op::Sub | Op::Xor => {
                    return self.create_mov(d, VOperand::make_const(d.ty(), 0));
                }
                Op::And | Op::Or => {
                    return self.create_mov(d, a);
                }
                _ => {}
            }
        }

        self.insert(op, &[d], &[a, b], InstAux::None)
    }

    pub fn create_add(&mut self, d: VOperand, a: VOperand, b: VOperand) -> InstRef {
        self.create_binop(Op::Add, d, a, b)
    }

    pub fn create_sub(&mut self, d: VOperand, a: VOperand, b: VOperand) -> InstRef {
        self.create_binop(Op::Sub, d, a, b)
    }

    pub fn create_and(&mut self, d: VOperand, a: VOperand, b: VOperand) -> InstRef {
        self.create_binop(Op::And, d, a, b)
    }

    pub fn create_or(&mut self, d: VOperand, a: VOperand, b: VOperand) -> InstRef {
        self.create_binop(Op::Or, d, a, b)
    }

    pub fn create_xor(&mut self, d: VOperand, a: VOperand, b: VOperand) -> InstRef {
        self.create_binop(Op::Xor, d, a, b)
    }

    pub fn create_sll(&mut self, d: VOperand, a: VOperand, b: VOperand) -> InstRef {
        self.create_binop(Op::Sll, d, a, b)
    }

    pub fn create_srl(&mut self, d: VOperand, a: VOperand, b: VOperand) -> InstRef {
        self.create_binop(Op::Srl, d, a, b)
    }

    pub fn create_sra(&mut self, d: VOperand, a: VOperand, b: VOperand) -> InstRef {
        self.create_binop(Op::Sra, d, a, b)
    }

    pub fn create_setcc(
        &mut self,
        cc: CondCode,
        d: VOperand,
        a: VOperand,
        b: VOperand,
    ) -> InstRef {
        if a.is_const() && b.is_const() {
            let val = eval_cond(cc, a.const_val(), b.const_val()) as u32;
            return self.create_mov(d, VOperand::make_const(d.ty(), val));
        }
        self.insert(Op::Setcc, &[d], &[a, b], InstAux::Cond(cc))
    }

    /// Unconditional branch to another block of the region.
    pub fn create_br(&mut self, target: BlockId) -> InstRef {
        let r = self.insert(Op::Br, &[], &[], InstAux::None);
        let cur = self.cursor();
        self.add_succ(cur, target);
        r
    }

    /// Conditional branch. Successor edges are attached here, taken
    /// first, so a constant-folded brcc can pick its edge.
    pub fn create_brcc(
        &mut self,
        cc: CondCode,
        a: VOperand,
        b: VOperand,
        taken: BlockId,
        fallthrough: BlockId,
    ) -> InstRef {
        if a.is_const() && b.is_const() {
            let t = if eval_cond(cc, a.const_val(), b.const_val()) {
                taken
            } else {
                fallthrough
            };
            return self.create_br(t);
        }
        let r = self.insert(Op::Brcc, &[], &[a, b], InstAux::Cond(cc));
        let cur = self.cursor();
        self.add_succ(cur, taken);
        self.add_succ(cur, fallthrough);
        r
    }

    /// Direct guest branch; the operand is a constant guest IP.
    pub fn create_gbr(&mut self, tpc: VOperand) -> InstRef {
        assert!(tpc.is_const());
        self.insert(Op::Gbr, &[], &[tpc], InstAux::None)
    }

    /// Indirect guest branch through a register value.
    pub fn create_gbrind(&mut self, tpc: VOperand) -> InstRef {
        self.insert(Op::Gbrind, &[], &[tpc], InstAux::None)
    }

    pub fn create_vmload(
        &mut self,
        sz: VType,
        sgn: VSign,
        d: VOperand,
        ptr: VOperand,
    ) -> InstRef {
        self.insert(Op::Vmload, &[d], &[ptr], InstAux::Mem { sz, sgn })
    }

    pub fn create_vmstore(
        &mut self,
        sz: VType,
        sgn: VSign,
        ptr: VOperand,
        val: VOperand,
    ) -> InstRef {
        self.insert(Op::Vmstore, &[], &[ptr, val], InstAux::Mem { sz, sgn })
    }

    pub fn create_hcall(&mut self, stub: u16, arg: VOperand) -> InstRef {
        self.insert(Op::Hcall, &[], &[arg], InstAux::Stub(stub))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateInfo;

    fn empty_region() -> Region {
        let si: &'static StateInfo = Box::leak(Box::new(StateInfo { regs: Vec::new() }));
        let mut rn = Region::new(si);
        let bb = rn.create_block();
        rn.set_cursor(bb);
        rn
    }

    fn c(v: u32) -> VOperand {
        VOperand::make_const(VType::I32, v)
    }

    #[test]
    fn binop_const_folds_to_mov() {
        let mut rn = empty_region();
        let d = rn.new_local(VType::I32);
        let r = rn.create_add(d, c(40), c(2));
        let inst = rn.inst(r);
        assert_eq!(inst.op(), Op::Mov);
        assert_eq!(inst.ins[0].const_val(), 42);
    }

    #[test]
    fn add_zero_folds_to_mov() {
        let mut rn = empty_region();
        let d = rn.new_local(VType::I32);
        let a = rn.new_local(VType::I32);
        let r = rn.create_add(d, a, c(0));
        assert_eq!(rn.inst(r).op(), Op::Mov);
        assert_eq!(rn.inst(r).ins[0], a);
    }

    #[test]
    fn commutative_const_normalized_right() {
        let mut rn = empty_region();
        let d = rn.new_local(VType::I32);
        let a = rn.new_local(VType::I32);
        let r = rn.create_add(d, c(5), a);
        let inst = rn.inst(r);
        assert_eq!(inst.op(), Op::Add);
        assert_eq!(inst.ins[0], a);
        assert_eq!(inst.ins[1].const_val(), 5);
    }

    #[test]
    fn xor_self_folds_to_zero() {
        let mut rn = empty_region();
        let d = rn.new_local(VType::I32);
        let a = rn.new_local(VType::I32);
        let r = rn.create_xor(d, a, a);
        let inst = rn.inst(r);
        assert_eq!(inst.op(), Op::Mov);
        assert_eq!(inst.ins[0].const_val(), 0);
    }

    #[test]
    fn brcc_const_becomes_br_with_selected_edge() {
        let mut rn = empty_region();
        let src = rn.cursor();
        let taken = rn.create_block();
        let fall = rn.create_block();
        let r = rn.create_brcc(CondCode::Eq, c(0), c(0), taken, fall);
        assert_eq!(rn.inst(r).op(), Op::Br);
        assert_eq!(rn.block(src).succs, vec![taken]);
    }

    #[test]
    fn sra_const_fold_is_arithmetic() {
        assert_eq!(eval_binop(Op::Sra, 0x8000_0000, 31), 0xffff_ffff);
        assert_eq!(eval_binop(Op::Srl, 0x8000_0000, 31), 1);
    }
}
