//! QIR → x86-64 lowering.
//!
//! Blocks are emitted in layout order; the register allocator runs
//! inline, rewriting virtual operands to physical registers as each
//! instruction is lowered. Intra-region branches go through
//! back-patched rel32 labels; everything that leaves the region
//! uses absolute or state-relative addressing so the finished code
//! can be copied into its final home unchanged.

use qdbt_core::{BlockId, Inst, Op, Region, VOperand, VSign, VType};
use qdbt_frontend::rv32::cpu::{RuntimeStubId, RuntimeStubTab, JMP_CACHE_OFFS, STUB_TAB_OFFS};
use qdbt_tcache::{BranchSlot, BRANCH_SLOT_CODE, JMP_CACHE_SIZE, TB_CODE_PTR_OFFS, TB_IP_OFFS};

use crate::code_buffer::CodeBuffer;
use crate::compile::CompilerRuntime;
use crate::regalloc::RegAlloc;
use crate::x86_64::emitter::*;
use crate::x86_64::regs::{Reg, RegMask, MEMBASE, STATE, TMP_SHIFT};

struct Label {
    value: Option<usize>,
    uses: Vec<usize>,
}

pub struct QCodegen {
    buf: CodeBuffer,
    ra: RegAlloc,
    labels: Vec<Label>,
    /// Absolute stub table for JIT code; None means relocatable
    /// (AOT) mode, where helpers are reached through CPUState.
    stub_tab: Option<&'static RuntimeStubTab>,
    vmem_base: usize,
}

/// Lower a region and copy the finished code into runtime-owned
/// memory. Returns the host pointer and size.
pub fn generate(
    rt: &mut dyn CompilerRuntime,
    rn: &Region,
    entry_ip: u32,
) -> (*mut u8, usize) {
    let mut cg = QCodegen {
        buf: CodeBuffer::new(),
        ra: RegAlloc::new(rn.vregs()),
        labels: (0..rn.num_blocks())
            .map(|_| Label {
                value: None,
                uses: Vec::new(),
            })
            .collect(),
        stub_tab: rt.stub_tab(),
        vmem_base: rt.vmem_base(),
    };

    let layout = rn.layout();
    assert_eq!(layout[0].0, 0, "entry block must be laid out first");
    for (pos, &bb) in layout.iter().enumerate() {
        let next = layout.get(pos + 1).copied();
        cg.bind_label(bb);
        for inst in rn.block_insts(bb) {
            cg.emit_inst(rn, bb, inst, next);
        }
    }
    for (i, l) in cg.labels.iter().enumerate() {
        assert!(
            l.value.is_some() || l.uses.is_empty(),
            "unresolved label for bb{i}"
        );
    }

    let code = cg.buf.as_slice();
    let ptr = rt.allocate_code(code.len(), 16);
    assert!(!ptr.is_null(), "code allocation failed");
    // SAFETY: allocate_code returned a writable region of this size.
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
    }
    log::trace!(target: "qcg", "generated {} bytes for {entry_ip:#x}", code.len());
    (ptr, code.len())
}

impl QCodegen {
    fn bind_label(&mut self, bb: BlockId) {
        let off = self.buf.offset();
        let label = &mut self.labels[bb.0 as usize];
        assert!(label.value.is_none(), "label bound twice");
        label.value = Some(off);
        for pos in std::mem::take(&mut label.uses) {
            patch_rel32(&mut self.buf, pos, off);
        }
    }

    fn emit_jmp_label(&mut self, bb: BlockId) {
        let pos = emit_jmp_rel32(&mut self.buf);
        match self.labels[bb.0 as usize].value {
            Some(v) => patch_rel32(&mut self.buf, pos, v),
            None => self.labels[bb.0 as usize].uses.push(pos),
        }
    }

    fn emit_jcc_label(&mut self, cc: X86Cond, bb: BlockId) {
        let pos = emit_jcc_rel32(&mut self.buf, cc);
        match self.labels[bb.0 as usize].value {
            Some(v) => patch_rel32(&mut self.buf, pos, v),
            None => self.labels[bb.0 as usize].uses.push(pos),
        }
    }

    fn emit_inst(&mut self, rn: &Region, bb: BlockId, inst: &Inst, next: Option<BlockId>) {
        match inst.op() {
            Op::Mov => self.emit_mov(inst),
            op if op.is_binop() => self.emit_binop(inst),
            Op::Setcc => self.emit_setcc_op(inst),
            Op::Br => self.emit_br(rn, bb, next),
            Op::Brcc => self.emit_brcc(rn, bb, inst, next),
            Op::Gbr => self.emit_gbr(inst),
            Op::Gbrind => self.emit_gbrind(inst),
            Op::Vmload => self.emit_vmload(inst),
            Op::Vmstore => self.emit_vmstore(inst),
            Op::Hcall => self.emit_hcall(inst),
            op => panic!("codegen: unhandled op {}", op.name()),
        }
    }

    fn emit_mov(&mut self, inst: &Inst) {
        let d = inst.out[0];
        let s = inst.ins[0];

        if d.is_slot() {
            assert!(d.is_gslot(), "mov: local-slot destinations are not produced");
            let offs = d.slot_offs() as i32;
            if s.is_const() {
                emit_store_imm(
                    &mut self.buf,
                    d.ty().size_bytes(),
                    STATE,
                    offs,
                    s.const_val(),
                );
            } else {
                let p = self.ra.fill(&mut self.buf, s.vgpr(), RegMask::ALL, RegMask::NONE);
                match d.ty() {
                    VType::I8 => emit_store8(&mut self.buf, p, STATE, offs),
                    VType::I16 => emit_store16(&mut self.buf, p, STATE, offs),
                    VType::I32 => emit_store(&mut self.buf, false, p, STATE, offs),
                }
            }
            return;
        }

        assert!(d.is_vgpr(), "mov: unexpected destination {d:?}");
        if s.is_const() {
            let pd = self.ra.alloc_dst(&mut self.buf, d.vgpr(), RegMask::NONE);
            emit_mov_ri(&mut self.buf, false, pd, s.const_val() as u64);
        } else if s.is_vgpr() {
            if s.vgpr() == d.vgpr() {
                return;
            }
            let ps = self.ra.fill(&mut self.buf, s.vgpr(), RegMask::ALL, RegMask::NONE);
            let pd = self
                .ra
                .alloc_dst(&mut self.buf, d.vgpr(), RegMask::NONE.set(ps));
            emit_mov_rr(&mut self.buf, false, pd, ps);
        } else if s.is_gslot() {
            let pd = self.ra.alloc_dst(&mut self.buf, d.vgpr(), RegMask::NONE);
            emit_load(&mut self.buf, false, pd, STATE, s.slot_offs() as i32);
        } else {
            panic!("mov: unexpected source {s:?}");
        }
    }

    fn emit_binop(&mut self, inst: &Inst) {
        let op = inst.op();
        let d = inst.out[0];
        let a = inst.ins[0];
        let b = inst.ins[1];
        assert!(d.is_vgpr());

        let mut avoid = RegMask::NONE;
        let pa = if a.is_vgpr() {
            let p = self.ra.fill(&mut self.buf, a.vgpr(), RegMask::ALL, avoid);
            avoid = avoid.set(p);
            Some(p)
        } else {
            None
        };
        let pb = if b.is_vgpr() {
            let p = self.ra.fill(&mut self.buf, b.vgpr(), RegMask::ALL, avoid);
            avoid = avoid.set(p);
            Some(p)
        } else {
            None
        };

        // Two-operand x86: the destination aliases the left input.
        let d_r = d.vgpr();
        let aliases_a = a.is_vgpr() && a.vgpr() == d_r;
        let pd = if aliases_a {
            self.ra.mark_written(d_r);
            pa.unwrap()
        } else {
            let pd = self.ra.alloc_dst(&mut self.buf, d_r, avoid);
            match (pa, a.is_const()) {
                (Some(p), _) => emit_mov_rr(&mut self.buf, false, pd, p),
                (None, true) => {
                    emit_mov_ri(&mut self.buf, false, pd, a.const_val() as u64)
                }
                _ => panic!("binop: bad left operand {a:?}"),
            }
            pd
        };

        if op.is_shift() {
            let sop = match op {
                Op::Sll => ShiftOp::Shl,
                Op::Srl => ShiftOp::Shr,
                Op::Sra => ShiftOp::Sar,
                _ => unreachable!(),
            };
            if b.is_const() {
                emit_shift_ri(&mut self.buf, sop, false, pd, (b.const_val() & 31) as u8);
            } else {
                emit_mov_rr(&mut self.buf, false, TMP_SHIFT, pb.unwrap());
                emit_shift_cl(&mut self.buf, sop, false, pd);
            }
            return;
        }

        let aop = match op {
            Op::Add => ArithOp::Add,
            Op::Sub => ArithOp::Sub,
            Op::And => ArithOp::And,
            Op::Or => ArithOp::Or,
            Op::Xor => ArithOp::Xor,
            _ => unreachable!(),
        };
        if b.is_const() {
            emit_arith_ri(&mut self.buf, aop, false, pd, b.const_val() as i32);
        } else {
            emit_arith_rr(&mut self.buf, aop, false, pd, pb.unwrap());
        }
    }

    fn emit_setcc_op(&mut self, inst: &Inst) {
        let d = inst.out[0];
        let mut a = inst.ins[0];
        let mut b = inst.ins[1];
        let mut cc = inst.cond();

        if a.is_const() {
            std::mem::swap(&mut a, &mut b);
            cc = cc.swap();
        }
        assert!(a.is_vgpr());
        let pa = self.ra.fill(&mut self.buf, a.vgpr(), RegMask::ALL, RegMask::NONE);
        let mut avoid = RegMask::NONE.set(pa);
        let pb = if b.is_vgpr() {
            let p = self.ra.fill(&mut self.buf, b.vgpr(), RegMask::ALL, avoid);
            avoid = avoid.set(p);
            Some(p)
        } else {
            None
        };

        let d_r = d.vgpr();
        let aliased = (a.is_vgpr() && a.vgpr() == d_r) || (b.is_vgpr() && b.vgpr() == d_r);
        let x86c = X86Cond::from_cc(cc);

        if aliased {
            self.ra.mark_written(d_r);
            let pd = self.ra.preg_of(d_r);
            self.emit_cmp(pa, b, pb);
            emit_setcc(&mut self.buf, x86c, pd);
            emit_movzx_b(&mut self.buf, pd, pd);
        } else {
            let pd = self.ra.alloc_dst(&mut self.buf, d_r, avoid);
            emit_xor_self(&mut self.buf, pd);
            self.emit_cmp(pa, b, pb);
            emit_setcc(&mut self.buf, x86c, pd);
        }
    }

    fn emit_cmp(&mut self, pa: Reg, b: VOperand, pb: Option<Reg>) {
        if b.is_const() {
            emit_arith_ri(&mut self.buf, ArithOp::Cmp, false, pa, b.const_val() as i32);
        } else {
            emit_arith_rr(&mut self.buf, ArithOp::Cmp, false, pa, pb.unwrap());
        }
    }

    fn emit_br(&mut self, rn: &Region, bb: BlockId, next: Option<BlockId>) {
        let target = rn.block(bb).succs[0];
        self.ra.block_boundary(&mut self.buf);
        if next != Some(target) {
            self.emit_jmp_label(target);
        }
    }

    fn emit_brcc(&mut self, rn: &Region, bb: BlockId, inst: &Inst, next: Option<BlockId>) {
        let succs = &rn.block(bb).succs;
        let (taken, fall) = (succs[0], succs[1]);

        let mut a = inst.ins[0];
        let mut b = inst.ins[1];
        let mut cc = inst.cond();
        if a.is_const() {
            std::mem::swap(&mut a, &mut b);
            cc = cc.swap();
        }
        assert!(a.is_vgpr());
        let pa = self.ra.fill(&mut self.buf, a.vgpr(), RegMask::ALL, RegMask::NONE);
        let pb = if b.is_vgpr() {
            Some(self.ra.fill(
                &mut self.buf,
                b.vgpr(),
                RegMask::ALL,
                RegMask::NONE.set(pa),
            ))
        } else {
            None
        };

        // Sync before the compare: boundary spills are plain moves
        // and leave the flags alone, but keep the original's order.
        self.ra.block_boundary(&mut self.buf);
        self.emit_cmp(pa, b, pb);
        self.emit_jcc_label(X86Cond::from_cc(cc), taken);
        if next != Some(fall) {
            self.emit_jmp_label(fall);
        }
    }

    fn emit_gbr(&mut self, inst: &Inst) {
        let tpc = inst.ins[0];
        assert!(tpc.is_const());
        self.ra.block_boundary(&mut self.buf);

        let mut slot = BranchSlot {
            code: [0; BRANCH_SLOT_CODE],
            gip: tpc.const_val(),
        };
        match self.stub_tab {
            Some(tab) => slot.reset(tab.get(RuntimeStubId::LinkBranch)),
            None => slot.reset_state_call(
                (STUB_TAB_OFFS + RuntimeStubId::LinkBranch.offs()) as i32,
            ),
        }
        self.buf.emit_bytes(&slot.code);
        self.buf.emit_u32(slot.gip);
    }

    fn emit_gbrind(&mut self, inst: &Inst) {
        let tpc = inst.ins[0];
        assert!(tpc.is_vgpr(), "gbrind target is a register value");

        // Pin the target IP in ESI: it is both the probe key and the
        // brind helper's second argument.
        self.ra.fill(
            &mut self.buf,
            tpc.vgpr(),
            RegMask::NONE.set(Reg::Rsi),
            RegMask::NONE,
        );
        self.ra.block_boundary(&mut self.buf);

        // Inline jump-cache probe.
        emit_mov_rr(&mut self.buf, false, Reg::Rdi, Reg::Rsi);
        emit_shift_ri(&mut self.buf, ShiftOp::Shr, false, Reg::Rdi, 2);
        emit_arith_ri(
            &mut self.buf,
            ArithOp::And,
            false,
            Reg::Rdi,
            (JMP_CACHE_SIZE - 1) as i32,
        );
        match self.stub_tab {
            Some(_) => {
                emit_mov_ri(
                    &mut self.buf,
                    true,
                    Reg::Rdx,
                    qdbt_tcache::jmp_cache_ptr() as u64,
                );
            }
            None => {
                emit_load(&mut self.buf, true, Reg::Rdx, STATE, JMP_CACHE_OFFS as i32);
            }
        }
        emit_load_sib(&mut self.buf, true, Reg::Rdi, Reg::Rdx, Reg::Rdi, 3);
        emit_test_rr(&mut self.buf, true, Reg::Rdi, Reg::Rdi);
        let miss0 = emit_jcc_rel32(&mut self.buf, X86Cond::Je);
        emit_cmp_rm(&mut self.buf, false, Reg::Rsi, Reg::Rdi, TB_IP_OFFS);
        let miss1 = emit_jcc_rel32(&mut self.buf, X86Cond::Jne);
        emit_load(&mut self.buf, true, Reg::Rdi, Reg::Rdi, TB_CODE_PTR_OFFS);
        emit_jmp_reg(&mut self.buf, Reg::Rdi);

        // Slow path: the brind helper decides where to go.
        let slow = self.buf.offset();
        patch_rel32(&mut self.buf, miss0, slow);
        patch_rel32(&mut self.buf, miss1, slow);
        emit_mov_rr(&mut self.buf, true, Reg::Rdi, STATE);
        match self.stub_tab {
            Some(tab) => {
                emit_mov_ri(
                    &mut self.buf,
                    true,
                    Reg::Rax,
                    tab.get(RuntimeStubId::Brind) as u64,
                );
                emit_call_reg(&mut self.buf, Reg::Rax);
            }
            None => {
                emit_call_mem(
                    &mut self.buf,
                    STATE,
                    (STUB_TAB_OFFS + RuntimeStubId::Brind.offs()) as i32,
                );
            }
        }
        emit_jmp_reg(&mut self.buf, Reg::Rdx);
    }

    fn emit_vmload(&mut self, inst: &Inst) {
        let (sz, sgn) = inst.mem_op();
        let d = inst.out[0];
        let ptr = inst.ins[0];
        assert!(d.is_vgpr() && ptr.is_vgpr());

        self.ra.sync_globals(&mut self.buf);
        let pp = self.ra.fill(&mut self.buf, ptr.vgpr(), RegMask::ALL, RegMask::NONE);
        let pd = if d.vgpr() == ptr.vgpr() {
            self.ra.mark_written(d.vgpr());
            pp
        } else {
            self.ra
                .alloc_dst(&mut self.buf, d.vgpr(), RegMask::NONE.set(pp))
        };

        let buf = &mut self.buf;
        if self.vmem_base != 0 {
            match (sz, sgn) {
                (VType::I8, VSign::U) => emit_load_zx8_sib(buf, pd, MEMBASE, pp),
                (VType::I8, VSign::S) => emit_load_sx8_sib(buf, pd, MEMBASE, pp),
                (VType::I16, VSign::U) => emit_load_zx16_sib(buf, pd, MEMBASE, pp),
                (VType::I16, VSign::S) => emit_load_sx16_sib(buf, pd, MEMBASE, pp),
                (VType::I32, _) => emit_load_sib(buf, false, pd, MEMBASE, pp, 0),
            }
        } else {
            match (sz, sgn) {
                (VType::I8, VSign::U) => emit_load_zx8(buf, pd, pp, 0),
                (VType::I8, VSign::S) => emit_load_sx8(buf, pd, pp, 0),
                (VType::I16, VSign::U) => emit_load_zx16(buf, pd, pp, 0),
                (VType::I16, VSign::S) => emit_load_sx16(buf, pd, pp, 0),
                (VType::I32, _) => emit_load(buf, false, pd, pp, 0),
            }
        }
    }

    fn emit_vmstore(&mut self, inst: &Inst) {
        let (sz, _sgn) = inst.mem_op();
        let ptr = inst.ins[0];
        let val = inst.ins[1];
        assert!(ptr.is_vgpr());

        self.ra.sync_globals(&mut self.buf);
        let pp = self.ra.fill(&mut self.buf, ptr.vgpr(), RegMask::ALL, RegMask::NONE);

        if val.is_const() {
            if self.vmem_base != 0 {
                emit_store_imm_sib(
                    &mut self.buf,
                    sz.size_bytes(),
                    MEMBASE,
                    pp,
                    val.const_val(),
                );
            } else {
                emit_store_imm(&mut self.buf, sz.size_bytes(), pp, 0, val.const_val());
            }
            return;
        }

        let pv = self.ra.fill(
            &mut self.buf,
            val.vgpr(),
            RegMask::ALL,
            RegMask::NONE.set(pp),
        );
        let buf = &mut self.buf;
        if self.vmem_base != 0 {
            match sz {
                VType::I8 => emit_store8_sib(buf, pv, MEMBASE, pp),
                VType::I16 => emit_store16_sib(buf, pv, MEMBASE, pp),
                VType::I32 => emit_store32_sib(buf, pv, MEMBASE, pp),
            }
        } else {
            match sz {
                VType::I8 => emit_store8(buf, pv, pp, 0),
                VType::I16 => emit_store16(buf, pv, pp, 0),
                VType::I32 => emit_store(buf, false, pv, pp, 0),
            }
        }
    }

    fn emit_hcall(&mut self, inst: &Inst) {
        let stub = RuntimeStubId::from_u16(inst.stub());
        let arg = inst.ins[0];
        assert!(arg.is_const(), "hcall argument is the raw insn word");

        self.ra.call_op(&mut self.buf);
        emit_mov_rr(&mut self.buf, true, Reg::Rdi, STATE);
        emit_mov_ri(&mut self.buf, false, Reg::Rsi, arg.const_val() as u64);
        match self.stub_tab {
            Some(tab) => {
                emit_mov_ri(&mut self.buf, true, Reg::Rax, tab.get(stub) as u64);
                emit_call_reg(&mut self.buf, Reg::Rax);
            }
            None => {
                emit_call_mem(&mut self.buf, STATE, (STUB_TAB_OFFS + stub.offs()) as i32);
            }
        }

        // Traplike helpers unwind to the execute loop: return null
        // so the loop inspects the trap number.
        if stub.traps() {
            emit_xor_self(&mut self.buf, Reg::Rax);
            match self.stub_tab {
                Some(tab) => {
                    emit_mov_ri(
                        &mut self.buf,
                        true,
                        TMP_SHIFT,
                        tab.get(RuntimeStubId::Escape) as u64,
                    );
                    emit_jmp_reg(&mut self.buf, TMP_SHIFT);
                }
                None => {
                    emit_jmp_mem(
                        &mut self.buf,
                        STATE,
                        (STUB_TAB_OFFS + RuntimeStubId::Escape.offs()) as i32,
                    );
                }
            }
            self.ra.reset_dead();
        }
    }
}
