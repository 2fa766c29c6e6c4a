//! RV32 → QIR translation.
//!
//! Carves the requested IP ranges into translation blocks: decodes
//! guest instructions sequentially, lowers each to QIR through the
//! folding builder, and records control flow. Instructions that may
//! trap are preceded by a spill of the precise guest IP to its
//! state slot, so a trap raised inside a helper observes the right
//! IP.

use std::collections::HashMap;

use qdbt_core::{BlockId, CondCode, Region, VOperand, VSign, VType};

use super::cpu::{state_info, RuntimeStubId, IP_VREG};
use super::insn::Insn;

/// Maximum number of guest instructions per translation block.
pub const TB_MAX_INSNS: u32 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Next,
    Branch,
    TbOvf,
}

pub struct Rv32Translator {
    ip2bb: HashMap<u32, BlockId>,
    insn_ip: u32,
    control: Control,
    vmem_base: usize,
}

fn vconst(val: u32) -> VOperand {
    VOperand::make_const(VType::I32, val)
}

fn vgpr(id: u8) -> VOperand {
    assert!(id != 0);
    VOperand::make_vgpr(VType::I32, id as u16 - 1)
}

/// Register read operand: register 0 folds to the constant zero.
fn gprop(id: u8) -> VOperand {
    if id == 0 {
        vconst(0)
    } else {
        vgpr(id)
    }
}

impl Rv32Translator {
    /// Translate every `[lo, hi)` range of the set into the region.
    /// Each range entry IP gets its own block up front so direct
    /// branches inside the set become CFG edges.
    pub fn translate(region: &mut Region, ipranges: &[(u32, u32)], vmem_base: usize) {
        log::debug!(target: "qir", "rv32: translate {} range(s)", ipranges.len());
        let mut t = Rv32Translator {
            ip2bb: HashMap::new(),
            insn_ip: 0,
            control: Control::Next,
            vmem_base,
        };

        for &(lo, _) in ipranges {
            let bb = region.create_block();
            t.ip2bb.insert(lo, bb);
        }
        for &(lo, hi) in ipranges {
            t.translate_range(region, lo, hi);
        }
    }

    fn translate_range(&mut self, rn: &mut Region, ip: u32, boundary_ip: u32) {
        log::debug!(target: "qir", "rv32: range [{ip:#x}:{boundary_ip:#x}]");
        assert!(boundary_ip != 0);
        self.insn_ip = ip;
        rn.set_cursor(self.ip2bb[&ip]);

        self.control = Control::Next;
        let mut num_insns = 0;
        loop {
            self.translate_insn(rn);
            num_insns += 1;
            if self.control != Control::Next {
                break;
            }
            if num_insns == TB_MAX_INSNS || self.insn_ip >= boundary_ip {
                self.control = Control::TbOvf;
                self.make_gbr(rn, self.insn_ip);
                break;
            }
        }
        log::debug!(target: "qir", "rv32: stop at {:#x}", self.insn_ip);
    }

    /// Spill the current guest IP to its state slot so a traplike
    /// helper observes a precise IP.
    fn pre_sideeff(&self, rn: &mut Region) {
        let offs = state_info().reg(IP_VREG).offs;
        let ip_slot = VOperand::make_slot(true, VType::I32, offs);
        rn.create_mov(ip_slot, vconst(self.insn_ip));
    }

    fn fetch(&self) -> Insn {
        // SAFETY: the caller mapped guest code at vmem_base and the
        // compile driver clamped the range to mapped pages.
        let word = unsafe {
            ((self.vmem_base + self.insn_ip as usize) as *const u32).read_unaligned()
        };
        Insn(word)
    }

    /// Direct guest branch to `ip`: a CFG edge if `ip` is an entry
    /// of the range set, otherwise an exiting gbr.
    fn make_gbr(&self, rn: &mut Region, ip: u32) {
        if let Some(&bb) = self.ip2bb.get(&ip) {
            rn.create_br(bb);
        } else {
            self.pre_sideeff(rn);
            rn.create_gbr(vconst(ip));
        }
    }

    /// A brcc successor: the entry block itself when the target is
    /// in the range set, else a stub block exiting through gbr.
    fn branch_target(&self, rn: &mut Region, ip: u32) -> BlockId {
        if let Some(&bb) = self.ip2bb.get(&ip) {
            return bb;
        }
        let bb = rn.create_block();
        rn.set_cursor(bb);
        self.pre_sideeff(rn);
        rn.create_gbr(vconst(ip));
        bb
    }

    fn translate_brcc(&mut self, rn: &mut Region, i: Insn, cc: CondCode) {
        let src = rn.cursor();
        let take_ip = self.insn_ip.wrapping_add(i.imm_b() as u32);
        let fall_ip = self.insn_ip.wrapping_add(4);
        let bb_t = self.branch_target(rn, take_ip);
        let bb_f = self.branch_target(rn, fall_ip);
        rn.set_cursor(src);
        rn.create_brcc(cc, gprop(i.rs1()), gprop(i.rs2()), bb_t, bb_f);
        self.control = Control::Branch;
    }

    fn translate_setcc_rr(&self, rn: &mut Region, i: Insn, cc: CondCode) {
        if i.rd() != 0 {
            rn.create_setcc(cc, vgpr(i.rd()), gprop(i.rs1()), gprop(i.rs2()));
        }
    }

    fn translate_setcc_ri(&self, rn: &mut Region, i: Insn, cc: CondCode) {
        if i.rd() != 0 {
            rn.create_setcc(
                cc,
                vgpr(i.rd()),
                gprop(i.rs1()),
                vconst(i.imm_i() as u32),
            );
        }
    }

    fn translate_load(&self, rn: &mut Region, i: Insn, sz: VType, sgn: VSign) {
        self.pre_sideeff(rn);
        let addr = rn.new_local(VType::I32);
        rn.create_add(addr, gprop(i.rs1()), vconst(i.imm_i() as u32));
        if i.rd() != 0 {
            rn.create_vmload(sz, sgn, vgpr(i.rd()), addr);
        } else {
            // The access still happens; the value is discarded.
            rn.create_vmload(sz, sgn, addr, addr);
        }
    }

    fn translate_store(&self, rn: &mut Region, i: Insn, sz: VType) {
        self.pre_sideeff(rn);
        let addr = rn.new_local(VType::I32);
        rn.create_add(addr, gprop(i.rs1()), vconst(i.imm_s() as u32));
        rn.create_vmstore(sz, VSign::U, addr, gprop(i.rs2()));
    }

    /// Rare operations go through a helper; the raw instruction
    /// word is the argument and the stub defines the semantics.
    fn translate_helper(&self, rn: &mut Region, i: Insn, stub: RuntimeStubId) {
        self.pre_sideeff(rn);
        rn.create_hcall(stub as u16, vconst(i.0));
    }

    fn binop_ri(
        &self,
        rn: &mut Region,
        i: Insn,
        f: fn(&mut Region, VOperand, VOperand, VOperand) -> qdbt_core::InstRef,
        imm: u32,
    ) {
        if i.rd() != 0 {
            f(rn, vgpr(i.rd()), gprop(i.rs1()), vconst(imm));
        }
    }

    fn binop_rr(
        &self,
        rn: &mut Region,
        i: Insn,
        f: fn(&mut Region, VOperand, VOperand, VOperand) -> qdbt_core::InstRef,
    ) {
        if i.rd() != 0 {
            f(rn, vgpr(i.rd()), gprop(i.rs1()), gprop(i.rs2()));
        }
    }

    fn translate_insn(&mut self, rn: &mut Region) {
        let i = self.fetch();
        match i.opcode() {
            0x37 => {
                // lui
                if i.rd() != 0 {
                    rn.create_mov(vgpr(i.rd()), vconst(i.imm_u() as u32));
                }
            }
            0x17 => {
                // auipc
                if i.rd() != 0 {
                    rn.create_mov(
                        vgpr(i.rd()),
                        vconst(self.insn_ip.wrapping_add(i.imm_u() as u32)),
                    );
                }
            }
            0x6f => {
                // jal
                if i.rd() != 0 {
                    rn.create_mov(vgpr(i.rd()), vconst(self.insn_ip.wrapping_add(4)));
                }
                self.make_gbr(rn, self.insn_ip.wrapping_add(i.imm_j() as u32));
                self.control = Control::Branch;
            }
            0x67 if i.funct3() == 0 => {
                // jalr
                let tgt = rn.new_local(VType::I32);
                rn.create_add(tgt, gprop(i.rs1()), vconst(i.imm_i() as u32));
                rn.create_and(tgt, tgt, vconst(!1u32));
                if i.rd() != 0 {
                    rn.create_mov(vgpr(i.rd()), vconst(self.insn_ip.wrapping_add(4)));
                }
                rn.create_gbrind(tgt);
                self.control = Control::Branch;
            }
            0x63 => match i.funct3() {
                0 => self.translate_brcc(rn, i, CondCode::Eq),
                1 => self.translate_brcc(rn, i, CondCode::Ne),
                4 => self.translate_brcc(rn, i, CondCode::Lt),
                5 => self.translate_brcc(rn, i, CondCode::Ge),
                6 => self.translate_brcc(rn, i, CondCode::Ltu),
                7 => self.translate_brcc(rn, i, CondCode::Geu),
                _ => self.translate_ill(rn, i),
            },
            0x03 => match i.funct3() {
                0 => self.translate_load(rn, i, VType::I8, VSign::S),
                1 => self.translate_load(rn, i, VType::I16, VSign::S),
                2 => self.translate_load(rn, i, VType::I32, VSign::S),
                4 => self.translate_load(rn, i, VType::I8, VSign::U),
                5 => self.translate_load(rn, i, VType::I16, VSign::U),
                _ => self.translate_ill(rn, i),
            },
            0x23 => match i.funct3() {
                0 => self.translate_store(rn, i, VType::I8),
                1 => self.translate_store(rn, i, VType::I16),
                2 => self.translate_store(rn, i, VType::I32),
                _ => self.translate_ill(rn, i),
            },
            0x13 => match i.funct3() {
                0 => self.binop_ri(rn, i, Region::create_add, i.imm_i() as u32),
                1 if i.funct7() == 0 => {
                    self.binop_ri(rn, i, Region::create_sll, i.shamt())
                }
                2 => self.translate_setcc_ri(rn, i, CondCode::Lt),
                3 => self.translate_setcc_ri(rn, i, CondCode::Ltu),
                4 => self.binop_ri(rn, i, Region::create_xor, i.imm_i() as u32),
                5 if i.funct7() == 0 => {
                    self.binop_ri(rn, i, Region::create_srl, i.shamt())
                }
                5 if i.funct7() == 0x20 => {
                    self.binop_ri(rn, i, Region::create_sra, i.shamt())
                }
                6 => self.binop_ri(rn, i, Region::create_or, i.imm_i() as u32),
                7 => self.binop_ri(rn, i, Region::create_and, i.imm_i() as u32),
                _ => self.translate_ill(rn, i),
            },
            0x33 => match (i.funct3(), i.funct7()) {
                (0, 0) => self.binop_rr(rn, i, Region::create_add),
                (0, 0x20) => self.binop_rr(rn, i, Region::create_sub),
                (1, 0) => self.binop_rr(rn, i, Region::create_sll),
                (2, 0) => self.translate_setcc_rr(rn, i, CondCode::Lt),
                (3, 0) => self.translate_setcc_rr(rn, i, CondCode::Ltu),
                (4, 0) => self.binop_rr(rn, i, Region::create_xor),
                (5, 0) => self.binop_rr(rn, i, Region::create_srl),
                (5, 0x20) => self.binop_rr(rn, i, Region::create_sra),
                (6, 0) => self.binop_rr(rn, i, Region::create_or),
                (7, 0) => self.binop_rr(rn, i, Region::create_and),
                _ => self.translate_ill(rn, i),
            },
            0x0f => match i.funct3() {
                0 => self.translate_helper(rn, i, RuntimeStubId::Fence),
                1 => self.translate_helper(rn, i, RuntimeStubId::FenceI),
                _ => self.translate_ill(rn, i),
            },
            0x73 => match i.0 {
                0x0000_0073 => {
                    self.translate_helper(rn, i, RuntimeStubId::Ecall);
                    self.control = Control::Branch;
                }
                0x0010_0073 => {
                    self.translate_helper(rn, i, RuntimeStubId::Ebreak);
                    self.control = Control::Branch;
                }
                _ => self.translate_ill(rn, i),
            },
            0x2f if i.funct3() == 2 => {
                let stub = match i.funct5() {
                    0x02 if i.rs2() == 0 => Some(RuntimeStubId::LrW),
                    0x03 => Some(RuntimeStubId::ScW),
                    0x01 => Some(RuntimeStubId::AmoswapW),
                    0x00 => Some(RuntimeStubId::AmoaddW),
                    0x04 => Some(RuntimeStubId::AmoxorW),
                    0x0c => Some(RuntimeStubId::AmoandW),
                    0x08 => Some(RuntimeStubId::AmoorW),
                    0x10 => Some(RuntimeStubId::AmominW),
                    0x14 => Some(RuntimeStubId::AmomaxW),
                    0x18 => Some(RuntimeStubId::AmominuW),
                    0x1c => Some(RuntimeStubId::AmomaxuW),
                    _ => None,
                };
                match stub {
                    Some(s) => self.translate_helper(rn, i, s),
                    None => self.translate_ill(rn, i),
                }
            }
            _ => self.translate_ill(rn, i),
        }
        self.insn_ip = self.insn_ip.wrapping_add(4);
    }

    fn translate_ill(&mut self, rn: &mut Region, i: Insn) {
        log::debug!(target: "qir", "illegal insn {:#010x} at {:#x}", i.0, self.insn_ip);
        self.translate_helper(rn, i, RuntimeStubId::Illegal);
        self.control = Control::Branch;
    }
}
