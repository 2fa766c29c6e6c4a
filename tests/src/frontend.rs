//! Translator output properties, checked at the IR level.

use qdbt_core::{InstFlags, Op, Region};
use qdbt_frontend::rv32::cpu::state_info;
use qdbt_frontend::rv32::Rv32Translator;

/// Translate `words` as guest code starting at IP 0.
fn translate(words: &[u32]) -> Region {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    let mut rn = Region::new(state_info());
    Rv32Translator::translate(
        &mut rn,
        &[(0, bytes.len() as u32)],
        bytes.as_ptr() as usize,
    );
    rn
}

fn all_insts(rn: &Region) -> Vec<&qdbt_core::Inst> {
    let mut out = Vec::new();
    for &bb in rn.layout() {
        out.extend(rn.block_insts(bb));
    }
    out
}

#[test]
fn writes_to_x0_are_elided() {
    // addi x0, x5, 1
    let rn = translate(&[0x0012_8013]);
    for inst in all_insts(&rn) {
        for o in inst.outs() {
            assert!(!o.is_vgpr(), "x0 write must not produce a register def");
        }
    }
}

#[test]
fn reads_of_x0_fold_to_constant_zero() {
    // add x5, x0, x0 - both inputs are the constant zero, so the
    // whole op folds to a constant move.
    let rn = translate(&[0x0000_02b3]);
    let insts = all_insts(&rn);
    let mov = insts
        .iter()
        .find(|i| i.op() == Op::Mov && i.out[0].is_vgpr())
        .expect("x5 def");
    assert!(mov.ins[0].is_const());
    assert_eq!(mov.ins[0].const_val(), 0);
}

#[test]
fn load_to_x0_still_accesses_memory() {
    // lb x0, 0(a0): the access happens, the value is discarded.
    let rn = translate(&[0x0005_0003]);
    let insts = all_insts(&rn);
    let ld = insts
        .iter()
        .find(|i| i.op() == Op::Vmload)
        .expect("load emitted");
    assert_eq!(ld.out[0], ld.ins[0], "value discarded into the address temp");
}

#[test]
fn brcc_on_x0_folds_to_unconditional_branch() {
    // beq x0, x0, +8 - no compare survives (scenario S5).
    let rn = translate(&[0x0000_0463]);
    let insts = all_insts(&rn);
    assert!(insts.iter().all(|i| i.op() != Op::Brcc));
    let entry = rn.layout()[0];
    assert_eq!(rn.block(entry).succs.len(), 1, "single selected successor");
    // The selected successor exits to guest IP 8.
    let target = rn.block(entry).succs[0];
    let gbr = rn
        .block_insts(target)
        .find(|i| i.op() == Op::Gbr)
        .expect("stub exits through gbr");
    assert_eq!(gbr.ins[0].const_val(), 8);
}

#[test]
fn conditional_branch_has_taken_then_fallthrough_edges() {
    // bne a0, a1, +8
    let rn = translate(&[0x00b5_1463]);
    let entry = rn.layout()[0];
    let brcc = rn
        .block_insts(entry)
        .find(|i| i.op() == Op::Brcc)
        .expect("brcc survives");
    assert_eq!(brcc.cond(), qdbt_core::CondCode::Ne);
    let succs = &rn.block(entry).succs;
    assert_eq!(succs.len(), 2);
    let taken_gbr = rn
        .block_insts(succs[0])
        .find(|i| i.op() == Op::Gbr)
        .unwrap();
    let fall_gbr = rn
        .block_insts(succs[1])
        .find(|i| i.op() == Op::Gbr)
        .unwrap();
    assert_eq!(taken_gbr.ins[0].const_val(), 8);
    assert_eq!(fall_gbr.ins[0].const_val(), 4);
}

#[test]
fn side_effect_order_is_program_order() {
    // sw a1, 0(a0); lw a2, 0(a0); sw a3, 4(a0); ecall
    let rn = translate(&[0x00b5_2023, 0x0005_2603, 0x00d5_2223, 0x0000_0073]);
    let effects: Vec<Op> = all_insts(&rn)
        .iter()
        .filter(|i| i.has_flag(InstFlags::SIDEEFF))
        .map(|i| i.op())
        .collect();
    assert_eq!(
        effects,
        vec![Op::Vmstore, Op::Vmload, Op::Vmstore, Op::Hcall],
        "side-effecting ops keep guest program order"
    );
}

#[test]
fn traplike_insns_spill_precise_ip() {
    // addi a0, zero, 42; ecall - the helper must observe ip 4.
    let rn = translate(&[0x02a0_0513, 0x0000_0073]);
    let insts = all_insts(&rn);
    let hcall_pos = insts.iter().position(|i| i.op() == Op::Hcall).unwrap();
    let spill = insts[..hcall_pos]
        .iter()
        .rev()
        .find(|i| i.op() == Op::Mov && i.out[0].is_gslot())
        .expect("ip spilled before the trap");
    assert_eq!(spill.ins[0].const_val(), 4);
}

#[test]
fn jal_writes_link_register() {
    // jal ra, +8 at ip 0: ra = 4.
    let rn = translate(&[0x0080_00ef]);
    let insts = all_insts(&rn);
    let link = insts
        .iter()
        .find(|i| i.op() == Op::Mov && i.out[0].is_vgpr() && i.out[0].vgpr() == 0)
        .expect("ra def");
    assert_eq!(link.ins[0].const_val(), 4);
}

#[test]
fn jalr_masks_low_bit_and_exits_indirect() {
    // jalr x0, 0(a0)
    let rn = translate(&[0x0005_0067]);
    let insts = all_insts(&rn);
    let and = insts
        .iter()
        .find(|i| i.op() == Op::And)
        .expect("target is masked");
    assert_eq!(and.ins[1].const_val(), !1u32);
    let brind = insts.iter().find(|i| i.op() == Op::Gbrind).unwrap();
    assert!(brind.has_flag(InstFlags::REXIT));
    assert_eq!(brind.ins[0], and.out[0]);
}

#[test]
fn unknown_encoding_lowers_to_illegal_helper() {
    let rn = translate(&[0xffff_ffff]);
    let insts = all_insts(&rn);
    let hc = insts.iter().find(|i| i.op() == Op::Hcall).unwrap();
    assert_eq!(
        hc.stub(),
        qdbt_frontend::rv32::cpu::RuntimeStubId::Illegal as u16
    );
}

#[test]
fn fallthrough_at_range_end_emits_gbr() {
    // Two plain ALU insns, no branch: the TB ends in gbr(8).
    let rn = translate(&[0x0050_0513, 0x0015_8593]);
    let insts = all_insts(&rn);
    let gbr = insts.iter().find(|i| i.op() == Op::Gbr).unwrap();
    assert_eq!(gbr.ins[0].const_val(), 8);
}
