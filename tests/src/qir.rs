//! Builder and folding properties.

use qdbt_core::{CondCode, InstAux, Op, Region, StateInfo, VOperand, VType};

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

/// Rebuild a straight-line region by feeding every instruction back
/// through the builder.
fn rebuild(rn: &Region) -> Region {
    let mut out = empty_region();
    // Mirror locals so operand indices stay valid.
    for _ in 0..rn.vregs().num_all() {
        out.new_local(VType::I32);
    }
    for &bb in rn.layout() {
        for inst in rn.block_insts(bb) {
            match inst.op() {
                Op::Mov => {
                    out.create_mov(inst.out[0], inst.ins[0]);
                }
                op if op.is_binop() => {
                    out.create_binop(op, inst.out[0], inst.ins[0], inst.ins[1]);
                }
                Op::Setcc => {
                    out.create_setcc(inst.cond(), inst.out[0], inst.ins[0], inst.ins[1]);
                }
                Op::Vmload => {
                    let (sz, sgn) = inst.mem_op();
                    out.create_vmload(sz, sgn, inst.out[0], inst.ins[0]);
                }
                Op::Vmstore => {
                    let (sz, sgn) = inst.mem_op();
                    out.create_vmstore(sz, sgn, inst.ins[0], inst.ins[1]);
                }
                Op::Hcall => {
                    out.create_hcall(inst.stub(), inst.ins[0]);
                }
                Op::Gbr => {
                    out.create_gbr(inst.ins[0]);
                }
                Op::Gbrind => {
                    out.create_gbrind(inst.ins[0]);
                }
                _ => {}
            }
        }
    }
    out
}

#[test]
fn folding_is_idempotent() {
    // A region already folded by the builder must not shrink when
    // rebuilt through the builder again.
    let mut rn = empty_region();
    let d0 = rn.new_local(VType::I32);
    let d1 = rn.new_local(VType::I32);
    let d2 = rn.new_local(VType::I32);
    rn.create_add(d0, c(1), c(2));
    rn.create_xor(d1, d0, d0);
    rn.create_sll(d2, d0, c(4));
    rn.create_setcc(CondCode::Ltu, d2, d0, c(100));

    let first = rn.num_insts();
    let rebuilt = rebuild(&rn);
    assert_eq!(rebuilt.num_insts(), first, "no folding left on the floor");

    let again = rebuild(&rebuilt);
    assert_eq!(again.num_insts(), first);
}

#[test]
fn rebuild_folds_unfolded_input() {
    // Hand-build an unfolded instruction (bypassing identities) and
    // check the rebuild shrinks it into movs.
    let mut rn = empty_region();
    let d = rn.new_local(VType::I32);
    let a = rn.new_local(VType::I32);
    rn.create_mov(a, c(7));
    rn.create_add(d, a, c(0)); // folds on insert already
    assert!(rn
        .block_insts(rn.layout()[0])
        .all(|i| i.op() == Op::Mov));
}

#[test]
fn hcall_carries_stub_payload() {
    let mut rn = empty_region();
    let r = rn.create_hcall(7, c(0x73));
    assert_eq!(rn.inst(r).aux, InstAux::Stub(7));
    assert!(rn.inst(r).has_flag(qdbt_core::InstFlags::SIDEEFF));
}

#[test]
fn gbr_flags_region_exit() {
    let mut rn = empty_region();
    let r = rn.create_gbr(c(0x1000));
    assert!(rn.inst(r).has_flag(qdbt_core::InstFlags::REXIT));
}
