//! Human-readable IR dump, used behind the `qir` log stream.

use std::fmt::Write;

use crate::inst::{Inst, InstAux};
use crate::region::Region;
use crate::voperand::VOperand;

fn fmt_operand(rn: &Region, v: VOperand, buf: &mut String) {
    if v.is_vgpr() {
        let idx = v.vgpr();
        if rn.vregs().is_global(idx) {
            buf.push_str(rn.vregs().global_info(idx).name);
        } else {
            write!(buf, "v{idx}").unwrap();
        }
    } else {
        write!(buf, "{v:?}").unwrap();
    }
}

fn fmt_inst(rn: &Region, inst: &Inst, buf: &mut String) {
    buf.push_str("    ");
    buf.push_str(inst.op().name());
    match inst.aux {
        InstAux::Cond(cc) => {
            buf.push('.');
            buf.push_str(cc.name());
        }
        InstAux::Mem { sz, sgn } => {
            write!(buf, ".{}{}", if sgn == crate::types::VSign::S { 's' } else { 'u' },
                sz.size_bytes() * 8)
                .unwrap();
        }
        InstAux::Stub(id) => {
            write!(buf, "#{id}").unwrap();
        }
        InstAux::None => {}
    }
    let mut first = true;
    for &o in inst.outs() {
        buf.push_str(if first { " " } else { ", " });
        first = false;
        fmt_operand(rn, o, buf);
    }
    for &i in inst.inputs() {
        buf.push_str(if first { " " } else { ", " });
        first = false;
        fmt_operand(rn, i, buf);
    }
    buf.push('\n');
}

/// Render a whole region in layout order.
pub fn region_to_string(rn: &Region) -> String {
    let mut buf = String::new();
    for &bb in rn.layout() {
        let block = rn.block(bb);
        write!(buf, "bb{}:", bb.0).unwrap();
        if !block.succs.is_empty() {
            buf.push_str("  ->");
            for s in &block.succs {
                write!(buf, " bb{}", s.0).unwrap();
            }
        }
        buf.push('\n');
        for inst in rn.block_insts(bb) {
            fmt_inst(rn, inst, &mut buf);
        }
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::Op;
    use crate::state::StateInfo;
    use crate::types::VType;

    #[test]
    fn dump_contains_fold_result() {
        let si: &'static StateInfo = Box::leak(Box::new(StateInfo { regs: Vec::new() }));
        let mut rn = Region::new(si);
        let bb = rn.create_block();
        rn.set_cursor(bb);
        let d = rn.new_local(VType::I32);
        rn.create_add(
            d,
            VOperand::make_const(VType::I32, 1),
            VOperand::make_const(VType::I32, 2),
        );
        let s = region_to_string(&rn);
        assert!(s.contains("mov"));
        assert!(s.contains("0x3"));
        assert!(!s.contains(Op::Add.name()));
    }
}
