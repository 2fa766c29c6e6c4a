//! Basic-block layout: order the region's blocks so that the
//! preferred fallthrough successor (a brcc's not-taken edge, a
//! br's only edge) is placed immediately after its predecessor,
//! letting the emitter drop the trailing jump.

use qdbt_core::{BlockId, Region};

pub fn run(rn: &mut Region) {
    let n = rn.num_blocks() as usize;
    let mut placed = vec![false; n];
    let mut order = Vec::with_capacity(n);

    for start in 0..n {
        let mut cur = BlockId(start as u32);
        while !placed[cur.0 as usize] {
            placed[cur.0 as usize] = true;
            order.push(cur);
            let succs = &rn.block(cur).succs;
            let pref = match succs.len() {
                1 => succs[0],
                2 => succs[1],
                _ => break,
            };
            if placed[pref.0 as usize] {
                break;
            }
            cur = pref;
        }
    }

    rn.set_layout(order);
}

#[cfg(test)]
mod tests {
    use super::*;
    use qdbt_core::StateInfo;

    #[test]
    fn fallthrough_edge_follows_predecessor() {
        let si: &'static StateInfo = Box::leak(Box::new(StateInfo { regs: Vec::new() }));
        let mut rn = Region::new(si);
        let entry = rn.create_block();
        let taken = rn.create_block();
        let fall = rn.create_block();
        rn.add_succ(entry, taken);
        rn.add_succ(entry, fall);
        run(&mut rn);
        let order = rn.layout();
        assert_eq!(order[0], entry);
        assert_eq!(order[1], fall, "not-taken edge placed next");
        assert_eq!(order[2], taken);
    }
}
