//! Block-scoped register allocator, driven from the code generator
//! one instruction at a time.
//!
//! Virtual registers are either Globals (the guest GPRs and IP,
//! each with a home slot in CPUState reached through the STATE
//! register) or region Locals (block-scoped scratch values spilled
//! to the fixed frame below SP). Sources are filled before
//! destinations are allocated; eviction writes a dirty value back
//! to its home. Globals are synced at side-effecting instructions
//! and released at block boundaries and helper calls; a Local is
//! dead at every block boundary.

use qdbt_core::{RegN, VRegsInfo, VType};

use crate::code_buffer::CodeBuffer;
use crate::x86_64::emitter::{
    emit_load, emit_load_zx16, emit_load_zx8, emit_mov_rr, emit_store, emit_store16,
    emit_store8,
};
use crate::x86_64::regs::{
    Reg, RegMask, FRAME_SIZE, PREGS_ALLOCATABLE, PREGS_CALL_CLOBBER, SP, STATE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Loc {
    Dead,
    Mem,
    Reg,
}

#[derive(Debug, Clone)]
struct VReg {
    ty: VType,
    global: bool,
    /// CPUState offset for globals.
    state_offs: u16,
    /// Lazily assigned frame offset for locals.
    frame_offs: i32,
    has_frame: bool,
    loc: Loc,
    p: Reg,
    /// Memory home is up to date with the register.
    synced: bool,
}

pub struct RegAlloc {
    vregs: Vec<VReg>,
    p2v: [Option<RegN>; 16],
    num_globals: RegN,
    frame_cur: i32,
}

impl RegAlloc {
    pub fn new(vinfo: &VRegsInfo) -> Self {
        let mut vregs = Vec::with_capacity(vinfo.num_all() as usize);
        for i in 0..vinfo.num_globals() {
            let gi = vinfo.global_info(i);
            vregs.push(VReg {
                ty: gi.ty,
                global: true,
                state_offs: gi.offs,
                frame_offs: 0,
                has_frame: false,
                loc: Loc::Mem,
                p: Reg::Rax,
                synced: true,
            });
        }
        for i in vinfo.num_globals()..vinfo.num_all() {
            vregs.push(VReg {
                ty: vinfo.local_type(i),
                global: false,
                state_offs: 0,
                frame_offs: 0,
                has_frame: false,
                loc: Loc::Dead,
                p: Reg::Rax,
                synced: false,
            });
        }
        Self {
            vregs,
            p2v: [None; 16],
            num_globals: vinfo.num_globals(),
            frame_cur: 0,
        }
    }

    fn emit_fill(buf: &mut CodeBuffer, v: &VReg) {
        let (base, offs) = if v.global {
            (STATE, v.state_offs as i32)
        } else {
            (SP, v.frame_offs)
        };
        match v.ty {
            VType::I8 => emit_load_zx8(buf, v.p, base, offs),
            VType::I16 => emit_load_zx16(buf, v.p, base, offs),
            VType::I32 => emit_load(buf, false, v.p, base, offs),
        }
    }

    fn emit_spill(buf: &mut CodeBuffer, v: &VReg) {
        let (base, offs) = if v.global {
            (STATE, v.state_offs as i32)
        } else {
            (SP, v.frame_offs)
        };
        match v.ty {
            VType::I8 => emit_store8(buf, v.p, base, offs),
            VType::I16 => emit_store16(buf, v.p, base, offs),
            VType::I32 => emit_store(buf, false, v.p, base, offs),
        }
    }

    /// Write a dirty register value back to its home slot,
    /// allocating a frame slot for a homeless local.
    fn sync_one(&mut self, buf: &mut CodeBuffer, r: RegN) {
        let v = &self.vregs[r as usize];
        if v.loc != Loc::Reg || v.synced {
            return;
        }
        if !v.global && !v.has_frame {
            let offs = self.frame_cur;
            self.frame_cur += 8;
            assert!(self.frame_cur <= FRAME_SIZE, "regalloc: spill frame overflow");
            let v = &mut self.vregs[r as usize];
            v.frame_offs = offs;
            v.has_frame = true;
        }
        let v = &self.vregs[r as usize];
        Self::emit_spill(buf, v);
        self.vregs[r as usize].synced = true;
    }

    /// Sync + release: the value's home becomes authoritative.
    fn evict(&mut self, buf: &mut CodeBuffer, p: Reg) {
        let Some(r) = self.p2v[p as usize] else {
            return;
        };
        self.sync_one(buf, r);
        self.p2v[p as usize] = None;
        self.vregs[r as usize].loc = Loc::Mem;
    }

    fn alloc_preg(&mut self, buf: &mut CodeBuffer, desire: RegMask, avoid: RegMask) -> Reg {
        let target = desire.and(PREGS_ALLOCATABLE).and(avoid.not());
        // Prefer a free register.
        for i in 0..16 {
            let p = Reg::from_u8(i);
            if target.test(p) && self.p2v[i as usize].is_none() {
                return p;
            }
        }
        // Evict the first candidate.
        let p = target
            .first()
            .unwrap_or_else(|| panic!("regalloc: no candidate register"));
        self.evict(buf, p);
        p
    }

    fn assign(&mut self, r: RegN, p: Reg) {
        self.p2v[p as usize] = Some(r);
        let v = &mut self.vregs[r as usize];
        v.loc = Loc::Reg;
        v.p = p;
    }

    #[inline]
    pub fn preg_of(&self, r: RegN) -> Reg {
        let v = &self.vregs[r as usize];
        assert!(v.loc == Loc::Reg);
        v.p
    }

    /// Bring a source value into a register satisfying `desire`,
    /// avoiding `avoid`. Reading a dead local is a translator bug:
    /// block-locals may not live across block boundaries.
    pub fn fill(
        &mut self,
        buf: &mut CodeBuffer,
        r: RegN,
        desire: RegMask,
        avoid: RegMask,
    ) -> Reg {
        match self.vregs[r as usize].loc {
            Loc::Reg => {
                let cur = self.vregs[r as usize].p;
                if desire.test(cur) && !avoid.test(cur) {
                    return cur;
                }
                let np = self.alloc_preg(buf, desire, avoid.or(RegMask::NONE.set(cur)));
                emit_mov_rr(buf, false, np, cur);
                self.p2v[cur as usize] = None;
                self.assign(r, np);
                np
            }
            Loc::Mem => {
                let p = self.alloc_preg(buf, desire, avoid);
                self.assign(r, p);
                let v = &self.vregs[r as usize];
                assert!(v.global || v.has_frame);
                Self::emit_fill(buf, v);
                self.vregs[r as usize].synced = true;
                p
            }
            Loc::Dead => {
                panic!("regalloc: read of dead local v{r} (live across block boundary?)")
            }
        }
    }

    /// Allocate the destination register for vreg `r`, avoiding the
    /// instruction's source registers. The previous value of `r` is
    /// discarded.
    pub fn alloc_dst(&mut self, buf: &mut CodeBuffer, r: RegN, avoid: RegMask) -> Reg {
        let v = &self.vregs[r as usize];
        if v.loc == Loc::Reg && !avoid.test(v.p) {
            let p = v.p;
            self.vregs[r as usize].synced = false;
            return p;
        }
        // Release the old register (its value is dead or still
        // readable by the caller through the raw preg).
        if v.loc == Loc::Reg {
            let old = v.p;
            self.p2v[old as usize] = None;
        }
        let p = self.alloc_preg(buf, PREGS_ALLOCATABLE, avoid);
        self.assign(r, p);
        self.vregs[r as usize].synced = false;
        p
    }

    /// Mark an in-register vreg as modified.
    pub fn mark_written(&mut self, r: RegN) {
        let v = &mut self.vregs[r as usize];
        assert!(v.loc == Loc::Reg);
        v.synced = false;
    }

    /// Sync all dirty globals to their state slots without giving
    /// up their registers (side-effect boundary).
    pub fn sync_globals(&mut self, buf: &mut CodeBuffer) {
        for r in 0..self.num_globals {
            self.sync_one(buf, r);
        }
    }

    /// Block boundary: globals are synced and released, locals die.
    pub fn block_boundary(&mut self, buf: &mut CodeBuffer) {
        for r in 0..self.vregs.len() as RegN {
            let v = &self.vregs[r as usize];
            if v.global {
                if v.loc == Loc::Reg {
                    let p = v.p;
                    self.sync_one(buf, r);
                    self.p2v[p as usize] = None;
                    self.vregs[r as usize].loc = Loc::Mem;
                }
            } else {
                if v.loc == Loc::Reg {
                    self.p2v[v.p as usize] = None;
                }
                self.vregs[r as usize].loc = Loc::Dead;
            }
        }
    }

    /// Drop every register mapping without emitting stores. Used
    /// after a region exit whose values are already synced (the
    /// code that would consume them is unreachable).
    pub fn reset_dead(&mut self) {
        for r in 0..self.vregs.len() as RegN {
            let v = &mut self.vregs[r as usize];
            if v.loc == Loc::Reg {
                self.p2v[v.p as usize] = None;
                v.loc = if v.global { Loc::Mem } else { Loc::Dead };
            } else if !v.global {
                v.loc = Loc::Dead;
            }
        }
    }

    /// Helper call: spill every caller-clobbered register and
    /// release all globals - the helper may read and write any
    /// guest register through CPUState.
    pub fn call_op(&mut self, buf: &mut CodeBuffer) {
        for i in 0..16 {
            let p = Reg::from_u8(i);
            if PREGS_CALL_CLOBBER.test(p) {
                self.evict(buf, p);
            }
        }
        for r in 0..self.num_globals {
            let v = &self.vregs[r as usize];
            if v.loc == Loc::Reg {
                let p = v.p;
                self.sync_one(buf, r);
                self.p2v[p as usize] = None;
                self.vregs[r as usize].loc = Loc::Mem;
            }
        }
    }
}
