use crate::types::{RegN, VType};

/// Description of one global virtual register's home inside the
/// guest CPU state struct.
#[derive(Debug, Clone, Copy)]
pub struct StateReg {
    pub offs: u16,
    pub ty: VType,
    pub name: &'static str,
}

/// Read-only table of all global virtual registers, built once by
/// the guest frontend.
#[derive(Debug)]
pub struct StateInfo {
    pub regs: Vec<StateReg>,
}

impl StateInfo {
    pub fn n_regs(&self) -> RegN {
        self.regs.len() as RegN
    }

    pub fn reg(&self, idx: RegN) -> &StateReg {
        &self.regs[idx as usize]
    }
}

/// Per-region virtual register table: the pre-declared globals plus
/// locals allocated on demand during translation.
pub struct VRegsInfo {
    glob: &'static StateInfo,
    locals: Vec<VType>,
}

impl VRegsInfo {
    pub fn new(glob: &'static StateInfo) -> Self {
        Self {
            glob,
            locals: Vec::new(),
        }
    }

    #[inline]
    pub fn num_globals(&self) -> RegN {
        self.glob.n_regs()
    }

    #[inline]
    pub fn num_all(&self) -> RegN {
        self.glob.n_regs() + self.locals.len() as RegN
    }

    #[inline]
    pub fn is_global(&self, idx: RegN) -> bool {
        idx < self.glob.n_regs()
    }

    #[inline]
    pub fn is_local(&self, idx: RegN) -> bool {
        !self.is_global(idx)
    }

    pub fn global_info(&self, idx: RegN) -> &StateReg {
        assert!(self.is_global(idx));
        self.glob.reg(idx)
    }

    pub fn local_type(&self, idx: RegN) -> VType {
        assert!(self.is_local(idx));
        self.locals[(idx - self.glob.n_regs()) as usize]
    }

    pub fn add_local(&mut self, ty: VType) -> RegN {
        let idx = self.num_all();
        self.locals.push(ty);
        idx
    }
}
