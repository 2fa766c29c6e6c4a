pub mod arena;
pub mod builder;
pub mod dump;
pub mod inst;
pub mod ops;
pub mod region;
pub mod state;
pub mod types;
pub mod voperand;

pub use arena::MemArena;
pub use inst::{Inst, InstAux, InstRef, MAX_IN, MAX_OUT};
pub use ops::{InstFlags, Op, OpDef};
pub use region::{Block, BlockId, Region};
pub use state::{StateInfo, StateReg, VRegsInfo};
pub use types::{CondCode, RegN, VSign, VType};
pub use voperand::VOperand;
