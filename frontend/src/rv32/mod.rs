pub mod cpu;
pub mod insn;
pub mod stubs;
pub mod translate;

pub use cpu::{CPUState, RuntimeStubId, RuntimeStubTab, NUM_GPRS};
pub use translate::{Rv32Translator, TB_MAX_INSNS};
