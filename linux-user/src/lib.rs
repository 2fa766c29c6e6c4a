//! Process front door: guest ELF loading, the user-kernel syscall
//! layer, and log-stream selection.

pub mod elf;
pub mod logger;
pub mod ukernel;
