//! Compiler driver - one job turns an IP range into installed host
//! code. The JIT and AOT pipelines differ only in the
//! `CompilerRuntime` they plug in.

use qdbt_core::{dump, Region};
use qdbt_frontend::rv32::cpu::{state_info, RuntimeStubTab};
use qdbt_frontend::rv32::Rv32Translator;

use crate::layout;
use crate::x86_64::codegen;

/// Services the compiler needs from its host pipeline.
pub trait CompilerRuntime {
    /// Carve out memory for finished code.
    fn allocate_code(&mut self, size: usize, align: usize) -> *mut u8;

    /// Relocatable output (AOT object) as opposed to code that may
    /// embed absolute host addresses (JIT).
    fn allows_relocation(&self) -> bool;

    /// Host base of guest memory, also used to fetch guest code.
    fn vmem_base(&self) -> usize;

    /// Clamp a translation range before it is carved into blocks.
    fn update_ip_boundary(&self, iprange: &mut (u32, u32));

    /// Record a finished region; returns the pointer execution
    /// should use (null when the runtime only records it).
    fn announce_region(&mut self, ip: u32, code: &[u8]) -> *mut u8;

    /// Absolute stub table for JIT code; None in relocatable mode,
    /// where helper calls go through the table inside CPUState.
    fn stub_tab(&self) -> Option<&'static RuntimeStubTab>;
}

/// One translation request: the guest IP range to compile.
#[derive(Debug, Clone, Copy)]
pub struct CompilerJob {
    pub iprange: (u32, u32),
}

impl CompilerJob {
    pub fn new(iprange: (u32, u32)) -> Self {
        Self { iprange }
    }
}

/// Translate, lay out, and emit one region; announce it to the
/// runtime and return its host entry point.
pub fn compile(rt: &mut dyn CompilerRuntime, mut job: CompilerJob) -> *mut u8 {
    rt.update_ip_boundary(&mut job.iprange);
    let entry_ip = job.iprange.0;
    assert!(job.iprange.1 > entry_ip, "empty translation range");

    let mut region = Region::new(state_info());
    Rv32Translator::translate(&mut region, &[job.iprange], rt.vmem_base());
    if log::log_enabled!(target: "qir", log::Level::Trace) {
        log::trace!(target: "qir", "region for {entry_ip:#x}:\n{}", dump::region_to_string(&region));
    }

    layout::run(&mut region);
    let (ptr, size) = codegen::generate(rt, &region, entry_ip);
    // SAFETY: generate copied `size` bytes to `ptr`.
    let code = unsafe { std::slice::from_raw_parts(ptr, size) };
    rt.announce_region(entry_ip, code)
}
