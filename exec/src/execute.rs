//! The execute loop: look up the guest IP in the code cache, enter
//! generated code through the trampoline, translate on miss, link
//! pending branch slots, and surface traps to the caller.

use qdbt_backend::{compile, CompilerJob, CompilerRuntime};
use qdbt_frontend::rv32::cpu::{trap, CPUState, RuntimeStubTab};
use qdbt_tcache::{self as tcache, TBlock, TCode};

use crate::dispatch;

/// CompilerRuntime of the JIT path: code goes straight into the
/// code cache, regions install as TBs, stub addresses are embedded
/// absolutely.
pub struct JitRuntime;

impl CompilerRuntime for JitRuntime {
    fn allocate_code(&mut self, size: usize, align: usize) -> *mut u8 {
        tcache::allocate_code(size, align)
    }

    fn allows_relocation(&self) -> bool {
        false
    }

    fn vmem_base(&self) -> usize {
        qdbt_mmu::base()
    }

    /// Stop at the end of the guest page and at the next TB that
    /// already exists.
    fn update_ip_boundary(&self, iprange: &mut (u32, u32)) {
        let page_end = (iprange.0 as u64 & !(qdbt_mmu::PAGE_SIZE as u64 - 1))
            + qdbt_mmu::PAGE_SIZE as u64;
        iprange.1 = iprange.1.min(page_end.min(u32::MAX as u64 + 1) as u32);
        if let Some(next) = tcache::lookup_upper_bound(iprange.0) {
            iprange.1 = iprange.1.min(next);
        }
    }

    fn announce_region(&mut self, ip: u32, code: &[u8]) -> *mut u8 {
        let tb = tcache::insert(
            ip,
            TCode {
                ptr: code.as_ptr() as *mut u8,
                size: code.len(),
            },
        );
        // SAFETY: freshly installed TBlock.
        unsafe { (*tb).tcode.ptr }
    }

    fn stub_tab(&self) -> Option<&'static RuntimeStubTab> {
        Some(dispatch::stub_tab())
    }
}

/// Find or translate the TB at `ip`.
pub fn tb_find(ip: u32) -> *mut TBlock {
    if let Some(tb) = tcache::lookup(ip) {
        return tb;
    }
    let mut rt = JitRuntime;
    compile(&mut rt, CompilerJob::new((ip, u32::MAX)));
    tcache::lookup(ip).expect("compile did not install a TB")
}

/// Run the guest until a trap. On return `state.trapno` names the
/// trap and `state.ip` is the precise guest IP at the trap site.
pub fn execute(state: &mut CPUState) {
    state.trapno = trap::NONE;
    state.stub_tab = dispatch::stub_tab().clone();
    state.jmp_cache = tcache::jmp_cache_ptr();

    if state.ip & 3 != 0 {
        state.trapno = trap::UNALIGNED_IP;
        return;
    }
    let mut tb = tb_find(state.ip);

    loop {
        // SAFETY: tb holds installed code; state outlives the call.
        let slot =
            unsafe { dispatch::enter_tb(state, qdbt_mmu::base(), (*tb).tcode.ptr) };

        if slot.is_null() {
            if state.trapno != trap::NONE {
                return;
            }
            // Indirect-branch miss: the helper stored the target.
            if state.ip & 3 != 0 {
                state.trapno = trap::UNALIGNED_IP;
                return;
            }
            tb = tb_find(state.ip);
        } else {
            // An unlinked direct branch: translate its target, link
            // the slot so this exit never repeats, and continue at
            // the target.
            // SAFETY: non-null returns are valid slots in the cache.
            let gip = unsafe { (*slot).gip };
            if gip & 3 != 0 {
                state.ip = gip;
                state.trapno = trap::UNALIGNED_IP;
                return;
            }
            let target = tb_find(gip);
            // SAFETY: slot lies in the RWX code cache; target is live.
            unsafe {
                (*slot).link((*target).tcode.ptr as usize);
                tb = target;
            }
        }
    }
}
