//! Host ↔ generated-code boundary.
//!
//! The enter/exit trampolines and the link-branch stub are emitted
//! into the code cache at init rather than written as inline
//! assembly: they are plain position-independent sequences, and
//! emitting them keeps the fixed-register contract (STATE, MEMBASE,
//! frame size) in one place with the code generator.
//!
//! Register contract: the enter trampoline saves the callee-saved
//! set, pins STATE (r13) and MEMBASE (r12), reserves the 248-byte
//! spill frame, and jumps to TB code. The exit trampoline reverses
//! this and returns the pending branch-slot pointer (or null) to
//! the execute loop.

use std::cell::UnsafeCell;

use qdbt_backend::x86_64::emitter::{
    emit_arith_ri, emit_call_reg, emit_jmp_reg, emit_mov_ri, emit_mov_rr, emit_pop,
    emit_push, emit_ret, ArithOp,
};
use qdbt_backend::x86_64::regs::{Reg, CALLEE_SAVED, FRAME_SIZE, MEMBASE, STATE};
use qdbt_backend::CodeBuffer;
use qdbt_frontend::rv32::cpu::{CPUState, RuntimeStubId, RuntimeStubTab};
use qdbt_frontend::rv32::stubs;
use qdbt_tcache::{self as tcache, BranchSlot};

/// Two-register return of the dispatch helpers: `v0` lands in rax
/// (seen by the execute loop when control exits), `v1` in rdx (the
/// address the calling stub jumps through).
#[repr(C)]
pub struct RetPair {
    pub v0: usize,
    pub v1: usize,
}

type EnterFn = unsafe extern "C" fn(*mut CPUState, usize, *const u8) -> *mut BranchSlot;

struct Dispatch {
    enter: EnterFn,
    escape: usize,
    stub_tab: RuntimeStubTab,
}

struct DispatchCell(UnsafeCell<Option<Dispatch>>);

// SAFETY: single-threaded core; initialized once before use.
unsafe impl Sync for DispatchCell {}

static DISPATCH: DispatchCell = DispatchCell(UnsafeCell::new(None));

fn dispatch() -> &'static Dispatch {
    // SAFETY: single-threaded access, init() called first.
    unsafe { (*DISPATCH.0.get()).as_ref().expect("dispatch: not initialized") }
}

/// Emit the trampolines and the link stub into the code cache and
/// assemble the runtime stub table. Requires an initialized tcache.
pub fn init() {
    // SAFETY: single-threaded init.
    let cell = unsafe { &mut *DISPATCH.0.get() };
    assert!(cell.is_none(), "dispatch: double init");

    let mut buf = CodeBuffer::new();

    // Enter trampoline: fn(state, membase, tc_ptr) -> slot.
    let enter_off = buf.offset();
    emit_push(&mut buf, Reg::Rbp);
    emit_mov_rr(&mut buf, true, Reg::Rbp, Reg::Rsp);
    for &r in &CALLEE_SAVED[1..] {
        emit_push(&mut buf, r);
    }
    emit_mov_rr(&mut buf, true, STATE, Reg::Rdi);
    emit_mov_rr(&mut buf, true, MEMBASE, Reg::Rsi);
    emit_arith_ri(&mut buf, ArithOp::Sub, true, Reg::Rsp, FRAME_SIZE);
    emit_jmp_reg(&mut buf, Reg::Rdx);

    // Exit trampoline.
    let escape_off = buf.offset();
    emit_arith_ri(&mut buf, ArithOp::Add, true, Reg::Rsp, FRAME_SIZE);
    for &r in CALLEE_SAVED.iter().rev() {
        if r != Reg::Rbp {
            emit_pop(&mut buf, r);
        }
    }
    emit_pop(&mut buf, Reg::Rbp);
    emit_ret(&mut buf);

    // Link-branch stub: entered from an unlinked slot's call. The
    // pushed return address lands on the slot's trailing guest IP;
    // pop it as the helper argument.
    let link_off = buf.offset();
    emit_pop(&mut buf, Reg::Rdi);
    emit_mov_ri(&mut buf, true, Reg::Rax, helper_link_branch as usize as u64);
    emit_call_reg(&mut buf, Reg::Rax);
    emit_jmp_reg(&mut buf, Reg::Rdx);

    let code = buf.as_slice();
    let base = tcache::allocate_code(code.len(), 16);
    // SAFETY: freshly allocated code-cache bytes of that size.
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), base, code.len());
    }
    let at = |off: usize| base as usize + off;

    let mut tab = RuntimeStubTab::empty();
    tab.0[RuntimeStubId::LinkBranch as usize] = at(link_off);
    tab.0[RuntimeStubId::Brind as usize] = helper_brind as usize;
    tab.0[RuntimeStubId::Escape as usize] = at(escape_off);
    tab.0[RuntimeStubId::Illegal as usize] = stubs::stub_illegal as usize;
    tab.0[RuntimeStubId::Fence as usize] = stubs::stub_fence as usize;
    tab.0[RuntimeStubId::FenceI as usize] = stubs::stub_fencei as usize;
    tab.0[RuntimeStubId::Ecall as usize] = stubs::stub_ecall as usize;
    tab.0[RuntimeStubId::Ebreak as usize] = stubs::stub_ebreak as usize;
    tab.0[RuntimeStubId::LrW as usize] = stubs::stub_lr_w as usize;
    tab.0[RuntimeStubId::ScW as usize] = stubs::stub_sc_w as usize;
    tab.0[RuntimeStubId::AmoswapW as usize] = stubs::stub_amoswap_w as usize;
    tab.0[RuntimeStubId::AmoaddW as usize] = stubs::stub_amoadd_w as usize;
    tab.0[RuntimeStubId::AmoxorW as usize] = stubs::stub_amoxor_w as usize;
    tab.0[RuntimeStubId::AmoandW as usize] = stubs::stub_amoand_w as usize;
    tab.0[RuntimeStubId::AmoorW as usize] = stubs::stub_amoor_w as usize;
    tab.0[RuntimeStubId::AmominW as usize] = stubs::stub_amomin_w as usize;
    tab.0[RuntimeStubId::AmomaxW as usize] = stubs::stub_amomax_w as usize;
    tab.0[RuntimeStubId::AmominuW as usize] = stubs::stub_amominu_w as usize;
    tab.0[RuntimeStubId::AmomaxuW as usize] = stubs::stub_amomaxu_w as usize;

    *cell = Some(Dispatch {
        // SAFETY: `base + enter_off` is the emitted enter trampoline.
        enter: unsafe { std::mem::transmute::<*mut u8, EnterFn>(base.add(enter_off)) },
        escape: at(escape_off),
        stub_tab: tab,
    });
}

pub fn destroy() {
    // SAFETY: single-threaded teardown.
    let cell = unsafe { &mut *DISPATCH.0.get() };
    *cell = None;
}

pub fn stub_tab() -> &'static RuntimeStubTab {
    &dispatch().stub_tab
}

/// Run a TB. Returns the unlinked branch slot the guest stopped at,
/// or null when control came back through a trap or a brind miss.
///
/// # Safety
/// `state` must be a valid CPUState with its stub table filled and
/// `code` must be an installed TB entry point.
pub unsafe fn enter_tb(
    state: *mut CPUState,
    membase: usize,
    code: *const u8,
) -> *mut BranchSlot {
    (dispatch().enter)(state, membase, code)
}

/// Called from an unlinked branch slot. Looks up the recorded
/// target IP; on a hit the slot is patched in place before control
/// transfers, so the stub is not entered again for this slot.
pub extern "C" fn helper_link_branch(ret_addr: usize) -> RetPair {
    // SAFETY: ret_addr was pushed by an unlinked slot's call.
    let slot = unsafe { BranchSlot::from_ret_addr(ret_addr) };
    let gip = unsafe { (*slot).gip };
    match tcache::lookup(gip) {
        Some(tb) => {
            // SAFETY: tb is a live TBlock; the slot lies in the RWX
            // code cache.
            let code = unsafe { (*tb).tcode.ptr };
            unsafe { (*slot).link(code as usize) };
            log::trace!(target: "tcache", "linked slot {slot:p} -> {gip:#x}");
            RetPair {
                v0: slot as usize,
                v1: code as usize,
            }
        }
        None => RetPair {
            v0: slot as usize,
            v1: dispatch().escape,
        },
    }
}

/// Indirect-branch helper: records the target IP and consults the
/// cache, refreshing the jump cache on a hit.
pub extern "C" fn helper_brind(state: *mut CPUState, gip: u32) -> RetPair {
    // SAFETY: called from generated code with the live CPUState.
    unsafe {
        (*state).ip = gip;
    }
    match tcache::lookup(gip) {
        Some(tb) => {
            tcache::on_brind(tb);
            RetPair {
                v0: 0,
                // SAFETY: tb is a live TBlock.
                v1: unsafe { (*tb).tcode.ptr } as usize,
            }
        }
        None => RetPair {
            v0: 0,
            v1: dispatch().escape,
        },
    }
}
