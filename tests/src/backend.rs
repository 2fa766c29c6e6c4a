//! Backend lowering checked against compiled regions, using a
//! stand-alone relocatable-mode runtime (no process-global state).

use qdbt_backend::{compile, CompilerJob, CompilerRuntime};
use qdbt_core::MemArena;
use qdbt_frontend::rv32::cpu::RuntimeStubTab;
use qdbt_tcache::{BranchSlot, SlotKind};

/// Relocatable-mode test runtime: code goes into a private arena,
/// announcements are copied out for inspection.
struct TestRuntime {
    arena: MemArena,
    vmem_base: usize,
    regions: Vec<(u32, Vec<u8>)>,
}

impl TestRuntime {
    fn new(code: &[u32]) -> (Self, Vec<u8>) {
        let bytes: Vec<u8> = code.iter().flat_map(|w| w.to_le_bytes()).collect();
        let rt = TestRuntime {
            arena: MemArena::new(1 << 20, libc::PROT_READ | libc::PROT_WRITE),
            vmem_base: bytes.as_ptr() as usize,
            regions: Vec::new(),
        };
        (rt, bytes)
    }
}

impl CompilerRuntime for TestRuntime {
    fn allocate_code(&mut self, size: usize, align: usize) -> *mut u8 {
        self.arena.allocate(size, align)
    }

    fn allows_relocation(&self) -> bool {
        true
    }

    fn vmem_base(&self) -> usize {
        self.vmem_base
    }

    fn update_ip_boundary(&self, iprange: &mut (u32, u32)) {
        iprange.1 = iprange.1.min(qdbt_mmu::PAGE_SIZE as u32);
    }

    fn announce_region(&mut self, ip: u32, code: &[u8]) -> *mut u8 {
        self.regions.push((ip, code.to_vec()));
        std::ptr::null_mut()
    }

    fn stub_tab(&self) -> Option<&'static RuntimeStubTab> {
        None
    }
}

fn compile_words(words: &[u32]) -> Vec<u8> {
    let (mut rt, bytes) = TestRuntime::new(words);
    compile(&mut rt, CompilerJob::new((0, bytes.len() as u32)));
    let out = rt.regions[0].1.clone();
    drop(bytes);
    out
}

fn read_slot(code: &[u8], at: usize) -> BranchSlot {
    assert!(at + 16 <= code.len());
    // SAFETY: BranchSlot is 16 plain bytes.
    unsafe { (code.as_ptr().add(at) as *const BranchSlot).read_unaligned() }
}

fn find(hay: &[u8], needle: &[u8]) -> Option<usize> {
    hay.windows(needle.len()).position(|w| w == needle)
}

#[test]
fn presideeff_stores_precise_ip() {
    // addi a0, zero, 42; ecall
    let code = compile_words(&[0x02a0_0513, 0x0000_0073]);
    // mov dword [r13 + 128], 4 - the guest IP of the ecall.
    let expect = [0x41, 0xc7, 0x85, 0x80, 0, 0, 0, 4, 0, 0, 0];
    assert!(find(&code, &expect).is_some(), "ip spill not found");
}

#[test]
fn global_def_synced_before_helper_call() {
    // The constant 42 must reach a0's state slot (offset 0x28)
    // before the ecall helper runs.
    let code = compile_words(&[0x02a0_0513, 0x0000_0073]);
    // mov [r13 + 0x28], eax
    let sync = [0x41, 0x89, 0x45, 0x28];
    let call_disp = (qdbt_frontend::rv32::cpu::STUB_TAB_OFFS
        + qdbt_frontend::rv32::cpu::RuntimeStubId::Ecall.offs()) as u32;
    let mut call = vec![0x41, 0xff, 0x95];
    call.extend_from_slice(&call_disp.to_le_bytes());
    let sync_at = find(&code, &sync).expect("a0 sync");
    let call_at = find(&code, &call).expect("state-relative helper call");
    assert!(sync_at < call_at);
}

#[test]
fn fallthrough_region_ends_in_unlinked_slot() {
    // Two ALU insns, no branch: the region exits through a branch
    // slot carrying the continuation IP.
    let code = compile_words(&[0x0050_0513, 0x0015_8593]);
    let slot = read_slot(&code, code.len() - 16);
    assert_eq!(slot.kind(), SlotKind::Unlinked);
    assert_eq!({ slot.gip }, 8);
}

#[test]
fn folded_brcc_emits_no_conditional_jump() {
    // beq x0, x0, +8 (scenario S5): one selected exit, no jcc pair.
    let code = compile_words(&[0x0000_0463]);
    for w in code.windows(2) {
        assert!(
            !(w[0] == 0x0f && (0x80..=0x8f).contains(&w[1])),
            "unexpected jcc in folded branch"
        );
    }
    // Exactly the two successor stubs carry slots (the not-taken
    // one is unreachable but still laid out).
    let nop5 = [0x0f, 0x1f, 0x44, 0x00, 0x00];
    let count = code
        .windows(5)
        .filter(|w| *w == nop5)
        .count();
    assert_eq!(count, 2);
    let slot = read_slot(&code, code.len() - 16);
    assert!(matches!(slot.kind(), SlotKind::Unlinked));
}

#[test]
fn live_brcc_emits_compare_and_jcc() {
    // bne a0, a1, +8
    let code = compile_words(&[0x00b5_1463]);
    assert!(
        code.windows(2)
            .any(|w| w[0] == 0x0f && (0x80..=0x8f).contains(&w[1])),
        "conditional jump missing"
    );
}

#[test]
fn register_pressure_spills_and_survives() {
    // Touch more guest registers than there are allocatable host
    // registers; eviction must kick in without panicking.
    let mut words = Vec::new();
    for rd in 5..=28u32 {
        // addi rd, rd, 1
        words.push((1 << 20) | (rd << 15) | (rd << 7) | 0x13);
    }
    words.push(0x0000_0073); // ecall
    let code = compile_words(&words);
    assert!(!code.is_empty());
}

#[test]
fn shift_by_register_goes_through_cl() {
    // sll a0, a0, a1
    let code = compile_words(&[0x00b5_1533, 0x0000_0073]);
    // d3 /4 - shl r32, cl
    assert!(
        code.windows(2)
            .any(|w| w[0] == 0xd3 && (w[1] & 0xf8) == 0xe0),
        "variable shift must use cl"
    );
}
