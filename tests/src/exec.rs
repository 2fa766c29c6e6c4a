//! End-to-end scenarios running generated code.
//!
//! The MMU, code cache, and dispatch stubs are process-global, so
//! every scenario runs inside this single sequential test body.

use std::panic::{catch_unwind, AssertUnwindSafe};

use qdbt_exec::{dispatch, execute};
use qdbt_frontend::rv32::cpu::{trap, CPUState};
use qdbt_mmu as mmu;
use qdbt_tcache::{self as tcache, SlotKind, TCode};

fn write_code(addr: u32, words: &[u32]) {
    for (i, w) in words.iter().enumerate() {
        // SAFETY: the page was mapped writable by the test.
        unsafe {
            (mmu::g2h(addr + (i as u32) * 4) as *mut u32).write_unaligned(*w);
        }
    }
}

fn run_until_trap(state: &mut CPUState, ip: u32) -> u32 {
    state.ip = ip;
    execute(state);
    state.trapno
}

#[test]
fn runtime_scenarios() {
    mmu::init();
    tcache::init();
    dispatch::init();

    mmu::map(
        0x0001_0000,
        mmu::PAGE_SIZE,
        libc::PROT_READ | libc::PROT_WRITE,
        true,
        -1,
        0,
    )
    .unwrap();
    mmu::map(
        0x0002_0000,
        mmu::PAGE_SIZE,
        libc::PROT_READ | libc::PROT_WRITE,
        true,
        -1,
        0,
    )
    .unwrap();

    let mut state = CPUState::new();

    // ---- S1: minimal return ----
    // addi a0, zero, 42; ecall; ebreak
    write_code(0x10000, &[0x02a0_0513, 0x0000_0073, 0x0010_0073]);
    assert_eq!(run_until_trap(&mut state, 0x10000), trap::ECALL);
    assert_eq!(state.gpr[10], 42);
    assert_eq!(state.ip, 0x10004, "precise ip at the ecall");
    state.ip += 4;
    execute(&mut state);
    assert_eq!(state.trapno, trap::EBREAK);

    // ---- S4: load width and sign ----
    unsafe {
        std::ptr::copy_nonoverlapping(
            [0x80u8, 0x81, 0x82, 0x83].as_ptr(),
            mmu::g2h(0x20000),
            4,
        );
    }
    // lui a1, 0x20; then lb/lbu/lh/lhu/lw a0, 0(a1), each followed
    // by an ecall so the harness can observe a0; final ebreak.
    write_code(
        0x10100,
        &[
            0x0002_05b7, // lui a1, 0x20
            0x0005_8503, // lb a0, 0(a1)
            0x0000_0073,
            0x0005_c503, // lbu a0, 0(a1)
            0x0000_0073,
            0x0005_9503, // lh a0, 0(a1)
            0x0000_0073,
            0x0005_d503, // lhu a0, 0(a1)
            0x0000_0073,
            0x0005_a503, // lw a0, 0(a1)
            0x0000_0073,
            0x0010_0073, // ebreak
        ],
    );
    let expect = [0xffff_ff80u32, 0x80, 0xffff_8180, 0x8180, 0x8382_8180];
    state.ip = 0x10100;
    for (i, &want) in expect.iter().enumerate() {
        execute(&mut state);
        assert_eq!(state.trapno, trap::ECALL, "load #{i}");
        assert_eq!(state.gpr[10], want, "load #{i} value");
        state.ip += 4;
    }
    execute(&mut state);
    assert_eq!(state.trapno, trap::EBREAK);

    // ---- S2: direct branch linking ----
    // 0x10200: jal x0, +8 ; 0x10208: ebreak
    write_code(0x10200, &[0x0080_006f, 0, 0x0010_0073]);
    assert_eq!(run_until_trap(&mut state, 0x10200), trap::EBREAK);

    // The branch slot at the end of the first TB must now be
    // linked (32-bit relative: both TBs share the code arena).
    let tb = tcache::lookup(0x10200).unwrap();
    let (code_ptr, code_size) = unsafe { ((*tb).tcode.ptr, (*tb).tcode.size) };
    let slot = unsafe {
        &*(code_ptr.add(code_size - 16) as *const qdbt_tcache::BranchSlot)
    };
    assert_eq!({ slot.gip }, 0x10208);
    assert_eq!(slot.kind(), SlotKind::Linked32);
    let target = tcache::lookup(0x10208).unwrap();
    assert_eq!(slot.linked32_target(), unsafe { (*target).tcode.ptr } as usize);

    // Re-running takes the patched jump straight through.
    assert_eq!(run_until_trap(&mut state, 0x10200), trap::EBREAK);

    // ---- S3 (jump cache): jalr dispatch ----
    // 0x10300: auipc t0, 0; addi t0, t0, 16; jalr x0, 0(t0)
    // 0x10310: ebreak
    write_code(
        0x10300,
        &[0x0000_0297, 0x0102_8293, 0x0002_8067, 0, 0x0010_0073],
    );
    // First pass misses both the inline probe and the helper.
    assert_eq!(run_until_trap(&mut state, 0x10300), trap::EBREAK);
    // Second pass: the helper hits and refreshes the jump cache.
    assert_eq!(run_until_trap(&mut state, 0x10300), trap::EBREAK);
    let cached = tcache::jmp_cache_get(0x10310);
    assert!(!cached.is_null(), "brind hit populates the jump cache");
    unsafe {
        assert_eq!((*cached).ip, 0x10310);
    }
    assert_eq!(
        tcache::lookup(0x10310).unwrap(),
        cached,
        "validated bucket agrees with the cache"
    );
    // Third pass goes through the inline probe.
    assert_eq!(run_until_trap(&mut state, 0x10300), trap::EBREAK);

    // ---- conditional loop: brcc + block boundaries ----
    // a0 = 5; a1 = 0; loop: a1 += 1; a0 -= 1; bne a0, x0, loop;
    // ebreak
    write_code(
        0x10400,
        &[
            0x0050_0513, // addi a0, zero, 5
            0x0000_0593, // addi a1, zero, 0
            0x0015_8593, // addi a1, a1, 1
            0xfff5_0513, // addi a0, a0, -1
            0xfe05_1ce3, // bne a0, zero, -8
            0x0010_0073, // ebreak
        ],
    );
    assert_eq!(run_until_trap(&mut state, 0x10400), trap::EBREAK);
    assert_eq!(state.gpr[10], 0);
    assert_eq!(state.gpr[11], 5);

    // ---- stores: width-correct guest memory writes ----
    // lui a1, 0x20; lui a0, 0x12345; addi a0, a0, 0x678;
    // sw a0, 16(a1); sb a0, 20(a1); sh a0, 22(a1); ebreak
    write_code(
        0x10500,
        &[
            0x0002_05b7, // lui a1, 0x20
            0x1234_5537, // lui a0, 0x12345
            0x6785_0513, // addi a0, a0, 0x678
            0x00a5_a823, // sw a0, 16(a1)
            0x00a5_8a23, // sb a0, 20(a1)
            0x00a5_9b23, // sh a0, 22(a1)
            0x0010_0073, // ebreak
        ],
    );
    assert_eq!(run_until_trap(&mut state, 0x10500), trap::EBREAK);
    unsafe {
        assert_eq!(
            (mmu::g2h(0x20010) as *const u32).read_unaligned(),
            0x1234_5678
        );
        assert_eq!(*mmu::g2h(0x20014), 0x78);
        assert_eq!(
            (mmu::g2h(0x20016) as *const u16).read_unaligned(),
            0x5678
        );
    }

    // ---- atomics through helpers ----
    // lui a1, 0x20; addi a1, a1, 0x40; addi a2, zero, 7;
    // amoadd.w a0, a2, (a1); ebreak - memory starts at 0, so
    // a0 = 0 and [a1] = 7 afterwards.
    write_code(
        0x10600,
        &[
            0x0002_05b7, // lui a1, 0x20
            0x0405_8593, // addi a1, a1, 0x40
            0x0070_0613, // addi a2, zero, 7
            0x00c5_a52f, // amoadd.w a0, a2, (a1)
            0x0010_0073, // ebreak
        ],
    );
    assert_eq!(run_until_trap(&mut state, 0x10600), trap::EBREAK);
    assert_eq!(state.gpr[10], 0);
    unsafe {
        assert_eq!((mmu::g2h(0x20040) as *const u32).read_unaligned(), 7);
    }

    // ---- TB uniqueness (property 8) ----
    let dup = catch_unwind(AssertUnwindSafe(|| {
        tcache::insert(
            0x10000,
            TCode {
                ptr: std::ptr::null_mut(),
                size: 0,
            },
        );
    }));
    assert!(dup.is_err(), "duplicate install must be rejected");

    // ---- unaligned dispatch ----
    state.ip = 0x10001;
    execute(&mut state);
    assert_eq!(state.trapno, trap::UNALIGNED_IP);
}
