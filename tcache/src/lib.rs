//! Translation cache - the process-wide map from guest IP to
//! translated host code, the indirect-branch jump cache probed
//! inline by generated code, and the arena all generated code
//! lives in.

pub mod slot;

pub use slot::{BranchSlot, SlotKind, BRANCH_SLOT_CODE};

use std::cell::UnsafeCell;
use std::collections::BTreeMap;
use std::ops::Bound;

use qdbt_core::MemArena;

/// Location and size of one TB's host code.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TCode {
    pub ptr: *mut u8,
    pub size: usize,
}

/// A translation block: one guest entry IP mapped to host code.
/// `#[repr(C)]` because the inline jump-cache probe reads `ip` and
/// `tcode.ptr` at fixed offsets.
#[repr(C)]
#[derive(Debug)]
pub struct TBlock {
    pub ip: u32,
    pub tcode: TCode,
}

/// Field offsets consumed by the inline probe.
pub const TB_IP_OFFS: i32 = 0;
pub const TB_CODE_PTR_OFFS: i32 = 8;

pub const JMP_CACHE_BITS: u32 = 12;
pub const JMP_CACHE_SIZE: usize = 1 << JMP_CACHE_BITS;

/// Code cache capacity.
const CODE_ARENA_SIZE: usize = 128 * 1024 * 1024;

struct TCache {
    tb_map: BTreeMap<u32, Box<TBlock>>,
    jmp_cache: Vec<*mut TBlock>,
    code_arena: MemArena,
    translate_hook: Option<fn(u32)>,
}

struct TCacheCell(UnsafeCell<Option<TCache>>);

// SAFETY: the core is single-threaded; all access happens on the
// execute thread.
unsafe impl Sync for TCacheCell {}

static TCACHE: TCacheCell = TCacheCell(UnsafeCell::new(None));

fn tcache() -> &'static mut TCache {
    // SAFETY: single-threaded access, init() called first.
    unsafe { (*TCACHE.0.get()).as_mut().expect("tcache: not initialized") }
}

pub fn init() {
    // SAFETY: single-threaded init.
    let cell = unsafe { &mut *TCACHE.0.get() };
    assert!(cell.is_none(), "tcache: double init");
    *cell = Some(TCache {
        tb_map: BTreeMap::new(),
        jmp_cache: vec![std::ptr::null_mut(); JMP_CACHE_SIZE],
        // Generated code is patched in place by the link stub while
        // the region stays executable.
        code_arena: MemArena::new(
            CODE_ARENA_SIZE,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        ),
        translate_hook: None,
    });
}

pub fn destroy() {
    // SAFETY: single-threaded teardown.
    let cell = unsafe { &mut *TCACHE.0.get() };
    *cell = None;
}

/// Called for every installed TB; the profiler hangs off this.
pub fn set_translate_hook(hook: fn(u32)) {
    tcache().translate_hook = Some(hook);
}

pub fn lookup(ip: u32) -> Option<*mut TBlock> {
    tcache()
        .tb_map
        .get_mut(&ip)
        .map(|tb| tb.as_mut() as *mut TBlock)
}

/// Smallest installed TB entry IP strictly above `ip`.
pub fn lookup_upper_bound(ip: u32) -> Option<u32> {
    tcache()
        .tb_map
        .range((Bound::Excluded(ip), Bound::Unbounded))
        .next()
        .map(|(&k, _)| k)
}

/// Install a new TB. For any guest IP at most one live TB exists;
/// a second install for the same IP is an invariant violation.
pub fn insert(ip: u32, tcode: TCode) -> *mut TBlock {
    let tc = tcache();
    assert!(
        !tc.tb_map.contains_key(&ip),
        "tcache: TB already installed for ip {ip:#x}"
    );
    let tb = Box::new(TBlock { ip, tcode });
    let ptr = tc.tb_map.entry(ip).or_insert(tb).as_mut() as *mut TBlock;
    if let Some(hook) = tc.translate_hook {
        hook(ip);
    }
    log::trace!(target: "tcache", "install tb {ip:#x} -> {:p}", tcode.ptr);
    ptr
}

#[inline]
pub fn jmp_cache_index(ip: u32) -> usize {
    (ip as usize >> 2) & (JMP_CACHE_SIZE - 1)
}

/// Refresh the jump-cache bucket for a TB that was reached through
/// an indirect branch.
pub fn on_brind(tb: *mut TBlock) {
    // SAFETY: tb comes from insert() and lives until destroy().
    let ip = unsafe { (*tb).ip };
    tcache().jmp_cache[jmp_cache_index(ip)] = tb;
}

/// Weak read of a jump-cache bucket; the caller validates by IP.
pub fn jmp_cache_get(ip: u32) -> *mut TBlock {
    tcache().jmp_cache[jmp_cache_index(ip)]
}

/// Address of the jump-cache table, embedded in generated code.
pub fn jmp_cache_ptr() -> usize {
    tcache().jmp_cache.as_ptr() as usize
}

/// Carve code-cache bytes out of the arena.
pub fn allocate_code(size: usize, align: usize) -> *mut u8 {
    tcache().code_arena.allocate(size, align)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tb_field_offsets_match_probe() {
        let tb = TBlock {
            ip: 0x1000,
            tcode: TCode {
                ptr: std::ptr::null_mut(),
                size: 0,
            },
        };
        let base = &tb as *const TBlock as usize;
        assert_eq!(&tb.ip as *const u32 as usize - base, TB_IP_OFFS as usize);
        assert_eq!(
            &tb.tcode.ptr as *const *mut u8 as usize - base,
            TB_CODE_PTR_OFFS as usize
        );
    }

    #[test]
    fn jmp_cache_indexing() {
        assert_eq!(jmp_cache_index(0), 0);
        assert_eq!(jmp_cache_index(4), 1);
        assert_eq!(
            jmp_cache_index((JMP_CACHE_SIZE as u32) << 2),
            0,
            "wraps at table size"
        );
    }
}
