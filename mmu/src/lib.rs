//! Guest MMU - one contiguous host reservation covering the whole
//! 32-bit guest address space, so `host = base + guest` for every
//! guest address. Guest page protection mirrors host mprotect.
//!
//! Process-global with an explicit init/destroy lifecycle; the core
//! is single-threaded, so all access happens on one thread.

use std::cell::UnsafeCell;
use std::io;
use std::ptr;

pub const PAGE_BITS: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_BITS;

/// Whole 32-bit guest address space.
const GUEST_SPACE_SIZE: usize = 1 << 32;

struct Mmu {
    base: *mut u8,
}

struct MmuCell(UnsafeCell<Option<Mmu>>);

// SAFETY: the core is single-threaded by design; all MMU access is
// funneled through this module on the execute thread.
unsafe impl Sync for MmuCell {}

static MMU: MmuCell = MmuCell(UnsafeCell::new(None));

fn mmu() -> &'static Mmu {
    // SAFETY: single-threaded access, init() called first.
    unsafe { (*MMU.0.get()).as_ref().expect("mmu: not initialized") }
}

/// Reserve the guest address space. Fatal on failure.
pub fn init() {
    // SAFETY: single-threaded init.
    let slot = unsafe { &mut *MMU.0.get() };
    assert!(slot.is_none(), "mmu: double init");

    // SAFETY: PROT_NONE reservation, no file backing.
    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            GUEST_SPACE_SIZE,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        panic!(
            "mmu: failed to reserve guest space: {}",
            io::Error::last_os_error()
        );
    }
    *slot = Some(Mmu {
        base: base as *mut u8,
    });
    log::debug!(target: "ukernel", "mmu: guest space at {base:p}");
}

pub fn destroy() {
    // SAFETY: single-threaded teardown.
    let slot = unsafe { &mut *MMU.0.get() };
    if let Some(m) = slot.take() {
        unsafe {
            libc::munmap(m.base as *mut libc::c_void, GUEST_SPACE_SIZE);
        }
    }
}

/// Host base of the reservation; guest address 0 maps here.
#[inline]
pub fn base() -> usize {
    mmu().base as usize
}

/// Translate a guest address to its host pointer.
#[inline]
pub fn g2h(gaddr: u32) -> *mut u8 {
    // SAFETY: every 32-bit guest address lies inside the reservation.
    unsafe { mmu().base.add(gaddr as usize) }
}

/// Translate a host pointer back to its guest address.
#[inline]
pub fn h2g(host: *const u8) -> u32 {
    let off = (host as usize).wrapping_sub(mmu().base as usize);
    assert!(off < GUEST_SPACE_SIZE, "h2g: host pointer not in guest space");
    off as u32
}

#[inline]
pub fn page_align_down(addr: u32) -> u32 {
    addr & !(PAGE_SIZE as u32 - 1)
}

#[inline]
pub fn page_align_up(addr: u32) -> u32 {
    addr.wrapping_add(PAGE_SIZE as u32 - 1) & !(PAGE_SIZE as u32 - 1)
}

/// Split a guest address into (pageno, page offset).
#[inline]
pub fn page_split(addr: u32) -> (u32, u32) {
    (addr >> PAGE_BITS, addr & (PAGE_SIZE as u32 - 1))
}

/// Place a host mapping at `base + gaddr`. With `replace` the
/// mapping overrides whatever occupies the slot; without it the
/// call fails if the slot is already taken.
pub fn map(
    gaddr: u32,
    len: usize,
    prot: i32,
    replace: bool,
    fd: i32,
    offset: i64,
) -> io::Result<*mut u8> {
    let host = g2h(gaddr);
    let mut flags = libc::MAP_FIXED;
    if fd < 0 {
        flags |= libc::MAP_ANONYMOUS;
    }
    flags |= libc::MAP_PRIVATE;
    if !replace {
        flags = (flags & !libc::MAP_FIXED) | libc::MAP_FIXED_NOREPLACE;
    }
    // SAFETY: target range lies within our reservation.
    let ret = unsafe {
        libc::mmap(host as *mut libc::c_void, len, prot, flags, fd, offset)
    };
    if ret == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as *mut u8)
}

/// Mirror a guest page protection change onto the host mapping.
pub fn mprotect(gaddr: u32, len: usize, prot: i32) -> io::Result<()> {
    let host = g2h(gaddr);
    // SAFETY: target range lies within our reservation.
    let ret = unsafe { libc::mprotect(host as *mut libc::c_void, len, prot) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // One body: the MMU is process-global and tests run in parallel.
    #[test]
    fn mmu_lifecycle() {
        init();

        // Address translation round-trip over representative points.
        for g in [0u32, 0x1000, 0x10000, 0xdead_b000, u32::MAX] {
            assert_eq!(h2g(g2h(g)), g);
        }

        // Fixed map + write + readback.
        let gaddr = 0x0001_0000;
        map(gaddr, PAGE_SIZE, libc::PROT_READ | libc::PROT_WRITE, true, -1, 0)
            .unwrap();
        unsafe {
            *g2h(gaddr) = 0x5a;
            assert_eq!(*g2h(gaddr), 0x5a);
        }

        // Protection mirror.
        mprotect(gaddr, PAGE_SIZE, libc::PROT_READ).unwrap();
        mprotect(gaddr, PAGE_SIZE, libc::PROT_READ | libc::PROT_WRITE).unwrap();

        // No-replace fails on an occupied slot.
        assert!(
            map(gaddr, PAGE_SIZE, libc::PROT_READ, false, -1, 0).is_err()
        );

        assert_eq!(page_split(0x12345), (0x12, 0x345));
        assert_eq!(page_align_up(1), PAGE_SIZE as u32);
        assert_eq!(page_align_down(0x1fff), 0x1000);

        destroy();
    }
}
