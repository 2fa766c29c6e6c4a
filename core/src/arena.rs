use std::ptr;

/// Monotonic bump allocator over one mmap'd reservation.
///
/// Backs long-lived allocations that are only ever freed wholesale:
/// the translation-code cache and the AOT pipeline's code staging
/// area. There is no per-allocation free; running out of capacity
/// is fatal.
pub struct MemArena {
    ptr: *mut u8,
    size: usize,
    used: usize,
}

// SAFETY: MemArena owns its mmap'd memory exclusively.
unsafe impl Send for MemArena {}

impl MemArena {
    /// Reserve `size` bytes (rounded up to the page size) with the
    /// given mmap protection flags.
    pub fn new(size: usize, prot: i32) -> Self {
        let page = page_size();
        let size = (size + page - 1) & !(page - 1);

        // SAFETY: anonymous private mapping, no file backing.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            panic!(
                "MemArena: mmap of {size:#x} bytes failed: {}",
                std::io::Error::last_os_error()
            );
        }

        Self {
            ptr: ptr as *mut u8,
            size,
            used: 0,
        }
    }

    /// Bump-allocate `size` bytes aligned to `align`.
    pub fn allocate(&mut self, size: usize, align: usize) -> *mut u8 {
        assert!(align.is_power_of_two());
        let start = (self.used + align - 1) & !(align - 1);
        let end = start
            .checked_add(size)
            .unwrap_or_else(|| panic!("MemArena: allocation overflow"));
        assert!(end <= self.size, "MemArena: out of capacity");
        self.used = end;
        // SAFETY: start + size <= self.size, within the mapping.
        unsafe { self.ptr.add(start) }
    }

    #[inline]
    pub fn base_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.size
    }

    /// The arena contents written so far.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: 0..used has been handed out by allocate().
        unsafe { std::slice::from_raw_parts(self.ptr, self.used) }
    }
}

impl Drop for MemArena {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.size);
            }
        }
    }
}

pub fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_align() {
        let mut arena = MemArena::new(1 << 16, libc::PROT_READ | libc::PROT_WRITE);
        let a = arena.allocate(3, 1);
        let b = arena.allocate(8, 8);
        assert_eq!(b as usize % 8, 0);
        assert!(b as usize >= a as usize + 3);
        assert_eq!(arena.used(), (b as usize - arena.base_ptr() as usize) + 8);
    }

    #[test]
    fn writable() {
        let mut arena = MemArena::new(4096, libc::PROT_READ | libc::PROT_WRITE);
        let p = arena.allocate(16, 16);
        unsafe {
            p.write_bytes(0xAB, 16);
            assert_eq!(*p.add(15), 0xAB);
        }
    }

    #[test]
    #[should_panic(expected = "out of capacity")]
    fn exhaustion_is_fatal() {
        let mut arena = MemArena::new(4096, libc::PROT_READ | libc::PROT_WRITE);
        arena.allocate(4096, 1);
        arena.allocate(1, 1);
    }
}
