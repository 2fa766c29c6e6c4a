//! User-kernel: loads the guest ELF into the flat guest space,
//! builds the initial Linux-ABI stack, drives the execute loop,
//! and emulates the guest's Linux syscalls.

use std::fs;
use std::io;
use std::path::Path;

use qdbt_exec as exec;
use qdbt_frontend::rv32::cpu::{trap, CPUState};
use qdbt_mmu as mmu;

use crate::elf::*;

/// Guest stack geometry.
pub const STACK_TOP: u32 = 0x7fff_f000;
pub const STACK_SIZE: u32 = 8 * 1024 * 1024;

/// Result of loading the guest executable.
pub struct ElfImage {
    pub entry: u32,
    pub load_addr: u32,
    pub brk: u32,
    pub stack_start: u32,
    pub phdr_addr: u32,
    pub phnum: u16,
}

#[derive(Debug)]
pub enum LoadError {
    Io(io::Error),
    Elf(ElfError),
    NoLoadSegment,
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O: {e}"),
            Self::Elf(e) => write!(f, "ELF: {e}"),
            Self::NoLoadSegment => write!(f, "no PT_LOAD segment"),
        }
    }
}

impl From<io::Error> for LoadError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ElfError> for LoadError {
    fn from(e: ElfError) -> Self {
        Self::Elf(e)
    }
}

fn elf_to_prot(flags: u32) -> i32 {
    let mut prot = 0;
    if flags & PF_R != 0 {
        prot |= libc::PROT_READ;
    }
    if flags & PF_W != 0 {
        prot |= libc::PROT_WRITE;
    }
    if flags & PF_X != 0 {
        prot |= libc::PROT_EXEC;
    }
    prot
}

unsafe fn guest_write(gaddr: u32, data: &[u8]) {
    std::ptr::copy_nonoverlapping(data.as_ptr(), mmu::g2h(gaddr), data.len());
}

unsafe fn guest_write_u32(gaddr: u32, val: u32) {
    (mmu::g2h(gaddr) as *mut u32).write_unaligned(val);
}

/// The user-kernel state that survives across syscalls.
pub struct Ukernel {
    brk: u32,
    mmap_next: u32,
    pub exit_code: Option<i32>,
}

impl Ukernel {
    pub fn new() -> Self {
        Self {
            brk: 0,
            mmap_next: 0,
            exit_code: None,
        }
    }

    /// Map the guest executable and build the initial stack.
    pub fn load_elf(&mut self, path: &Path, guest_argv: &[&str]) -> Result<ElfImage, LoadError> {
        let data = fs::read(path)?;
        let ehdr = Elf32Ehdr::parse(&data)?;
        let phdrs = ehdr.program_headers(&data)?;

        let mut brk: u32 = 0;
        let mut load_addr: u32 = u32::MAX;
        let mut phdr_addr: u32 = 0;
        let mut has_load = false;

        for ph in &phdrs {
            if ph.p_type == PT_PHDR {
                phdr_addr = ph.p_vaddr;
            }
            if ph.p_type != PT_LOAD {
                continue;
            }
            has_load = true;
            load_addr = load_addr.min(ph.p_vaddr);

            let aligned_start = mmu::page_align_down(ph.p_vaddr);
            let aligned_end = mmu::page_align_up(ph.p_vaddr + ph.p_memsz);
            let size = (aligned_end - aligned_start) as usize;

            mmu::map(
                aligned_start,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                true,
                -1,
                0,
            )?;

            if ph.p_filesz > 0 {
                let src = ph.p_offset as usize..(ph.p_offset + ph.p_filesz) as usize;
                if src.end > data.len() {
                    return Err(LoadError::Elf(ElfError::InvalidPhdr));
                }
                // SAFETY: the segment was just mapped writable.
                unsafe { guest_write(ph.p_vaddr, &data[src]) };
            }

            let prot = elf_to_prot(ph.p_flags);
            if prot != (libc::PROT_READ | libc::PROT_WRITE) {
                mmu::mprotect(aligned_start, size, prot)?;
            }
            brk = brk.max(aligned_end);
        }
        if !has_load {
            return Err(LoadError::NoLoadSegment);
        }
        if phdr_addr == 0 {
            phdr_addr = load_addr + ehdr.e_phoff;
        }

        self.brk = brk;
        self.mmap_next = mmu::page_align_up(brk) + 0x1000_0000;

        let stack_start =
            setup_stack(ehdr.e_entry, phdr_addr, ehdr.e_phnum, guest_argv)?;

        log::debug!(
            target: "ukernel",
            "loaded {}: entry {:#x} brk {:#x} sp {:#x}",
            path.display(), ehdr.e_entry, brk, stack_start
        );
        Ok(ElfImage {
            entry: ehdr.e_entry,
            load_addr,
            brk,
            stack_start,
            phdr_addr,
            phnum: ehdr.e_phnum,
        })
    }

    /// Drive the execute loop until the guest terminates. Returns
    /// the process exit code.
    pub fn run(&mut self, state: &mut CPUState) -> i32 {
        loop {
            exec::execute(state);
            match state.trapno {
                trap::EBREAK => {
                    log::debug!(target: "ukernel", "ebreak at {:#x}", state.ip);
                    return 1;
                }
                trap::ECALL => {
                    state.ip += 4;
                    self.syscall(state);
                    if state.trapno == trap::TERMINATED {
                        return self.exit_code.unwrap_or(0);
                    }
                }
                trap::ILLEGAL_INSN => {
                    log::warn!(target: "ukernel", "illegal instruction at {:#x}", state.ip);
                    return 1;
                }
                trap::UNALIGNED_IP => {
                    log::warn!(target: "ukernel", "unaligned ip {:#x}", state.ip);
                    return 1;
                }
                t => panic!("ukernel: unhandled trap {t}"),
            }
        }
    }

    /// Emulate one guest syscall: number in a7, args in a0..a5,
    /// result in a0.
    fn syscall(&mut self, state: &mut CPUState) {
        state.trapno = trap::NONE;
        let nr = state.gpr[17];
        let a = [
            state.gpr[10],
            state.gpr[11],
            state.gpr[12],
            state.gpr[13],
        ];

        let rc: u32 = match nr {
            // read / write / writev
            63 => unsafe {
                errno_ret(libc::read(
                    a[0] as i32,
                    mmu::g2h(a[1]) as *mut libc::c_void,
                    a[2] as usize,
                ))
            },
            64 => unsafe {
                errno_ret(libc::write(
                    a[0] as i32,
                    mmu::g2h(a[1]) as *const libc::c_void,
                    a[2] as usize,
                ))
            },
            66 => self.sys_writev(a[0] as i32, a[1], a[2]),
            // close
            57 => {
                // Leave the emulator's own stdio alone.
                if a[0] <= 2 {
                    0
                } else {
                    unsafe { errno_ret(libc::close(a[0] as i32) as isize) }
                }
            }
            // fstat: not emulated; musl falls back gracefully.
            80 => neg_errno(libc::ENOSYS),
            // ioctl
            29 => neg_errno(libc::ENOTTY),
            // exit / exit_group
            93 | 94 => {
                self.exit_code = Some(a[0] as i32);
                state.trapno = trap::TERMINATED;
                0
            }
            // set_tid_address / set_robust_list
            96 | 99 => 0,
            // clock_gettime: 32-bit timespec
            113 => unsafe {
                let mut ts = libc::timespec {
                    tv_sec: 0,
                    tv_nsec: 0,
                };
                let rc = libc::clock_gettime(a[0] as i32, &mut ts);
                if rc == 0 {
                    guest_write_u32(a[1], ts.tv_sec as u32);
                    guest_write_u32(a[1] + 4, ts.tv_nsec as u32);
                }
                errno_ret(rc as isize)
            },
            // uname
            160 => unsafe {
                let mut un: libc::utsname = std::mem::zeroed();
                let rc = libc::uname(&mut un);
                if rc == 0 {
                    let machine = b"riscv32\0";
                    for (i, &b) in machine.iter().enumerate() {
                        un.machine[i] = b as libc::c_char;
                    }
                    // Guest struct is an array of 6 × 65-byte fields.
                    let src = &un as *const libc::utsname as *const u8;
                    let dst = mmu::g2h(a[0]);
                    std::ptr::copy_nonoverlapping(src, dst, 65 * 6);
                }
                errno_ret(rc as isize)
            },
            // id getters
            172 => unsafe { libc::getpid() as u32 },
            174 => unsafe { libc::getuid() },
            175 => unsafe { libc::geteuid() },
            176 => unsafe { libc::getgid() },
            177 => unsafe { libc::getegid() },
            178 => unsafe { libc::getpid() as u32 },
            // brk
            214 => self.sys_brk(a[0]),
            // munmap: keep the reservation, just drop access
            215 => match mmu::mprotect(a[0], a[1] as usize, libc::PROT_NONE) {
                Ok(()) => 0,
                Err(_) => neg_errno(libc::EINVAL),
            },
            // mmap
            222 => self.sys_mmap(a[0], a[1], a[2] as i32),
            // mprotect
            226 => match mmu::mprotect(a[0], a[1] as usize, a[2] as i32) {
                Ok(()) => 0,
                Err(_) => neg_errno(libc::EINVAL),
            },
            // madvise
            233 => 0,
            // getrandom
            278 => {
                // SAFETY: guest buffer mapped by the caller.
                unsafe {
                    errno_ret(libc::getrandom(
                        mmu::g2h(a[0]) as *mut libc::c_void,
                        a[1] as usize,
                        a[2],
                    ))
                }
            }
            _ => {
                log::debug!(target: "ukernel", "unimplemented syscall {nr}");
                neg_errno(libc::ENOSYS)
            }
        };

        if state.trapno == trap::NONE {
            log::trace!(target: "ukernel", "sys_{nr}({:#x}, {:#x}, ..) = {rc:#x}", a[0], a[1]);
            state.gpr[10] = rc;
        }
    }

    fn sys_brk(&mut self, new_brk: u32) -> u32 {
        if new_brk == 0 || new_brk < self.brk {
            return self.brk;
        }
        let old_aligned = mmu::page_align_up(self.brk);
        let new_aligned = mmu::page_align_up(new_brk);
        if new_aligned > old_aligned {
            let size = (new_aligned - old_aligned) as usize;
            if mmu::map(
                old_aligned,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                true,
                -1,
                0,
            )
            .is_err()
            {
                return self.brk;
            }
        }
        self.brk = new_brk;
        new_brk
    }

    fn sys_mmap(&mut self, addr: u32, len: u32, prot: i32) -> u32 {
        let aligned_len = mmu::page_align_up(len) as usize;
        let gaddr = if addr != 0 {
            addr
        } else {
            let a = self.mmap_next;
            self.mmap_next += aligned_len as u32;
            a
        };
        match mmu::map(gaddr, aligned_len, prot, true, -1, 0) {
            Ok(_) => gaddr,
            Err(_) => neg_errno(libc::ENOMEM),
        }
    }

    fn sys_writev(&mut self, fd: i32, iov: u32, iovcnt: u32) -> u32 {
        // 32-bit iovec: { u32 base; u32 len }.
        let mut total: isize = 0;
        for i in 0..iovcnt {
            // SAFETY: guest iovec array mapped by the caller.
            let (base, len) = unsafe {
                let p = mmu::g2h(iov + i * 8) as *const u32;
                (p.read_unaligned(), p.add(1).read_unaligned())
            };
            if len == 0 {
                continue;
            }
            let rc = unsafe {
                libc::write(fd, mmu::g2h(base) as *const libc::c_void, len as usize)
            };
            if rc < 0 {
                return errno_ret(rc);
            }
            total += rc;
            if (rc as u32) < len {
                break;
            }
        }
        total as u32
    }
}

impl Default for Ukernel {
    fn default() -> Self {
        Self::new()
    }
}

/// `gpr[2] = stack_start`: the ABI stack pointer at entry.
pub fn init_thread(state: &mut CPUState, elf: &ElfImage) {
    state.gpr[2] = elf.stack_start;
}

fn errno_ret(rc: isize) -> u32 {
    if rc < 0 {
        // SAFETY: errno read on the same thread as the failed call.
        let e = unsafe { *libc::__errno_location() };
        (-e) as u32
    } else {
        rc as u32
    }
}

fn neg_errno(e: i32) -> u32 {
    (-e) as u32
}

/// Map the stack and lay out argc/argv/envp/auxv per the 32-bit
/// Linux ABI.
fn setup_stack(
    entry: u32,
    phdr_addr: u32,
    phnum: u16,
    argv: &[&str],
) -> io::Result<u32> {
    let stack_base = STACK_TOP - STACK_SIZE;
    mmu::map(
        stack_base,
        STACK_SIZE as usize,
        libc::PROT_READ | libc::PROT_WRITE,
        true,
        -1,
        0,
    )?;

    let mut pos = STACK_TOP;

    // AT_RANDOM seed bytes.
    pos -= 16;
    let random_addr = pos;
    let seed: [u8; 16] = [
        0xde, 0xad, 0xbe, 0xef, 0xca, 0xfe, 0xba, 0xbe, 0x01, 0x23, 0x45, 0x67, 0x89,
        0xab, 0xcd, 0xef,
    ];
    // SAFETY: inside the stack mapping.
    unsafe { guest_write(random_addr, &seed) };

    // Argument strings, NUL-terminated by the zero-filled mapping.
    let mut argv_addrs = Vec::with_capacity(argv.len());
    for &s in argv.iter().rev() {
        let bytes = s.as_bytes();
        pos -= bytes.len() as u32 + 1;
        argv_addrs.push(pos);
        unsafe { guest_write(pos, bytes) };
    }
    argv_addrs.reverse();

    pos &= !15;

    let auxv: [(u32, u32); 7] = [
        (AT_PHDR, phdr_addr),
        (AT_PHENT, 32),
        (AT_PHNUM, phnum as u32),
        (AT_PAGESZ, mmu::PAGE_SIZE as u32),
        (AT_ENTRY, entry),
        (AT_RANDOM, random_addr),
        (AT_NULL, 0),
    ];

    // argc + argv + NULL + envp NULL + auxv pairs, 4 bytes each.
    let frame_words = 1 + argv.len() + 1 + 1 + auxv.len() * 2;
    pos -= (frame_words * 4) as u32;
    pos &= !15;

    let sp = pos;
    let mut cur = sp;
    unsafe {
        guest_write_u32(cur, argv.len() as u32);
        cur += 4;
        for &addr in &argv_addrs {
            guest_write_u32(cur, addr);
            cur += 4;
        }
        guest_write_u32(cur, 0); // argv terminator
        cur += 4;
        guest_write_u32(cur, 0); // empty envp
        cur += 4;
        for (typ, val) in auxv {
            guest_write_u32(cur, typ);
            guest_write_u32(cur + 4, val);
            cur += 8;
        }
    }
    Ok(sp)
}
