//! Minimal ELF32 parsing for static RV32 guest executables.

use std::fmt;
use std::mem;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;

pub const ET_EXEC: u16 = 2;
pub const EM_RISCV: u16 = 243;

pub const PT_LOAD: u32 = 1;
pub const PT_PHDR: u32 = 6;

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

// Auxiliary vector types placed on the guest stack.
pub const AT_NULL: u32 = 0;
pub const AT_PHDR: u32 = 3;
pub const AT_PHENT: u32 = 4;
pub const AT_PHNUM: u32 = 5;
pub const AT_PAGESZ: u32 = 6;
pub const AT_ENTRY: u32 = 9;
pub const AT_RANDOM: u32 = 25;

#[derive(Debug)]
pub enum ElfError {
    TooSmall,
    InvalidMagic,
    UnsupportedClass,
    UnsupportedEndian,
    UnsupportedMachine,
    UnsupportedType,
    InvalidPhdr,
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooSmall => write!(f, "file too small"),
            Self::InvalidMagic => write!(f, "invalid ELF magic"),
            Self::UnsupportedClass => write!(f, "not ELF32"),
            Self::UnsupportedEndian => write!(f, "not little-endian"),
            Self::UnsupportedMachine => write!(f, "not RISC-V"),
            Self::UnsupportedType => write!(f, "not ET_EXEC"),
            Self::InvalidPhdr => write!(f, "invalid program header"),
        }
    }
}

impl std::error::Error for ElfError {}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf32Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf32Phdr {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}

impl Elf32Ehdr {
    pub fn parse(data: &[u8]) -> Result<Elf32Ehdr, ElfError> {
        if data.len() < mem::size_of::<Elf32Ehdr>() {
            return Err(ElfError::TooSmall);
        }
        // SAFETY: bounds checked; plain repr(C) integer struct.
        let ehdr =
            unsafe { (data.as_ptr() as *const Elf32Ehdr).read_unaligned() };
        if ehdr.e_ident[0..4] != ELF_MAGIC {
            return Err(ElfError::InvalidMagic);
        }
        if ehdr.e_ident[4] != ELFCLASS32 {
            return Err(ElfError::UnsupportedClass);
        }
        if ehdr.e_ident[5] != ELFDATA2LSB {
            return Err(ElfError::UnsupportedEndian);
        }
        if ehdr.e_ident[6] != EV_CURRENT {
            return Err(ElfError::InvalidMagic);
        }
        if ehdr.e_machine != EM_RISCV {
            return Err(ElfError::UnsupportedMachine);
        }
        if ehdr.e_type != ET_EXEC {
            return Err(ElfError::UnsupportedType);
        }
        Ok(ehdr)
    }

    pub fn program_headers(&self, data: &[u8]) -> Result<Vec<Elf32Phdr>, ElfError> {
        let off = self.e_phoff as usize;
        let num = self.e_phnum as usize;
        let ent = self.e_phentsize as usize;
        if ent < mem::size_of::<Elf32Phdr>() {
            return Err(ElfError::InvalidPhdr);
        }
        let end = off
            .checked_add(num.checked_mul(ent).ok_or(ElfError::InvalidPhdr)?)
            .ok_or(ElfError::InvalidPhdr)?;
        if end > data.len() {
            return Err(ElfError::InvalidPhdr);
        }
        let mut phdrs = Vec::with_capacity(num);
        for i in 0..num {
            // SAFETY: bounds checked above.
            phdrs.push(unsafe {
                (data[off + i * ent..].as_ptr() as *const Elf32Phdr).read_unaligned()
            });
        }
        Ok(phdrs)
    }
}
