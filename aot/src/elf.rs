//! ELF64 structures shared by the object writer, the fixup pass,
//! and the boot loader, plus a small relocatable-object writer.

use std::fs;
use std::io::{self, Write};
use std::mem;
use std::path::Path;

pub const ET_REL: u16 = 1;
pub const EM_X86_64: u16 = 62;

pub const SHT_PROGBITS: u32 = 1;
pub const SHT_SYMTAB: u32 = 2;
pub const SHT_STRTAB: u32 = 3;

pub const SHF_WRITE: u64 = 1;
pub const SHF_ALLOC: u64 = 2;
pub const SHF_EXECINSTR: u64 = 4;

pub const STB_GLOBAL: u8 = 1;
pub const STT_OBJECT: u8 = 1;
pub const STT_FUNC: u8 = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Elf64Shdr {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Elf64Sym {
    pub st_name: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

pub fn sym_info(bind: u8, ty: u8) -> u8 {
    (bind << 4) | (ty & 0xf)
}

fn struct_bytes<T: Copy>(v: &T) -> &[u8] {
    // SAFETY: plain repr(C) structs of integer fields.
    unsafe { std::slice::from_raw_parts(v as *const T as *const u8, mem::size_of::<T>()) }
}

/// A growing string table (index 0 is the empty name).
pub struct StrTab {
    data: Vec<u8>,
}

impl StrTab {
    pub fn new() -> Self {
        Self { data: vec![0] }
    }

    pub fn add(&mut self, s: &str) -> u32 {
        let idx = self.data.len() as u32;
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        idx
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Default for StrTab {
    fn default() -> Self {
        Self::new()
    }
}

struct SectionDesc {
    name: &'static str,
    sh_type: u32,
    flags: u64,
    link: u32,
    info: u32,
    addralign: u64,
    entsize: u64,
    data: Vec<u8>,
}

/// ET_REL object writer: section data laid out after the header,
/// then the section header table.
pub struct ObjWriter {
    sections: Vec<SectionDesc>,
}

impl ObjWriter {
    pub fn new() -> Self {
        Self {
            sections: Vec::new(),
        }
    }

    /// Section indices start at 1 (0 is the null section).
    #[allow(clippy::too_many_arguments)]
    pub fn add_section(
        &mut self,
        name: &'static str,
        sh_type: u32,
        flags: u64,
        link: u32,
        info: u32,
        addralign: u64,
        entsize: u64,
        data: Vec<u8>,
    ) -> u16 {
        self.sections.push(SectionDesc {
            name,
            sh_type,
            flags,
            link,
            info,
            addralign,
            entsize,
            data,
        });
        self.sections.len() as u16
    }

    pub fn save(mut self, path: &Path) -> io::Result<()> {
        // Trailing .shstrtab holds the section names.
        let mut shstr = StrTab::new();
        let mut name_offs: Vec<u32> =
            self.sections.iter().map(|s| shstr.add(s.name)).collect();
        name_offs.push(shstr.add(".shstrtab"));
        self.sections.push(SectionDesc {
            name: ".shstrtab",
            sh_type: SHT_STRTAB,
            flags: 0,
            link: 0,
            info: 0,
            addralign: 1,
            entsize: 0,
            data: shstr.bytes().to_vec(),
        });

        let ehsize = mem::size_of::<Elf64Ehdr>();
        let shentsize = mem::size_of::<Elf64Shdr>();
        let n_sections = self.sections.len() + 1; // + null

        // Assign file offsets.
        let mut offset = ehsize;
        let mut shdrs = vec![Elf64Shdr::default()];
        for (i, sec) in self.sections.iter().enumerate() {
            let align = sec.addralign.max(1) as usize;
            offset = (offset + align - 1) & !(align - 1);
            shdrs.push(Elf64Shdr {
                sh_name: name_offs[i],
                sh_type: sec.sh_type,
                sh_flags: sec.flags,
                sh_addr: 0,
                sh_offset: offset as u64,
                sh_size: sec.data.len() as u64,
                sh_link: sec.link,
                sh_info: sec.info,
                sh_addralign: sec.addralign,
                sh_entsize: sec.entsize,
            });
            offset += sec.data.len();
        }
        let shoff = (offset + 7) & !7;

        let ehdr = Elf64Ehdr {
            e_ident: {
                let mut id = [0u8; 16];
                id[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
                id[4] = 2; // ELFCLASS64
                id[5] = 1; // ELFDATA2LSB
                id[6] = 1; // EV_CURRENT
                id
            },
            e_type: ET_REL,
            e_machine: EM_X86_64,
            e_version: 1,
            e_entry: 0,
            e_phoff: 0,
            e_shoff: shoff as u64,
            e_flags: 0,
            e_ehsize: ehsize as u16,
            e_phentsize: 0,
            e_phnum: 0,
            e_shentsize: shentsize as u16,
            e_shnum: n_sections as u16,
            e_shstrndx: (n_sections - 1) as u16,
        };

        let mut out = Vec::with_capacity(shoff + n_sections * shentsize);
        out.extend_from_slice(struct_bytes(&ehdr));
        for (sec, shdr) in self.sections.iter().zip(shdrs.iter().skip(1)) {
            out.resize(shdr.sh_offset as usize, 0);
            out.extend_from_slice(&sec.data);
        }
        out.resize(shoff, 0);
        for shdr in &shdrs {
            out.extend_from_slice(struct_bytes(shdr));
        }

        fs::File::create(path)?.write_all(&out)
    }
}

impl Default for ObjWriter {
    fn default() -> Self {
        Self::new()
    }
}

// -- Read-side helpers (fixup and boot) --

/// A loaded ELF file image plus parsed section headers.
pub struct ElfFile {
    pub data: Vec<u8>,
    pub shdrs: Vec<Elf64Shdr>,
}

fn read_struct<T: Copy>(data: &[u8], offset: usize) -> T {
    assert!(offset + mem::size_of::<T>() <= data.len(), "truncated ELF");
    // SAFETY: bounds checked; plain repr(C) integer struct.
    unsafe { (data.as_ptr().add(offset) as *const T).read_unaligned() }
}

impl ElfFile {
    pub fn open(path: &Path) -> io::Result<ElfFile> {
        let data = fs::read(path)?;
        if data.len() < mem::size_of::<Elf64Ehdr>() || data[0..4] != [0x7f, b'E', b'L', b'F'] {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "not an ELF file"));
        }
        let ehdr: Elf64Ehdr = read_struct(&data, 0);
        let mut shdrs = Vec::with_capacity(ehdr.e_shnum as usize);
        for i in 0..ehdr.e_shnum as usize {
            shdrs.push(read_struct(
                &data,
                ehdr.e_shoff as usize + i * mem::size_of::<Elf64Shdr>(),
            ));
        }
        Ok(ElfFile { data, shdrs })
    }

    /// All symbols of the first SHT_SYMTAB (or SHT_DYNSYM fallback)
    /// with resolved names.
    pub fn symbols(&self) -> Vec<(String, Elf64Sym)> {
        const SHT_DYNSYM: u32 = 11;
        let symtab = self
            .shdrs
            .iter()
            .find(|s| s.sh_type == SHT_SYMTAB)
            .or_else(|| self.shdrs.iter().find(|s| s.sh_type == SHT_DYNSYM));
        let Some(symtab) = symtab else {
            return Vec::new();
        };
        let strtab = &self.shdrs[symtab.sh_link as usize];
        let n = (symtab.sh_size / mem::size_of::<Elf64Sym>() as u64) as usize;

        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let sym: Elf64Sym = read_struct(
                &self.data,
                symtab.sh_offset as usize + i * mem::size_of::<Elf64Sym>(),
            );
            let name_start = strtab.sh_offset as usize + sym.st_name as usize;
            let name_end = self.data[name_start..]
                .iter()
                .position(|&b| b == 0)
                .map(|p| name_start + p)
                .unwrap_or(name_start);
            let name = String::from_utf8_lossy(&self.data[name_start..name_end]).into_owned();
            out.push((name, sym));
        }
        out
    }

    /// File offset of the byte at virtual address `vaddr` inside
    /// section `shndx`.
    pub fn vaddr_to_file_offset(&self, shndx: u16, vaddr: u64) -> usize {
        let shdr = &self.shdrs[shndx as usize];
        (shdr.sh_offset + (vaddr - shdr.sh_addr)) as usize
    }
}
