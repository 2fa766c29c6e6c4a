//! AOT compilation driver - compile every profiled instruction
//! offset into the staging arena, emit the `.aot`/`.aottab`
//! object, link it, and fix up the table.

use std::collections::BTreeSet;
use std::mem;
use std::ops::Bound;
use std::path::Path;
use std::process::Command;

use qdbt_backend::{compile, CompilerJob, CompilerRuntime};
use qdbt_core::MemArena;
use qdbt_frontend::rv32::cpu::RuntimeStubTab;

use crate::elf::{
    sym_info, Elf64Sym, ObjWriter, StrTab, SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE,
    SHT_PROGBITS, SHT_STRTAB, SHT_SYMTAB, STB_GLOBAL, STT_FUNC, STT_OBJECT,
};
use crate::fixup;
use crate::profile::{self, PageData, PAGE_INSNS};
use crate::{
    cache_path, make_aot_symbol, AotSymbol, AOT_O_EXTENSION, AOT_SO_EXTENSION,
    AOT_SYM_AOTTAB,
};

/// Staging area for all AOT code.
const AOT_ARENA_SIZE: usize = 256 * 1024 * 1024;

/// One recorded region symbol.
struct RegionSym {
    name: String,
    offs: u64,
    size: u64,
}

struct AotCompilerRuntime {
    code_arena: MemArena,
    region_syms: Vec<RegionSym>,
    aot_symbols: Vec<AotSymbol>,
    translated: BTreeSet<u32>,
}

impl AotCompilerRuntime {
    fn new() -> Self {
        Self {
            code_arena: MemArena::new(
                AOT_ARENA_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
            ),
            region_syms: Vec::new(),
            aot_symbols: Vec::new(),
            translated: BTreeSet::new(),
        }
    }
}

impl CompilerRuntime for AotCompilerRuntime {
    fn allocate_code(&mut self, size: usize, align: usize) -> *mut u8 {
        self.code_arena.allocate(size, align)
    }

    fn allows_relocation(&self) -> bool {
        true
    }

    fn vmem_base(&self) -> usize {
        qdbt_mmu::base()
    }

    /// Clamp to the current guest page and to the nearest region
    /// already compiled above this IP.
    fn update_ip_boundary(&self, iprange: &mut (u32, u32)) {
        let page_end = (iprange.0 as u64 & !(qdbt_mmu::PAGE_SIZE as u64 - 1))
            + qdbt_mmu::PAGE_SIZE as u64;
        iprange.1 = iprange.1.min(page_end.min(u32::MAX as u64 + 1) as u32);
        if let Some(&next) = self
            .translated
            .range((Bound::Excluded(iprange.0), Bound::Unbounded))
            .next()
        {
            iprange.1 = iprange.1.min(next);
        }
    }

    fn announce_region(&mut self, ip: u32, code: &[u8]) -> *mut u8 {
        let offs = code.as_ptr() as u64 - self.code_arena.base_ptr() as u64;
        self.region_syms.push(RegionSym {
            name: make_aot_symbol(ip),
            offs,
            size: code.len() as u64,
        });
        self.aot_symbols.push(AotSymbol {
            gip: ip,
            host_vaddr: offs,
        });
        self.translated.insert(ip);
        std::ptr::null_mut()
    }

    fn stub_tab(&self) -> Option<&'static RuntimeStubTab> {
        None
    }
}

fn compile_page(rt: &mut AotCompilerRuntime, page: &PageData) {
    let page_vaddr = page.pageno << qdbt_mmu::PAGE_BITS;
    // Highest offsets first, so each region is clamped by the one
    // compiled just above it.
    for idx in (0..PAGE_INSNS).rev() {
        if !page.test(idx) {
            continue;
        }
        let ip = page_vaddr + PageData::idx2po(idx as u32);
        compile(rt, CompilerJob::new((ip, u32::MAX)));
    }
}

/// Serialize the `.aottab` payload: `{u64 n_sym}` then the records.
fn build_aottab(symbols: &[AotSymbol]) -> Vec<u8> {
    let mut tab = Vec::with_capacity(8 + symbols.len() * 16);
    tab.extend_from_slice(&(symbols.len() as u64).to_le_bytes());
    for sym in symbols {
        tab.extend_from_slice(&sym.to_bytes());
    }
    tab
}

/// Compile the recorded profile of `guest` into `<guest>.aot.so`.
/// The guest binary must already be loaded into guest memory.
pub fn compile_aot(guest: &Path) {
    let Ok(pages) = profile::load(guest) else {
        log::warn!(target: "aot", "no profile data found");
        return;
    };
    log::debug!(target: "aot", "start aot compilation: {} page(s)", pages.len());

    let mut rt = AotCompilerRuntime::new();
    for page in &pages {
        compile_page(&mut rt, page);
    }

    // Sections: 1 = .aot, 2 = .aottab, 3 = .symtab, 4 = .strtab.
    let mut writer = ObjWriter::new();
    let mut stra = StrTab::new();

    let mut syms: Vec<Elf64Sym> = vec![Elf64Sym::default()];
    for rs in &rt.region_syms {
        syms.push(Elf64Sym {
            st_name: stra.add(&rs.name),
            st_info: sym_info(STB_GLOBAL, STT_FUNC),
            st_other: 0,
            st_shndx: 1,
            st_value: rs.offs,
            st_size: rs.size,
        });
    }
    let aottab = build_aottab(&rt.aot_symbols);
    syms.push(Elf64Sym {
        st_name: stra.add(AOT_SYM_AOTTAB),
        st_info: sym_info(STB_GLOBAL, STT_OBJECT),
        st_other: 0,
        st_shndx: 2,
        st_value: 0,
        st_size: aottab.len() as u64,
    });

    let mut symtab_bytes = Vec::with_capacity(syms.len() * mem::size_of::<Elf64Sym>());
    for s in &syms {
        // SAFETY: plain repr(C) integer struct.
        symtab_bytes.extend_from_slice(unsafe {
            std::slice::from_raw_parts(
                s as *const Elf64Sym as *const u8,
                mem::size_of::<Elf64Sym>(),
            )
        });
    }

    writer.add_section(
        ".aot",
        SHT_PROGBITS,
        SHF_ALLOC | SHF_EXECINSTR | SHF_WRITE,
        0,
        0,
        0x10,
        0,
        rt.code_arena.as_slice().to_vec(),
    );
    writer.add_section(
        ".aottab",
        SHT_PROGBITS,
        SHF_ALLOC | SHF_WRITE,
        0,
        0,
        0x1000,
        0,
        aottab,
    );
    writer.add_section(
        ".symtab",
        SHT_SYMTAB,
        0,
        4, // .strtab
        1, // first global symbol
        8,
        mem::size_of::<Elf64Sym>() as u64,
        symtab_bytes,
    );
    writer.add_section(".strtab", SHT_STRTAB, 0, 0, 0, 1, 0, stra.bytes().to_vec());

    let obj_path = cache_path(guest, AOT_O_EXTENSION);
    let so_path = cache_path(guest, AOT_SO_EXTENSION);
    writer
        .save(&obj_path)
        .unwrap_or_else(|e| panic!("aot: failed to write {}: {e}", obj_path.display()));

    let status = Command::new("ld")
        .args(["-z", "relro", "--hash-style=gnu", "-m", "elf_x86_64", "-shared", "-o"])
        .arg(&so_path)
        .arg(&obj_path)
        .status()
        .unwrap_or_else(|e| panic!("aot: failed to spawn ld: {e}"));
    if !status.success() {
        panic!("aot: ld failed with {status}");
    }

    fixup::fixup_aottab(&so_path);
    log::debug!(
        target: "aot",
        "aot object ready: {} region(s), {} bytes of code",
        rt.region_syms.len(),
        rt.code_arena.used()
    );
}
