//! Post-link fixup: rewrite every `.aottab` record's `host_vaddr`
//! with the linker-assigned virtual address of its `_x<hex ip>`
//! symbol, in place at the table's file offset. After this pass the
//! shared object carries a dense guest-IP → virtual-address map.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use crate::elf::{Elf64Sym, ElfFile};
use crate::{
    make_aot_symbol, AotSymbol, AOT_SYMBOL_SIZE, AOT_SYM_AOTTAB, AOT_TAB_HEADER_SIZE,
};

/// Locate `_aot_tab` in the linked object; returns the table's
/// file offset and its entry count.
fn locate_aottab(elf: &ElfFile, syms: &HashMap<String, Elf64Sym>) -> (usize, u64) {
    let tab_sym = syms
        .get(AOT_SYM_AOTTAB)
        .unwrap_or_else(|| panic!("aot: missing {AOT_SYM_AOTTAB} symbol"));
    let offs = elf.vaddr_to_file_offset(tab_sym.st_shndx, tab_sym.st_value);
    let n_sym = u64::from_le_bytes(elf.data[offs..offs + 8].try_into().unwrap());
    (offs, n_sym)
}

/// Read the link-time virtual address of one symbol (also used by
/// the boot loader to compute the load bias).
pub fn symbol_vaddr(so_path: &Path, name: &str) -> Option<u64> {
    let elf = ElfFile::open(so_path).ok()?;
    elf.symbols()
        .into_iter()
        .find(|(n, _)| n == name)
        .map(|(_, s)| s.st_value)
}

pub fn fixup_aottab(so_path: &Path) {
    let elf = ElfFile::open(so_path)
        .unwrap_or_else(|e| panic!("aot: cannot reopen {}: {e}", so_path.display()));
    let syms: HashMap<String, Elf64Sym> = elf.symbols().into_iter().collect();
    let (tab_offs, n_sym) = locate_aottab(&elf, &syms);

    let mut patched = Vec::with_capacity(n_sym as usize * AOT_SYMBOL_SIZE);
    for i in 0..n_sym as usize {
        let rec_offs = tab_offs + AOT_TAB_HEADER_SIZE + i * AOT_SYMBOL_SIZE;
        let rec = AotSymbol::from_bytes(&elf.data[rec_offs..rec_offs + AOT_SYMBOL_SIZE]);
        let name = make_aot_symbol(rec.gip);
        let func = syms
            .get(&name)
            .unwrap_or_else(|| panic!("aot: fixup: missing symbol {name}"));
        patched.extend_from_slice(
            &AotSymbol {
                gip: rec.gip,
                host_vaddr: func.st_value,
            }
            .to_bytes(),
        );
    }

    let mut file = OpenOptions::new()
        .write(true)
        .open(so_path)
        .unwrap_or_else(|e| panic!("aot: cannot open {} for fixup: {e}", so_path.display()));
    file.seek(SeekFrom::Start((tab_offs + AOT_TAB_HEADER_SIZE) as u64))
        .and_then(|_| file.write_all(&patched))
        .unwrap_or_else(|e| panic!("aot: fixup write failed: {e}"));
    log::debug!(target: "aot", "fixup: rewrote {n_sym} table entries");
}
