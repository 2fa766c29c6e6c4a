//! AOT artifact properties: the object format, symbol closure, and
//! the table fixup.

use std::mem;
use std::path::PathBuf;

use qdbt_aot::elf::{
    sym_info, Elf64Sym, ElfFile, ObjWriter, StrTab, SHF_ALLOC, SHF_EXECINSTR,
    SHF_WRITE, SHT_PROGBITS, SHT_STRTAB, SHT_SYMTAB, STB_GLOBAL, STT_FUNC, STT_OBJECT,
};
use qdbt_aot::{
    fixup, make_aot_symbol, AotSymbol, AOT_SYMBOL_SIZE, AOT_SYM_AOTTAB,
    AOT_TAB_HEADER_SIZE,
};

fn tmp_path(name: &str) -> PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("qdbt-test-{}-{name}", std::process::id()));
    p
}

#[test]
fn aot_symbol_record_roundtrip() {
    let sym = AotSymbol {
        gip: 0x10008,
        host_vaddr: 0xdead_beef_1234,
    };
    let bytes = sym.to_bytes();
    assert_eq!(bytes.len(), AOT_SYMBOL_SIZE);
    assert_eq!(AotSymbol::from_bytes(&bytes), sym);
}

#[test]
fn symbol_names_have_no_leading_zeros() {
    assert_eq!(make_aot_symbol(0x10000), "_x10000");
    assert_eq!(make_aot_symbol(0xac), "_xac");
}

/// Build a small object in the real pipeline shape: two regions,
/// `.aot`/`.aottab`/`.symtab`/`.strtab`.
fn write_test_object(path: &PathBuf, gips: &[(u32, u64, u64)]) {
    let mut writer = ObjWriter::new();
    let mut stra = StrTab::new();

    let mut syms: Vec<Elf64Sym> = vec![Elf64Sym::default()];
    for &(gip, offs, size) in gips {
        syms.push(Elf64Sym {
            st_name: stra.add(&make_aot_symbol(gip)),
            st_info: sym_info(STB_GLOBAL, STT_FUNC),
            st_other: 0,
            st_shndx: 1,
            st_value: offs,
            st_size: size,
        });
    }
    // Table entries start out unresolved; the fixup pass supplies
    // the symbol addresses.
    let mut aottab = Vec::new();
    aottab.extend_from_slice(&(gips.len() as u64).to_le_bytes());
    for &(gip, _, _) in gips {
        aottab.extend_from_slice(&AotSymbol { gip, host_vaddr: 0 }.to_bytes());
    }
    syms.push(Elf64Sym {
        st_name: stra.add(AOT_SYM_AOTTAB),
        st_info: sym_info(STB_GLOBAL, STT_OBJECT),
        st_other: 0,
        st_shndx: 2,
        st_value: 0,
        st_size: aottab.len() as u64,
    });

    let mut symtab = Vec::new();
    for s in &syms {
        // SAFETY: plain repr(C) integer struct.
        symtab.extend_from_slice(unsafe {
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
        vec![0x90; 64],
    );
    writer.add_section(".aottab", SHT_PROGBITS, SHF_ALLOC | SHF_WRITE, 0, 0, 0x1000, 0, aottab);
    writer.add_section(
        ".symtab",
        SHT_SYMTAB,
        0,
        4,
        1,
        8,
        mem::size_of::<Elf64Sym>() as u64,
        symtab,
    );
    writer.add_section(".strtab", SHT_STRTAB, 0, 0, 0, 1, 0, stra.bytes().to_vec());
    writer.save(path).unwrap();
}

#[test]
fn object_symbols_cover_every_table_entry() {
    let path = tmp_path("closure.o");
    let regions = [(0x10000u32, 0u64, 32u64), (0x10008, 32, 32)];
    write_test_object(&path, &regions);

    let elf = ElfFile::open(&path).unwrap();
    let syms = elf.symbols();
    for &(gip, _, _) in &regions {
        let name = make_aot_symbol(gip);
        assert!(
            syms.iter().any(|(n, _)| *n == name),
            "missing symbol {name}"
        );
    }
    assert!(syms.iter().any(|(n, _)| n == AOT_SYM_AOTTAB));
    std::fs::remove_file(&path).ok();
}

#[test]
fn fixup_rewrites_table_with_symbol_addresses() {
    let path = tmp_path("fixup.o");
    // Table initially carries section offsets; fixup must replace
    // them with each symbol's (here: link-less) st_value.
    let regions = [(0x10000u32, 0x40u64, 32u64), (0x10008, 0x60, 32)];
    write_test_object(&path, &regions);

    fixup::fixup_aottab(&path);

    let elf = ElfFile::open(&path).unwrap();
    let syms = elf.symbols();
    let (_, tab_sym) = syms
        .iter()
        .find(|(n, _)| n == AOT_SYM_AOTTAB)
        .cloned()
        .unwrap();
    let tab_offs = elf.vaddr_to_file_offset(tab_sym.st_shndx, tab_sym.st_value);
    let n = u64::from_le_bytes(elf.data[tab_offs..tab_offs + 8].try_into().unwrap());
    assert_eq!(n, 2);
    for (i, &(gip, offs, _)) in regions.iter().enumerate() {
        let rec_offs = tab_offs + AOT_TAB_HEADER_SIZE + i * AOT_SYMBOL_SIZE;
        let rec = AotSymbol::from_bytes(&elf.data[rec_offs..rec_offs + AOT_SYMBOL_SIZE]);
        assert_eq!(rec.gip, gip);
        assert_eq!(rec.host_vaddr, offs, "fixed up to the symbol address");
    }
    std::fs::remove_file(&path).ok();
}
