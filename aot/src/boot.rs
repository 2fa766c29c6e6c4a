//! AOT boot: map the precompiled shared object and install its
//! regions into the code cache before the first guest instruction
//! runs.

use std::ffi::CString;
use std::path::Path;

use qdbt_tcache::{self as tcache, TCode};

use crate::fixup::symbol_vaddr;
use crate::{cache_path, AotSymbol, AOT_SYMBOL_SIZE, AOT_SO_EXTENSION, AOT_SYM_AOTTAB, AOT_TAB_HEADER_SIZE};

/// Load `<guest>.aot.so` if present and prepopulate the code cache
/// from its table. Returns the number of installed TBs.
pub fn boot_aot(guest: &Path) -> usize {
    let so_path = cache_path(guest, AOT_SO_EXTENSION);
    if !so_path.exists() {
        return 0;
    }

    let Some(link_vaddr) = symbol_vaddr(&so_path, AOT_SYM_AOTTAB) else {
        log::warn!(target: "aot", "boot: {} has no {AOT_SYM_AOTTAB}", so_path.display());
        return 0;
    };

    let cpath = CString::new(so_path.to_string_lossy().as_bytes()).unwrap();
    // SAFETY: plain dlopen of a file path.
    let handle = unsafe { libc::dlopen(cpath.as_ptr(), libc::RTLD_NOW) };
    if handle.is_null() {
        log::warn!(target: "aot", "boot: dlopen {} failed", so_path.display());
        return 0;
    }
    let sym_name = CString::new(AOT_SYM_AOTTAB).unwrap();
    // SAFETY: handle is a live dlopen handle.
    let tab = unsafe { libc::dlsym(handle, sym_name.as_ptr()) };
    assert!(!tab.is_null(), "aot: boot: dlsym {AOT_SYM_AOTTAB} failed");

    // The table records link-time addresses; rebase by the load bias.
    let bias = tab as usize - link_vaddr as usize;

    // SAFETY: the table was written by the fixup pass: a header
    // followed by n_sym records.
    let n_sym = unsafe { (tab as *const u64).read_unaligned() } as usize;
    let mut installed = 0;
    for i in 0..n_sym {
        let rec = unsafe {
            let p = (tab as *const u8).add(AOT_TAB_HEADER_SIZE + i * AOT_SYMBOL_SIZE);
            AotSymbol::from_bytes(std::slice::from_raw_parts(p, AOT_SYMBOL_SIZE))
        };
        tcache::insert(
            rec.gip,
            TCode {
                ptr: (bias + rec.host_vaddr as usize) as *mut u8,
                size: 0,
            },
        );
        installed += 1;
    }
    log::debug!(target: "aot", "boot: installed {installed} aot TB(s)");
    installed
}
