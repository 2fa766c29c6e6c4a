//! Execution profile - for each guest page, a bitmap of the
//! instruction offsets that started a translation. Recorded during
//! JIT runs through the tcache install hook and consumed by the
//! AOT pipeline on a later run.

use std::cell::UnsafeCell;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::{cache_path, PROF_EXTENSION};

pub const PAGE_INSNS: usize = qdbt_mmu::PAGE_SIZE / 4;
pub const BITMAP_WORDS: usize = PAGE_INSNS / 64;

const PROF_MAGIC: u32 = 0x5150_4f46; // "QPOF"

/// One profiled guest page.
#[derive(Debug, Clone)]
pub struct PageData {
    pub pageno: u32,
    pub executed: [u64; BITMAP_WORDS],
}

impl PageData {
    pub fn new(pageno: u32) -> Self {
        Self {
            pageno,
            executed: [0; BITMAP_WORDS],
        }
    }

    /// Instruction index within the page → byte offset.
    pub const fn idx2po(idx: u32) -> u32 {
        idx * 4
    }

    pub fn set(&mut self, page_offs: u32) {
        let idx = (page_offs / 4) as usize;
        self.executed[idx / 64] |= 1 << (idx % 64);
    }

    pub fn test(&self, idx: usize) -> bool {
        self.executed[idx / 64] & (1 << (idx % 64)) != 0
    }
}

struct Profile {
    pages: BTreeMap<u32, PageData>,
    path: PathBuf,
}

struct ProfileCell(UnsafeCell<Option<Profile>>);

// SAFETY: single-threaded core.
unsafe impl Sync for ProfileCell {}

static PROFILE: ProfileCell = ProfileCell(UnsafeCell::new(None));

/// Start recording for this guest binary.
pub fn init(guest: &Path) {
    // SAFETY: single-threaded init.
    let cell = unsafe { &mut *PROFILE.0.get() };
    *cell = Some(Profile {
        pages: BTreeMap::new(),
        path: cache_path(guest, PROF_EXTENSION),
    });
}

/// Mark one translated entry IP. No-op when recording is off.
pub fn on_translate(ip: u32) {
    // SAFETY: single-threaded access.
    let Some(prof) = (unsafe { (*PROFILE.0.get()).as_mut() }) else {
        return;
    };
    let (pageno, po) = qdbt_mmu::page_split(ip);
    prof.pages
        .entry(pageno)
        .or_insert_with(|| PageData::new(pageno))
        .set(po);
}

/// Persist the recorded profile, merging with a previous one.
pub fn save() -> io::Result<()> {
    // SAFETY: single-threaded access.
    let Some(prof) = (unsafe { (*PROFILE.0.get()).as_mut() }) else {
        return Ok(());
    };
    if let Ok(old) = load_file(&prof.path) {
        for page in old {
            let entry = prof
                .pages
                .entry(page.pageno)
                .or_insert_with(|| PageData::new(page.pageno));
            for (w, old_w) in entry.executed.iter_mut().zip(page.executed) {
                *w |= old_w;
            }
        }
    }

    let mut buf = Vec::new();
    buf.extend_from_slice(&PROF_MAGIC.to_le_bytes());
    buf.extend_from_slice(&(prof.pages.len() as u32).to_le_bytes());
    for page in prof.pages.values() {
        buf.extend_from_slice(&page.pageno.to_le_bytes());
        for w in page.executed {
            buf.extend_from_slice(&w.to_le_bytes());
        }
    }
    fs::File::create(&prof.path)?.write_all(&buf)?;
    log::debug!(target: "aot", "profile: saved {} page(s)", prof.pages.len());
    Ok(())
}

pub fn has_profile(guest: &Path) -> bool {
    cache_path(guest, PROF_EXTENSION).exists()
}

/// Read the profile recorded for this guest binary.
pub fn load(guest: &Path) -> io::Result<Vec<PageData>> {
    load_file(&cache_path(guest, PROF_EXTENSION))
}

fn load_file(path: &Path) -> io::Result<Vec<PageData>> {
    let mut data = Vec::new();
    fs::File::open(path)?.read_to_end(&mut data)?;
    let bad = |m: &str| io::Error::new(io::ErrorKind::InvalidData, m.to_string());

    if data.len() < 8 || u32::from_le_bytes(data[0..4].try_into().unwrap()) != PROF_MAGIC {
        return Err(bad("bad profile magic"));
    }
    let n = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
    let rec = 4 + BITMAP_WORDS * 8;
    if data.len() < 8 + n * rec {
        return Err(bad("truncated profile"));
    }

    let mut pages = Vec::with_capacity(n);
    for i in 0..n {
        let base = 8 + i * rec;
        let mut page =
            PageData::new(u32::from_le_bytes(data[base..base + 4].try_into().unwrap()));
        for w in 0..BITMAP_WORDS {
            let o = base + 4 + w * 8;
            page.executed[w] = u64::from_le_bytes(data[o..o + 8].try_into().unwrap());
        }
        pages.push(page);
    }
    Ok(pages)
}
