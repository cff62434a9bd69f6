//! Owns the mapped shared-memory region: the data file (header + slot
//! table + SMA arena) and the lock file, and wires the `layout`, `lock`
//! and `sma` modules together into one handle.
//!
//! Grounded on the teacher's `shm::region::ShmRegion` — same two-file
//! layout (`<name>.data`, `<name>.lock`) under `/dev/shm`, same
//! create/open/create_or_open trio, same parameter-mismatch-triggers-
//! recreate policy.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::layout::{self, Header, MAGIC, NONE};
use crate::lock::{ShmMutex, ShmRwLock, LOCK_SIZE};
use crate::sma::MmapSma;

fn shm_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        PathBuf::from("/dev/shm")
    } else {
        std::env::temp_dir().join("userdata_cache")
    }
}

/// Parameters fixed at region creation time; `create_or_open` recreates
/// the region if an existing one was built with different parameters.
#[derive(Debug, Clone, Copy)]
pub struct RegionParams {
    pub nslots: u32,
    pub sma_size: u32,
    pub gc_ttl: u32,
    pub ttl: u32,
    pub smart: u32,
    pub defend: bool,
    pub max_key_size: u32,
    pub max_value_size: u32,
}

pub struct ShmRegion {
    pub mmap: MmapMut,
    pub path: PathBuf,
    pub lock_mmap: MmapMut,
    pub lock_path: PathBuf,
}

impl ShmRegion {
    pub fn create(name: &str, params: RegionParams) -> io::Result<Self> {
        let dir = shm_dir();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }

        let arena_base = layout::arena_offset(params.nslots);
        let total_size = arena_base + params.sma_size as usize;

        let data_path = dir.join(format!("{name}.data"));
        let lock_path = dir.join(format!("{name}.lock"));

        let data_file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&data_path)?;
        data_file.set_len(total_size as u64)?;

        let lock_file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&lock_path)?;
        lock_file.set_len(LOCK_SIZE as u64)?;

        // Safety: we just created these files and hold them exclusively.
        let mut mmap = unsafe { MmapMut::map_mut(&data_file)? };
        let mut lock_mmap = unsafe { MmapMut::map_mut(&lock_file)? };

        mmap.fill(0);
        lock_mmap.fill(0);

        let header = unsafe { &mut *(mmap.as_mut_ptr() as *mut Header) };
        header.magic = MAGIC;
        header.stime = crate::clock::now_unix();
        // nhits/nmisses are atomics; `mmap.fill(0)` above already zeroed them.
        header.ninserts = 0;
        header.nexpunges = 0;
        header.mem_size = 0;
        header.gc = NONE;
        header.lastkey_hash = 0;
        header.lastkey_len = 0;
        header.lastkey_mtime = 0;
        header.lastkey_owner = 0;
        header.sma_free_head = NONE;
        header.state = 0;
        header.nslots = params.nslots;
        header.gc_ttl = params.gc_ttl;
        header.ttl = params.ttl;
        header.smart = params.smart;
        header.defend = params.defend as u32;
        header.max_key_size = params.max_key_size;
        header.max_value_size = params.max_value_size;

        let slots_base = layout::slots_offset();
        for i in 0..params.nslots as usize {
            let offset = slots_base + i * layout::SLOT_WORD_SIZE;
            let word = unsafe { &mut *(mmap.as_mut_ptr().add(offset) as *mut i64) };
            *word = NONE;
        }

        unsafe {
            ShmRwLock::init(lock_mmap.as_mut_ptr())?;
            ShmMutex::init(header.sma_lock.as_mut_ptr())?;
            let free_head_ptr = &mut header.sma_free_head as *mut i64;
            let sma_lock_ptr = header.sma_lock.as_mut_ptr();
            let sma = MmapSma::new(mmap.as_mut_ptr(), arena_base, params.sma_size as usize, free_head_ptr, sma_lock_ptr);
            sma.init();
        }

        mmap.flush()?;
        lock_mmap.flush()?;

        Ok(ShmRegion {
            mmap,
            path: data_path,
            lock_mmap,
            lock_path,
        })
    }

    pub fn open(name: &str) -> io::Result<Self> {
        let dir = shm_dir();
        let data_path = dir.join(format!("{name}.data"));
        let lock_path = dir.join(format!("{name}.lock"));
        Self::open_paths(&data_path, &lock_path)
    }

    fn open_paths(data_path: &Path, lock_path: &Path) -> io::Result<ShmRegion> {
        let data_file = fs::OpenOptions::new().read(true).write(true).open(data_path)?;
        let lock_file = fs::OpenOptions::new().read(true).write(true).open(lock_path)?;

        let mmap = unsafe { MmapMut::map_mut(&data_file)? };
        let lock_mmap = unsafe { MmapMut::map_mut(&lock_file)? };

        let header = unsafe { &*(mmap.as_ptr() as *const Header) };
        if header.magic != MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad magic in cache region"));
        }

        Ok(ShmRegion {
            mmap,
            path: data_path.to_path_buf(),
            lock_mmap,
            lock_path: lock_path.to_path_buf(),
        })
    }

    pub fn create_or_open(name: &str, params: RegionParams) -> io::Result<Self> {
        let dir = shm_dir();
        let data_path = dir.join(format!("{name}.data"));
        let lock_path = dir.join(format!("{name}.lock"));

        if data_path.exists() && lock_path.exists() {
            match Self::open_paths(&data_path, &lock_path) {
                Ok(region) => {
                    let header = region.header();
                    if header.nslots == params.nslots
                        && header.max_key_size == params.max_key_size
                        && header.max_value_size == params.max_value_size
                    {
                        return Ok(region);
                    }
                    drop(region);
                }
                Err(_) => {}
            }
        }

        Self::create(name, params)
    }

    pub fn header(&self) -> &Header {
        unsafe { &*(self.mmap.as_ptr() as *const Header) }
    }

    pub fn header_mut(&mut self) -> &mut Header {
        unsafe { &mut *(self.mmap.as_mut_ptr() as *mut Header) }
    }

    pub fn lock(&self) -> ShmRwLock {
        unsafe { ShmRwLock::from_existing(self.lock_mmap.as_ptr() as *mut u8) }
    }

    /// Build an `MmapSma` over this region's arena. The returned value
    /// borrows nothing; it recomputes its base pointer and free-head
    /// pointer from `self` each time, since both live in this mapping.
    pub fn sma(&self) -> MmapSma {
        let nslots = self.header().nslots;
        let arena_base = layout::arena_offset(nslots);
        let sma_size = self.mmap.len() - arena_base;
        let base = self.mmap.as_ptr() as *mut u8;
        let header_ptr = base as *mut Header;
        let free_head_ptr = unsafe { &mut (*header_ptr).sma_free_head as *mut i64 };
        let sma_lock_ptr = unsafe { (*header_ptr).sma_lock.as_mut_ptr() };
        unsafe { MmapSma::new(base, arena_base, sma_size, free_head_ptr, sma_lock_ptr) }
    }

    pub fn base_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    pub fn base_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    pub fn unlink(&self) -> io::Result<()> {
        let _ = fs::remove_file(&self.path);
        let _ = fs::remove_file(&self.lock_path);
        Ok(())
    }
}
