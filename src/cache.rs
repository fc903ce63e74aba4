//! Write-back register cache.
//!
//! Each wave caches the contiguous hwreg/ttmp window of its context save
//! record so that repeated register traffic while the wave is stopped does
//! not round-trip through the driver. The cache is write-back: writes land
//! in the local buffer and mark it dirty; the owning queue flushes every
//! dirty cache back to global memory before the driver resumes the queue.
//!
//! The backing bytes are fetched lazily: `reset` only records the new
//! window, and the first `read` or `write` after it pulls the window from
//! global memory.

use crate::error::{fatal, Result};
use crate::mem::ProcessMemory;
use crate::types::GlobalAddress;
use std::sync::atomic::{AtomicU64, Ordering};

/// Caching policy for a register window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Accesses bypass the cache and go straight to global memory.
    Uncached,
    /// Writes land in the cache and are flushed when the queue resumes.
    WriteBack,
}

pub struct RegisterCache {
    /// Monotonic id, used to correlate log lines.
    id: u64,
    policy: CachePolicy,
    base: GlobalAddress,
    len: usize,
    bytes: Vec<u8>,
    fetched: bool,
    dirty: bool,
}

impl RegisterCache {
    pub fn new(policy: CachePolicy) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            policy,
            base: 0,
            len: 0,
            bytes: Vec::new(),
            fetched: false,
            dirty: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether `[address, address + len)` lies entirely inside the window.
    pub fn contains(&self, address: GlobalAddress, len: usize) -> bool {
        self.len != 0
            && address >= self.base
            && address + len as u64 <= self.base + self.len as u64
    }

    /// Discard the cached contents and adopt a new window. The next access
    /// re-fetches from global memory.
    pub fn reset(&mut self, base: GlobalAddress, len: usize) {
        assert!(!self.dirty, "resetting a dirty register cache");
        log::trace!(
            "cache_{}: reset to [{:#x}..{:#x})",
            self.id,
            base,
            base + len as u64
        );
        self.base = base;
        self.len = len;
        self.fetched = false;
        self.bytes.clear();
    }

    /// Move the window to a new base address without invalidating the
    /// cached contents. Used when a stopped wave's context save record
    /// relocated but its saved state did not change.
    pub fn relocate(&mut self, base: GlobalAddress) {
        if base != self.base {
            log::trace!("cache_{}: relocate {:#x} -> {:#x}", self.id, self.base, base);
            self.base = base;
        }
    }

    fn fetch(&mut self, memory: &mut dyn ProcessMemory) -> Result<()> {
        if self.fetched {
            return Ok(());
        }
        self.bytes.resize(self.len, 0);
        memory
            .read_global_memory(self.base, &mut self.bytes)
            .map_err(|_| fatal!("cache_{}: could not fetch [{:#x}..{:#x})", self.id, self.base, self.base + self.len as u64))?;
        self.fetched = true;
        Ok(())
    }

    /// Read `dst.len()` bytes at `address` from the window. The range must
    /// be contained; failure to fetch the backing bytes is fatal.
    pub fn read(
        &mut self,
        memory: &mut dyn ProcessMemory,
        address: GlobalAddress,
        dst: &mut [u8],
    ) -> Result<()> {
        assert!(self.contains(address, dst.len()), "read outside the cached window");
        self.fetch(memory)?;
        let offset = (address - self.base) as usize;
        dst.copy_from_slice(&self.bytes[offset..offset + dst.len()]);
        Ok(())
    }

    /// Write `src` at `address` into the window and mark the cache dirty.
    pub fn write(
        &mut self,
        memory: &mut dyn ProcessMemory,
        address: GlobalAddress,
        src: &[u8],
    ) -> Result<()> {
        assert!(self.contains(address, src.len()), "write outside the cached window");
        self.fetch(memory)?;
        let offset = (address - self.base) as usize;
        self.bytes[offset..offset + src.len()].copy_from_slice(src);
        self.dirty = true;
        Ok(())
    }

    /// Write the dirty window back to global memory. Failure is fatal: the
    /// wave would resume with stale architected state.
    pub fn flush(&mut self, memory: &mut dyn ProcessMemory) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        log::trace!(
            "cache_{}: flush [{:#x}..{:#x})",
            self.id,
            self.base,
            self.base + self.len as u64
        );
        memory
            .write_global_memory(self.base, &self.bytes)
            .map_err(|_| fatal!("cache_{}: could not flush [{:#x}..{:#x})", self.id, self.base, self.base + self.len as u64))?;
        self.dirty = false;
        Ok(())
    }
}

impl std::fmt::Debug for RegisterCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterCache")
            .field("id", &self.id)
            .field("base", &format_args!("{:#x}", self.base))
            .field("len", &self.len)
            .field("fetched", &self.fetched)
            .field("dirty", &self.dirty)
            .finish()
    }
}
