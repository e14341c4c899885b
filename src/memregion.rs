//! Safe wrapper over a single physical `/dev/mem` mapping.
//!
//! Replaces the source's raw `mmap()`/pointer-plus-remainder arithmetic
//! with a bounded read-only view backed by `memmap2`, which already
//! handles aligning the mapping to the page enclosing an arbitrary offset
//! and exposing a slice starting exactly at the requested byte. The
//! mapping is released on `Drop`.

use std::fs::{File, OpenOptions};
use std::path::Path;

use anyhow::{Context, Result};
use memmap2::{Mmap, MmapOptions};

/// One mapped framebuffer candidate region.
///
/// The region is never written despite `/dev/mem` being opened read/write
/// (retained for parity with the source) — the mapping itself is
/// read-only.
pub struct MemRegion {
    mmap: Mmap,
}

impl MemRegion {
    /// Open `/dev/mem` and map `len` bytes starting at physical byte
    /// `offset`, page-aligning internally.
    pub fn map(dev_mem_path: &Path, offset: u64, len: usize) -> Result<Self> {
        let file: File = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dev_mem_path)
            .with_context(|| format!("failed to open {}", dev_mem_path.display()))?;

        // Safety: mapping arbitrary physical memory is inherently unsafe;
        // the caller guarantees `offset`/`len` name a valid framebuffer
        // region for this device. The resulting mapping is only ever read.
        let mmap = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(len)
                .map(&file)
                .with_context(|| format!("mmap failed at offset {offset:#x}, len {len}"))?
        };

        Ok(Self { mmap })
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap
    }

    /// The first `n` bytes of the region, used by the header-hash change
    /// detector (first `2 * FRAME_WIDTH` bytes).
    #[must_use]
    pub fn header(&self, n: usize) -> &[u8] {
        &self.mmap[..n.min(self.mmap.len())]
    }
}
