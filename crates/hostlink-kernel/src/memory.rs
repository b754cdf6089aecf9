//! Kernel memory
//!
//! Each instance owns a host-side byte heap that both sides address through
//! [`MemoryHandle`] offsets. Inputs, outputs, variables and host function
//! arguments all live here, so the guest's own linear memory never has to be
//! shared with the host.

use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::error::{KernelError, KernelResult};
use crate::types::MemoryHandle;

/// Memory page size (64KB), same as a WASM page
pub const PAGE_SIZE: u64 = 65536;

/// First usable offset; everything below it keeps handle 0 invalid.
const HEAP_BASE: u64 = 8;

/// Round up to 8 bytes; `None` when the rounded size does not fit in `u64`.
fn align_size(size: u64) -> Option<u64> {
    size.max(1).checked_add(7).map(|s| s & !7)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Region {
    start: u64,
    size: u64,
}

impl Region {
    fn end(&self) -> u64 {
        self.start + self.size
    }
}

#[derive(Debug, Clone, Copy)]
struct Block {
    /// Reserved, aligned size.
    size: u64,
    /// Length requested by the caller.
    len: u64,
}

/// Allocation statistics for one kernel memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub pages: u64,
    pub live_blocks: usize,
    pub free_blocks: usize,
    pub allocated_bytes: u64,
    pub peak_bytes: u64,
}

/// Host-side heap with first-fit reuse and coalescing of freed blocks.
#[derive(Debug)]
pub struct PluginMemory {
    data: Vec<u8>,
    max_pages: u64,
    top: u64,
    blocks: BTreeMap<u64, Block>,
    free_list: Vec<Region>,
    allocated_bytes: u64,
    peak_bytes: u64,
}

impl PluginMemory {
    pub fn new(max_pages: u64) -> Self {
        Self {
            data: vec![0u8; PAGE_SIZE as usize],
            max_pages: max_pages.max(1),
            top: HEAP_BASE,
            blocks: BTreeMap::new(),
            free_list: Vec::new(),
            allocated_bytes: 0,
            peak_bytes: 0,
        }
    }

    pub fn pages(&self) -> u64 {
        self.data.len() as u64 / PAGE_SIZE
    }

    /// Allocate a zeroed block of `len` bytes.
    pub fn alloc(&mut self, len: u64) -> KernelResult<MemoryHandle> {
        let size = align_size(len).ok_or(KernelError::AllocationFailed(len))?;
        let start = match self.take_free(size) {
            Some(start) => start,
            None => self.bump(size, len)?,
        };

        self.data[start as usize..(start + size) as usize].fill(0);
        self.blocks.insert(start, Block { size, len });
        self.allocated_bytes += size;
        self.peak_bytes = self.peak_bytes.max(self.allocated_bytes);

        Ok(MemoryHandle(start))
    }

    fn take_free(&mut self, size: u64) -> Option<u64> {
        let idx = self.free_list.iter().position(|r| r.size >= size)?;
        let region = self.free_list[idx];

        if region.size > size {
            self.free_list[idx] = Region {
                start: region.start + size,
                size: region.size - size,
            };
        } else {
            self.free_list.remove(idx);
        }
        Some(region.start)
    }

    fn bump(&mut self, size: u64, len: u64) -> KernelResult<u64> {
        let start = self.top;
        let end = start
            .checked_add(size)
            .ok_or(KernelError::AllocationFailed(len))?;

        if end > self.data.len() as u64 {
            let needed_pages = end.div_ceil(PAGE_SIZE);
            if needed_pages > self.max_pages {
                return Err(KernelError::AllocationFailed(len));
            }
            debug!(
                from = self.pages(),
                to = needed_pages,
                "Growing kernel memory"
            );
            self.data.resize((needed_pages * PAGE_SIZE) as usize, 0);
        }

        self.top = end;
        Ok(start)
    }

    /// Release a block. Unknown handles are ignored.
    pub fn free(&mut self, handle: MemoryHandle) {
        let Some(block) = self.blocks.remove(&handle.0) else {
            if !handle.is_null() {
                warn!(handle = %handle, "Free of unknown kernel memory handle");
            }
            return;
        };
        self.allocated_bytes = self.allocated_bytes.saturating_sub(block.size);

        let mut coalesced = Region {
            start: handle.0,
            size: block.size,
        };
        let mut i = 0;
        while i < self.free_list.len() {
            let region = self.free_list[i];
            if region.end() == coalesced.start {
                coalesced = Region {
                    start: region.start,
                    size: region.size + coalesced.size,
                };
                self.free_list.remove(i);
            } else if coalesced.end() == region.start {
                coalesced.size += region.size;
                self.free_list.remove(i);
            } else {
                i += 1;
            }
        }

        if coalesced.end() == self.top {
            self.top = coalesced.start;
        } else {
            self.free_list.push(coalesced);
        }
    }

    /// Length of a live block, 0 for anything else.
    pub fn length(&self, handle: MemoryHandle) -> u64 {
        self.blocks.get(&handle.0).map(|b| b.len).unwrap_or(0)
    }

    pub fn contains(&self, handle: MemoryHandle) -> bool {
        self.blocks.contains_key(&handle.0)
    }

    /// Bytes of a live block.
    pub fn bytes(&self, handle: MemoryHandle) -> Option<&[u8]> {
        let block = self.blocks.get(&handle.0)?;
        let start = handle.0 as usize;
        Some(&self.data[start..start + block.len as usize])
    }

    pub fn bytes_mut(&mut self, handle: MemoryHandle) -> Option<&mut [u8]> {
        let block = self.blocks.get(&handle.0)?;
        let start = handle.0 as usize;
        Some(&mut self.data[start..start + block.len as usize])
    }

    /// Allocate a block holding a copy of `bytes`.
    pub fn alloc_bytes(&mut self, bytes: &[u8]) -> KernelResult<MemoryHandle> {
        let handle = self.alloc(bytes.len() as u64)?;
        let start = handle.0 as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(handle)
    }

    /// The whole heap, indexed by handle offset.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.top as usize]
    }

    fn check(&self, offset: u64, size: u64) -> KernelResult<usize> {
        match offset.checked_add(size) {
            Some(end) if offset >= HEAP_BASE && end <= self.top => Ok(offset as usize),
            _ => Err(KernelError::MemoryOutOfBounds { offset, size }),
        }
    }

    pub fn read(&self, offset: u64, len: u64) -> KernelResult<&[u8]> {
        let start = self.check(offset, len)?;
        Ok(&self.data[start..start + len as usize])
    }

    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> KernelResult<()> {
        let start = self.check(offset, bytes.len() as u64)?;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn load_u8(&self, offset: u64) -> KernelResult<u8> {
        let start = self.check(offset, 1)?;
        Ok(self.data[start])
    }

    pub fn store_u8(&mut self, offset: u64, value: u8) -> KernelResult<()> {
        let start = self.check(offset, 1)?;
        self.data[start] = value;
        Ok(())
    }

    pub fn load_u64(&self, offset: u64) -> KernelResult<u64> {
        let start = self.check(offset, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.data[start..start + 8]);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn store_u64(&mut self, offset: u64, value: u64) -> KernelResult<()> {
        let start = self.check(offset, 8)?;
        self.data[start..start + 8].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Drop every block. All previously issued handles become invalid.
    pub fn reset(&mut self) {
        let used = self.top as usize;
        self.data[..used].fill(0);
        self.top = HEAP_BASE;
        self.blocks.clear();
        self.free_list.clear();
        self.allocated_bytes = 0;
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            pages: self.pages(),
            live_blocks: self.blocks.len(),
            free_blocks: self.free_list.len(),
            allocated_bytes: self.allocated_bytes,
            peak_bytes: self.peak_bytes,
        }
    }
}

impl Default for PluginMemory {
    fn default() -> Self {
        Self::new(1024)
    }
}
