// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use file_mmap::FileMapping;
use file_mmap::MapError;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

/// A span of the DMA address space backed by a range of a file descriptor.
///
/// The region is mapped into the process when it is registered and stays
/// mapped at the same virtual address until it is removed.
#[derive(Debug)]
pub struct MemoryRegion {
    dma_addr: u64,
    size: u64,
    mapping: FileMapping,
    refcount: AtomicU32,
}

impl MemoryRegion {
    pub(crate) fn new(
        dma_addr: u64,
        size: u64,
        fd: impl Into<OwnedFd>,
        offset: u64,
        len: usize,
    ) -> Result<Self, MapError> {
        Ok(Self {
            dma_addr,
            size,
            mapping: FileMapping::new(fd, offset, len)?,
            refcount: AtomicU32::new(0),
        })
    }

    /// The DMA address of the start of the region.
    pub fn dma_addr(&self) -> u64 {
        self.dma_addr
    }

    /// The size of the region in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The DMA address just past the end of the region.
    pub fn end(&self) -> u64 {
        self.dma_addr + self.size
    }

    /// The offset of the region within its backing file.
    pub fn file_offset(&self) -> u64 {
        self.mapping.offset()
    }

    /// The granularity the backing file is mapped at.
    pub fn page_size(&self) -> usize {
        self.mapping.page_size()
    }

    /// The address the start of the region is mapped at in this process.
    pub fn virt_addr(&self) -> *mut u8 {
        self.mapping.as_ptr()
    }

    /// The number of outstanding resolved buffers into this region.
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Relaxed)
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.mapping.as_fd().as_raw_fd()
    }

    /// Returns whether `[dma_addr, dma_addr + len)` lies within the region.
    pub(crate) fn contains(&self, dma_addr: u64, len: u64) -> bool {
        dma_addr >= self.dma_addr
            && dma_addr
                .checked_add(len)
                .is_some_and(|end| end <= self.end())
    }

    /// Takes one reference. Returns false if the count is saturated.
    pub(crate) fn acquire(&self) -> bool {
        self.refcount
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_add(1))
            .is_ok()
    }

    /// Drops one reference. Returns false if there were none.
    pub(crate) fn release(&self) -> bool {
        self.refcount
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl AsFd for MemoryRegion {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.mapping.as_fd()
    }
}
