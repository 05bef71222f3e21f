// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Emulation of a DMA controller for device emulation running in user mode.
//!
//! A [`DmaController`] owns a private 64-bit DMA address space. Foreign memory
//! (typically guest RAM handed over by a VMM as file descriptors) is made
//! available to the controller in linear chunks called memory regions. Each
//! region is backed by a range of a file descriptor and registered at a
//! unique, non-overlapping span of the DMA address space.
//!
//! To perform DMA, a device first translates a DMA address range into a
//! scatter-gather list of [`DmaSg`] entries with [`DmaController::translate`],
//! then resolves the list into directly accessible [`DmaIov`] buffers with
//! [`DmaController::resolve`], and finally hands the list back with
//! [`DmaController::release`]. [`DmaController::map_single`] and
//! [`DmaController::unmap_single`] cover the common case of a range that fits
//! a single region.
//!
//! Every region is mapped into the process with read/write access once, when
//! it is registered. Resolving and releasing are lookups and pointer
//! arithmetic; no mapping or unmapping happens per transaction.
//!
//! Table mutations take `&mut DmaController` while the DMA path takes
//! `&DmaController`, so a resolved [`DmaIov`] can never outlive the region it
//! points into. Hosts that need to mutate the table from one thread while
//! other threads perform DMA can use [`SharedDmaController`].

#![cfg(unix)]
// UNSAFETY: Accessing the foreign memory mapped for each region.
#![expect(unsafe_code)]

mod config;
mod map;
mod region;
mod shared;
mod translate;

pub use config::DEFAULT_MAX_REGIONS;
pub use config::DmaControllerConfig;
pub use map::DmaIov;
pub use map::OutOfBounds;
pub use region::MemoryRegion;
pub use shared::SharedDmaController;
pub use translate::DmaSg;
pub use translate::TranslateError;

use std::collections::TryReserveError;
use std::os::fd::AsFd;
use thiserror::Error;

/// An error creating a [`DmaController`].
#[derive(Debug, Error)]
pub enum CreateError {
    /// The controller must be able to hold at least one region.
    #[error("invalid region capacity {0}")]
    InvalidCapacity(usize),
    /// Storage for the region table could not be allocated.
    #[error("failed to allocate region table")]
    Allocation(#[source] TryReserveError),
}

/// An error registering a memory region.
#[derive(Debug, Error)]
pub enum AddRegionError {
    /// The region is empty or its end does not fit in the DMA address space.
    #[error("invalid region size {size:#x} at dma address {dma_addr:#x}")]
    InvalidSize {
        /// The requested DMA address.
        dma_addr: u64,
        /// The requested size.
        size: u64,
    },
    /// The region overlaps an existing region.
    #[error("region overlaps existing region {index}")]
    Overlap {
        /// The index of the existing region.
        index: usize,
        /// The index the new region would have been inserted at.
        insert_at: usize,
    },
    /// The region table is full.
    #[error("region table is full")]
    CapacityExceeded {
        /// The index the new region would have been inserted at.
        insert_at: usize,
    },
    /// The backing file descriptor could not be duplicated.
    #[error("failed to duplicate region file descriptor")]
    DuplicateFd(#[source] std::io::Error),
    /// The backing file could not be mapped.
    #[error("failed to map region")]
    MapFailed(#[source] file_mmap::MapError),
}

impl AddRegionError {
    /// Returns the index the region would have been inserted at, for failures
    /// caused by the current contents of the table.
    pub fn insert_index(&self) -> Option<usize> {
        match *self {
            AddRegionError::Overlap { insert_at, .. }
            | AddRegionError::CapacityExceeded { insert_at } => Some(insert_at),
            AddRegionError::InvalidSize { .. }
            | AddRegionError::DuplicateFd(_)
            | AddRegionError::MapFailed(_) => None,
        }
    }
}

/// An error removing a memory region.
#[derive(Debug, Error)]
pub enum RemoveRegionError {
    /// No region matches the requested span exactly.
    #[error("no region at {dma_addr:#x} with size {size:#x}")]
    NotFound {
        /// The requested DMA address.
        dma_addr: u64,
        /// The requested size.
        size: u64,
    },
    /// The owner refused to release its users of the region.
    #[error("failed to notify owner of region removal")]
    Notify(#[source] anyhow::Error),
}

/// Formats a DMA range as `start-end` in hex.
pub(crate) struct DmaRange(pub u64, pub u64);

impl std::fmt::Display for DmaRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}-{:#x}", self.0, self.1)
    }
}

/// An emulated DMA controller.
///
/// Holds up to a fixed number of memory regions, sorted by DMA address.
#[derive(Debug)]
pub struct DmaController {
    name: String,
    max_regions: usize,
    regions: Vec<MemoryRegion>,
}

impl DmaController {
    /// Creates a controller that can hold up to `max_regions` regions.
    ///
    /// `name` identifies the owning device in log records.
    pub fn new(name: impl Into<String>, max_regions: usize) -> Result<Self, CreateError> {
        if max_regions == 0 {
            return Err(CreateError::InvalidCapacity(max_regions));
        }
        let mut regions = Vec::new();
        regions
            .try_reserve_exact(max_regions)
            .map_err(CreateError::Allocation)?;

        let name = name.into();
        tracing::debug!(controller = %name, max_regions, "created dma controller");
        Ok(Self {
            name,
            max_regions,
            regions,
        })
    }

    /// Creates a controller from configuration.
    pub fn from_config(config: &DmaControllerConfig) -> Result<Self, CreateError> {
        Self::new(config.name.clone(), config.max_regions)
    }

    /// Unmaps every region and releases the controller.
    ///
    /// Dropping the controller does the same.
    pub fn destroy(mut self) {
        self.remove_all_regions();
    }

    /// The name of the owning device.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The maximum number of regions.
    pub fn max_regions(&self) -> usize {
        self.max_regions
    }

    /// The number of registered regions.
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// The registered regions, sorted by DMA address.
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// Returns the region at `index`.
    pub fn region(&self, index: usize) -> Option<&MemoryRegion> {
        self.regions.get(index)
    }

    /// Returns the index of the region containing `dma_addr`.
    pub fn find_region(&self, dma_addr: u64) -> Option<usize> {
        let index = self.regions.partition_point(|r| r.end() <= dma_addr);
        self.regions
            .get(index)
            .is_some_and(|r| r.dma_addr() <= dma_addr)
            .then_some(index)
    }

    /// Index of the region starting exactly at `dma_addr`.
    pub(crate) fn region_index_at(&self, dma_addr: u64) -> Option<usize> {
        self.regions
            .binary_search_by_key(&dma_addr, |r| r.dma_addr())
            .ok()
    }

    /// Registers `size` bytes of `fd` at file offset `offset` as the region
    /// `[dma_addr, dma_addr + size)`.
    ///
    /// The region is mapped read/write immediately. The controller keeps its
    /// own duplicate of `fd` for as long as the region is registered; the
    /// caller's descriptor is left open whether or not registration succeeds.
    ///
    /// Returns the index of the new region. Indexes of existing regions at or
    /// after this index shift up by one.
    pub fn add_region(
        &mut self,
        dma_addr: u64,
        size: u64,
        fd: impl AsFd,
        offset: u64,
    ) -> Result<usize, AddRegionError> {
        let invalid_size = AddRegionError::InvalidSize { dma_addr, size };
        if size == 0 {
            return Err(invalid_size);
        }
        let end = dma_addr.checked_add(size).ok_or(invalid_size)?;
        let len =
            usize::try_from(size).map_err(|_| AddRegionError::InvalidSize { dma_addr, size })?;

        let insert_at = self.regions.partition_point(|r| r.dma_addr() < dma_addr);

        // Since the table is sorted and disjoint, only the neighbors of the
        // insertion point can overlap.
        if let Some(index) = insert_at.checked_sub(1) {
            if self.regions[index].end() > dma_addr {
                return Err(self.overlap(index, insert_at, dma_addr, end));
            }
        }
        if let Some(next) = self.regions.get(insert_at) {
            if next.dma_addr() < end {
                return Err(self.overlap(insert_at, insert_at, dma_addr, end));
            }
        }

        if self.regions.len() == self.max_regions {
            tracing::error!(
                controller = %self.name,
                max_regions = self.max_regions,
                range = %DmaRange(dma_addr, end),
                "reached maximum number of dma regions"
            );
            return Err(AddRegionError::CapacityExceeded { insert_at });
        }

        let fd = fd
            .as_fd()
            .try_clone_to_owned()
            .map_err(AddRegionError::DuplicateFd)?;
        let region = MemoryRegion::new(dma_addr, size, fd, offset, len).map_err(|err| {
            tracing::error!(
                controller = %self.name,
                range = %DmaRange(dma_addr, end),
                offset,
                error = &err as &dyn std::error::Error,
                "failed to map dma region"
            );
            AddRegionError::MapFailed(err)
        })?;

        tracing::debug!(
            controller = %self.name,
            range = %DmaRange(dma_addr, end),
            index = insert_at,
            fd = region.raw_fd(),
            offset,
            page_size = region.page_size(),
            virt_addr = ?region.virt_addr(),
            "added dma region"
        );
        self.regions.insert(insert_at, region);
        Ok(insert_at)
    }

    fn overlap(&self, index: usize, insert_at: usize, dma_addr: u64, end: u64) -> AddRegionError {
        let existing = &self.regions[index];
        tracing::info!(
            controller = %self.name,
            range = %DmaRange(dma_addr, end),
            existing = %DmaRange(existing.dma_addr(), existing.end()),
            index,
            "dma region overlaps existing region"
        );
        AddRegionError::Overlap { index, insert_at }
    }

    /// Removes the region registered exactly at `[dma_addr, dma_addr + size)`.
    ///
    /// `unmap` is called with the region before it is torn down, so that the
    /// owner can stop using any memory it resolved from it. If `unmap` fails,
    /// the region stays registered.
    ///
    /// Removal proceeds even if the region still has outstanding references
    /// after `unmap` returns. Raw pointers obtained from the region must not be
    /// used after this returns.
    pub fn remove_region(
        &mut self,
        dma_addr: u64,
        size: u64,
        unmap: impl FnOnce(&MemoryRegion) -> anyhow::Result<()>,
    ) -> Result<(), RemoveRegionError> {
        let index = self
            .region_index_at(dma_addr)
            .filter(|&index| self.regions[index].size() == size)
            .ok_or(RemoveRegionError::NotFound { dma_addr, size })?;

        let region = &self.regions[index];
        unmap(region).map_err(|err| {
            tracing::error!(
                controller = %self.name,
                range = %DmaRange(region.dma_addr(), region.end()),
                error = ?err,
                "failed to notify of dma region removal"
            );
            RemoveRegionError::Notify(err)
        })?;

        let region = self.regions.remove(index);
        self.release_region(region);
        Ok(())
    }

    /// Removes every region.
    pub fn remove_all_regions(&mut self) {
        for region in std::mem::take(&mut self.regions) {
            self.release_region(region);
        }
    }

    fn release_region(&self, region: MemoryRegion) {
        let refcount = region.refcount();
        if refcount > 0 {
            tracing::warn!(
                controller = %self.name,
                range = %DmaRange(region.dma_addr(), region.end()),
                refcount,
                "removing dma region with outstanding references"
            );
        }
        tracing::info!(
            controller = %self.name,
            range = %DmaRange(region.dma_addr(), region.end()),
            virt_addr = ?region.virt_addr(),
            "unmapped dma region"
        );
        drop(region);
    }
}

impl Drop for DmaController {
    fn drop(&mut self) {
        self.remove_all_regions();
    }
}
