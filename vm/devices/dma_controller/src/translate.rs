// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Translation of DMA address ranges into scatter-gather lists.

use crate::DmaController;
use std::cell::Cell;
use thiserror::Error;

thread_local! {
    /// The index of the region this thread translated into most recently.
    ///
    /// Only a hint: it is shared by every controller the thread uses and may
    /// be stale or out of range after the table changes.
    static REGION_HINT: Cell<usize> = const { Cell::new(0) };
}

/// A scatter-gather entry: a span of DMA address space within a single
/// region.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct DmaSg {
    /// The DMA address of the start of the region.
    pub dma_addr: u64,
    /// The index of the region in the table at translation time.
    pub region: usize,
    /// The offset of the span within the region.
    pub offset: u64,
    /// The length of the span.
    pub length: u64,
}

impl DmaSg {
    /// The first DMA address covered by this entry.
    pub fn start(&self) -> u64 {
        self.dma_addr + self.offset
    }

    /// The DMA address just past the end of this entry.
    pub fn end(&self) -> u64 {
        self.start() + self.length
    }
}

/// An error translating a DMA range.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TranslateError {
    /// Part of the range is not covered by any region, or the range is empty.
    #[error("dma range {dma_addr:#x}+{len:#x} is not mapped")]
    InvalidRange {
        /// The requested DMA address.
        dma_addr: u64,
        /// The requested length.
        len: u64,
    },
    /// The scatter-gather list is too short.
    #[error("{needed} scatter-gather entries needed, only {available} available")]
    EntriesExhausted {
        /// The number of entries the range needs.
        needed: usize,
        /// The number of entries provided.
        available: usize,
    },
}

impl DmaController {
    /// Translates `[dma_addr, dma_addr + len)` into scatter-gather entries,
    /// one per region the range touches, in address order.
    ///
    /// Returns the number of entries written to the start of `sgl`. The whole
    /// range must be covered by registered regions. If `sgl` is too short,
    /// nothing is written and the error reports the number of entries needed.
    pub fn translate(
        &self,
        dma_addr: u64,
        len: u64,
        sgl: &mut [DmaSg],
    ) -> Result<usize, TranslateError> {
        if len == 0 {
            return Err(TranslateError::InvalidRange { dma_addr, len });
        }

        // Fast path: DMA tends to hit the same region repeatedly.
        let hint = REGION_HINT.get();
        if let (Some(sg), Some(region)) = (sgl.first_mut(), self.regions.get(hint)) {
            if region.contains(dma_addr, len) {
                *sg = DmaSg {
                    dma_addr: region.dma_addr(),
                    region: hint,
                    offset: dma_addr - region.dma_addr(),
                    length: len,
                };
                return Ok(1);
            }
        }

        let count = self.split_sg(dma_addr, len, sgl)?;
        REGION_HINT.set(sgl[count - 1].region);
        Ok(count)
    }

    /// Searches the table for the regions covering the range.
    fn split_sg(
        &self,
        dma_addr: u64,
        len: u64,
        sgl: &mut [DmaSg],
    ) -> Result<usize, TranslateError> {
        let invalid = TranslateError::InvalidRange { dma_addr, len };
        let end = dma_addr.checked_add(len).ok_or(invalid.clone())?;

        // The table is sorted and disjoint, so region ends are sorted too.
        let first = self.regions.partition_point(|r| r.end() <= dma_addr);

        // Count first, so nothing is written if the list is too short.
        let mut needed = 0;
        let mut next = dma_addr;
        for region in &self.regions[first..] {
            if next == end || region.dma_addr() > next {
                break;
            }
            next = region.end().min(end);
            needed += 1;
        }
        if next != end {
            return Err(invalid);
        }
        if needed > sgl.len() {
            return Err(TranslateError::EntriesExhausted {
                needed,
                available: sgl.len(),
            });
        }

        let mut next = dma_addr;
        for (sg, (index, region)) in sgl
            .iter_mut()
            .zip(self.regions.iter().enumerate().skip(first).take(needed))
        {
            let chunk_end = region.end().min(end);
            *sg = DmaSg {
                dma_addr: region.dma_addr(),
                region: index,
                offset: next - region.dma_addr(),
                length: chunk_end - next,
            };
            next = chunk_end;
        }
        Ok(needed)
    }
}
