// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Resolution of scatter-gather lists into accessible memory.

use crate::DmaController;
use crate::DmaRange;
use crate::translate::DmaSg;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use thiserror::Error;

/// An access outside the bounds of a [`DmaIov`].
#[derive(Debug, Error)]
#[error("access at {offset:#x}+{len:#x} is outside buffer of {size:#x} bytes")]
pub struct OutOfBounds {
    offset: usize,
    len: usize,
    size: usize,
}

/// A resolved scatter-gather entry: a window of foreign memory mapped into
/// this process.
///
/// Borrows the controller, so the region it points into cannot be removed
/// while the buffer is alive. The memory is shared with the process that
/// supplied it and may change underneath the caller at any time, so it is
/// only ever accessed as [`AtomicU8`]s.
#[derive(Debug)]
pub struct DmaIov<'a> {
    ptr: NonNull<u8>,
    len: usize,
    _controller: PhantomData<&'a DmaController>,
}

// SAFETY: The buffer points into a shared mapping owned by the controller,
// which is itself safe to share amongst threads.
unsafe impl Send for DmaIov<'_> {}
// SAFETY: Safe accesses to the buffer are all atomic, via `as_slice`.
unsafe impl Sync for DmaIov<'_> {}

impl DmaIov<'_> {
    /// Returns a pointer to the start of the buffer, suitable for passing to
    /// I/O system calls.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// The length of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// The buffer as a slice of atomic bytes.
    pub fn as_slice(&self) -> &[AtomicU8] {
        // SAFETY: The buffer is within a mapping that stays valid for reads
        // and writes for the lifetime of the borrow. AtomicU8 has the layout
        // of u8, and every access through the slice is atomic, so concurrent
        // access by other threads or the owning process is not a data race.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<AtomicU8>(), self.len) }
    }

    /// Copies `buf.len()` bytes starting at `offset` into `buf`.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<(), OutOfBounds> {
        let src = self.window(offset, buf.len())?;
        for (b, src) in buf.iter_mut().zip(src) {
            *b = src.load(Ordering::Relaxed);
        }
        Ok(())
    }

    /// Copies `data` into the buffer starting at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), OutOfBounds> {
        let dest = self.window(offset, data.len())?;
        for (&b, dest) in data.iter().zip(dest) {
            dest.store(b, Ordering::Relaxed);
        }
        Ok(())
    }

    fn window(&self, offset: usize, len: usize) -> Result<&[AtomicU8], OutOfBounds> {
        self.as_slice()
            .get(offset..)
            .and_then(|s| s.get(..len))
            .ok_or(OutOfBounds {
                offset,
                len,
                size: self.len,
            })
    }
}

impl DmaController {
    /// Resolves scatter-gather entries produced by [`Self::translate`] into
    /// accessible buffers, taking a reference on each entry's region.
    ///
    /// Pass the same entries to [`Self::release`] when the transfer is done.
    ///
    /// # Panics
    ///
    /// Panics if an entry does not describe a span of the region it refers to,
    /// which happens if the table changed since the entries were translated,
    /// or if a region's reference count would overflow.
    pub fn resolve(&self, sgl: &[DmaSg]) -> Vec<DmaIov<'_>> {
        sgl.iter().map(|sg| self.resolve_one(sg)).collect()
    }

    fn resolve_one(&self, sg: &DmaSg) -> DmaIov<'_> {
        let region = self
            .regions
            .get(sg.region)
            .filter(|region| {
                region.dma_addr() == sg.dma_addr
                    && sg
                        .offset
                        .checked_add(sg.length)
                        .is_some_and(|end| end <= region.size())
            })
            .unwrap_or_else(|| panic!("stale scatter-gather entry {sg:x?}"));

        tracing::debug!(
            controller = %self.name,
            range = %DmaRange(sg.start(), sg.end()),
            "map"
        );
        assert!(
            region.acquire(),
            "too many references to dma region {}",
            DmaRange(region.dma_addr(), region.end())
        );

        // SAFETY: The span was checked to be within the region, whose mapping
        // is region.size() bytes long, so the result is a non-null pointer
        // within the mapping.
        let ptr = unsafe { NonNull::new_unchecked(region.virt_addr().add(sg.offset as usize)) };
        DmaIov {
            ptr,
            len: sg.length as usize,
            _controller: PhantomData,
        }
    }

    /// Drops the references taken by [`Self::resolve`].
    ///
    /// Entries are matched to regions by DMA address, since indexes may have
    /// changed. Entries whose region has since been removed are ignored.
    pub fn release(&self, sgl: &[DmaSg]) {
        for sg in sgl {
            let Some(index) = self.region_index_at(sg.dma_addr) else {
                continue;
            };
            tracing::debug!(
                controller = %self.name,
                range = %DmaRange(sg.start(), sg.end()),
                "unmap"
            );
            if !self.regions[index].release() {
                tracing::warn!(
                    controller = %self.name,
                    range = %DmaRange(sg.start(), sg.end()),
                    index,
                    "released dma region with no outstanding references"
                );
            }
        }
    }

    /// Maps a range that fits within a single region.
    ///
    /// Returns `None` if the range is not mapped or spans more than one
    /// region.
    pub fn map_single(&self, dma_addr: u64, len: u64) -> Option<DmaIov<'_>> {
        let mut sg = [DmaSg::default()];
        match self.translate(dma_addr, len, &mut sg) {
            Ok(1) => Some(self.resolve_one(&sg[0])),
            Ok(_) | Err(_) => None,
        }
    }

    /// Unmaps a buffer returned by [`Self::map_single`] for the same range.
    ///
    /// # Panics
    ///
    /// Panics if the range does not translate to a single entry.
    pub fn unmap_single(&self, dma_addr: u64, len: u64, iov: DmaIov<'_>) {
        let mut sg = [DmaSg::default()];
        let result = self.translate(dma_addr, len, &mut sg);
        assert_eq!(
            result,
            Ok(1),
            "unmap of {dma_addr:#x}+{len:#x} is not a single mapped region"
        );
        drop(iov);
        self.release(&sg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::backing;
    use crate::tests::controller;
    use std::os::unix::fs::FileExt;
    use test_with_tracing::test;

    fn refcounts(dma: &DmaController) -> Vec<u32> {
        dma.regions().iter().map(|r| r.refcount()).collect()
    }

    #[test]
    fn resolve_release_is_balanced() {
        let dma = controller(3, &[(0x1000, 0x1000), (0x2000, 0x1000), (0x3000, 0x1000)]);
        let mut sgl = [DmaSg::default(); 3];
        let n = dma.translate(0x1800, 0x2000, &mut sgl).unwrap();
        assert_eq!(n, 3);

        let iov = dma.resolve(&sgl[..n]);
        assert_eq!(refcounts(&dma), [1, 1, 1]);
        let lens: Vec<_> = iov.iter().map(|iov| iov.len()).collect();
        assert_eq!(lens, [0x800, 0x1000, 0x800]);

        // A second, overlapping transaction.
        let n2 = dma.translate(0x2000, 0x10, &mut sgl).unwrap();
        let iov2 = dma.resolve(&sgl[..n2]);
        assert_eq!(refcounts(&dma), [1, 2, 1]);

        dma.release(&sgl[..n2]);
        drop(iov2);
        let n = dma.translate(0x1800, 0x2000, &mut sgl).unwrap();
        dma.release(&sgl[..n]);
        drop(iov);
        assert_eq!(refcounts(&dma), [0, 0, 0]);
    }

    #[test]
    fn buffers_share_backing_memory() {
        let file = backing(0x4000);
        file.write_all_at(b"guest data", 0x2100).unwrap();
        let reader = file.try_clone().unwrap();

        let mut dma = DmaController::new("test", 1).unwrap();
        dma.add_region(0x10000, 0x1000, file, 0x2000).unwrap();

        let mut sgl = [DmaSg::default()];
        dma.translate(0x10100, 0x100, &mut sgl).unwrap();
        let iov = dma.resolve(&sgl);
        let mut buf = [0; 10];
        iov[0].read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"guest data");

        iov[0].write_at(0xf0, b"device").unwrap();
        let mut buf = [0; 6];
        reader.read_exact_at(&mut buf, 0x21f0).unwrap();
        assert_eq!(&buf, b"device");

        assert_eq!(
            iov[0].as_ptr(),
            dma.region(0).unwrap().virt_addr().wrapping_add(0x100)
        );
        dma.release(&sgl);
    }

    #[test]
    fn split_buffers_are_contiguous_in_dma_space() {
        let mut dma = DmaController::new("test", 2).unwrap();
        let first = backing(0x1000);
        let second = backing(0x1000);
        second.write_all_at(b"BB", 0).unwrap();
        first.write_all_at(b"AA", 0xffe).unwrap();
        dma.add_region(0x1000, 0x1000, first, 0).unwrap();
        dma.add_region(0x2000, 0x1000, second, 0).unwrap();

        let mut sgl = [DmaSg::default(); 2];
        let n = dma.translate(0x1ffe, 4, &mut sgl).unwrap();
        let mut data = Vec::new();
        for iov in dma.resolve(&sgl[..n]) {
            let mut buf = vec![0; iov.len()];
            iov.read_at(0, &mut buf).unwrap();
            data.extend(buf);
        }
        assert_eq!(data, b"AABB");
        dma.release(&sgl[..n]);
    }

    #[test]
    fn out_of_bounds_access() {
        let dma = controller(1, &[(0x1000, 0x1000)]);
        let iov = dma.map_single(0x1000, 0x10).unwrap();
        let mut buf = [0; 4];
        assert!(iov.read_at(0xd, &mut buf).is_err());
        assert!(iov.write_at(0x10, &[1]).is_err());
        assert!(iov.write_at(usize::MAX, &[1]).is_err());
        iov.read_at(0xc, &mut buf).unwrap();
        dma.unmap_single(0x1000, 0x10, iov);
    }

    #[test]
    fn atomic_view() {
        let dma = controller(1, &[(0x1000, 0x1000)]);
        let iov = dma.map_single(0x1010, 0x20).unwrap();
        assert_eq!(iov.as_slice().len(), 0x20);

        iov.write_at(2, b"xy").unwrap();
        assert_eq!(iov.as_slice()[3].load(Ordering::Relaxed), b'y');
        iov.as_slice()[0x1f].store(b'z', Ordering::Relaxed);
        let mut buf = [0];
        iov.read_at(0x1f, &mut buf).unwrap();
        assert_eq!(&buf, b"z");
        dma.unmap_single(0x1010, 0x20, iov);
    }

    #[test]
    fn concurrent_writes_to_shared_buffer() {
        let dma = controller(1, &[(0x1000, 0x1000)]);
        let iov = dma.map_single(0x1000, 0x100).unwrap();
        std::thread::scope(|s| {
            for thread in 0..4u8 {
                let iov = &iov;
                s.spawn(move || {
                    for _ in 0..100 {
                        iov.write_at(0, &[thread; 0x100]).unwrap();
                        let mut buf = [0; 0x100];
                        iov.read_at(0, &mut buf).unwrap();
                        assert!(buf.iter().all(|&b| b < 4));
                    }
                });
            }
        });
        dma.unmap_single(0x1000, 0x100, iov);
        assert_eq!(refcounts(&dma), [0]);
    }

    #[test]
    fn map_single() {
        let dma = controller(2, &[(0x1000, 0x1000), (0x2000, 0x1000)]);
        let iov = dma.map_single(0x1100, 0x100).unwrap();
        assert_eq!(iov.len(), 0x100);
        assert_eq!(refcounts(&dma), [1, 0]);
        dma.unmap_single(0x1100, 0x100, iov);
        assert_eq!(refcounts(&dma), [0, 0]);

        // Spans two regions.
        assert!(dma.map_single(0x1f00, 0x200).is_none());
        // Not mapped.
        assert!(dma.map_single(0x3000, 0x10).is_none());
        assert!(dma.map_single(0x1000, 0).is_none());
        assert_eq!(refcounts(&dma), [0, 0]);
    }

    #[test]
    #[should_panic(expected = "is not a single mapped region")]
    fn unmap_single_across_regions() {
        let dma = controller(2, &[(0x1000, 0x1000), (0x2000, 0x1000)]);
        let iov = dma.map_single(0x1f00, 0x100).unwrap();
        dma.unmap_single(0x1f00, 0x200, iov);
    }

    #[test]
    #[should_panic(expected = "stale scatter-gather entry")]
    fn resolve_stale_entry() {
        let mut dma = controller(2, &[(0x1000, 0x1000), (0x2000, 0x1000)]);
        let mut sgl = [DmaSg::default()];
        dma.translate(0x2000, 0x10, &mut sgl).unwrap();
        dma.remove_region(0x1000, 0x1000, |_| Ok(())).unwrap();
        dma.resolve(&sgl);
    }

    #[test]
    fn release_matches_by_address() {
        let mut dma = controller(3, &[(0x2000, 0x1000), (0x3000, 0x1000)]);
        let mut sgl = [DmaSg::default()];
        dma.translate(0x3000, 0x10, &mut sgl).unwrap();
        drop(dma.resolve(&sgl));
        assert_eq!(sgl[0].region, 1);

        // Shift the region to a new index before releasing.
        dma.add_region(0x1000, 0x1000, backing(0x1000), 0).unwrap();
        assert_eq!(refcounts(&dma), [0, 0, 1]);
        dma.release(&sgl);
        assert_eq!(refcounts(&dma), [0, 0, 0]);
    }

    #[test]
    fn release_without_references() {
        let dma = controller(1, &[(0x1000, 0x1000)]);
        let sg = DmaSg {
            dma_addr: 0x1000,
            region: 0,
            offset: 0,
            length: 0x10,
        };
        dma.release(&[sg]);
        assert_eq!(refcounts(&dma), [0]);

        // Unknown regions are ignored.
        dma.release(&[DmaSg {
            dma_addr: 0x5000,
            ..sg
        }]);
    }
}
