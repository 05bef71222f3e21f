// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shared read/write mappings of a range of a file into the current process.
//!
//! A [`FileMapping`] owns both the file descriptor and the mapping made from
//! it. The mapping is established at a page-aligned file offset; callers can
//! ask for any offset and the returned base pointer is biased to match.

#![cfg(unix)]
// UNSAFETY: Calling mmap/munmap and handing out pointers into the mapping.
#![expect(unsafe_code)]

use std::ffi::c_void;
use std::fs::File;
use std::io;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;
use std::os::unix::fs::MetadataExt;
use std::ptr::NonNull;
use thiserror::Error;

/// An error establishing a [`FileMapping`].
#[derive(Debug, Error)]
pub enum MapError {
    /// Zero-length mappings are not allowed.
    #[error("mapping length must be non-zero")]
    ZeroLength,
    /// The requested range cannot be expressed as an mmap offset and length.
    #[error("file range {offset:#x}+{len:#x} is not mappable")]
    InvalidRange {
        /// The requested file offset.
        offset: u64,
        /// The requested length.
        len: usize,
    },
    /// The file's block size could not be queried.
    #[error("failed to query block size of backing file")]
    BlockSize(#[source] io::Error),
    /// The mmap call itself failed.
    #[error("failed to map file")]
    Map(#[source] io::Error),
}

/// Returns the system page size.
pub fn system_page_size() -> usize {
    // SAFETY: sysconf has no memory safety requirements.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    size as usize
}

/// Returns the granularity at which `file` should be mapped: the larger of its
/// block size and the system page size.
///
/// Block sizes that are not a power of two are ignored.
pub fn mapping_page_size(file: &File) -> io::Result<usize> {
    let block_size = file.metadata()?.blksize() as usize;
    let page_size = system_page_size();
    if block_size.is_power_of_two() {
        Ok(block_size.max(page_size))
    } else {
        Ok(page_size)
    }
}

/// A read/write, shared mapping of a range of a file.
///
/// The mapping and the descriptor are released on drop.
pub struct FileMapping {
    file: File,
    base: NonNull<c_void>,
    map_len: usize,
    bias: usize,
    len: usize,
    offset: u64,
    page_size: usize,
}

// SAFETY: The result of an mmap is safe to share amongst threads.
unsafe impl Send for FileMapping {}
// SAFETY: The result of an mmap is safe to share amongst threads.
unsafe impl Sync for FileMapping {}

impl FileMapping {
    /// Maps `len` bytes of `fd` starting at file offset `offset`.
    ///
    /// Ownership of `fd` passes to the mapping, including on failure, in which
    /// case the descriptor is closed.
    pub fn new(fd: impl Into<OwnedFd>, offset: u64, len: usize) -> Result<Self, MapError> {
        let file = File::from(fd.into());
        if len == 0 {
            return Err(MapError::ZeroLength);
        }

        let page_size = mapping_page_size(&file).map_err(MapError::BlockSize)?;
        let aligned_offset = offset & !(page_size as u64 - 1);
        let bias = (offset - aligned_offset) as usize;
        let invalid = || MapError::InvalidRange { offset, len };
        let map_len = bias
            .checked_add(len)
            .and_then(|n| n.checked_next_multiple_of(page_size))
            .ok_or_else(invalid)?;
        let file_offset = libc::off_t::try_from(aligned_offset).map_err(|_| invalid())?;

        // SAFETY: No address is being passed, the descriptor is owned by
        // `file` and is valid. The result is being validated.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                file_offset,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(MapError::Map(io::Error::last_os_error()));
        }
        let base = NonNull::new(addr)
            .ok_or_else(|| MapError::Map(io::Error::other("mmap returned a null mapping")))?;

        Ok(Self {
            file,
            base,
            map_len,
            bias,
            len,
            offset,
            page_size,
        })
    }

    /// Returns a pointer to the byte at the requested file offset.
    ///
    /// The pointer is valid for reads and writes of [`Self::len`] bytes for
    /// the lifetime of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        // SAFETY: bias is less than page_size, which is within the mapping.
        unsafe { self.base.as_ptr().cast::<u8>().add(self.bias) }
    }

    /// The number of usable bytes starting at [`Self::as_ptr`].
    pub fn len(&self) -> usize {
        self.len
    }

    /// The file offset the mapping was requested at.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The granularity the file was mapped at.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// The backing file.
    pub fn file(&self) -> &File {
        &self.file
    }
}

impl AsFd for FileMapping {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl std::fmt::Debug for FileMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileMapping")
            .field("fd", &self.file.as_raw_fd())
            .field("base", &self.base)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl Drop for FileMapping {
    fn drop(&mut self) {
        // SAFETY: self contains a valid mmap result of map_len bytes.
        if unsafe { libc::munmap(self.base.as_ptr(), self.map_len) } < 0 {
            panic!("{:?}", io::Error::last_os_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileExt;

    fn backing(len: u64) -> File {
        let file = tempfile::tempfile().unwrap();
        file.set_len(len).unwrap();
        file
    }

    #[test]
    fn zero_length() {
        assert!(matches!(
            FileMapping::new(backing(4096), 0, 0),
            Err(MapError::ZeroLength)
        ));
    }

    #[test]
    fn shared_with_file() {
        let file = backing(0x4000);
        file.write_all_at(b"hello", 0x1000).unwrap();
        let reader = file.try_clone().unwrap();

        let mapping = FileMapping::new(file, 0x1000, 0x2000).unwrap();
        assert_eq!(mapping.len(), 0x2000);
        assert_eq!(mapping.offset(), 0x1000);

        // SAFETY: the mapping is at least 5 bytes long.
        let data = unsafe { std::slice::from_raw_parts(mapping.as_ptr(), 5) };
        assert_eq!(data, b"hello");

        // SAFETY: the mapping is valid for writes.
        unsafe { mapping.as_ptr().add(0x10).write(0xaa) };
        let mut byte = [0];
        reader.read_exact_at(&mut byte, 0x1010).unwrap();
        assert_eq!(byte, [0xaa]);
    }

    #[test]
    fn unaligned_offset() {
        let file = backing(0x3000);
        file.write_all_at(b"xy", 0x1234).unwrap();

        let mapping = FileMapping::new(file, 0x1234, 0x10).unwrap();
        assert!(mapping.page_size() >= system_page_size());
        assert_eq!(
            mapping.as_ptr() as usize % mapping.page_size(),
            0x1234 % mapping.page_size()
        );
        // SAFETY: the mapping is at least 2 bytes long.
        let data = unsafe { std::slice::from_raw_parts(mapping.as_ptr(), 2) };
        assert_eq!(data, b"xy");
    }

    #[test]
    fn unmappable_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let dir = File::open(dir.path()).unwrap();
        assert!(matches!(
            FileMapping::new(dir, 0, 0x1000),
            Err(MapError::Map(_))
        ));
    }
}
