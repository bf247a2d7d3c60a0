//! Runtime shared memory regions.
//!
//! A runtime shares one region with the iokernel. Everything the runtime
//! hands over (packet headers, buffer headers) is referenced by an offset
//! into that region, and every offset is bounds-checked before it is used.
//! The region also carries the page table the NIC needs to turn a runtime
//! address into an IO address.

use nix::libc;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::fs::FileExt;
use std::ptr::{self, NonNull};
use thiserror::Error;

/// Shared regions are backed by 2 MiB pages.
pub const PGSHIFT_2MB: usize = 21;
pub const PGSIZE_2MB: usize = 1 << PGSHIFT_2MB;
const PGMASK_2MB: usize = PGSIZE_2MB - 1;

/// Base page size used by /proc/self/pagemap.
const PGSIZE_4KB: usize = 4096;

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("mmap failed: {0}")]
    Map(#[source] io::Error),

    #[error("range {offset:#x}+{len} outside region of {region_len} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        region_len: usize,
    },

    #[error("page table has {got} entries, region needs {expected}")]
    PageTable { expected: usize, got: usize },

    #[error("pagemap read failed: {0}")]
    Pagemap(#[source] io::Error),

    #[error("page {page} is not resident")]
    NotResident { page: usize },
}

pub type Result<T> = std::result::Result<T, ShmError>;

/// A mapped region shared with one runtime process.
pub struct ShmRegion {
    base: NonNull<u8>,
    len: usize,
    /// IO address of every 2 MiB page, indexed by page number from `base`.
    page_iovas: Vec<u64>,
}

// Safety: the mapping is owned by this struct and only reached through
// bounds-checked methods.
unsafe impl Send for ShmRegion {}

impl ShmRegion {
    /// Map `len` bytes of a runtime's shared memory file.
    pub fn map_fd(fd: BorrowedFd<'_>, len: usize) -> Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd.as_raw_fd(),
                0,
            )
        };
        Self::from_mmap(ptr, len)
    }

    /// Map an anonymous shared region (used when the runtime lives in the
    /// same address space, and by tests).
    pub fn anonymous(len: usize) -> Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        Self::from_mmap(ptr, len)
    }

    fn from_mmap(ptr: *mut libc::c_void, len: usize) -> Result<Self> {
        if ptr == libc::MAP_FAILED {
            return Err(ShmError::Map(io::Error::last_os_error()));
        }
        let base = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| ShmError::Map(io::Error::other("mmap returned null")))?;

        let mut region = Self {
            base,
            len,
            page_iovas: Vec::new(),
        };
        region.page_iovas = region.identity_iovas();
        Ok(region)
    }

    /// Number of 2 MiB pages spanned by the region.
    pub fn page_count(&self) -> usize {
        self.len.div_ceil(PGSIZE_2MB)
    }

    /// IOVA == VA, the layout used with an IOMMU in passthrough mode.
    fn identity_iovas(&self) -> Vec<u64> {
        let base = self.base.as_ptr() as u64;
        (0..self.page_count())
            .map(|page| base + (page * PGSIZE_2MB) as u64)
            .collect()
    }

    /// Install a page table supplied by the control plane.
    pub fn set_page_iovas(&mut self, page_iovas: Vec<u64>) -> Result<()> {
        if page_iovas.len() != self.page_count() {
            return Err(ShmError::PageTable {
                expected: self.page_count(),
                got: page_iovas.len(),
            });
        }
        self.page_iovas = page_iovas;
        Ok(())
    }

    /// Build the page table from /proc/self/pagemap.
    ///
    /// Only meaningful for hugepage-backed regions and requires
    /// CAP_SYS_ADMIN, otherwise the kernel reports zero frame numbers.
    pub fn load_pagemap(&mut self) -> Result<()> {
        let pagemap = File::open("/proc/self/pagemap").map_err(ShmError::Pagemap)?;
        self.load_page_table(&pagemap)
    }

    /// Build the page table from a pagemap-formatted source: one
    /// little-endian word per 4 KiB virtual page, bit 63 set when present,
    /// frame number in bits 0-54.
    pub fn load_page_table<F: FileExt>(&mut self, pagemap: &F) -> Result<()> {
        let mut iovas = Vec::with_capacity(self.page_count());

        for page in 0..self.page_count() {
            let vaddr = self.base.as_ptr() as usize + page * PGSIZE_2MB;
            // Fault the page in before asking for its frame.
            unsafe { ptr::read_volatile(vaddr as *const u8) };

            let mut entry = [0u8; 8];
            pagemap
                .read_exact_at(&mut entry, ((vaddr / PGSIZE_4KB) * 8) as u64)
                .map_err(ShmError::Pagemap)?;
            let iova = frame_address(u64::from_le_bytes(entry))
                .ok_or(ShmError::NotResident { page })?;
            iovas.push(iova);
        }

        self.page_iovas = iovas;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Validate that `offset..offset + len` lies inside the region.
    #[inline]
    pub fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(ShmError::OutOfBounds {
                offset,
                len,
                region_len: self.len,
            }),
        }
    }

    /// Translate a region offset into the IO address the NIC uses.
    #[inline]
    pub fn iova(&self, offset: usize) -> Result<u64> {
        self.check(offset, 0)?;
        let page = offset >> PGSHIFT_2MB;
        let iova = self.page_iovas.get(page).ok_or(ShmError::OutOfBounds {
            offset,
            len: 0,
            region_len: self.len,
        })?;
        Ok(iova + (offset & PGMASK_2MB) as u64)
    }

    /// Host pointer for a validated range.
    #[inline]
    pub fn ptr_at(&self, offset: usize, len: usize) -> Result<NonNull<u8>> {
        self.check(offset, len)?;
        // Safety: offset is within the mapping.
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) })
    }

    /// Copy bytes out of the region.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let src = self.ptr_at(offset, buf.len())?;
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    /// Copy bytes into the region.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        let dst = self.ptr_at(offset, data.len())?;
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), dst.as_ptr(), data.len()) };
        Ok(())
    }

    /// Borrow a range mutably.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive ownership of the range, i.e. the
    /// runtime handed the buffer over and will not touch it until the
    /// matching completion, and no other live borrow overlaps it.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let ptr = self.ptr_at(offset, len)?;
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len) })
    }
}

/// Physical address of a present pagemap entry. A zero frame number means
/// the kernel hid it from us.
fn frame_address(entry: u64) -> Option<u64> {
    let pfn = entry & ((1 << 55) - 1);
    (entry & (1 << 63) != 0 && pfn != 0).then(|| pfn * PGSIZE_4KB as u64)
}

impl std::fmt::Debug for ShmRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmRegion")
            .field("base", &self.base)
            .field("len", &self.len)
            .field("pages", &self.page_iovas.len())
            .finish()
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Pagemap entries keyed by virtual 4 KiB page number.
    struct FakePagemap(HashMap<u64, u64>);

    impl FileExt for FakePagemap {
        fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
            let entry = self.0.get(&(offset / 8)).copied().unwrap_or(0);
            let n = buf.len().min(8);
            buf[..n].copy_from_slice(&entry.to_le_bytes()[..n]);
            Ok(n)
        }

        fn write_at(&self, _buf: &[u8], _offset: u64) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        }
    }

    fn vpage(region: &ShmRegion, page: usize) -> u64 {
        (region.ptr_at(0, 0).unwrap().as_ptr() as usize / PGSIZE_4KB + page * 512) as u64
    }

    #[test]
    fn test_bounds() {
        let region = ShmRegion::anonymous(8192).unwrap();
        assert!(region.check(0, 8192).is_ok());
        assert!(region.check(8191, 1).is_ok());
        assert!(region.check(8191, 2).is_err());
        assert!(region.check(usize::MAX, 2).is_err());
        assert!(region.read(8190, &mut [0u8; 4]).is_err());
    }

    #[test]
    fn test_read_write() {
        let region = ShmRegion::anonymous(4096).unwrap();
        region.write(100, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        region.read(100, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_identity_iova() {
        let region = ShmRegion::anonymous(3 * PGSIZE_2MB).unwrap();
        assert_eq!(region.page_count(), 3);
        let base = region.ptr_at(0, 0).unwrap().as_ptr() as u64;
        assert_eq!(region.iova(0).unwrap(), base);
        assert_eq!(
            region.iova(PGSIZE_2MB + 17).unwrap(),
            base + PGSIZE_2MB as u64 + 17
        );
    }

    #[test]
    fn test_custom_page_table() {
        let mut region = ShmRegion::anonymous(2 * PGSIZE_2MB).unwrap();
        assert!(region.set_page_iovas(vec![0x1000_0000]).is_err());
        region
            .set_page_iovas(vec![0x4000_0000, 0x8000_0000])
            .unwrap();
        assert_eq!(region.iova(5).unwrap(), 0x4000_0005);
        assert_eq!(region.iova(PGSIZE_2MB + 5).unwrap(), 0x8000_0005);
    }

    #[test]
    fn test_page_table_from_pagemap() {
        let mut region = ShmRegion::anonymous(2 * PGSIZE_2MB).unwrap();
        let present = 1u64 << 63;
        let pagemap = FakePagemap(HashMap::from([
            (vpage(&region, 0), present | 0x1_2340),
            (vpage(&region, 1), present | 0x5_6780),
        ]));

        region.load_page_table(&pagemap).unwrap();
        assert_eq!(region.iova(0).unwrap(), 0x1_2340 << 12);
        assert_eq!(region.iova(PGSIZE_2MB + 9).unwrap(), (0x5_6780 << 12) + 9);
    }

    #[test]
    fn test_pagemap_hidden_frames_rejected() {
        let mut region = ShmRegion::anonymous(2 * PGSIZE_2MB).unwrap();
        let identity = region.iova(PGSIZE_2MB).unwrap();
        // Second page present but with the frame number masked out.
        let pagemap = FakePagemap(HashMap::from([
            (vpage(&region, 0), (1u64 << 63) | 0x42),
            (vpage(&region, 1), 1u64 << 63),
        ]));

        assert!(matches!(
            region.load_page_table(&pagemap),
            Err(ShmError::NotResident { page: 1 })
        ));
        // A failed load leaves the old table in place.
        assert_eq!(region.iova(PGSIZE_2MB).unwrap(), identity);
    }
}
