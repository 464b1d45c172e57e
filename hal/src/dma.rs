//! DMA Mapping and Page Allocation
//!
//! Bus-mastering devices see memory through the platform's DMA view. Drivers
//! never compute device addresses themselves: they ask a [`DmaMapper`] for a
//! [`DmaMapping`] and hand the device address it returns to the hardware.
//! Memory the device reads on its own (descriptor tables) comes from a
//! [`PageAllocator`].

use spin::Mutex;

use crate::{HalError, HalResult, PageSize, PhysAddr};

/// Size of the pages handed out by [`PageAllocator`]
pub const DMA_PAGE_SIZE: usize = PageSize::Size4KiB.size() as usize;

// =============================================================================
// MAPPING
// =============================================================================

/// Direction of a bus-master transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Device reads from memory
    ToDevice,
    /// Device writes to memory
    FromDevice,
    /// Device both reads and writes (descriptor tables)
    Bidirectional,
}

/// An active DMA mapping of a host buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaMapping {
    host: usize,
    device: PhysAddr,
    len: usize,
    direction: DmaDirection,
}

impl DmaMapping {
    /// Describe a mapping; called by [`DmaMapper`] implementations
    pub const fn new(host: usize, device: PhysAddr, len: usize, direction: DmaDirection) -> Self {
        Self { host, device, len, direction }
    }

    /// Host (CPU) address of the buffer
    pub const fn host(&self) -> usize {
        self.host
    }

    /// Address the device must use
    pub const fn device(&self) -> PhysAddr {
        self.device
    }

    /// Mapped length in bytes
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Check for an empty mapping
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Transfer direction
    pub const fn direction(&self) -> DmaDirection {
        self.direction
    }
}

/// Platform DMA mapping service
pub trait DmaMapper {
    /// Make `len` bytes at `host` visible to the device
    fn map(&self, host: usize, len: usize, direction: DmaDirection) -> HalResult<DmaMapping>;

    /// Release a mapping returned by [`DmaMapper::map`]
    fn unmap(&self, mapping: &DmaMapping) -> HalResult<()>;
}

/// Mapper for platforms where the device sees host addresses unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMapper;

impl DmaMapper for IdentityMapper {
    fn map(&self, host: usize, len: usize, direction: DmaDirection) -> HalResult<DmaMapping> {
        if host == 0 {
            return Err(HalError::InvalidAddress);
        }
        Ok(DmaMapping::new(host, PhysAddr::new(host as u64), len, direction))
    }

    fn unmap(&self, _mapping: &DmaMapping) -> HalResult<()> {
        Ok(())
    }
}

// =============================================================================
// PAGE ALLOCATION
// =============================================================================

/// Allocator for DMA-visible, page-aligned memory
pub trait PageAllocator {
    /// Allocate `count` contiguous zeroed pages, returning the host address
    fn allocate_pages(&self, count: usize) -> HalResult<usize>;

    /// Free pages returned by [`PageAllocator::allocate_pages`]
    fn free_pages(&self, host: usize, count: usize) -> HalResult<()>;
}

/// Maximum number of pages a [`PagePool`] can manage
pub const PAGE_POOL_MAX_PAGES: usize = 1024;

const POOL_WORDS: usize = PAGE_POOL_MAX_PAGES / 64;

static_assertions::const_assert_eq!(PAGE_POOL_MAX_PAGES % 64, 0);

/// Bitmap page allocator over a caller-supplied memory region
#[derive(Debug)]
pub struct PagePool {
    /// Base address of the region (page aligned)
    base: usize,
    /// Total number of pages
    pages: usize,
    /// Bitmap data (1 = used, 0 = free)
    bitmap: Mutex<[u64; POOL_WORDS]>,
}

impl PagePool {
    /// Create a pool over `pages` pages starting at `base`
    ///
    /// # Safety
    ///
    /// The region must be writable, DMA-visible, and owned exclusively by the
    /// pool for as long as it exists.
    pub unsafe fn new(base: usize, pages: usize) -> HalResult<Self> {
        if base == 0 || base % DMA_PAGE_SIZE != 0 {
            return Err(HalError::InvalidAddress);
        }
        if pages == 0 || pages > PAGE_POOL_MAX_PAGES {
            return Err(HalError::InvalidParameter);
        }
        log::debug!("DMA page pool: {} pages at {:#x}", pages, base);
        Ok(Self {
            base,
            pages,
            bitmap: Mutex::new([0; POOL_WORDS]),
        })
    }

    /// Number of free pages
    pub fn free_count(&self) -> usize {
        let bitmap = self.bitmap.lock();
        let used: u32 = bitmap.iter().map(|word| word.count_ones()).sum();
        self.pages - used as usize
    }

    fn is_used(bitmap: &[u64; POOL_WORDS], page: usize) -> bool {
        bitmap[page / 64] & (1 << (page % 64)) != 0
    }

    fn set_range(bitmap: &mut [u64; POOL_WORDS], start: usize, count: usize, used: bool) {
        for page in start..start + count {
            if used {
                bitmap[page / 64] |= 1 << (page % 64);
            } else {
                bitmap[page / 64] &= !(1 << (page % 64));
            }
        }
    }

    /// Find contiguous free pages
    fn find_contiguous(&self, bitmap: &[u64; POOL_WORDS], count: usize) -> Option<usize> {
        let mut start = 0;
        let mut found = 0;
        for page in 0..self.pages {
            if Self::is_used(bitmap, page) {
                found = 0;
                continue;
            }
            if found == 0 {
                start = page;
            }
            found += 1;
            if found >= count {
                return Some(start);
            }
        }
        None
    }
}

impl PageAllocator for PagePool {
    fn allocate_pages(&self, count: usize) -> HalResult<usize> {
        if count == 0 {
            return Err(HalError::InvalidParameter);
        }
        let mut bitmap = self.bitmap.lock();
        let start = self
            .find_contiguous(&bitmap, count)
            .ok_or(HalError::OutOfMemory)?;
        Self::set_range(&mut bitmap, start, count, true);
        drop(bitmap);

        let host = self.base + start * DMA_PAGE_SIZE;
        // SAFETY: the pages lie inside the region handed to `new` and were
        // just marked used, so nothing else references them.
        unsafe {
            core::ptr::write_bytes(host as *mut u8, 0, count * DMA_PAGE_SIZE);
        }
        log::trace!("DMA page pool: allocated {} pages at {:#x}", count, host);
        Ok(host)
    }

    fn free_pages(&self, host: usize, count: usize) -> HalResult<()> {
        if host < self.base || (host - self.base) % DMA_PAGE_SIZE != 0 {
            return Err(HalError::InvalidAddress);
        }
        let start = (host - self.base) / DMA_PAGE_SIZE;
        if count == 0 || start + count > self.pages {
            return Err(HalError::InvalidParameter);
        }
        let mut bitmap = self.bitmap.lock();
        if (start..start + count).any(|page| !Self::is_used(&bitmap, page)) {
            return Err(HalError::InvalidAddress);
        }
        Self::set_range(&mut bitmap, start, count, false);
        log::trace!("DMA page pool: freed {} pages at {:#x}", count, host);
        Ok(())
    }
}
