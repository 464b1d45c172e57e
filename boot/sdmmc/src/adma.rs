//! ADMA2 descriptor tables
//!
//! A data buffer is described to the controller as a table of 32-bit ADMA2
//! descriptor lines, one per 64 KiB chunk. The table lives in DMA-visible
//! pages owned by a [`DescriptorTable`], which releases its mapping and its
//! pages together when dropped.

use core::mem::size_of;

use helix_hal::dma::{DmaDirection, DmaMapper, DmaMapping, PageAllocator, DMA_PAGE_SIZE};
use helix_hal::{PageSize, PhysAddr};
use static_assertions::const_assert_eq;

use crate::error::{SdError, SdResult};

/// Largest transfer one descriptor line can describe
pub const ADMA_MAX_LINE_LEN: usize = 0x1_0000;

/// 32-bit ADMA2 descriptors cannot address memory at or above 4 GiB
pub const ADMA_ADDRESS_LIMIT: u64 = 1 << 32;

/// ADMA2 descriptor attributes
pub mod adma2_attr {
    /// Valid descriptor
    pub const VALID: u16 = 1 << 0;
    /// End of descriptor table
    pub const END: u16 = 1 << 1;
    /// Generate interrupt
    pub const INT: u16 = 1 << 2;
    /// Transfer data action
    pub const ACT_TRAN: u16 = 2 << 4;
}

/// One 32-bit ADMA2 descriptor line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct AdmaDescriptorLine {
    /// Attribute bits
    pub attr: u16,
    /// Length in bytes; 0 encodes 64 KiB
    pub length: u16,
    /// Physical address of the chunk
    pub address: u32,
}

const_assert_eq!(size_of::<AdmaDescriptorLine>(), 8);

impl AdmaDescriptorLine {
    /// Transfer line for `len` bytes (1..=64 KiB) at `address`
    pub const fn transfer(address: u32, len: usize, end: bool) -> Self {
        let mut attr = adma2_attr::VALID | adma2_attr::ACT_TRAN;
        if end {
            attr |= adma2_attr::END;
        }
        Self {
            attr,
            length: (len & 0xFFFF) as u16,
            address,
        }
    }

    /// Valid bit
    pub const fn is_valid(&self) -> bool {
        self.attr & adma2_attr::VALID != 0
    }

    /// End-of-table bit
    pub const fn is_end(&self) -> bool {
        self.attr & adma2_attr::END != 0
    }

    /// Transfer length in bytes, with 0 decoded as 64 KiB
    pub const fn byte_len(&self) -> usize {
        if self.length == 0 {
            ADMA_MAX_LINE_LEN
        } else {
            self.length as usize
        }
    }
}

/// Descriptor lines needed for `len` bytes
pub const fn descriptor_count(len: usize) -> usize {
    len.div_ceil(ADMA_MAX_LINE_LEN)
}

/// Pages needed to hold the descriptor table for `len` bytes
pub const fn table_pages(len: usize) -> usize {
    let bytes = descriptor_count(len) * size_of::<AdmaDescriptorLine>();
    PageSize::Size4KiB.pages_for(bytes as u64) as usize
}

fn check_range(address: PhysAddr, len: usize) -> SdResult<()> {
    if len == 0 || address.as_u64() >= ADMA_ADDRESS_LIMIT {
        return Err(SdError::InvalidArgument);
    }
    match address.checked_add(len as u64) {
        Some(end) if end.as_u64() <= ADMA_ADDRESS_LIMIT => Ok(()),
        _ => Err(SdError::InvalidArgument),
    }
}

/// Describe `len` bytes at `address` into `lines`
///
/// Returns the number of lines written. The last line carries the end flag.
pub fn fill_descriptors(
    address: PhysAddr,
    len: usize,
    lines: &mut [AdmaDescriptorLine],
) -> SdResult<usize> {
    check_range(address, len)?;
    let count = descriptor_count(len);
    if lines.len() < count {
        return Err(SdError::InvalidArgument);
    }
    let mut remaining = len;
    let mut chunk_addr = address.as_u64();
    for (index, line) in lines[..count].iter_mut().enumerate() {
        let chunk = remaining.min(ADMA_MAX_LINE_LEN);
        *line = AdmaDescriptorLine::transfer(chunk_addr as u32, chunk, index + 1 == count);
        remaining -= chunk;
        chunk_addr += chunk as u64;
    }
    Ok(count)
}

/// Descriptor table in DMA-visible pages
#[derive(Debug)]
pub struct DescriptorTable<'p, P: DmaMapper + PageAllocator + ?Sized> {
    platform: &'p P,
    host: usize,
    pages: usize,
    lines: usize,
    mapping: Option<DmaMapping>,
}

impl<'p, P: DmaMapper + PageAllocator + ?Sized> DescriptorTable<'p, P> {
    /// Build and map the table describing `len` bytes at device address `data`
    pub fn build(platform: &'p P, data: PhysAddr, len: usize) -> SdResult<Self> {
        check_range(data, len)?;
        let pages = table_pages(len);
        let host = platform
            .allocate_pages(pages)
            .map_err(|_| SdError::OutOfResources)?;
        let mut table = Self {
            platform,
            host,
            pages,
            lines: descriptor_count(len),
            mapping: None,
        };

        // SAFETY: the pages were just allocated for this table and are large
        // enough for `lines` descriptors; the table owns them until drop.
        let lines = unsafe {
            core::slice::from_raw_parts_mut(host as *mut AdmaDescriptorLine, table.lines)
        };
        fill_descriptors(data, len, lines)?;

        let mapping = platform.map(host, pages * DMA_PAGE_SIZE, DmaDirection::Bidirectional)?;
        table.mapping = Some(mapping);
        if mapping.device().as_u64() + (pages * DMA_PAGE_SIZE) as u64 > ADMA_ADDRESS_LIMIT {
            return Err(SdError::InvalidArgument);
        }
        log::trace!(
            "ADMA2 table: {} lines for {:#x}+{:#x} at {:#x}",
            table.lines,
            data.as_u64(),
            len,
            mapping.device().as_u64()
        );
        Ok(table)
    }

    /// Address to program into the ADMA system address register
    pub fn device_address(&self) -> PhysAddr {
        self.mapping.map_or(PhysAddr::new(0), |m| m.device())
    }

    /// The descriptor lines
    pub fn lines(&self) -> &[AdmaDescriptorLine] {
        // SAFETY: see `build`; the memory stays valid while `self` lives.
        unsafe { core::slice::from_raw_parts(self.host as *const AdmaDescriptorLine, self.lines) }
    }
}

impl<P: DmaMapper + PageAllocator + ?Sized> Drop for DescriptorTable<'_, P> {
    fn drop(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            if let Err(err) = self.platform.unmap(&mapping) {
                log::warn!("ADMA2 table unmap failed: {}", err);
            }
        }
        if let Err(err) = self.platform.free_pages(self.host, self.pages) {
            log::warn!("ADMA2 table free failed: {}", err);
        }
    }
}
