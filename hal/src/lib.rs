//! # Helix HAL - Hardware Abstraction Layer
//!
//! This crate defines the hardware-facing primitives that boot-stage device
//! drivers are written against. It knows nothing about any particular
//! device: drivers describe what they need through the traits below and the
//! firmware environment supplies the implementations.
//!
//! ## Layout
//!
//! - [`mmio`]: width-checked register access over a memory-mapped window,
//!   plus typed read/modify/write and polling helpers
//! - [`time`]: microsecond busy-wait delays
//! - [`dma`]: bus-master mapping and DMA-visible page allocation
//!
//! ## Design Philosophy
//!
//! The HAL is designed to be:
//! - **Minimal**: Only exposes what a polled boot driver needs
//! - **Safe**: Encapsulates the volatile accesses behind checked APIs
//! - **Replaceable**: Every collaborator is a trait, so tests can swap in
//!   a simulated device

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

#[cfg(test)]
extern crate std;

pub mod dma;
pub mod mmio;
pub mod time;

use core::fmt;

/// Result type for HAL operations
pub type HalResult<T> = Result<T, HalError>;

/// Errors that can occur in HAL operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// The operation is not supported on this platform
    NotSupported,
    /// Invalid parameter provided
    InvalidParameter,
    /// Hardware reported an error
    HardwareError,
    /// Resource is not available
    ResourceBusy,
    /// Operation timed out
    Timeout,
    /// Address is invalid or not aligned
    InvalidAddress,
    /// Memory allocation failed
    OutOfMemory,
    /// Feature not initialized
    NotInitialized,
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HalError::NotSupported => write!(f, "Operation not supported"),
            HalError::InvalidParameter => write!(f, "Invalid parameter"),
            HalError::HardwareError => write!(f, "Hardware error"),
            HalError::ResourceBusy => write!(f, "Resource busy"),
            HalError::Timeout => write!(f, "Operation timed out"),
            HalError::InvalidAddress => write!(f, "Invalid address"),
            HalError::OutOfMemory => write!(f, "Out of memory"),
            HalError::NotInitialized => write!(f, "Not initialized"),
        }
    }
}

/// Physical address type (architecture-independent)
///
/// For DMA this is the address as seen by the bus master, which may differ
/// from the CPU's view when an IOMMU sits in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Create a new physical address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if this is the null address
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check if the address is aligned to the given alignment
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 % align == 0
    }

    /// Align the address down to the given alignment
    #[inline]
    pub const fn align_down(self, align: u64) -> Self {
        Self(self.0 & !(align - 1))
    }

    /// Add an offset to the address
    #[inline]
    pub const fn add(self, offset: u64) -> Self {
        Self(self.0 + offset)
    }

    /// Add an offset, returning `None` on overflow
    #[inline]
    pub const fn checked_add(self, offset: u64) -> Option<Self> {
        match self.0.checked_add(offset) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }
}

/// Page size enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PageSize {
    /// 4 KiB page
    Size4KiB,
    /// 2 MiB page (large page)
    Size2MiB,
    /// 1 GiB page (huge page)
    Size1GiB,
}

impl PageSize {
    /// Get the size in bytes
    #[inline]
    pub const fn size(self) -> u64 {
        match self {
            PageSize::Size4KiB => 4 * 1024,
            PageSize::Size2MiB => 2 * 1024 * 1024,
            PageSize::Size1GiB => 1024 * 1024 * 1024,
        }
    }

    /// Number of pages of this size needed to hold `bytes`
    #[inline]
    pub const fn pages_for(self, bytes: u64) -> u64 {
        bytes.div_ceil(self.size())
    }
}
