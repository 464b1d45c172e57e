//! Memory-Mapped Register Access
//!
//! Register access is split into two layers:
//!
//! - [`RegisterBus`] is the raw contract: a single read or write of 1, 2, 4
//!   or 8 bytes at a byte offset inside a register window.
//! - [`RegisterBusExt`] layers typed access on top of any bus, together with
//!   the OR/AND/modify helpers and the poll-until-match primitive drivers use
//!   to wait for hardware state changes.
//!
//! [`MmioWindow`] is the volatile implementation used on real hardware.

use core::ptr;

use crate::time::Stall;
use crate::{HalError, HalResult, PhysAddr};

// =============================================================================
// RAW BUS
// =============================================================================

/// Raw access to a block of device registers
///
/// Each call performs exactly one access of `width` bytes; there are no side
/// effects beyond that access.
pub trait RegisterBus {
    /// Read `width` bytes at `offset`, zero-extended to 64 bits
    fn read(&self, offset: usize, width: usize) -> HalResult<u64>;

    /// Write the low `width` bytes of `value` at `offset`
    fn write(&self, offset: usize, width: usize, value: u64) -> HalResult<()>;
}

impl<B: RegisterBus + ?Sized> RegisterBus for &B {
    fn read(&self, offset: usize, width: usize) -> HalResult<u64> {
        (**self).read(offset, width)
    }

    fn write(&self, offset: usize, width: usize, value: u64) -> HalResult<()> {
        (**self).write(offset, width, value)
    }
}

/// Check that `width` is one of the supported access sizes
#[inline]
pub const fn is_valid_width(width: usize) -> bool {
    matches!(width, 1 | 2 | 4 | 8)
}

/// Volatile register window at a fixed address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioWindow {
    base: PhysAddr,
}

impl MmioWindow {
    /// Create a window over the registers at `base`
    ///
    /// A null base is accepted here and rejected on every access.
    ///
    /// # Safety
    ///
    /// `base` must be identity-mapped, device memory (uncached) and valid for
    /// every offset the driver will touch. No other code may drive the same
    /// registers while the window is in use.
    pub const unsafe fn new(base: PhysAddr) -> Self {
        Self { base }
    }

    /// Base address of the window
    pub const fn base(&self) -> PhysAddr {
        self.base
    }

    fn address(&self, offset: usize, width: usize) -> HalResult<usize> {
        if self.base.is_null() || !is_valid_width(width) {
            return Err(HalError::InvalidParameter);
        }
        let addr = self
            .base
            .checked_add(offset as u64)
            .ok_or(HalError::InvalidAddress)?;
        if !addr.is_aligned(width as u64) {
            return Err(HalError::InvalidAddress);
        }
        Ok(addr.as_u64() as usize)
    }
}

impl RegisterBus for MmioWindow {
    fn read(&self, offset: usize, width: usize) -> HalResult<u64> {
        let addr = self.address(offset, width)?;
        // SAFETY: the constructor contract makes every aligned offset in the
        // window a valid device register.
        let value = unsafe {
            match width {
                1 => ptr::read_volatile(addr as *const u8) as u64,
                2 => ptr::read_volatile(addr as *const u16) as u64,
                4 => ptr::read_volatile(addr as *const u32) as u64,
                _ => ptr::read_volatile(addr as *const u64),
            }
        };
        Ok(value)
    }

    fn write(&self, offset: usize, width: usize, value: u64) -> HalResult<()> {
        let addr = self.address(offset, width)?;
        // SAFETY: see `read`.
        unsafe {
            match width {
                1 => ptr::write_volatile(addr as *mut u8, value as u8),
                2 => ptr::write_volatile(addr as *mut u16, value as u16),
                4 => ptr::write_volatile(addr as *mut u32, value as u32),
                _ => ptr::write_volatile(addr as *mut u64, value),
            }
        }
        Ok(())
    }
}

// =============================================================================
// TYPED ACCESS
// =============================================================================

/// An unsigned integer type that maps onto one register access width
pub trait Register: Copy + Eq + core::fmt::Debug {
    /// Access width in bytes
    const WIDTH: usize;

    /// Truncate a raw bus value to this width
    fn from_raw(raw: u64) -> Self;

    /// Widen to a raw bus value
    fn to_raw(self) -> u64;
}

macro_rules! impl_register {
    ($($ty:ty),*) => {
        $(
            impl Register for $ty {
                const WIDTH: usize = core::mem::size_of::<$ty>();

                #[inline]
                fn from_raw(raw: u64) -> Self {
                    raw as $ty
                }

                #[inline]
                fn to_raw(self) -> u64 {
                    self as u64
                }
            }
        )*
    };
}

impl_register!(u8, u16, u32, u64);

/// Typed helpers available on every [`RegisterBus`]
pub trait RegisterBusExt: RegisterBus {
    /// Read a register of type `T`
    #[inline]
    fn read_reg<T: Register>(&self, offset: usize) -> HalResult<T> {
        self.read(offset, T::WIDTH).map(T::from_raw)
    }

    /// Write a register of type `T`
    #[inline]
    fn write_reg<T: Register>(&self, offset: usize, value: T) -> HalResult<()> {
        self.write(offset, T::WIDTH, value.to_raw())
    }

    /// Read, transform and write back a register
    fn modify_reg<T: Register, F: FnOnce(T) -> T>(&self, offset: usize, f: F) -> HalResult<()> {
        let value = self.read_reg::<T>(offset)?;
        self.write_reg(offset, f(value))
    }

    /// Set `bits` in a register
    fn or_reg<T: Register>(&self, offset: usize, bits: T) -> HalResult<()> {
        self.modify_reg::<T, _>(offset, |v| T::from_raw(v.to_raw() | bits.to_raw()))
    }

    /// Keep only `mask` bits in a register
    fn and_reg<T: Register>(&self, offset: usize, mask: T) -> HalResult<()> {
        self.modify_reg::<T, _>(offset, |v| T::from_raw(v.to_raw() & mask.to_raw()))
    }

    /// Check whether `(reg & mask) == value`
    fn check_reg<T: Register>(&self, offset: usize, mask: T, value: T) -> HalResult<bool> {
        let current = self.read_reg::<T>(offset)?;
        Ok(current.to_raw() & mask.to_raw() == value.to_raw())
    }

    /// Poll until `(reg & mask) == value`
    ///
    /// Polls every microsecond for at most `timeout_us` microseconds. A
    /// timeout of 0 waits forever. Read failures end the wait immediately.
    fn wait_reg<T: Register>(
        &self,
        offset: usize,
        mask: T,
        value: T,
        timeout_us: u64,
        stall: &dyn Stall,
    ) -> HalResult<()> {
        let infinite = timeout_us == 0;
        let mut remaining = timeout_us;
        loop {
            if self.check_reg(offset, mask, value)? {
                return Ok(());
            }
            if !infinite {
                if remaining == 0 {
                    return Err(HalError::Timeout);
                }
                remaining -= 1;
            }
            stall.stall(1);
        }
    }
}

impl<B: RegisterBus + ?Sized> RegisterBusExt for B {}
