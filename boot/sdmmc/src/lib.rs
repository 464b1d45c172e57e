//! # Helix SD/eMMC Boot Driver
//!
//! Polled SDHCI host controller driver used by the boot stage to bring up a
//! removable SD card or an embedded MMC device and expose it as one or more
//! block devices.
//!
//! ## Architecture
//!
//! ```text
//!   SdMmcDriver (initialize / read_blocks / write_blocks / media_info)
//!        |
//!   block      chunking, eMMC partition selection, transfer recovery
//!   emmc / sd  identification flows per card kind
//!   bus_mode   speed mode selection, tuning
//!   ops        one method per card command
//!        |
//!   trb        command engine: submit, poll, PIO, SDMA, ADMA2
//!   host       reset, clock, power, signalling
//!        |
//!   helix-hal  RegisterBus, Stall, DmaMapper, PageAllocator
//! ```
//!
//! All hardware access goes through a [`Platform`], which supplies the
//! register window, the delay source and bus-master DMA services. Driver
//! state lives in a caller-owned [`SdMmcContext`] between calls.
//!
//! ## Initialization phases
//!
//! Initialization can run in one call ([`InitPhase::Both`]) or be split so
//! the slow card power-up overlaps other boot work: [`InitPhase::Early`]
//! resets the controller and starts the card handshake, [`InitPhase::Late`]
//! finishes identification and negotiates the fastest bus mode both sides
//! support.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

#[cfg(test)]
extern crate std;

pub mod adma;
pub mod block;
pub mod bus_mode;
pub mod card;
pub mod command;
pub mod config;
pub mod emmc;
pub mod error;
pub mod host;
pub mod ops;
pub mod regs;
pub mod sd;
pub mod state;
pub mod trb;

#[cfg(test)]
pub(crate) mod sim;

use core::fmt;

use helix_hal::dma::{DmaMapper, PageAllocator};
use helix_hal::mmio::RegisterBus;
use helix_hal::time::Stall;
use helix_hal::HalResult;

pub use block::{partition, BlockIo, MediaInfo};
pub use bus_mode::{BusTiming, BusWidth};
pub use config::{DmaProtection, DriverPolicy, InitConfig};
pub use error::{SdError, SdResult};
pub use host::SdHost;
pub use state::{CardKind, ControllerState, InitPhase, MemoryOrigin, SdMmcContext};

/// Services the firmware environment provides to the driver
pub trait Platform: Stall + DmaMapper + PageAllocator {
    /// Register window of one controller
    type Bus: RegisterBus;

    /// Open the register window of the controller at `pci_base`
    fn open_controller(&self, pci_base: u64) -> HalResult<Self::Bus>;
}

/// Driver entry points
pub struct SdMmcDriver<'p, P: Platform> {
    platform: &'p P,
}

impl<P: Platform> fmt::Debug for SdMmcDriver<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdMmcDriver").finish_non_exhaustive()
    }
}

impl<'p, P: Platform> SdMmcDriver<'p, P> {
    /// Driver bound to `platform`
    pub const fn new(platform: &'p P) -> Self {
        Self { platform }
    }

    /// Run the requested initialization phase
    ///
    /// A failure releases the controller state according to its
    /// [`MemoryOrigin`]. Calling again after a successful full
    /// initialization is a no-op.
    pub fn initialize(&self, ctx: &mut SdMmcContext, config: &InitConfig) -> SdResult<()> {
        if config.phase == InitPhase::Deinit {
            self.deinitialize(ctx);
            return Ok(());
        }

        let result = self.bring_up(ctx, config);
        if let Err(err) = result {
            log::error!(
                "SDHC: {:?} at {:#x}, {:?} phase failed: {}",
                config.card,
                config.pci_base,
                config.phase,
                err
            );
            ctx.release_after_failure();
        }
        result
    }

    fn bring_up(&self, ctx: &mut SdMmcContext, config: &InitConfig) -> SdResult<()> {
        let state = ctx.acquire(config);
        state.policy = config.policy;
        if state.is_initialized() {
            log::debug!("SDHC: controller at {:#x} already initialized", config.pci_base);
            return Ok(());
        }
        if config.phase == InitPhase::Late && !state.early_done {
            log::error!("SDHC: late phase requested before the early phase");
            return Err(SdError::NotReady);
        }

        let bus = self.platform.open_controller(config.pci_base)?;
        let mut host = SdHost::new(self.platform, bus, state);
        if config.phase.runs_early() && !host.state.early_done {
            early_phase(&mut host)?;
        }
        if config.phase.runs_late() {
            late_phase(&mut host)?;
        }
        Ok(())
    }

    fn deinitialize(&self, ctx: &mut SdMmcContext) {
        if let Some(state) = ctx.state_mut().filter(|s| s.is_valid()) {
            match self.platform.open_controller(state.pci_base) {
                Ok(bus) => {
                    let mut host = SdHost::new(self.platform, bus, state);
                    if let Err(err) = host.power_off() {
                        log::warn!("SDHC: power off failed: {}", err);
                    }
                }
                Err(err) => log::warn!("SDHC: controller unavailable at teardown: {:?}", err),
            }
        }
        ctx.clear();
    }

    fn with_host<R>(
        &self,
        ctx: &mut SdMmcContext,
        f: impl FnOnce(&mut SdHost<'_, P>) -> SdResult<R>,
    ) -> SdResult<R> {
        let state = ctx
            .state_mut()
            .filter(|s| s.is_valid() && s.is_initialized())
            .ok_or(SdError::NotReady)?;
        let bus = self.platform.open_controller(state.pci_base)?;
        let mut host = SdHost::new(self.platform, bus, state);
        f(&mut host)
    }

    /// Read whole blocks of logical device `device` starting at `lba`
    pub fn read_blocks(
        &self,
        ctx: &mut SdMmcContext,
        device: u8,
        lba: u64,
        buffer: &mut [u8],
    ) -> SdResult<()> {
        self.with_host(ctx, |host| {
            host.transfer_blocks(device, lba, BlockIo::Read(buffer))
        })
    }

    /// Write whole blocks of logical device `device` starting at `lba`
    ///
    /// `reliable` requests an eMMC reliable write and is ignored for SD.
    pub fn write_blocks(
        &self,
        ctx: &mut SdMmcContext,
        device: u8,
        lba: u64,
        data: &[u8],
        reliable: bool,
    ) -> SdResult<()> {
        self.with_host(ctx, |host| {
            host.transfer_blocks(device, lba, BlockIo::Write { data, reliable })
        })
    }

    /// Geometry of logical device `device`
    pub fn media_info(&self, ctx: &SdMmcContext, device: u8) -> SdResult<MediaInfo> {
        let state = ctx.state().ok_or(SdError::NotReady)?;
        block::media_info(state, device)
    }
}

fn early_phase<P: Platform>(host: &mut SdHost<'_, P>) -> SdResult<()> {
    host.reset_controller()?;
    host.read_capability()?;
    let present = host.card_present()?;
    host.state.slot.media_present = present;
    if !present {
        log::warn!("SDHC: no card in slot");
        return Err(SdError::NotReady);
    }

    host.init_host()?;
    match host.state.slot.card {
        CardKind::Emmc => host.emmc_early_init()?,
        CardKind::Sd => host.sd_early_init()?,
    }
    host.state.early_done = true;
    Ok(())
}

fn late_phase<P: Platform>(host: &mut SdHost<'_, P>) -> SdResult<()> {
    match host.state.slot.card {
        CardKind::Emmc => host.emmc_late_init()?,
        CardKind::Sd => host.sd_late_init()?,
    }
    host.state.slot.initialized = true;
    log::info!(
        "SDHC: {:?} ready, {:?} x{} at {} kHz",
        host.state.slot.card,
        host.state.slot.timing,
        host.state.slot.bus_width.bits(),
        host.state.current_freq_khz()
    );
    Ok(())
}
