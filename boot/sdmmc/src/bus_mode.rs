//! Bus-mode negotiation
//!
//! Mode selection is a pure function of what the card and the host
//! advertise; the switch sequences then walk card and host through the
//! width, timing and clock changes in the order the bus protocol requires.
//!
//! ```text
//! eMMC:  Legacy ─► HS26/HS52 ─► HS-DDR
//!                     └──────► HS200 (tune) ─► HS52 ─► 8-bit DDR ─► HS400
//! SD:    4-bit ─► SWITCH_FUNC query ─► commit ─► host timing ─► clock (tune)
//! ```

use crate::card::{device_type, ext_csd, hs_timing, sd_access_mode, SwitchStatus};
use crate::config::DriverPolicy;
use crate::error::{SdError, SdResult};
use crate::host::SdHost;
use crate::ops::SWITCH_FUNC_KEEP;
use crate::regs::{sdhc_regs, uhs_mode, HostCapability, HostControl2};
use crate::Platform;

use helix_hal::mmio::RegisterBusExt;

/// Tuning block exchanges before giving up
pub const MAX_TUNING_ATTEMPTS: usize = 40;

/// eMMC HS200/HS400 clock
pub const EMMC_HS200_CLOCK_KHZ: u32 = 200_000;
/// eMMC high speed clock (52 MHz devices)
pub const EMMC_HS52_CLOCK_KHZ: u32 = 52_000;
/// eMMC high speed clock (26 MHz devices)
pub const EMMC_HS26_CLOCK_KHZ: u32 = 26_000;

/// SD SDR104 clock
pub const SD_SDR104_CLOCK_KHZ: u32 = 208_000;
/// SD SDR50 clock
pub const SD_SDR50_CLOCK_KHZ: u32 = 100_000;
/// SD DDR50 and high speed clock
pub const SD_HS_CLOCK_KHZ: u32 = 50_000;
/// SD default speed clock
pub const SD_DEFAULT_CLOCK_KHZ: u32 = 25_000;

/// Data bus width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusWidth {
    /// DAT0 only
    #[default]
    Width1,
    /// DAT[3:0]
    Width4,
    /// DAT[7:0]
    Width8,
}

impl BusWidth {
    /// Width from a line count
    pub const fn from_bits(bits: u8) -> SdResult<Self> {
        match bits {
            1 => Ok(BusWidth::Width1),
            4 => Ok(BusWidth::Width4),
            8 => Ok(BusWidth::Width8),
            _ => Err(SdError::InvalidArgument),
        }
    }

    /// Number of data lines
    pub const fn bits(self) -> u8 {
        match self {
            BusWidth::Width1 => 1,
            BusWidth::Width4 => 4,
            BusWidth::Width8 => 8,
        }
    }

    /// EXT_CSD BUS_WIDTH value
    pub const fn ext_csd_value(self, ddr: bool) -> u8 {
        let base = match self {
            BusWidth::Width1 => 0,
            BusWidth::Width4 => 1,
            BusWidth::Width8 => 2,
        };
        if ddr {
            base + 4
        } else {
            base
        }
    }
}

/// Negotiated bus timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusTiming {
    /// eMMC backward compatible / SD default speed
    #[default]
    Legacy,
    /// High speed SDR
    HighSpeed,
    /// eMMC high speed DDR
    HighSpeedDdr,
    /// eMMC HS200
    Hs200,
    /// eMMC HS400
    Hs400,
    /// SD UHS-I SDR50
    Sdr50,
    /// SD UHS-I SDR104
    Sdr104,
    /// SD UHS-I DDR50
    Ddr50,
}

impl BusTiming {
    /// Timings that sample on both clock edges
    pub const fn is_ddr(self) -> bool {
        matches!(self, BusTiming::HighSpeedDdr | BusTiming::Hs400 | BusTiming::Ddr50)
    }
}

/// Target of eMMC negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmmcBusMode {
    /// Timing
    pub timing: BusTiming,
    /// Bus width
    pub width: BusWidth,
    /// Clock in kHz
    pub clock_khz: u32,
}

/// Best eMMC mode both sides support
pub fn select_emmc_mode(
    device: u8,
    capability: &HostCapability,
    policy: &DriverPolicy,
) -> EmmcBusMode {
    let width = if capability.bus_width8() {
        BusWidth::Width8
    } else {
        BusWidth::Width4
    };

    let (timing, clock_khz) = if device & device_type::HS200 != 0 && capability.sdr104() {
        (BusTiming::Hs200, EMMC_HS200_CLOCK_KHZ)
    } else if device & device_type::HS_DDR != 0 && capability.ddr50() {
        (BusTiming::HighSpeedDdr, EMMC_HS52_CLOCK_KHZ)
    } else if device & device_type::HS_52 != 0 && capability.high_speed() {
        (BusTiming::HighSpeed, EMMC_HS52_CLOCK_KHZ)
    } else if device & device_type::HS_26 != 0 && capability.high_speed() {
        (BusTiming::HighSpeed, EMMC_HS26_CLOCK_KHZ)
    } else {
        return EmmcBusMode {
            timing: BusTiming::Legacy,
            width: BusWidth::Width1,
            clock_khz: 0,
        };
    };

    let hs400 = timing == BusTiming::Hs200
        && device & device_type::HS400 != 0
        && capability.hs400()
        && capability.bus_width8()
        && !policy.hs400_downgrade;
    if hs400 {
        return EmmcBusMode {
            timing: BusTiming::Hs400,
            width: BusWidth::Width8,
            clock_khz: EMMC_HS200_CLOCK_KHZ,
        };
    }
    EmmcBusMode { timing, width, clock_khz }
}

/// Target of SD negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdBusMode {
    /// Function group 1 access mode
    pub access_mode: u8,
    /// Timing
    pub timing: BusTiming,
    /// Clock in kHz
    pub clock_khz: u32,
}

/// Best SD access mode both sides support
///
/// UHS-I modes need the card to have accepted 1.8V signalling.
pub fn select_sd_mode(status: &SwitchStatus, s18a: bool, capability: &HostCapability) -> SdBusMode {
    let mode = |access_mode, timing, clock_khz| SdBusMode {
        access_mode,
        timing,
        clock_khz,
    };
    if s18a && capability.sdr104() && status.supports(sd_access_mode::SDR104) {
        mode(sd_access_mode::SDR104, BusTiming::Sdr104, SD_SDR104_CLOCK_KHZ)
    } else if s18a && capability.sdr50() && status.supports(sd_access_mode::SDR50) {
        mode(sd_access_mode::SDR50, BusTiming::Sdr50, SD_SDR50_CLOCK_KHZ)
    } else if s18a && capability.ddr50() && status.supports(sd_access_mode::DDR50) {
        mode(sd_access_mode::DDR50, BusTiming::Ddr50, SD_HS_CLOCK_KHZ)
    } else if capability.high_speed() && status.supports(sd_access_mode::HIGH_SPEED) {
        mode(sd_access_mode::HIGH_SPEED, BusTiming::HighSpeed, SD_HS_CLOCK_KHZ)
    } else {
        mode(sd_access_mode::DEFAULT, BusTiming::Legacy, SD_DEFAULT_CLOCK_KHZ)
    }
}

impl<'a, P: Platform> SdHost<'a, P> {
    // =========================================================================
    // TUNING
    // =========================================================================

    /// Sampling-point tuning loop
    pub fn execute_tuning(&mut self) -> SdResult<()> {
        let control = (HostControl2::EXECUTE_TUNING | HostControl2::SAMPLING_CLOCK).bits();
        self.bus
            .or_reg(sdhc_regs::HOST_CONTROL2, HostControl2::EXECUTE_TUNING.bits())?;

        for attempt in 0..MAX_TUNING_ATTEMPTS {
            if let Err(err) = self.send_tuning_block() {
                self.bus.and_reg(sdhc_regs::HOST_CONTROL2, !control)?;
                log::error!("SDHC: tuning block {} failed: {}", attempt, err);
                return Err(err);
            }

            let ctrl2 =
                HostControl2::from_bits_retain(self.bus.read_reg(sdhc_regs::HOST_CONTROL2)?);
            let executing = ctrl2.contains(HostControl2::EXECUTE_TUNING);
            let sampling = ctrl2.contains(HostControl2::SAMPLING_CLOCK);
            if !executing && sampling {
                log::debug!("SDHC: tuning done after {} blocks", attempt + 1);
                return Ok(());
            }
            if !executing {
                // Tuning ended without a sampling point
                break;
            }
        }

        self.bus.and_reg(sdhc_regs::HOST_CONTROL2, !control)?;
        log::error!("SDHC: tuning failed");
        Err(SdError::DeviceError)
    }

    // =========================================================================
    // eMMC
    // =========================================================================

    fn emmc_switch_bus_width(&mut self, width: BusWidth, ddr: bool) -> SdResult<()> {
        self.mmc_switch(ext_csd::BUS_WIDTH as u8, width.ext_csd_value(ddr))?;
        self.set_bus_width(width)
    }

    fn emmc_switch_timing(&mut self, timing: u8) -> SdResult<()> {
        self.mmc_switch(ext_csd::HS_TIMING as u8, timing)
    }

    fn emmc_switch_to_high_speed(&mut self, mode: EmmcBusMode) -> SdResult<()> {
        let ddr = mode.timing.is_ddr();
        self.emmc_switch_bus_width(mode.width, ddr)?;
        self.emmc_switch_timing(hs_timing::HIGH_SPEED)?;
        self.enable_high_speed()?;
        let uhs = if ddr {
            uhs_mode::DDR50
        } else if mode.clock_khz == EMMC_HS52_CLOCK_KHZ {
            uhs_mode::SDR25
        } else {
            uhs_mode::SDR12
        };
        self.set_uhs_mode(uhs)?;
        self.supply_clock(mode.clock_khz)
    }

    fn emmc_switch_to_hs200(&mut self, width: BusWidth, clock_khz: u32) -> SdResult<()> {
        self.emmc_switch_bus_width(width, false)?;
        self.stop_clock()?;
        self.wait_clock_stable()?;
        self.start_sd_clock()?;
        self.emmc_switch_timing(hs_timing::HS200)?;
        self.set_uhs_mode(uhs_mode::SDR104)?;
        self.supply_clock(clock_khz)?;
        self.execute_tuning()
    }

    fn emmc_switch_to_hs400(&mut self, clock_khz: u32) -> SdResult<()> {
        self.emmc_switch_to_hs200(BusWidth::Width8, clock_khz)?;

        self.emmc_switch_timing(hs_timing::HIGH_SPEED)?;
        self.set_uhs_mode(uhs_mode::SDR25)?;
        self.supply_clock(EMMC_HS52_CLOCK_KHZ)?;

        self.emmc_switch_bus_width(BusWidth::Width8, true)?;
        self.emmc_switch_timing(hs_timing::HS400)?;
        self.set_uhs_mode(uhs_mode::HS400)?;
        self.supply_clock(clock_khz)
    }

    /// Negotiate the fastest common eMMC bus mode
    pub fn negotiate_emmc_bus(&mut self) -> SdResult<()> {
        let device = self.state.slot.identity.ext_csd.device_type();
        let mode = select_emmc_mode(device, &self.state.capability, &self.state.policy);
        log::debug!("eMMC: device type {:#04x}, target {:?}", device, mode);

        match mode.timing {
            BusTiming::Legacy => return Ok(()),
            BusTiming::Hs400 => self.emmc_switch_to_hs400(mode.clock_khz)?,
            BusTiming::Hs200 => self.emmc_switch_to_hs200(mode.width, mode.clock_khz)?,
            _ => self.emmc_switch_to_high_speed(mode)?,
        }
        self.state.slot.timing = mode.timing;
        log::info!(
            "eMMC: {:?}, {}-bit, {} kHz",
            mode.timing,
            mode.width.bits(),
            self.state.current_freq_khz()
        );
        Ok(())
    }

    // =========================================================================
    // SD
    // =========================================================================

    /// Negotiate the fastest common SD access mode at 4-bit width
    pub fn negotiate_sd_bus(&mut self) -> SdResult<()> {
        self.sd_set_bus_width(BusWidth::Width4)?;
        self.set_bus_width(BusWidth::Width4)?;

        let keep = SWITCH_FUNC_KEEP;
        let status = self.sd_switch_function(false, keep, keep, keep, keep)?;
        let mode = select_sd_mode(&status, self.state.slot.s18a, &self.state.capability);
        log::debug!(
            "SD: access modes {:#04x}, target {:?}",
            status.access_mode_support(),
            mode
        );

        let committed = self.sd_switch_function(true, mode.access_mode, keep, keep, keep)?;
        if committed.access_mode_selected() != mode.access_mode {
            log::error!(
                "SD: access mode {} requested, {} selected",
                mode.access_mode,
                committed.access_mode_selected()
            );
            return Err(SdError::DeviceError);
        }

        if mode.access_mode == sd_access_mode::HIGH_SPEED {
            self.enable_high_speed()?;
        }
        self.set_uhs_mode(u16::from(mode.access_mode))?;
        self.supply_clock(mode.clock_khz)?;

        let needs_tuning = mode.timing == BusTiming::Sdr104
            || (mode.timing == BusTiming::Sdr50 && self.state.capability.tuning_sdr50());
        if needs_tuning {
            self.execute_tuning()?;
        }
        self.state.slot.timing = mode.timing;
        log::info!("SD: {:?}, 4-bit, {} kHz", mode.timing, self.state.current_freq_khz());
        Ok(())
    }
}
