//! Host controller bring-up and control
//!
//! [`SdHost`] binds one controller's register window to its durable state for
//! the duration of a driver call. The methods here program the controller
//! itself: reset, clock, power, bus width and timing bits. Card protocol
//! lives in the command engine and the card command library.

use helix_hal::mmio::RegisterBusExt;
use helix_hal::time::Stall;

use crate::bus_mode::BusWidth;
use crate::error::{SdError, SdResult};
use crate::regs::{
    bus_voltage, sdhc_regs, ClockControl, HostCapability, HostControl1, HostControl2, HostVersion,
    PresentState, SlotType, SoftwareReset, TIMEOUT_CONTROL_MAX,
};
use crate::state::ControllerState;
use crate::Platform;

/// Timeout for controller-internal state changes (1 s)
pub const GENERIC_TIMEOUT_US: u64 = 1_000_000;

/// Identification clock
pub const INIT_CLOCK_KHZ: u32 = 400;

/// Settle time after enabling 1.8V signalling
pub const SIGNAL_VOLTAGE_SETTLE_US: u64 = 5_000;

/// Largest 10-bit clock divisor
const MAX_DIVISOR: u32 = 0x3FF;

/// Largest divisor of the 8-bit (pre-3.00) encoding
const MAX_DIVISOR_8BIT: u32 = 0x80;

/// Compute the clock control divisor bits for `target_khz`
///
/// Returns the register bits (frequency select fields only) and the
/// frequency those bits produce. The programmed clock never exceeds the
/// target unless the divisor range runs out.
pub fn clock_divisor(base_khz: u32, target_khz: u32, version: HostVersion) -> (u16, u32) {
    let mut divisor = 0;
    if base_khz > target_khz {
        divisor = (1..=MAX_DIVISOR)
            .find(|d| u64::from(target_khz) * 2 * u64::from(*d) >= u64::from(base_khz))
            .unwrap_or(MAX_DIVISOR);
    }

    let bits = if version.has_10bit_divisor() {
        (((divisor & 0xFF) << 8) | ((divisor & 0x300) >> 2)) as u16
    } else {
        if divisor & (divisor.wrapping_sub(1)) != 0 {
            divisor = divisor.next_power_of_two();
        }
        divisor = divisor.min(MAX_DIVISOR_8BIT);
        ((divisor & 0xFF) << 8) as u16
    };

    let effective = if divisor == 0 {
        base_khz
    } else {
        base_khz / (2 * divisor)
    };
    (bits, effective)
}

/// A controller and its state, bound for one driver call
pub struct SdHost<'a, P: Platform> {
    pub(crate) platform: &'a P,
    pub(crate) bus: P::Bus,
    pub(crate) state: &'a mut ControllerState,
}

impl<P: Platform> core::fmt::Debug for SdHost<'_, P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SdHost")
            .field("pci_base", &self.state.pci_base)
            .field("card", &self.state.slot.card)
            .finish_non_exhaustive()
    }
}

impl<'a, P: Platform> SdHost<'a, P> {
    /// Bind a register window to its state
    pub fn new(platform: &'a P, bus: P::Bus, state: &'a mut ControllerState) -> Self {
        Self { platform, bus, state }
    }

    /// The bound state
    pub fn state(&self) -> &ControllerState {
        self.state
    }

    /// Capability snapshot
    pub fn capability(&self) -> HostCapability {
        self.state.capability
    }

    pub(crate) fn stall(&self, micros: u64) {
        self.platform.stall(micros);
    }

    /// Poll `(reg & mask) == value` with the platform delay
    pub(crate) fn wait<T: helix_hal::mmio::Register>(
        &self,
        offset: usize,
        mask: T,
        value: T,
        timeout_us: u64,
    ) -> SdResult<()> {
        let stall: &dyn Stall = self.platform;
        self.bus.wait_reg(offset, mask, value, timeout_us, stall)?;
        Ok(())
    }

    // =========================================================================
    // RESET & CAPABILITY
    // =========================================================================

    /// Software reset of the whole controller, then unmask all status bits
    pub fn reset_controller(&mut self) -> SdResult<()> {
        self.bus
            .write_reg(sdhc_regs::SOFTWARE_RESET, SoftwareReset::ALL.bits())?;
        self.wait(
            sdhc_regs::SOFTWARE_RESET,
            SoftwareReset::ALL.bits(),
            0,
            GENERIC_TIMEOUT_US,
        )
        .map_err(|err| {
            log::error!("SDHC: controller reset did not complete");
            err
        })?;

        self.bus.write_reg::<u16>(sdhc_regs::NORMAL_INT_ENABLE, 0xFFFF)?;
        self.bus.write_reg::<u16>(sdhc_regs::ERROR_INT_ENABLE, 0xFFFF)?;
        Ok(())
    }

    /// Reset the command and/or data line circuits
    pub fn reset_lines(&mut self, lines: SoftwareReset) -> SdResult<()> {
        if lines.is_empty() {
            return Ok(());
        }
        self.bus.or_reg(sdhc_regs::SOFTWARE_RESET, lines.bits())?;
        self.wait(sdhc_regs::SOFTWARE_RESET, lines.bits(), 0, GENERIC_TIMEOUT_US)
    }

    /// Snapshot the capability and version registers
    pub fn read_capability(&mut self) -> SdResult<HostCapability> {
        let capability =
            HostCapability::from_raw(self.bus.read_reg::<u64>(sdhc_regs::CAPABILITIES)?);
        let version = HostVersion(self.bus.read_reg::<u16>(sdhc_regs::HOST_VERSION)?);
        self.state.capability = capability;
        self.state.version = version;

        log::info!(
            "SDHC: host version {:#x}, base clock {} MHz, caps {:#018x}",
            version.spec(),
            capability.base_clock_mhz(),
            capability.raw()
        );
        log::debug!(
            "SDHC: adma2={} sdma={} hs={} 8bit={} sdr50={} sdr104={} ddr50={} hs400={}",
            capability.adma2(),
            capability.sdma(),
            capability.high_speed(),
            capability.bus_width8(),
            capability.sdr50(),
            capability.sdr104(),
            capability.ddr50(),
            capability.hs400()
        );
        log::debug!(
            "SDHC: re-tuning timer {:#x} mode {}, driver types {:#05b}",
            capability.retuning_timer(),
            capability.retuning_mode(),
            capability.driver_types()
        );
        Ok(capability)
    }

    /// Card detected, or the slot is embedded
    pub fn card_present(&self) -> SdResult<bool> {
        if self.state.capability.slot_type() == SlotType::Embedded {
            return Ok(true);
        }
        let present = PresentState::from_bits_retain(
            self.bus.read_reg::<u32>(sdhc_regs::PRESENT_STATE)?,
        );
        Ok(present.contains(PresentState::CARD_INSERTED))
    }

    /// Bootstrap clock, bus power and data timeout
    pub fn init_host(&mut self) -> SdResult<()> {
        self.supply_clock(INIT_CLOCK_KHZ)?;
        self.init_power()?;
        self.bus
            .write_reg(sdhc_regs::TIMEOUT_CONTROL, TIMEOUT_CONTROL_MAX)?;
        Ok(())
    }

    // =========================================================================
    // CLOCK
    // =========================================================================

    /// Gate the SD clock once both lines are idle
    pub fn stop_clock(&mut self) -> SdResult<()> {
        let inhibit = (PresentState::CMD_INHIBIT | PresentState::DAT_INHIBIT).bits();
        self.wait(sdhc_regs::PRESENT_STATE, inhibit, 0, GENERIC_TIMEOUT_US)?;
        self.bus
            .and_reg(sdhc_regs::CLOCK_CONTROL, !ClockControl::SD_ENABLE.bits())?;
        Ok(())
    }

    /// Wait for the internal clock to report stable
    pub fn wait_clock_stable(&mut self) -> SdResult<()> {
        let stable = ClockControl::INTERNAL_STABLE.bits();
        self.wait(sdhc_regs::CLOCK_CONTROL, stable, stable, GENERIC_TIMEOUT_US)
    }

    /// Ungate the SD clock
    pub fn start_sd_clock(&mut self) -> SdResult<()> {
        self.bus
            .or_reg(sdhc_regs::CLOCK_CONTROL, ClockControl::SD_ENABLE.bits())?;
        Ok(())
    }

    /// Program the SD clock as close to `target_khz` as the divisor allows
    pub fn supply_clock(&mut self, target_khz: u32) -> SdResult<()> {
        let base_khz = self.state.capability.base_clock_khz();
        if base_khz == 0 {
            log::error!("SDHC: base clock not reported");
            return Err(SdError::DeviceError);
        }
        let (bits, effective) = clock_divisor(base_khz, target_khz, self.state.version);

        self.stop_clock()?;
        self.bus.write_reg::<u16>(
            sdhc_regs::CLOCK_CONTROL,
            bits | ClockControl::INTERNAL_ENABLE.bits(),
        )?;
        self.state.record_clock(effective);
        self.wait_clock_stable()?;
        self.start_sd_clock()?;

        log::debug!(
            "SDHC: clock {} kHz requested, {} kHz programmed",
            target_khz,
            effective
        );
        Ok(())
    }

    // =========================================================================
    // POWER
    // =========================================================================

    /// Power the bus at the highest supported voltage
    pub fn init_power(&mut self) -> SdResult<()> {
        let cap = self.state.capability;
        let voltage = if cap.voltage_33() {
            bus_voltage::V33
        } else if cap.voltage_30() {
            bus_voltage::V30
        } else if cap.voltage_18() {
            self.bus
                .or_reg(sdhc_regs::HOST_CONTROL2, HostControl2::SIGNALING_1V8.bits())?;
            self.stall(SIGNAL_VOLTAGE_SETTLE_US);
            bus_voltage::V18
        } else {
            log::error!("SDHC: no supported bus voltage");
            return Err(SdError::DeviceError);
        };

        self.bus
            .and_reg(sdhc_regs::POWER_CONTROL, !bus_voltage::POWER_ON)?;
        self.bus.write_reg(sdhc_regs::POWER_CONTROL, voltage)?;
        self.bus
            .write_reg(sdhc_regs::POWER_CONTROL, voltage | bus_voltage::POWER_ON)?;
        log::debug!("SDHC: bus power on, voltage select {:#x}", voltage);
        Ok(())
    }

    /// Stop the clock and remove bus power
    pub fn power_off(&mut self) -> SdResult<()> {
        self.stop_clock()?;
        self.bus
            .and_reg(sdhc_regs::POWER_CONTROL, !bus_voltage::POWER_ON)?;
        self.state.record_clock(0);
        Ok(())
    }

    /// Host side of the SD 1.8V signal switch, after CMD11 was accepted
    pub fn switch_to_1v8_signaling(&mut self) -> SdResult<()> {
        self.stop_clock()?;
        if self.dat_level()? != 0 {
            log::error!("SDHC: DAT[3:0] not low after voltage switch command");
            return Err(SdError::DeviceError);
        }

        self.bus
            .or_reg(sdhc_regs::HOST_CONTROL2, HostControl2::SIGNALING_1V8.bits())?;
        self.stall(SIGNAL_VOLTAGE_SETTLE_US);
        let ctrl2 = HostControl2::from_bits_retain(self.bus.read_reg(sdhc_regs::HOST_CONTROL2)?);
        if !ctrl2.contains(HostControl2::SIGNALING_1V8) {
            log::error!("SDHC: 1.8V signalling enable did not stick");
            return Err(SdError::DeviceError);
        }

        self.start_sd_clock()?;
        self.stall(1_000);
        if self.dat_level()? != 0xF {
            log::error!("SDHC: DAT[3:0] not high after 1.8V switch");
            return Err(SdError::DeviceError);
        }
        Ok(())
    }

    fn dat_level(&self) -> SdResult<u8> {
        let present =
            PresentState::from_bits_retain(self.bus.read_reg(sdhc_regs::PRESENT_STATE)?);
        Ok(present.dat_level())
    }

    // =========================================================================
    // BUS WIDTH & TIMING
    // =========================================================================

    /// Program the host side data width
    pub fn set_bus_width(&mut self, width: BusWidth) -> SdResult<()> {
        self.bus.modify_reg::<u8, _>(sdhc_regs::HOST_CONTROL1, |value| {
            let mut ctrl = HostControl1::from_bits_retain(value);
            ctrl.remove(HostControl1::DATA_WIDTH_4 | HostControl1::DATA_WIDTH_8);
            match width {
                BusWidth::Width1 => {}
                BusWidth::Width4 => ctrl.insert(HostControl1::DATA_WIDTH_4),
                BusWidth::Width8 => ctrl.insert(HostControl1::DATA_WIDTH_8),
            }
            ctrl.bits()
        })?;
        self.state.slot.bus_width = width;
        Ok(())
    }

    /// Set the high speed enable bit
    pub fn enable_high_speed(&mut self) -> SdResult<()> {
        self.bus
            .or_reg(sdhc_regs::HOST_CONTROL1, HostControl1::HIGH_SPEED.bits())?;
        Ok(())
    }

    /// Program the UHS mode select field
    pub fn set_uhs_mode(&mut self, mode: u16) -> SdResult<()> {
        self.bus
            .and_reg(sdhc_regs::HOST_CONTROL2, !HostControl2::UHS_MODE.bits())?;
        self.bus
            .or_reg(sdhc_regs::HOST_CONTROL2, mode & HostControl2::UHS_MODE.bits())?;
        Ok(())
    }
}
