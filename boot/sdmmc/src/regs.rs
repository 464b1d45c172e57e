//! SD Host Controller register map
//!
//! Offsets follow the SD Host Controller Standard layout. Multi-bit fields
//! are exposed as `bitflags` types so that register writes read as the
//! operation they perform.

use bitflags::bitflags;

// =============================================================================
// REGISTER OFFSETS
// =============================================================================

/// SDHC controller register offsets
pub mod sdhc_regs {
    /// SDMA System Address (32-bit)
    pub const SDMA_ADDR: usize = 0x00;
    /// Block Size (16-bit)
    pub const BLOCK_SIZE: usize = 0x04;
    /// Block Count (16-bit)
    pub const BLOCK_COUNT: usize = 0x06;
    /// Argument 1 (32-bit)
    pub const ARGUMENT: usize = 0x08;
    /// Transfer Mode (16-bit)
    pub const TRANSFER_MODE: usize = 0x0C;
    /// Command (16-bit); writing it issues the command
    pub const COMMAND: usize = 0x0E;
    /// Response words 0..3 (32-bit each)
    pub const RESPONSE: usize = 0x10;
    /// Buffer Data Port (32-bit)
    pub const BUFFER_DATA: usize = 0x20;
    /// Present State (32-bit)
    pub const PRESENT_STATE: usize = 0x24;
    /// Host Control 1 (8-bit)
    pub const HOST_CONTROL1: usize = 0x28;
    /// Power Control (8-bit)
    pub const POWER_CONTROL: usize = 0x29;
    /// Clock Control (16-bit)
    pub const CLOCK_CONTROL: usize = 0x2C;
    /// Timeout Control (8-bit)
    pub const TIMEOUT_CONTROL: usize = 0x2E;
    /// Software Reset (8-bit)
    pub const SOFTWARE_RESET: usize = 0x2F;
    /// Normal Interrupt Status (16-bit, write 1 to clear)
    pub const NORMAL_INT_STATUS: usize = 0x30;
    /// Error Interrupt Status (16-bit, write 1 to clear)
    pub const ERROR_INT_STATUS: usize = 0x32;
    /// Normal Interrupt Status Enable (16-bit)
    pub const NORMAL_INT_ENABLE: usize = 0x34;
    /// Error Interrupt Status Enable (16-bit)
    pub const ERROR_INT_ENABLE: usize = 0x36;
    /// Host Control 2 (16-bit)
    pub const HOST_CONTROL2: usize = 0x3E;
    /// Capabilities (64-bit)
    pub const CAPABILITIES: usize = 0x40;
    /// ADMA System Address (64-bit)
    pub const ADMA_ADDR: usize = 0x58;
    /// Host Controller Version (16-bit)
    pub const HOST_VERSION: usize = 0xFE;
}

// =============================================================================
// STATUS REGISTERS
// =============================================================================

bitflags! {
    /// Present State register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PresentState: u32 {
        /// Command line in use
        const CMD_INHIBIT = 1 << 0;
        /// Data line in use
        const DAT_INHIBIT = 1 << 1;
        /// DAT line active
        const DAT_ACTIVE = 1 << 2;
        /// Buffer write enable
        const BUF_WRITE_ENABLE = 1 << 10;
        /// Buffer read enable
        const BUF_READ_ENABLE = 1 << 11;
        /// Card inserted
        const CARD_INSERTED = 1 << 16;
        /// Card state stable
        const CARD_STABLE = 1 << 17;
        /// DAT[3:0] line signal level
        const DAT_LEVEL = 0xF << 20;
        /// CMD line signal level
        const CMD_LEVEL = 1 << 24;
    }
}

impl PresentState {
    /// DAT[3:0] signal levels as a nibble
    pub const fn dat_level(self) -> u8 {
        ((self.bits() >> 20) & 0xF) as u8
    }
}

bitflags! {
    /// Normal Interrupt Status register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NormalInt: u16 {
        /// Command complete
        const CMD_COMPLETE = 1 << 0;
        /// Transfer complete
        const TRANSFER_COMPLETE = 1 << 1;
        /// Block gap event
        const BLOCK_GAP = 1 << 2;
        /// DMA boundary interrupt
        const DMA_INT = 1 << 3;
        /// Buffer write ready
        const BUF_WRITE_READY = 1 << 4;
        /// Buffer read ready
        const BUF_READ_READY = 1 << 5;
        /// Card insertion
        const CARD_INSERTION = 1 << 6;
        /// Card removal
        const CARD_REMOVAL = 1 << 7;
        /// Error interrupt summary
        const ERROR_INT = 1 << 15;
    }
}

impl NormalInt {
    /// Everything a new command clears; card insert/removal is preserved
    pub const CLEAR_FOR_COMMAND: u16 = 0xFF3F;
}

bitflags! {
    /// Error Interrupt Status register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ErrorInt: u16 {
        /// Command timeout
        const CMD_TIMEOUT = 1 << 0;
        /// Command CRC error
        const CMD_CRC = 1 << 1;
        /// Command end bit error
        const CMD_END_BIT = 1 << 2;
        /// Command index error
        const CMD_INDEX = 1 << 3;
        /// Data timeout
        const DATA_TIMEOUT = 1 << 4;
        /// Data CRC error
        const DATA_CRC = 1 << 5;
        /// Data end bit error
        const DATA_END_BIT = 1 << 6;
        /// Current limit error
        const CURRENT_LIMIT = 1 << 7;
        /// Auto CMD error
        const AUTO_CMD = 1 << 8;
        /// ADMA error
        const ADMA = 1 << 9;
        /// Tuning error
        const TUNING = 1 << 10;
    }
}

impl ErrorInt {
    /// Errors raised by the command line
    pub const COMMAND_ERRORS: Self = Self::CMD_TIMEOUT
        .union(Self::CMD_CRC)
        .union(Self::CMD_END_BIT)
        .union(Self::CMD_INDEX);

    /// Errors raised by the data line
    pub const DATA_ERRORS: Self = Self::DATA_TIMEOUT
        .union(Self::DATA_CRC)
        .union(Self::DATA_END_BIT);

    /// CRC errors on either line
    pub const CRC_ERRORS: Self = Self::CMD_CRC.union(Self::DATA_CRC);
}

// =============================================================================
// CONTROL REGISTERS
// =============================================================================

bitflags! {
    /// Transfer Mode register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransferModeFlags: u16 {
        /// DMA enable
        const DMA_ENABLE = 1 << 0;
        /// Block count enable
        const BLOCK_COUNT_ENABLE = 1 << 1;
        /// Auto CMD12 enable
        const AUTO_CMD12 = 1 << 2;
        /// Card to host
        const READ = 1 << 4;
        /// Multiple block
        const MULTI_BLOCK = 1 << 5;
    }
}

bitflags! {
    /// Clock Control register (low byte; the divisor occupies bits 15:6)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClockControl: u16 {
        /// Internal clock enable
        const INTERNAL_ENABLE = 1 << 0;
        /// Internal clock stable
        const INTERNAL_STABLE = 1 << 1;
        /// SD clock enable
        const SD_ENABLE = 1 << 2;
    }
}

bitflags! {
    /// Host Control 1 register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostControl1: u8 {
        /// LED control
        const LED = 1 << 0;
        /// 4-bit data transfer width
        const DATA_WIDTH_4 = 1 << 1;
        /// High speed enable
        const HIGH_SPEED = 1 << 2;
        /// DMA select field (bits 4:3)
        const DMA_SELECT = 0b11 << 3;
        /// ADMA2 32-bit in the DMA select field
        const DMA_ADMA2 = 0b10 << 3;
        /// 8-bit extended data transfer width
        const DATA_WIDTH_8 = 1 << 5;
    }
}

bitflags! {
    /// Host Control 2 register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostControl2: u16 {
        /// UHS mode select field (bits 2:0)
        const UHS_MODE = 0b111;
        /// 1.8 V signaling enable
        const SIGNALING_1V8 = 1 << 3;
        /// Execute tuning
        const EXECUTE_TUNING = 1 << 6;
        /// Sampling clock select
        const SAMPLING_CLOCK = 1 << 7;
    }
}

bitflags! {
    /// Software Reset register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SoftwareReset: u8 {
        /// Reset the whole controller
        const ALL = 1 << 0;
        /// Reset the command line circuit
        const CMD_LINE = 1 << 1;
        /// Reset the data line circuit
        const DAT_LINE = 1 << 2;
    }
}

/// UHS mode select values for Host Control 2
pub mod uhs_mode {
    /// SDR12 / legacy
    pub const SDR12: u16 = 0;
    /// SDR25 / high speed
    pub const SDR25: u16 = 1;
    /// SDR50
    pub const SDR50: u16 = 2;
    /// SDR104 / HS200
    pub const SDR104: u16 = 3;
    /// DDR50 / HS-DDR
    pub const DDR50: u16 = 4;
    /// HS400 (vendor-defined but widely used)
    pub const HS400: u16 = 5;
}

/// Power Control voltage select values (bus power bit excluded)
pub mod bus_voltage {
    /// 3.3 V
    pub const V33: u8 = 0x0E;
    /// 3.0 V
    pub const V30: u8 = 0x0C;
    /// 1.8 V
    pub const V18: u8 = 0x0A;
    /// SD bus power on
    pub const POWER_ON: u8 = 0x01;
}

/// Conservative data timeout counter value (TMCLK x 2^27)
pub const TIMEOUT_CONTROL_MAX: u8 = 0x0E;

/// SDMA buffer boundary (512 KiB)
pub const SDMA_BOUNDARY: u64 = 512 * 1024;

/// Block size register encoding of the 512 KiB SDMA boundary
pub const SDMA_BOUNDARY_BITS: u16 = 0x7 << 12;

// =============================================================================
// CONTROLLER VERSION & CAPABILITY
// =============================================================================

/// Host controller specification version (low byte of `HOST_VERSION`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct HostVersion(pub u16);

impl HostVersion {
    /// Version 3.00
    pub const V300: u8 = 0x02;

    /// Specification version number
    pub const fn spec(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    /// Version 3.00 and later pack a 10-bit clock divisor
    pub const fn has_10bit_divisor(self) -> bool {
        self.spec() >= Self::V300
    }
}

/// Slot type reported in the capability register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotType {
    /// Removable card slot
    Removable,
    /// Embedded, non-removable device
    Embedded,
    /// Shared bus slot
    SharedBus,
    /// Reserved encoding
    Reserved,
}

/// Snapshot of the 64-bit capability register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostCapability {
    raw: u64,
}

impl HostCapability {
    /// Decode a raw capability value
    pub const fn from_raw(raw: u64) -> Self {
        Self { raw }
    }

    /// Raw register value
    pub const fn raw(&self) -> u64 {
        self.raw
    }

    const fn bit(&self, n: u32) -> bool {
        (self.raw >> n) & 1 != 0
    }

    const fn field(&self, lo: u32, width: u32) -> u64 {
        (self.raw >> lo) & ((1 << width) - 1)
    }

    /// Timeout clock frequency in kHz
    pub const fn timeout_clock_khz(&self) -> u32 {
        let freq = self.field(0, 6) as u32;
        if self.bit(7) {
            freq * 1000
        } else {
            freq
        }
    }

    /// Base clock frequency in MHz
    pub const fn base_clock_mhz(&self) -> u32 {
        self.field(8, 8) as u32
    }

    /// Base clock frequency in kHz
    pub const fn base_clock_khz(&self) -> u32 {
        self.base_clock_mhz() * 1000
    }

    /// Maximum block length in bytes
    pub const fn max_block_len(&self) -> u32 {
        match self.field(16, 2) {
            1 => 1024,
            2 => 2048,
            _ => 512,
        }
    }

    /// 8-bit embedded bus support
    pub const fn bus_width8(&self) -> bool {
        self.bit(18)
    }

    /// ADMA2 support
    pub const fn adma2(&self) -> bool {
        self.bit(19)
    }

    /// High speed support
    pub const fn high_speed(&self) -> bool {
        self.bit(21)
    }

    /// SDMA support
    pub const fn sdma(&self) -> bool {
        self.bit(22)
    }

    /// 3.3 V support
    pub const fn voltage_33(&self) -> bool {
        self.bit(24)
    }

    /// 3.0 V support
    pub const fn voltage_30(&self) -> bool {
        self.bit(25)
    }

    /// 1.8 V support
    pub const fn voltage_18(&self) -> bool {
        self.bit(26)
    }

    /// 64-bit system bus support
    pub const fn system_bus_64(&self) -> bool {
        self.bit(28)
    }

    /// Slot type
    pub const fn slot_type(&self) -> SlotType {
        match self.field(30, 2) {
            0 => SlotType::Removable,
            1 => SlotType::Embedded,
            2 => SlotType::SharedBus,
            _ => SlotType::Reserved,
        }
    }

    /// SDR50 support
    pub const fn sdr50(&self) -> bool {
        self.bit(32)
    }

    /// SDR104 support (also gates eMMC HS200)
    pub const fn sdr104(&self) -> bool {
        self.bit(33)
    }

    /// DDR50 support (also gates eMMC HS-DDR)
    pub const fn ddr50(&self) -> bool {
        self.bit(34)
    }

    /// Any UHS-I mode support
    pub const fn uhs(&self) -> bool {
        self.sdr50() || self.sdr104() || self.ddr50()
    }

    /// Driver type A/C/D support bits
    pub const fn driver_types(&self) -> u8 {
        self.field(36, 3) as u8
    }

    /// Re-tuning timer count field
    pub const fn retuning_timer(&self) -> u8 {
        self.field(40, 4) as u8
    }

    /// SDR50 requires tuning
    pub const fn tuning_sdr50(&self) -> bool {
        self.bit(45)
    }

    /// Re-tuning mode field
    pub const fn retuning_mode(&self) -> u8 {
        self.field(46, 2) as u8
    }

    /// Programmable clock multiplier (0 = not supported)
    pub const fn clock_multiplier(&self) -> u8 {
        self.field(48, 8) as u8
    }

    /// HS400 support
    pub const fn hs400(&self) -> bool {
        self.bit(63)
    }
}
