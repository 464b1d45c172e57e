//! Card registers: CID, CSD, EXT_CSD, R1 status and SD switch status
//!
//! The 128-bit CID and CSD registers are stored as 16-byte little-endian
//! images: byte 0 holds bits 7:0 (the CRC slot, never echoed by the host)
//! and byte 15 holds bits 127:120. Field accessors take bit positions
//! straight from the card specifications.

// =============================================================================
// OCR
// =============================================================================

/// OCR voltage window (2.7V - 3.6V)
pub const OCR_VOLTAGE_WINDOW: u32 = 0x00FF_8000;

/// eMMC sector access mode / SD host capacity support (HCS/CCS)
pub const OCR_HCS: u32 = 1 << 30;

/// Power up status (card no longer busy)
pub const OCR_BUSY: u32 = 1 << 31;

/// SD 1.8V switching request (S18R) / accepted (S18A)
pub const OCR_S18: u32 = 1 << 24;

// =============================================================================
// 128-BIT REGISTERS
// =============================================================================

const fn bits128(raw: &[u8; 16], hi: u32, lo: u32) -> u32 {
    let value = u128::from_le_bytes(*raw);
    let width = hi - lo + 1;
    ((value >> lo) & ((1u128 << width) - 1)) as u32
}

/// Card Identification register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cid {
    /// Little-endian register image
    pub raw: [u8; 16],
}

impl Cid {
    /// Manufacturer ID (MID)
    pub const fn manufacturer_id(&self) -> u8 {
        bits128(&self.raw, 127, 120) as u8
    }

    /// `N` product name characters, the first one ending at bit `hi`
    fn name<const N: usize>(&self, hi: u32) -> [u8; N] {
        let mut name = [0u8; N];
        for (i, byte) in name.iter_mut().enumerate() {
            let top = hi - (i as u32) * 8;
            *byte = bits128(&self.raw, top, top - 7) as u8;
        }
        name
    }

    /// SD product name (PNM, 5 characters)
    pub fn sd_product_name(&self) -> [u8; 5] {
        self.name::<5>(103)
    }

    /// eMMC product name (PNM, 6 characters)
    pub fn mmc_product_name(&self) -> [u8; 6] {
        self.name::<6>(103)
    }

    /// SD product serial number (PSN)
    pub const fn sd_serial(&self) -> u32 {
        bits128(&self.raw, 55, 24)
    }

    /// eMMC product serial number (PSN)
    pub const fn mmc_serial(&self) -> u32 {
        bits128(&self.raw, 47, 16)
    }
}

/// CSD_STRUCTURE values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsdVersion {
    /// Version 1.0: standard capacity, byte addressed
    V1,
    /// Version 2.0: high capacity, sector addressed
    V2,
    /// Version 3.0 / eMMC extended (structure in EXT_CSD)
    V3,
    /// Reserved encoding
    Reserved,
}

/// Card Specific Data register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Csd {
    /// Little-endian register image
    pub raw: [u8; 16],
}

impl Csd {
    /// CSD_STRUCTURE field (bits 127:126)
    pub const fn structure(&self) -> u8 {
        bits128(&self.raw, 127, 126) as u8
    }

    /// Get CSD structure version
    pub const fn version(&self) -> CsdVersion {
        match self.structure() {
            0 => CsdVersion::V1,
            1 => CsdVersion::V2,
            2 => CsdVersion::V3,
            _ => CsdVersion::Reserved,
        }
    }

    /// Structure 0 cards use byte addresses; later structures use sectors
    pub const fn is_sector_addressed(&self) -> bool {
        self.structure() != 0
    }

    /// TRAN_SPEED (bits 103:96)
    pub const fn tran_speed(&self) -> u8 {
        bits128(&self.raw, 103, 96) as u8
    }

    /// CCC - card command classes (bits 95:84)
    pub const fn ccc(&self) -> u16 {
        bits128(&self.raw, 95, 84) as u16
    }

    /// READ_BL_LEN (bits 83:80)
    pub const fn read_bl_len(&self) -> u8 {
        bits128(&self.raw, 83, 80) as u8
    }

    /// C_SIZE for structure 0 (bits 73:62)
    pub const fn c_size_v1(&self) -> u32 {
        bits128(&self.raw, 73, 62)
    }

    /// C_SIZE_MULT for structure 0 (bits 49:47)
    pub const fn c_size_mult(&self) -> u8 {
        bits128(&self.raw, 49, 47) as u8
    }

    /// C_SIZE for SD structure 1 (bits 69:48)
    pub const fn c_size_v2(&self) -> u32 {
        bits128(&self.raw, 69, 48)
    }

    /// Capacity in bytes of a byte-addressed (structure 0) card
    pub const fn byte_addressed_capacity(&self) -> u64 {
        let blocks = (self.c_size_v1() as u64 + 1) << (self.c_size_mult() + 2);
        blocks << self.read_bl_len()
    }

    /// Capacity in bytes of a high capacity SD card
    pub const fn sd_high_capacity(&self) -> u64 {
        (self.c_size_v2() as u64 + 1) * 512 * 1024
    }
}

// =============================================================================
// EXTENDED CSD
// =============================================================================

/// EXT_CSD byte offsets
pub mod ext_csd {
    /// General purpose partition sizes (3 bytes each, GP1..GP4)
    pub const GP_SIZE_MULT: usize = 143;
    /// RPMB partition size (128 KiB units)
    pub const RPMB_SIZE_MULT: usize = 168;
    /// Partition configuration
    pub const PARTITION_CONFIG: usize = 179;
    /// Bus width mode
    pub const BUS_WIDTH: usize = 183;
    /// High speed interface timing
    pub const HS_TIMING: usize = 185;
    /// Extended CSD revision
    pub const EXT_CSD_REV: usize = 192;
    /// Device type
    pub const DEVICE_TYPE: usize = 196;
    /// Sector count (4 bytes, little endian)
    pub const SEC_COUNT: usize = 212;
    /// High capacity write protect group size
    pub const HC_WP_GRP_SIZE: usize = 221;
    /// High capacity erase group size
    pub const HC_ERASE_GRP_SIZE: usize = 224;
    /// Boot partition size (128 KiB units)
    pub const BOOT_SIZE_MULT: usize = 226;
}

/// DEVICE_TYPE bits
pub mod device_type {
    /// High speed at 26 MHz
    pub const HS_26: u8 = 1 << 0;
    /// High speed at 52 MHz
    pub const HS_52: u8 = 1 << 1;
    /// High speed DDR at 52 MHz (1.8V/3V or 1.2V)
    pub const HS_DDR: u8 = (1 << 2) | (1 << 3);
    /// HS200 (1.8V or 1.2V)
    pub const HS200: u8 = (1 << 4) | (1 << 5);
    /// HS400 (1.8V or 1.2V)
    pub const HS400: u8 = (1 << 6) | (1 << 7);
}

/// HS_TIMING values
pub mod hs_timing {
    /// Backwards compatible timing
    pub const LEGACY: u8 = 0;
    /// High speed
    pub const HIGH_SPEED: u8 = 1;
    /// HS200
    pub const HS200: u8 = 2;
    /// HS400
    pub const HS400: u8 = 3;
}

/// 128 KiB, the unit of boot and RPMB partition sizes
pub const PARTITION_SIZE_UNIT: u64 = 128 * 1024;

/// EXT_CSD register (512 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtCsd {
    /// Raw register block
    pub raw: [u8; 512],
}

impl Default for ExtCsd {
    fn default() -> Self {
        Self { raw: [0; 512] }
    }
}

impl ExtCsd {
    /// Sector count (512-byte sectors)
    pub const fn sec_count(&self) -> u32 {
        let o = ext_csd::SEC_COUNT;
        u32::from_le_bytes([self.raw[o], self.raw[o + 1], self.raw[o + 2], self.raw[o + 3]])
    }

    /// Device type bits
    pub const fn device_type(&self) -> u8 {
        self.raw[ext_csd::DEVICE_TYPE]
    }

    /// Current HS_TIMING value
    pub const fn hs_timing(&self) -> u8 {
        self.raw[ext_csd::HS_TIMING]
    }

    /// Current BUS_WIDTH value
    pub const fn bus_width(&self) -> u8 {
        self.raw[ext_csd::BUS_WIDTH]
    }

    /// PARTITION_CONFIG value
    pub const fn partition_config(&self) -> u8 {
        self.raw[ext_csd::PARTITION_CONFIG]
    }

    /// EXT_CSD revision
    pub const fn revision(&self) -> u8 {
        self.raw[ext_csd::EXT_CSD_REV]
    }

    /// Boot partition size in bytes (each of the two)
    pub const fn boot_partition_bytes(&self) -> u64 {
        self.raw[ext_csd::BOOT_SIZE_MULT] as u64 * PARTITION_SIZE_UNIT
    }

    /// RPMB partition size in bytes
    pub const fn rpmb_bytes(&self) -> u64 {
        self.raw[ext_csd::RPMB_SIZE_MULT] as u64 * PARTITION_SIZE_UNIT
    }

    /// General purpose partition `n` (0..4) size in bytes
    pub const fn gp_partition_bytes(&self, n: usize) -> u64 {
        let o = ext_csd::GP_SIZE_MULT + n * 3;
        let mult =
            self.raw[o] as u64 | (self.raw[o + 1] as u64) << 8 | (self.raw[o + 2] as u64) << 16;
        let wp = self.raw[ext_csd::HC_WP_GRP_SIZE] as u64;
        let erase = self.raw[ext_csd::HC_ERASE_GRP_SIZE] as u64;
        mult * wp * erase * 512 * 1024
    }

    /// Update the cached copy after a successful SWITCH
    pub fn set(&mut self, index: usize, value: u8) {
        if let Some(byte) = self.raw.get_mut(index) {
            *byte = value;
        }
    }
}

// =============================================================================
// CARD STATUS
// =============================================================================

/// Card status (R1 response)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CardStatus(pub u32);

impl CardStatus {
    /// eMMC SWITCH_ERROR
    pub const fn switch_error(&self) -> bool {
        (self.0 & (1 << 7)) != 0
    }

    /// Ready for data
    pub const fn ready_for_data(&self) -> bool {
        (self.0 & (1 << 8)) != 0
    }

    /// App command enabled
    pub const fn app_cmd(&self) -> bool {
        (self.0 & (1 << 5)) != 0
    }

    /// Current state
    pub const fn current_state(&self) -> CardState {
        CardState::from_u8(((self.0 >> 9) & 0xF) as u8)
    }

    /// Check for any error
    pub const fn has_error(&self) -> bool {
        (self.0 & 0xFDF9_8000) != 0
    }
}

/// Card states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CardState {
    /// Idle state
    Idle = 0,
    /// Ready state
    Ready = 1,
    /// Identification state
    Ident = 2,
    /// Stand-by state
    Stby = 3,
    /// Transfer state
    Tran = 4,
    /// Sending data
    Data = 5,
    /// Receiving data
    Rcv = 6,
    /// Programming state
    Prg = 7,
    /// Disconnect state
    Dis = 8,
    /// Bus test state
    Btst = 9,
    /// Sleep state
    Slp = 10,
    /// Unknown state
    Unknown = 15,
}

impl CardState {
    /// Create from u8
    pub const fn from_u8(val: u8) -> Self {
        match val {
            0 => CardState::Idle,
            1 => CardState::Ready,
            2 => CardState::Ident,
            3 => CardState::Stby,
            4 => CardState::Tran,
            5 => CardState::Data,
            6 => CardState::Rcv,
            7 => CardState::Prg,
            8 => CardState::Dis,
            9 => CardState::Btst,
            10 => CardState::Slp,
            _ => CardState::Unknown,
        }
    }
}

// =============================================================================
// SD SWITCH FUNCTION STATUS
// =============================================================================

/// Access mode (function group 1) support bits
pub mod sd_access_mode {
    /// Default speed / SDR12
    pub const DEFAULT: u8 = 0;
    /// High speed / SDR25
    pub const HIGH_SPEED: u8 = 1;
    /// SDR50
    pub const SDR50: u8 = 2;
    /// SDR104
    pub const SDR104: u8 = 3;
    /// DDR50
    pub const DDR50: u8 = 4;
}

/// 512-bit status returned by SD CMD6, most significant byte first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchStatus {
    /// Raw status block
    pub raw: [u8; 64],
}

impl Default for SwitchStatus {
    fn default() -> Self {
        Self { raw: [0; 64] }
    }
}

impl SwitchStatus {
    /// Maximum current consumption in mA (bits 511:496)
    pub const fn max_current(&self) -> u16 {
        u16::from_be_bytes([self.raw[0], self.raw[1]])
    }

    /// Function group 1 support bits (bits 415:400, low byte)
    pub const fn access_mode_support(&self) -> u8 {
        self.raw[13]
    }

    /// Check support for access mode `mode`
    pub const fn supports(&self, mode: u8) -> bool {
        self.access_mode_support() & (1 << mode) != 0
    }

    /// Function group 1 selection (bits 379:376)
    pub const fn access_mode_selected(&self) -> u8 {
        self.raw[16] & 0xF
    }
}
