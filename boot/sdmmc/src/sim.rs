//! Simulated SDHCI controller and card
//!
//! The simulator implements [`Platform`] so tests can drive the real engine
//! against it. It models the register side effects the driver relies on
//! (write-1-to-clear status, self-clearing resets, clock stability, DAT
//! levels), answers the eMMC and SD command sets from an in-memory card,
//! moves data by PIO, SDMA or ADMA2, and records an event trace.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::vec::Vec;

use helix_hal::dma::{DmaDirection, DmaMapper, DmaMapping, PageAllocator, DMA_PAGE_SIZE};
use helix_hal::mmio::{is_valid_width, RegisterBus};
use helix_hal::time::Stall;
use helix_hal::{HalError, HalResult, PhysAddr};
use spin::Mutex;

use crate::adma::adma2_attr;
use crate::card::{ext_csd, CardState, OCR_BUSY, OCR_HCS, OCR_S18};
use crate::regs::{
    sdhc_regs, ClockControl, ErrorInt, HostControl1, HostControl2, NormalInt, PresentState,
    TransferModeFlags, SDMA_BOUNDARY,
};
use crate::state::CardKind;
use crate::Platform;

const REG_SPACE: usize = 0x100;
const BLOCK: usize = 512;
const FIRST_DEVICE_ADDRESS: u64 = 0x1000_0000;

const CAP_VOLTAGES: u64 = 0b111 << 24;
const CAP_DMA: u64 = (1 << 19) | (1 << 22);
const CAP_HIGH_SPEED: u64 = 1 << 21;
const CAP_UHS: u64 = 0b111 << 32;
const CAP_TIMEOUT_CLOCK: u64 = (1 << 7) | 10;

/// Injected failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimFaults {
    /// Software reset bits never clear
    pub reset_stuck: bool,
    /// Commands with this index get no response
    pub command_timeout: Option<u8>,
    /// Block reads and writes fail with a data CRC error
    pub data_crc: bool,
    /// Block transfers complete with a data timeout raised alongside
    pub complete_with_data_timeout: bool,
    /// Command and data inhibit stay set
    pub lines_busy: bool,
    /// Tuning ends without a sampling clock
    pub tuning_never_completes: bool,
    /// Tuning never ends
    pub tuning_stuck: bool,
    /// eMMC SWITCH commands are rejected
    pub switch_error: bool,
    /// SD SWITCH_FUNC commits report a failed selection
    pub sd_switch_mismatch: bool,
    /// The internal clock never reports stable
    pub clock_unstable: bool,
}

/// Controller and card description
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Card kind in the slot
    pub card: CardKind,
    /// Capability register
    pub capability: u64,
    /// Host version register
    pub version: u16,
    /// CID image (byte 0 zero)
    pub cid: [u8; 16],
    /// CSD image (byte 0 zero)
    pub csd: [u8; 16],
    /// EXT_CSD block (eMMC)
    pub ext_csd: [u8; 512],
    /// SD function group 1 support bits
    pub sd_switch_support: u8,
    /// OCR without the busy bit
    pub ocr: u32,
    /// SD card accepts 1.8V signalling
    pub s18a: bool,
    /// Address an SD card publishes
    pub sd_rca: u16,
    /// Card detect
    pub card_inserted: bool,
    /// Non-zero operating condition polls before the card is ready
    pub ocr_polls_until_ready: u32,
    /// Injected failures
    pub faults: SimFaults,
}

fn cid_image(manufacturer: u8, name: &[u8], serial: u32, serial_lo: u32) -> [u8; 16] {
    let mut value = u128::from(manufacturer) << 120;
    for (i, c) in name.iter().enumerate() {
        value |= u128::from(*c) << (96 - i * 8);
    }
    value |= u128::from(serial) << serial_lo;
    value.to_le_bytes()
}

impl SimConfig {
    /// HS400-capable eMMC behind an HS400-capable embedded host
    pub fn emmc() -> Self {
        let mut ext = [0u8; 512];
        ext[ext_csd::DEVICE_TYPE] = 0xFF;
        ext[ext_csd::EXT_CSD_REV] = 8;
        ext[ext_csd::SEC_COUNT..ext_csd::SEC_COUNT + 4]
            .copy_from_slice(&0x0010_0000u32.to_le_bytes());
        ext[ext_csd::BOOT_SIZE_MULT] = 2;
        ext[ext_csd::RPMB_SIZE_MULT] = 1;
        ext[ext_csd::GP_SIZE_MULT] = 1;
        ext[ext_csd::HC_WP_GRP_SIZE] = 1;
        ext[ext_csd::HC_ERASE_GRP_SIZE] = 1;

        Self {
            card: CardKind::Emmc,
            capability: (1 << 63)
                | CAP_UHS
                | (1 << 30)
                | CAP_VOLTAGES
                | CAP_DMA
                | CAP_HIGH_SPEED
                | (1 << 18)
                | (200 << 8)
                | CAP_TIMEOUT_CLOCK,
            version: 0x0002,
            cid: cid_image(0x15, b"BOOTMC", 0x1234_5678, 16),
            csd: ((2u128 << 126) | (9u128 << 80)).to_le_bytes(),
            ext_csd: ext,
            sd_switch_support: 0,
            ocr: 0x00FF_8080,
            s18a: false,
            sd_rca: 0,
            card_inserted: true,
            ocr_polls_until_ready: 2,
            faults: SimFaults::default(),
        }
    }

    /// High capacity UHS-I SD card behind a UHS-I host
    pub fn sd_uhs() -> Self {
        Self {
            card: CardKind::Sd,
            capability: CAP_UHS
                | CAP_VOLTAGES
                | CAP_DMA
                | CAP_HIGH_SPEED
                | (200 << 8)
                | CAP_TIMEOUT_CLOCK,
            version: 0x0002,
            cid: cid_image(0x03, b"SD32G", 0xCAFE_F00D, 24),
            csd: ((1u128 << 126) | (15159u128 << 48)).to_le_bytes(),
            ext_csd: [0; 512],
            sd_switch_support: 0x1F,
            ocr: 0x00FF_8000,
            s18a: true,
            sd_rca: 0xB368,
            card_inserted: true,
            ocr_polls_until_ready: 2,
            faults: SimFaults::default(),
        }
    }

    /// Standard capacity SD card behind a version 2.00 host
    pub fn sd_legacy() -> Self {
        Self {
            capability: CAP_VOLTAGES | CAP_DMA | CAP_HIGH_SPEED | (50 << 8) | CAP_TIMEOUT_CLOCK,
            version: 0x0001,
            csd: ((9u128 << 80) | (4095u128 << 62) | (7u128 << 47)).to_le_bytes(),
            sd_switch_support: 0x03,
            s18a: false,
            sd_rca: 0x0001,
            ..Self::sd_uhs()
        }
    }

    /// eMMC host without ADMA2
    pub fn sdma_only() -> Self {
        let mut config = Self::emmc();
        config.capability &= !(1 << 19);
        config
    }

    /// eMMC host without any DMA
    pub fn pio_only() -> Self {
        let mut config = Self::emmc();
        config.capability &= !CAP_DMA;
        config
    }
}

/// Observable controller and card activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    /// A command was issued
    Command {
        /// Command index
        index: u8,
        /// Argument
        argument: u32,
    },
    /// The SD clock was ungated at this frequency (kHz)
    SdClock(u32),
    /// Command (0x02) and/or data (0x04) line reset
    LineReset(u8),
    /// An eMMC SWITCH wrote an EXT_CSD byte
    ExtCsdWrite {
        /// EXT_CSD index
        index: u8,
        /// Value written
        value: u8,
    },
    /// A tuning block of this many bytes was sent
    TuningBlock(usize),
    /// SDMA paused at a buffer boundary
    SdmaBoundary,
    /// A block read or write started
    Data {
        /// Command index
        index: u8,
        /// Argument
        argument: u32,
        /// Blocks in the transfer
        blocks: u32,
    },
}

#[derive(Debug)]
struct CardModel {
    state: CardState,
    app_cmd: bool,
    rca: u16,
    ocr_polls: u32,
    switch_error: bool,
    dat_low: bool,
    access_mode: u8,
    ext_csd: [u8; 512],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Engine {
    Pio,
    Sdma,
    Adma,
}

#[derive(Debug)]
struct DataPhase {
    index: u8,
    argument: u32,
    read: bool,
    block_size: usize,
    data: Vec<u8>,
    cursor: usize,
    engine: Engine,
    sdma_address: u64,
    paused: bool,
}

enum Reply {
    None,
    Short(u32),
    Long([u8; 16]),
}

#[derive(Debug)]
struct SimState {
    config: SimConfig,
    regs: [u8; REG_SPACE],
    card: CardModel,
    storage: BTreeMap<(u8, u64), Vec<u8>>,
    phase: Option<DataPhase>,
    events: Vec<SimEvent>,
    mappings: Vec<DmaMapping>,
    next_device: u64,
    pages: BTreeMap<usize, usize>,
    elapsed_us: u64,
}

impl SimState {
    fn new(config: SimConfig) -> Self {
        let card = CardModel {
            state: CardState::Idle,
            app_cmd: false,
            rca: 0,
            ocr_polls: 0,
            switch_error: false,
            dat_low: false,
            access_mode: 0,
            ext_csd: config.ext_csd,
        };
        let mut state = Self {
            config,
            regs: [0; REG_SPACE],
            card,
            storage: BTreeMap::new(),
            phase: None,
            events: Vec::new(),
            mappings: Vec::new(),
            next_device: FIRST_DEVICE_ADDRESS,
            pages: BTreeMap::new(),
            elapsed_us: 0,
        };
        state.reset_all();
        state
    }

    // -------------------------------------------------------------------------
    // raw register file
    // -------------------------------------------------------------------------

    fn raw(&self, offset: usize, width: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes[..width].copy_from_slice(&self.regs[offset..offset + width]);
        u64::from_le_bytes(bytes)
    }

    fn set_raw(&mut self, offset: usize, width: usize, value: u64) {
        self.regs[offset..offset + width].copy_from_slice(&value.to_le_bytes()[..width]);
    }

    fn raw16(&self, offset: usize) -> u16 {
        self.raw(offset, 2) as u16
    }

    fn set16(&mut self, offset: usize, value: u16) {
        self.set_raw(offset, 2, u64::from(value));
    }

    fn set_normal(&mut self, bits: NormalInt) {
        let value = self.raw16(sdhc_regs::NORMAL_INT_STATUS) | bits.bits();
        self.set16(sdhc_regs::NORMAL_INT_STATUS, value);
    }

    fn raise_error(&mut self, bits: ErrorInt) {
        let value = self.raw16(sdhc_regs::ERROR_INT_STATUS) | bits.bits();
        self.set16(sdhc_regs::ERROR_INT_STATUS, value);
        self.phase = None;
    }

    fn present_state(&self) -> PresentState {
        let mut present = PresentState::CMD_LEVEL;
        if self.config.faults.lines_busy {
            present |= PresentState::CMD_INHIBIT | PresentState::DAT_INHIBIT;
        }
        if self.phase.is_some() {
            present |= PresentState::DAT_INHIBIT | PresentState::DAT_ACTIVE;
        }
        if self.config.card_inserted {
            present |= PresentState::CARD_INSERTED | PresentState::CARD_STABLE;
        }
        if !self.card.dat_low {
            present |= PresentState::DAT_LEVEL;
        }
        present
    }

    /// Refresh the computed registers
    fn sync(&mut self) {
        let present = self.present_state().bits();
        self.set_raw(sdhc_regs::PRESENT_STATE, 4, u64::from(present));
        let mut normal = self.raw16(sdhc_regs::NORMAL_INT_STATUS) & !NormalInt::ERROR_INT.bits();
        if self.raw16(sdhc_regs::ERROR_INT_STATUS) != 0 {
            normal |= NormalInt::ERROR_INT.bits();
        }
        self.set16(sdhc_regs::NORMAL_INT_STATUS, normal);
    }

    fn peek(&mut self, offset: usize, width: usize) -> u64 {
        self.sync();
        self.raw(offset, width)
    }

    // -------------------------------------------------------------------------
    // bus access
    // -------------------------------------------------------------------------

    fn read(&mut self, offset: usize, width: usize) -> HalResult<u64> {
        if !is_valid_width(width) || offset + width > REG_SPACE {
            return Err(HalError::InvalidParameter);
        }
        if offset == sdhc_regs::BUFFER_DATA {
            return Ok(u64::from(self.pop_buffer()));
        }
        Ok(self.peek(offset, width))
    }

    fn write(&mut self, offset: usize, width: usize, value: u64) -> HalResult<()> {
        if !is_valid_width(width) || offset + width > REG_SPACE {
            return Err(HalError::InvalidParameter);
        }
        match offset {
            sdhc_regs::NORMAL_INT_STATUS => {
                let value = self.raw16(offset) & !(value as u16);
                self.set16(offset, value);
            }
            sdhc_regs::ERROR_INT_STATUS => {
                let value = self.raw16(offset) & !(value as u16);
                self.set16(offset, value);
            }
            sdhc_regs::SOFTWARE_RESET => self.software_reset(value as u8),
            sdhc_regs::CLOCK_CONTROL => self.write_clock(value as u16),
            sdhc_regs::PRESENT_STATE | sdhc_regs::CAPABILITIES | sdhc_regs::HOST_VERSION => {}
            sdhc_regs::BUFFER_DATA => self.push_buffer(value as u32),
            sdhc_regs::COMMAND => {
                self.set_raw(offset, width, value);
                self.issue_command(value as u16);
            }
            sdhc_regs::SDMA_ADDR => {
                self.set_raw(offset, width, value);
                self.resume_sdma(value);
            }
            _ => self.set_raw(offset, width, value),
        }
        Ok(())
    }

    fn reset_all(&mut self) {
        self.regs = [0; REG_SPACE];
        self.set_raw(sdhc_regs::CAPABILITIES, 8, self.config.capability);
        self.set16(sdhc_regs::HOST_VERSION, self.config.version);
        self.phase = None;
    }

    fn software_reset(&mut self, value: u8) {
        let lines = value & 0x06;
        if lines != 0 {
            self.events.push(SimEvent::LineReset(lines));
            self.phase = None;
        }
        if value & 0x01 != 0 {
            self.reset_all();
        }
        let remaining = if self.config.faults.reset_stuck { value } else { 0 };
        self.regs[sdhc_regs::SOFTWARE_RESET] = remaining;
    }

    fn write_clock(&mut self, value: u16) {
        let old = ClockControl::from_bits_retain(self.raw16(sdhc_regs::CLOCK_CONTROL));
        let mut new = ClockControl::from_bits_retain(value);
        new.set(
            ClockControl::INTERNAL_STABLE,
            new.contains(ClockControl::INTERNAL_ENABLE) && !self.config.faults.clock_unstable,
        );
        self.set16(sdhc_regs::CLOCK_CONTROL, new.bits());

        if !old.contains(ClockControl::SD_ENABLE) && new.contains(ClockControl::SD_ENABLE) {
            let ctrl2 = HostControl2::from_bits_retain(self.raw16(sdhc_regs::HOST_CONTROL2));
            if ctrl2.contains(HostControl2::SIGNALING_1V8) {
                self.card.dat_low = false;
            }
            let khz = self.sd_clock_khz(new.bits());
            self.events.push(SimEvent::SdClock(khz));
        }
    }

    fn sd_clock_khz(&self, clock: u16) -> u32 {
        let base = ((self.config.capability >> 8) & 0xFF) as u32 * 1000;
        let mut divisor = u32::from(clock >> 8);
        if self.config.version & 0xFF >= 2 {
            divisor |= u32::from((clock >> 6) & 0x3) << 8;
        }
        if divisor == 0 {
            base
        } else {
            base / (2 * divisor)
        }
    }

    // -------------------------------------------------------------------------
    // card model
    // -------------------------------------------------------------------------

    fn byte_addressed(&self) -> bool {
        self.config.csd[15] >> 6 == 0
    }

    fn partition(&self) -> u8 {
        match self.config.card {
            CardKind::Emmc => self.card.ext_csd[ext_csd::PARTITION_CONFIG] & 0x07,
            CardKind::Sd => 0,
        }
    }

    fn lba(&self, argument: u32) -> u64 {
        if self.byte_addressed() {
            u64::from(argument) / BLOCK as u64
        } else {
            u64::from(argument)
        }
    }

    fn status(&self) -> u32 {
        let mut status = (self.card.state as u32) << 9 | 1 << 8;
        if self.card.switch_error {
            status |= 1 << 7;
        }
        if self.card.app_cmd {
            status |= 1 << 5;
        }
        status
    }

    fn respond(&mut self, index: u8, argument: u32, app: bool) -> Option<Reply> {
        let emmc = self.config.card == CardKind::Emmc;
        let reply = match index {
            0 => {
                self.card.state = CardState::Idle;
                self.card.rca = 0;
                self.card.ocr_polls = 0;
                Reply::None
            }
            1 if emmc => Reply::Short(self.op_cond(argument, argument & OCR_HCS)),
            41 if app && !emmc => {
                let ccs = if self.byte_addressed() { 0 } else { OCR_HCS };
                let s18a = if self.config.s18a && argument & OCR_S18 != 0 {
                    OCR_S18
                } else {
                    0
                };
                Reply::Short(self.op_cond(argument, ccs | s18a))
            }
            2 => {
                self.card.state = CardState::Ident;
                Reply::Long(self.config.cid)
            }
            3 if emmc => {
                self.card.rca = (argument >> 16) as u16;
                self.card.state = CardState::Stby;
                Reply::Short(self.status())
            }
            3 => {
                self.card.rca = self.config.sd_rca;
                self.card.state = CardState::Stby;
                Reply::Short(u32::from(self.card.rca) << 16 | (CardState::Ident as u32) << 9)
            }
            6 if emmc => {
                self.mmc_switch(argument);
                Reply::Short(self.status())
            }
            7 => {
                if (argument >> 16) as u16 == self.card.rca {
                    self.card.state = CardState::Tran;
                }
                Reply::Short(self.status())
            }
            8 if !emmc => Reply::Short(argument & 0xFFF),
            9 => Reply::Long(self.config.csd),
            11 => {
                self.card.dat_low = true;
                Reply::Short(self.status())
            }
            12 => {
                self.card.state = CardState::Tran;
                Reply::Short(self.status())
            }
            13 => {
                let status = self.status();
                self.card.switch_error = false;
                Reply::Short(status)
            }
            55 => {
                self.card.app_cmd = true;
                Reply::Short(self.status())
            }
            6 | 8 | 16 | 17 | 18 | 19 | 21 | 23 | 24 | 25 => Reply::Short(self.status()),
            _ => return None,
        };
        Some(reply)
    }

    fn op_cond(&mut self, argument: u32, ready_bits: u32) -> u32 {
        if argument == 0 {
            return self.config.ocr;
        }
        self.card.ocr_polls += 1;
        if self.card.ocr_polls >= self.config.ocr_polls_until_ready {
            self.card.state = CardState::Ready;
            self.config.ocr | OCR_BUSY | ready_bits
        } else {
            self.config.ocr
        }
    }

    fn mmc_switch(&mut self, argument: u32) {
        if self.config.faults.switch_error {
            self.card.switch_error = true;
            return;
        }
        let index = (argument >> 16) as u8;
        let value = (argument >> 8) as u8;
        self.card.ext_csd[usize::from(index)] = value;
        self.events.push(SimEvent::ExtCsdWrite { index, value });
    }

    fn issue_command(&mut self, command: u16) {
        let index = ((command >> 8) & 0x3F) as u8;
        let argument = self.raw(sdhc_regs::ARGUMENT, 4) as u32;
        self.events.push(SimEvent::Command { index, argument });

        if self.config.faults.command_timeout == Some(index) {
            self.raise_error(ErrorInt::CMD_TIMEOUT);
            return;
        }
        let app = core::mem::take(&mut self.card.app_cmd);
        let Some(reply) = self.respond(index, argument, app) else {
            self.raise_error(ErrorInt::CMD_TIMEOUT);
            return;
        };

        let mut words = [0u32; 4];
        match reply {
            Reply::None => {}
            Reply::Short(word) => words[0] = word,
            Reply::Long(image) => {
                let value = u128::from_le_bytes(image) >> 8;
                for (i, word) in words.iter_mut().enumerate() {
                    *word = (value >> (32 * i)) as u32;
                }
            }
        }
        for (i, word) in words.iter().enumerate() {
            self.set_raw(sdhc_regs::RESPONSE + i * 4, 4, u64::from(*word));
        }
        self.set_normal(NormalInt::CMD_COMPLETE);

        let data_present = command & (1 << 5) != 0;
        if data_present {
            self.start_data(index, argument);
        } else if command & 0x3 == 0x3 {
            self.set_normal(NormalInt::TRANSFER_COMPLETE);
        }
    }

    // -------------------------------------------------------------------------
    // data phase
    // -------------------------------------------------------------------------

    fn start_data(&mut self, index: u8, argument: u32) {
        let mode = TransferModeFlags::from_bits_retain(self.raw16(sdhc_regs::TRANSFER_MODE));
        let block_size = usize::from(self.raw16(sdhc_regs::BLOCK_SIZE) & 0xFFF);
        let blocks = if mode.contains(TransferModeFlags::MULTI_BLOCK) {
            usize::from(self.raw16(sdhc_regs::BLOCK_COUNT))
        } else {
            1
        };
        let read = mode.contains(TransferModeFlags::READ);
        let total = block_size * blocks;
        let block_io = matches!(index, 17 | 18 | 24 | 25);

        if block_io {
            self.events.push(SimEvent::Data {
                index,
                argument,
                blocks: blocks as u32,
            });
            self.card.state = if read { CardState::Data } else { CardState::Rcv };
            if self.config.faults.data_crc {
                self.raise_error(ErrorInt::DATA_CRC);
                return;
            }
        }

        let data = if read {
            self.read_payload(index, argument, total)
        } else {
            std::vec![0; total]
        };
        let ctrl1 = HostControl1::from_bits_retain(self.regs[sdhc_regs::HOST_CONTROL1]);
        let engine = if !mode.contains(TransferModeFlags::DMA_ENABLE) {
            Engine::Pio
        } else if ctrl1 & HostControl1::DMA_SELECT == HostControl1::DMA_ADMA2 {
            Engine::Adma
        } else {
            Engine::Sdma
        };
        self.phase = Some(DataPhase {
            index,
            argument,
            read,
            block_size: block_size.max(4),
            data,
            cursor: 0,
            engine,
            sdma_address: self.raw(sdhc_regs::SDMA_ADDR, 4),
            paused: false,
        });

        match engine {
            Engine::Pio if read => self.set_normal(NormalInt::BUF_READ_READY),
            Engine::Pio => self.set_normal(NormalInt::BUF_WRITE_READY),
            Engine::Adma => self.run_adma(),
            Engine::Sdma => self.run_sdma(),
        }
    }

    fn read_payload(&mut self, index: u8, argument: u32, total: usize) -> Vec<u8> {
        let mut data = std::vec![0u8; total];
        match (self.config.card, index) {
            (CardKind::Emmc, 8) => {
                let len = total.min(512);
                data[..len].copy_from_slice(&self.card.ext_csd[..len]);
            }
            (CardKind::Sd, 6) => {
                let status = self.sd_switch_status(argument);
                let len = total.min(64);
                data[..len].copy_from_slice(&status[..len]);
            }
            (_, 17 | 18) => {
                let partition = self.partition();
                let lba = self.lba(argument);
                for (i, block) in data.chunks_mut(BLOCK).enumerate() {
                    if let Some(stored) = self.storage.get(&(partition, lba + i as u64)) {
                        block.copy_from_slice(&stored[..block.len()]);
                    }
                }
            }
            (_, 19 | 21) => {
                self.events.push(SimEvent::TuningBlock(total));
                self.tune();
                for (i, byte) in data.iter_mut().enumerate() {
                    *byte = i as u8;
                }
            }
            _ => {}
        }
        data
    }

    fn tune(&mut self) {
        let mut ctrl2 = HostControl2::from_bits_retain(self.raw16(sdhc_regs::HOST_CONTROL2));
        if !ctrl2.contains(HostControl2::EXECUTE_TUNING) || self.config.faults.tuning_stuck {
            return;
        }
        ctrl2.remove(HostControl2::EXECUTE_TUNING);
        if !self.config.faults.tuning_never_completes {
            ctrl2.insert(HostControl2::SAMPLING_CLOCK);
        }
        self.set16(sdhc_regs::HOST_CONTROL2, ctrl2.bits());
    }

    fn sd_switch_status(&mut self, argument: u32) -> [u8; 64] {
        let support = self.config.sd_switch_support;
        let requested = (argument & 0xF) as u8;
        let mut selected = if requested == 0xF {
            self.card.access_mode
        } else if support & (1 << requested) != 0 {
            requested
        } else {
            0xF
        };
        let commit = argument & (1 << 31) != 0;
        if commit && self.config.faults.sd_switch_mismatch {
            selected = 0xF;
        }
        if commit && selected != 0xF {
            self.card.access_mode = selected;
        }

        let mut status = [0u8; 64];
        status[..2].copy_from_slice(&200u16.to_be_bytes());
        status[13] = support;
        status[16] = selected;
        status
    }

    fn finish_data(&mut self) {
        let Some(phase) = self.phase.take() else {
            return;
        };
        let block_io = matches!(phase.index, 17 | 18 | 24 | 25);
        if !phase.read && block_io {
            let partition = self.partition();
            let lba = self.lba(phase.argument);
            for (i, block) in phase.data.chunks(BLOCK).enumerate() {
                self.storage.insert((partition, lba + i as u64), block.to_vec());
            }
        }
        self.card.state = CardState::Tran;
        self.set_normal(NormalInt::TRANSFER_COMPLETE);
        if block_io && self.config.faults.complete_with_data_timeout {
            let value = self.raw16(sdhc_regs::ERROR_INT_STATUS) | ErrorInt::DATA_TIMEOUT.bits();
            self.set16(sdhc_regs::ERROR_INT_STATUS, value);
        }
    }

    fn translate(&self, device: u64, len: usize) -> Option<usize> {
        self.mappings.iter().find_map(|m| {
            let start = m.device().as_u64();
            let end = start + m.len() as u64;
            (device >= start && device + len as u64 <= end)
                .then(|| m.host() + (device - start) as usize)
        })
    }

    /// Move up to `len` bytes between the phase buffer and device memory
    fn dma_move(&mut self, device: u64, len: usize) -> bool {
        let Some(phase) = self.phase.as_ref() else {
            return false;
        };
        let len = len.min(phase.data.len() - phase.cursor);
        let Some(host) = self.translate(device, len) else {
            self.raise_error(ErrorInt::ADMA);
            return false;
        };
        let Some(phase) = self.phase.as_mut() else {
            return false;
        };
        let cursor = phase.cursor;
        // SAFETY: `host` lies inside a live mapping of at least `len` bytes.
        unsafe {
            if phase.read {
                core::ptr::copy_nonoverlapping(phase.data[cursor..].as_ptr(), host as *mut u8, len);
            } else {
                core::ptr::copy_nonoverlapping(
                    host as *const u8,
                    phase.data[cursor..].as_mut_ptr(),
                    len,
                );
            }
        }
        phase.cursor += len;
        true
    }

    fn run_adma(&mut self) {
        let mut line_address = self.raw(sdhc_regs::ADMA_ADDR, 8);
        loop {
            let Some(host) = self.translate(line_address, 8) else {
                self.raise_error(ErrorInt::ADMA);
                return;
            };
            let mut line = [0u8; 8];
            // SAFETY: the descriptor lies inside a live mapping.
            unsafe { core::ptr::copy_nonoverlapping(host as *const u8, line.as_mut_ptr(), 8) };
            let attr = u16::from_le_bytes([line[0], line[1]]);
            let length = u16::from_le_bytes([line[2], line[3]]);
            let address = u32::from_le_bytes([line[4], line[5], line[6], line[7]]);
            if attr & adma2_attr::VALID == 0 {
                self.raise_error(ErrorInt::ADMA);
                return;
            }
            let len = if length == 0 { 0x1_0000 } else { usize::from(length) };
            if !self.dma_move(u64::from(address), len) {
                return;
            }
            if attr & adma2_attr::END != 0 {
                break;
            }
            line_address += 8;
        }
        self.finish_data();
    }

    fn run_sdma(&mut self) {
        let Some(phase) = self.phase.as_ref() else {
            return;
        };
        let address = phase.sdma_address;
        let remaining = phase.data.len() - phase.cursor;
        let boundary = (address / SDMA_BOUNDARY + 1) * SDMA_BOUNDARY;
        let len = remaining.min((boundary - address) as usize);
        if !self.dma_move(address, len) {
            return;
        }
        let Some(phase) = self.phase.as_mut() else {
            return;
        };
        phase.sdma_address = address + len as u64;
        if phase.cursor == phase.data.len() {
            self.finish_data();
        } else {
            phase.paused = true;
            self.set_normal(NormalInt::DMA_INT);
            self.events.push(SimEvent::SdmaBoundary);
        }
    }

    fn resume_sdma(&mut self, address: u64) {
        let paused = match self.phase.as_mut() {
            Some(phase) if phase.engine == Engine::Sdma && phase.paused => {
                phase.paused = false;
                phase.sdma_address = address;
                true
            }
            _ => false,
        };
        if paused {
            self.run_sdma();
        }
    }

    fn pio_block_done(&mut self) {
        let Some(phase) = self.phase.as_ref() else {
            return;
        };
        if phase.cursor >= phase.data.len() {
            self.finish_data();
        } else if phase.cursor % phase.block_size == 0 {
            let ready = if phase.read {
                NormalInt::BUF_READ_READY
            } else {
                NormalInt::BUF_WRITE_READY
            };
            self.set_normal(ready);
        }
    }

    fn pop_buffer(&mut self) -> u32 {
        let Some(phase) = self.phase.as_mut() else {
            return 0;
        };
        if !phase.read || phase.engine != Engine::Pio {
            return 0;
        }
        let mut bytes = [0u8; 4];
        let end = (phase.cursor + 4).min(phase.data.len());
        bytes[..end - phase.cursor].copy_from_slice(&phase.data[phase.cursor..end]);
        phase.cursor = end;
        self.pio_block_done();
        u32::from_le_bytes(bytes)
    }

    fn push_buffer(&mut self, word: u32) {
        let Some(phase) = self.phase.as_mut() else {
            return;
        };
        if phase.read || phase.engine != Engine::Pio {
            return;
        }
        let end = (phase.cursor + 4).min(phase.data.len());
        let cursor = phase.cursor;
        phase.data[cursor..end].copy_from_slice(&word.to_le_bytes()[..end - cursor]);
        phase.cursor = end;
        self.pio_block_done();
    }
}

/// Shared handle to one simulated controller
#[derive(Debug, Clone)]
pub struct SimController {
    state: Arc<Mutex<SimState>>,
}

/// Register window of a [`SimController`]
#[derive(Debug, Clone)]
pub struct SimBus {
    state: Arc<Mutex<SimState>>,
}

impl SimController {
    /// Power on a controller with a card in its slot
    pub fn new(config: SimConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(config))),
        }
    }

    /// Register window
    pub fn bus(&self) -> SimBus {
        SimBus {
            state: Arc::clone(&self.state),
        }
    }

    /// Current configuration
    pub fn config(&self) -> SimConfig {
        self.state.lock().config.clone()
    }

    /// Change injected failures
    pub fn with_faults(&self, f: impl FnOnce(&mut SimFaults)) {
        f(&mut self.state.lock().config.faults);
    }

    /// Event trace so far
    pub fn events(&self) -> Vec<SimEvent> {
        self.state.lock().events.clone()
    }

    /// 8-bit register value
    pub fn reg8(&self, offset: usize) -> u8 {
        self.state.lock().peek(offset, 1) as u8
    }

    /// 16-bit register value
    pub fn reg16(&self, offset: usize) -> u16 {
        self.state.lock().peek(offset, 2) as u16
    }

    /// 32-bit register value
    pub fn reg32(&self, offset: usize) -> u32 {
        self.state.lock().peek(offset, 4) as u32
    }

    /// Pages handed out and not yet freed
    pub fn outstanding_pages(&self) -> usize {
        self.state.lock().pages.values().sum()
    }

    /// DMA mappings not yet released
    pub fn active_mappings(&self) -> usize {
        self.state.lock().mappings.len()
    }

    /// Virtual time consumed by stalls
    pub fn elapsed_us(&self) -> u64 {
        self.state.lock().elapsed_us
    }

    /// Put the card in the transfer state without identification
    pub fn force_transfer_state(&self) {
        self.state.lock().card.state = CardState::Tran;
    }

    /// Fill user-area blocks with `byte`
    pub fn fill_storage(&self, lba: u64, blocks: u64, byte: u8) {
        let mut state = self.state.lock();
        for block in lba..lba + blocks {
            state.storage.insert((0, block), std::vec![byte; BLOCK]);
        }
    }

    /// Contents of one stored block
    pub fn storage_block(&self, partition: u8, lba: u64) -> Vec<u8> {
        self.state
            .lock()
            .storage
            .get(&(partition, lba))
            .cloned()
            .unwrap_or_else(|| std::vec![0; BLOCK])
    }

    /// Current card EXT_CSD byte
    pub fn ext_csd_byte(&self, index: usize) -> u8 {
        self.state.lock().card.ext_csd[index]
    }
}

impl RegisterBus for SimBus {
    fn read(&self, offset: usize, width: usize) -> HalResult<u64> {
        self.state.lock().read(offset, width)
    }

    fn write(&self, offset: usize, width: usize, value: u64) -> HalResult<()> {
        self.state.lock().write(offset, width, value)
    }
}

impl Stall for SimController {
    fn stall(&self, micros: u64) {
        self.state.lock().elapsed_us += micros;
    }
}

impl DmaMapper for SimController {
    fn map(&self, host: usize, len: usize, direction: DmaDirection) -> HalResult<DmaMapping> {
        if host == 0 || len == 0 {
            return Err(HalError::InvalidAddress);
        }
        let mut state = self.state.lock();
        let offset = host % DMA_PAGE_SIZE;
        let device = state.next_device + offset as u64;
        state.next_device += (offset + len).div_ceil(DMA_PAGE_SIZE) as u64 * DMA_PAGE_SIZE as u64;
        let mapping = DmaMapping::new(host, PhysAddr::new(device), len, direction);
        state.mappings.push(mapping);
        Ok(mapping)
    }

    fn unmap(&self, mapping: &DmaMapping) -> HalResult<()> {
        let mut state = self.state.lock();
        let index = state
            .mappings
            .iter()
            .position(|m| m == mapping)
            .ok_or(HalError::InvalidParameter)?;
        state.mappings.remove(index);
        Ok(())
    }
}

impl PageAllocator for SimController {
    fn allocate_pages(&self, count: usize) -> HalResult<usize> {
        if count == 0 {
            return Err(HalError::InvalidParameter);
        }
        let layout = Layout::from_size_align(count * DMA_PAGE_SIZE, DMA_PAGE_SIZE)
            .map_err(|_| HalError::InvalidParameter)?;
        // SAFETY: the layout has a non-zero size.
        let host = unsafe { alloc_zeroed(layout) } as usize;
        if host == 0 {
            return Err(HalError::OutOfMemory);
        }
        self.state.lock().pages.insert(host, count);
        Ok(host)
    }

    fn free_pages(&self, host: usize, count: usize) -> HalResult<()> {
        let mut state = self.state.lock();
        match state.pages.get(&host) {
            Some(&allocated) if allocated == count => {}
            _ => return Err(HalError::InvalidAddress),
        }
        state.pages.remove(&host);
        let layout = Layout::from_size_align(count * DMA_PAGE_SIZE, DMA_PAGE_SIZE)
            .map_err(|_| HalError::InvalidParameter)?;
        // SAFETY: `host` was returned by `alloc_zeroed` with this layout.
        unsafe { dealloc(host as *mut u8, layout) };
        Ok(())
    }
}

impl Platform for SimController {
    type Bus = SimBus;

    fn open_controller(&self, pci_base: u64) -> HalResult<SimBus> {
        if pci_base == 0 {
            return Err(HalError::InvalidAddress);
        }
        Ok(self.bus())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helix_hal::mmio::RegisterBusExt;

    #[test]
    fn test_register_round_trip() {
        let sim = SimController::new(SimConfig::emmc());
        let bus = sim.bus();
        bus.write_reg::<u8>(sdhc_regs::HOST_CONTROL1, 0x5A).unwrap();
        bus.write_reg::<u16>(sdhc_regs::BLOCK_SIZE, 0x1234).unwrap();
        bus.write_reg::<u32>(sdhc_regs::ARGUMENT, 0xDEAD_BEEF).unwrap();
        bus.write_reg::<u64>(sdhc_regs::ADMA_ADDR, 0x1_2345_6789).unwrap();
        assert_eq!(bus.read_reg::<u8>(sdhc_regs::HOST_CONTROL1).unwrap(), 0x5A);
        assert_eq!(bus.read_reg::<u16>(sdhc_regs::BLOCK_SIZE).unwrap(), 0x1234);
        assert_eq!(bus.read_reg::<u32>(sdhc_regs::ARGUMENT).unwrap(), 0xDEAD_BEEF);
        assert_eq!(bus.read_reg::<u64>(sdhc_regs::ADMA_ADDR).unwrap(), 0x1_2345_6789);
        assert_eq!(bus.read(0xFF, 2), Err(HalError::InvalidParameter));
        assert_eq!(bus.read(0x10, 3), Err(HalError::InvalidParameter));
    }

    #[test]
    fn test_status_is_write_one_to_clear() {
        let sim = SimController::new(SimConfig::emmc());
        let bus = sim.bus();
        bus.write_reg::<u16>(sdhc_regs::COMMAND, 0x0D1A).unwrap();
        assert_eq!(sim.reg16(sdhc_regs::NORMAL_INT_STATUS) & 0x01, 0x01);
        bus.write_reg::<u16>(sdhc_regs::NORMAL_INT_STATUS, 0x01).unwrap();
        assert_eq!(sim.reg16(sdhc_regs::NORMAL_INT_STATUS) & 0x01, 0);

        sim.with_faults(|f| f.command_timeout = Some(13));
        bus.write_reg::<u16>(sdhc_regs::COMMAND, 0x0D1A).unwrap();
        assert_eq!(sim.reg16(sdhc_regs::NORMAL_INT_STATUS) & 0x8000, 0x8000);
        bus.write_reg::<u16>(sdhc_regs::ERROR_INT_STATUS, 0xFFFF).unwrap();
        assert_eq!(sim.reg16(sdhc_regs::NORMAL_INT_STATUS) & 0x8000, 0);
    }

    #[test]
    fn test_mappings_are_tracked() {
        let sim = SimController::new(SimConfig::emmc());
        let buffer = [0u8; 100];
        let mapping = sim
            .map(buffer.as_ptr() as usize, buffer.len(), DmaDirection::ToDevice)
            .unwrap();
        assert!(mapping.device().as_u64() >= FIRST_DEVICE_ADDRESS);
        assert_eq!(sim.active_mappings(), 1);
        sim.unmap(&mapping).unwrap();
        assert_eq!(sim.unmap(&mapping), Err(HalError::InvalidParameter));

        let pages = sim.allocate_pages(2).unwrap();
        assert_eq!(pages % DMA_PAGE_SIZE, 0);
        assert_eq!(sim.outstanding_pages(), 2);
        assert_eq!(sim.free_pages(pages, 1), Err(HalError::InvalidAddress));
        sim.free_pages(pages, 2).unwrap();
        assert_eq!(sim.outstanding_pages(), 0);
    }
}
