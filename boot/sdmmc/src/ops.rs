//! Card command library
//!
//! Each operation is one or two engine invocations. Fields the card reports
//! are returned to the caller; the identification flows decide what to keep.

use crate::bus_mode::BusWidth;
use crate::card::{CardStatus, Cid, Csd, ExtCsd, SwitchStatus};
use crate::command::{CommandRequest, ResponseShape};
use crate::error::{SdError, SdResult};
use crate::host::SdHost;
use crate::state::CardKind;
use crate::Platform;

/// Command indices
pub mod opcode {
    /// CMD0
    pub const GO_IDLE_STATE: u8 = 0;
    /// CMD1 (eMMC)
    pub const SEND_OP_COND: u8 = 1;
    /// CMD2
    pub const ALL_SEND_CID: u8 = 2;
    /// CMD3
    pub const SET_RELATIVE_ADDR: u8 = 3;
    /// CMD6: eMMC SWITCH, SD SWITCH_FUNC
    pub const SWITCH: u8 = 6;
    /// ACMD6
    pub const SD_APP_SET_BUS_WIDTH: u8 = 6;
    /// CMD7
    pub const SELECT_CARD: u8 = 7;
    /// CMD8: SD SEND_IF_COND, eMMC SEND_EXT_CSD
    pub const SEND_IF_COND: u8 = 8;
    /// CMD8 (eMMC)
    pub const SEND_EXT_CSD: u8 = 8;
    /// CMD9
    pub const SEND_CSD: u8 = 9;
    /// CMD11 (SD)
    pub const VOLTAGE_SWITCH: u8 = 11;
    /// CMD12
    pub const STOP_TRANSMISSION: u8 = 12;
    /// CMD13
    pub const SEND_STATUS: u8 = 13;
    /// CMD16
    pub const SET_BLOCKLEN: u8 = 16;
    /// CMD17
    pub const READ_SINGLE_BLOCK: u8 = 17;
    /// CMD18
    pub const READ_MULTIPLE_BLOCK: u8 = 18;
    /// CMD19 (SD)
    pub const SD_SEND_TUNING_BLOCK: u8 = 19;
    /// CMD21 (eMMC)
    pub const MMC_SEND_TUNING_BLOCK: u8 = 21;
    /// CMD23
    pub const SET_BLOCK_COUNT: u8 = 23;
    /// CMD24
    pub const WRITE_BLOCK: u8 = 24;
    /// CMD25
    pub const WRITE_MULTIPLE_BLOCK: u8 = 25;
    /// ACMD41
    pub const SD_APP_OP_COND: u8 = 41;
    /// CMD55
    pub const APP_CMD: u8 = 55;
}

/// SEND_IF_COND argument: 2.7-3.6V and check pattern 0xAA
pub const IF_COND_ARGUMENT: u32 = 0x1FF;

/// Timeout for block read/write commands (10 s)
pub const IO_TIMEOUT_US: u64 = 10_000_000;

/// Reliable write flag of SET_BLOCK_COUNT
pub const RELIABLE_WRITE: u32 = 1 << 31;

/// eMMC SWITCH access mode: write byte
pub const SWITCH_WRITE_BYTE: u8 = 3;

/// SD SWITCH_FUNC group value that leaves the group unchanged
pub const SWITCH_FUNC_KEEP: u8 = 0xF;

/// SD tuning block length
pub const SD_TUNING_BLOCK_LEN: usize = 64;

const fn rca_argument(rca: u16) -> u32 {
    (rca as u32) << 16
}

/// Pack the eMMC SWITCH argument
pub const fn mmc_switch_argument(access: u8, index: u8, value: u8, cmd_set: u8) -> u32 {
    (access as u32) << 24 | (index as u32) << 16 | (value as u32) << 8 | cmd_set as u32
}

/// Pack the SD SWITCH_FUNC argument
pub const fn sd_switch_argument(
    set: bool,
    access_mode: u8,
    command_system: u8,
    driver_strength: u8,
    power_limit: u8,
) -> u32 {
    (set as u32) << 31
        | 0x00FF_0000
        | ((power_limit & 0xF) as u32) << 12
        | ((driver_strength & 0xF) as u32) << 8
        | ((command_system & 0xF) as u32) << 4
        | (access_mode & 0xF) as u32
}

impl<'a, P: Platform> SdHost<'a, P> {
    // =========================================================================
    // IDENTIFICATION
    // =========================================================================

    /// CMD0: reset the card to idle
    pub fn go_idle(&mut self) -> SdResult<()> {
        self.execute(CommandRequest::bc(opcode::GO_IDLE_STATE))?;
        Ok(())
    }

    /// CMD8: SD voltage check with echo verification
    pub fn send_if_cond(&mut self) -> SdResult<()> {
        let request = CommandRequest::bcr(opcode::SEND_IF_COND, ResponseShape::R7)
            .with_argument(IF_COND_ARGUMENT);
        let echo = self.execute(request)?.interface_condition()?;
        if echo & 0xFFF != IF_COND_ARGUMENT {
            log::warn!("SD: voltage check echo {:#x}", echo);
            return Err(SdError::DeviceError);
        }
        Ok(())
    }

    /// CMD55: next command is application specific
    pub fn app_cmd(&mut self, rca: u16) -> SdResult<CardStatus> {
        let request =
            CommandRequest::ac(opcode::APP_CMD, ResponseShape::R1).with_argument(rca_argument(rca));
        self.execute(request)?.card_status()
    }

    /// CMD55 + ACMD41: SD operating conditions
    pub fn sd_send_op_cond(&mut self, argument: u32) -> SdResult<u32> {
        self.app_cmd(0)?;
        let request =
            CommandRequest::bcr(opcode::SD_APP_OP_COND, ResponseShape::R3).with_argument(argument);
        self.execute(request)?.ocr()
    }

    /// CMD1: eMMC operating conditions
    pub fn mmc_send_op_cond(&mut self, argument: u32) -> SdResult<u32> {
        let request =
            CommandRequest::bcr(opcode::SEND_OP_COND, ResponseShape::R3).with_argument(argument);
        self.execute(request)?.ocr()
    }

    /// CMD2: identification broadcast
    pub fn all_send_cid(&mut self) -> SdResult<Cid> {
        let image = self
            .execute(CommandRequest::bcr(opcode::ALL_SEND_CID, ResponseShape::R2))?
            .register_image()?;
        Ok(Cid { raw: image })
    }

    /// CMD3 (eMMC): assign `rca`
    pub fn mmc_set_rca(&mut self, rca: u16) -> SdResult<()> {
        self.execute(
            CommandRequest::ac(opcode::SET_RELATIVE_ADDR, ResponseShape::R1)
                .with_argument(rca_argument(rca)),
        )?;
        Ok(())
    }

    /// CMD3 (SD): ask the card to publish its address
    pub fn sd_send_rca(&mut self) -> SdResult<u16> {
        self.execute(CommandRequest::bcr(opcode::SET_RELATIVE_ADDR, ResponseShape::R6))?
            .published_rca()
    }

    /// CMD9: card specific data
    pub fn send_csd(&mut self, rca: u16) -> SdResult<Csd> {
        let request = CommandRequest::ac(opcode::SEND_CSD, ResponseShape::R2)
            .with_argument(rca_argument(rca));
        let image = self.execute(request)?.register_image()?;
        Ok(Csd { raw: image })
    }

    /// CMD7: move the card to the transfer state
    pub fn select_card(&mut self, rca: u16) -> SdResult<()> {
        // SD cards may signal busy on selection
        let shape = match self.state.slot.card {
            CardKind::Sd => ResponseShape::R1b,
            CardKind::Emmc => ResponseShape::R1,
        };
        self.execute(
            CommandRequest::ac(opcode::SELECT_CARD, shape).with_argument(rca_argument(rca)),
        )?;
        Ok(())
    }

    /// CMD8 (eMMC): extended CSD
    pub fn send_ext_csd(&mut self) -> SdResult<ExtCsd> {
        let mut ext_csd = ExtCsd::default();
        self.execute(
            CommandRequest::adtc(opcode::SEND_EXT_CSD, ResponseShape::R1)
                .with_read(&mut ext_csd.raw),
        )?;
        Ok(ext_csd)
    }

    /// CMD13: card status
    pub fn send_status(&mut self, rca: u16) -> SdResult<CardStatus> {
        let request = CommandRequest::ac(opcode::SEND_STATUS, ResponseShape::R1)
            .with_argument(rca_argument(rca));
        self.execute(request)?.card_status()
    }

    // =========================================================================
    // SWITCHES
    // =========================================================================

    /// CMD6 (eMMC): write one EXT_CSD byte and verify with CMD13
    pub fn mmc_switch(&mut self, index: u8, value: u8) -> SdResult<()> {
        let argument = mmc_switch_argument(SWITCH_WRITE_BYTE, index, value, 0);
        self.execute(
            CommandRequest::ac(opcode::SWITCH, ResponseShape::R1b).with_argument(argument),
        )?;

        let rca = self.state.slot.identity.rca;
        let status = self.send_status(rca)?;
        if status.switch_error() {
            log::error!("eMMC: SWITCH of EXT_CSD[{}] to {:#x} rejected", index, value);
            return Err(SdError::DeviceError);
        }
        self.state.slot.identity.ext_csd.set(index as usize, value);
        Ok(())
    }

    /// CMD6 (eMMC): select a partition in PARTITION_CONFIG
    pub fn mmc_switch_partition(&mut self, partition: u8) -> SdResult<()> {
        let config = self.state.slot.identity.ext_csd.partition_config();
        let value = (config & !0x07) | (partition & 0x07);
        self.mmc_switch(crate::card::ext_csd::PARTITION_CONFIG as u8, value)?;
        self.state.active_partition = partition;
        log::debug!("eMMC: partition {} selected", partition);
        Ok(())
    }

    /// CMD6 (SD): query or commit function groups
    pub fn sd_switch_function(
        &mut self,
        set: bool,
        access_mode: u8,
        command_system: u8,
        driver_strength: u8,
        power_limit: u8,
    ) -> SdResult<SwitchStatus> {
        let argument =
            sd_switch_argument(set, access_mode, command_system, driver_strength, power_limit);
        let mut status = SwitchStatus::default();
        self.execute(
            CommandRequest::adtc(opcode::SWITCH, ResponseShape::R1)
                .with_argument(argument)
                .with_read(&mut status.raw),
        )?;
        Ok(status)
    }

    /// CMD55 + ACMD6: SD data bus width
    pub fn sd_set_bus_width(&mut self, width: BusWidth) -> SdResult<()> {
        let argument = match width {
            BusWidth::Width1 => 0,
            BusWidth::Width4 => 2,
            BusWidth::Width8 => return Err(SdError::InvalidArgument),
        };
        let rca = self.state.slot.identity.rca;
        self.app_cmd(rca)?;
        self.execute(
            CommandRequest::ac(opcode::SD_APP_SET_BUS_WIDTH, ResponseShape::R1)
                .with_argument(argument),
        )?;
        Ok(())
    }

    /// CMD11: SD signal voltage switch request
    pub fn voltage_switch(&mut self) -> SdResult<()> {
        self.execute(CommandRequest::ac(opcode::VOLTAGE_SWITCH, ResponseShape::R1))?;
        Ok(())
    }

    /// CMD19 / CMD21: one tuning block exchange
    pub fn send_tuning_block(&mut self) -> SdResult<()> {
        let (index, len) = match self.state.slot.card {
            CardKind::Sd => (opcode::SD_SEND_TUNING_BLOCK, SD_TUNING_BLOCK_LEN),
            CardKind::Emmc if self.state.slot.bus_width == BusWidth::Width8 => {
                (opcode::MMC_SEND_TUNING_BLOCK, 128)
            }
            CardKind::Emmc => (opcode::MMC_SEND_TUNING_BLOCK, 64),
        };
        let mut block = [0u8; 128];
        self.execute(CommandRequest::adtc(index, ResponseShape::R1).with_read(&mut block[..len]))?;
        Ok(())
    }

    // =========================================================================
    // DATA TRANSFER
    // =========================================================================

    /// CMD16: block length for byte-addressed cards
    pub fn set_block_len(&mut self, len: u32) -> SdResult<()> {
        self.execute(
            CommandRequest::ac(opcode::SET_BLOCKLEN, ResponseShape::R1).with_argument(len),
        )?;
        Ok(())
    }

    /// CMD23: pre-defined block count for the next transfer
    pub fn set_block_count(&mut self, count: u32, reliable: bool) -> SdResult<()> {
        let mut argument = count & 0xFFFF;
        if reliable {
            argument |= RELIABLE_WRITE;
        }
        self.execute(
            CommandRequest::ac(opcode::SET_BLOCK_COUNT, ResponseShape::R1).with_argument(argument),
        )?;
        Ok(())
    }

    /// CMD12: abort an open-ended transfer
    pub fn stop_transmission(&mut self) -> SdResult<()> {
        let rca = self.state.slot.identity.rca;
        self.execute(
            CommandRequest::ac(opcode::STOP_TRANSMISSION, ResponseShape::R1b)
                .with_argument(rca_argument(rca)),
        )?;
        Ok(())
    }

    /// CMD17 / CMD18 into `buffer`
    pub fn read_blocks_at(
        &mut self,
        address: u32,
        buffer: &mut [u8],
        block_len: usize,
    ) -> SdResult<()> {
        let index = if buffer.len() > block_len {
            opcode::READ_MULTIPLE_BLOCK
        } else {
            opcode::READ_SINGLE_BLOCK
        };
        self.execute(
            CommandRequest::adtc(index, ResponseShape::R1)
                .with_argument(address)
                .with_read(buffer)
                .with_timeout(IO_TIMEOUT_US),
        )?;
        Ok(())
    }

    /// CMD24 / CMD25 from `buffer`
    pub fn write_blocks_at(
        &mut self,
        address: u32,
        buffer: &[u8],
        block_len: usize,
    ) -> SdResult<()> {
        let index = if buffer.len() > block_len {
            opcode::WRITE_MULTIPLE_BLOCK
        } else {
            opcode::WRITE_BLOCK
        };
        self.execute(
            CommandRequest::adtc(index, ResponseShape::R1)
                .with_argument(address)
                .with_write(buffer)
                .with_timeout(IO_TIMEOUT_US),
        )?;
        Ok(())
    }
}
