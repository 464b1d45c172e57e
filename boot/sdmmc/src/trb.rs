//! Command/request engine
//!
//! One [`CommandRequest`] becomes one [`TransferRequestBlock`]: the transfer
//! strategy, the block geometry and the DMA resources backing the data phase.
//! The engine then walks the request through
//!
//! ```text
//! Created ──► EnvironmentReady ──► Submitted ──► Completed
//!    │              │                  │
//!    └──────────────┴──────────────────┴───────► Failed
//! ```
//!
//! by polling the interrupt status registers. The block owns its DMA
//! mappings and descriptor table, so every exit path releases them.

use helix_hal::dma::{DmaDirection, DmaMapper, DmaMapping};
use helix_hal::mmio::RegisterBusExt;
use helix_hal::PhysAddr;

use crate::adma::{DescriptorTable, ADMA_ADDRESS_LIMIT};
use crate::command::{CommandClass, CommandRequest, DataBuffer, Response};
use crate::error::{SdError, SdResult};
use crate::host::SdHost;
use crate::ops::opcode;
use crate::regs::{
    sdhc_regs, ErrorInt, HostCapability, HostControl1, NormalInt, PresentState, SoftwareReset,
    TransferModeFlags, SDMA_BOUNDARY, SDMA_BOUNDARY_BITS,
};
use crate::state::CardKind;
use crate::Platform;

/// Block size used for every multi-block transfer
pub const TRANSFER_BLOCK_SIZE: usize = 512;

/// Largest block count the block count register holds
const MAX_TRB_BLOCKS: usize = 0xFFFF;

/// How the data phase moves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// No data phase
    NoData,
    /// CPU moves every word through the buffer data port
    Pio,
    /// Single-buffer DMA with a 512 KiB boundary
    Sdma,
    /// Descriptor-table DMA
    Adma2,
}

/// Tuning block exchanges always run over PIO
pub fn is_tuning_command(index: u8, card: CardKind) -> bool {
    match card {
        CardKind::Emmc => index == opcode::MMC_SEND_TUNING_BLOCK,
        CardKind::Sd => index == opcode::SD_SEND_TUNING_BLOCK,
    }
}

/// Pick the transfer strategy for a request
///
/// ADMA2 wins when both DMA modes are advertised.
pub fn select_transfer_mode(
    request: &CommandRequest<'_>,
    card: CardKind,
    capability: &HostCapability,
) -> TransferMode {
    if request.data.is_empty() {
        TransferMode::NoData
    } else if is_tuning_command(request.index, card) {
        TransferMode::Pio
    } else if capability.adma2() {
        TransferMode::Adma2
    } else if capability.sdma() {
        TransferMode::Sdma
    } else {
        TransferMode::Pio
    }
}

/// Block size and count for a data phase of `len` bytes
///
/// Anything above one block must be a whole number of 512-byte blocks.
pub fn block_geometry(len: usize) -> SdResult<(usize, usize)> {
    if len == 0 {
        return Ok((0, 0));
    }
    let block_size = len.min(TRANSFER_BLOCK_SIZE);
    if len > TRANSFER_BLOCK_SIZE && len % TRANSFER_BLOCK_SIZE != 0 {
        return Err(SdError::InvalidArgument);
    }
    let count = len / block_size;
    if count > MAX_TRB_BLOCKS {
        return Err(SdError::InvalidArgument);
    }
    Ok((block_size, count))
}

/// Data buffer mapping released on drop
#[derive(Debug)]
pub struct DmaBuffer<'p, P: DmaMapper + ?Sized> {
    platform: &'p P,
    mapping: DmaMapping,
}

impl<'p, P: DmaMapper + ?Sized> DmaBuffer<'p, P> {
    /// Map `len` bytes at `host`
    pub fn map(
        platform: &'p P,
        host: usize,
        len: usize,
        direction: DmaDirection,
    ) -> SdResult<Self> {
        let mapping = platform.map(host, len, direction)?;
        Ok(Self { platform, mapping })
    }

    /// Device-visible address
    pub fn device_address(&self) -> PhysAddr {
        self.mapping.device()
    }
}

impl<P: DmaMapper + ?Sized> Drop for DmaBuffer<'_, P> {
    fn drop(&mut self) {
        if let Err(err) = self.platform.unmap(&self.mapping) {
            log::warn!("DMA buffer unmap failed: {}", err);
        }
    }
}

/// The execution unit of one request
pub struct TransferRequestBlock<'p, P: Platform> {
    /// Chosen strategy
    pub mode: TransferMode,
    /// Bytes per block
    pub block_size: usize,
    /// Number of blocks
    pub block_count: usize,
    /// Card to host
    pub read: bool,
    /// Tuning block exchange
    pub tuning: bool,
    buffer: Option<DmaBuffer<'p, P>>,
    table: Option<DescriptorTable<'p, P>>,
    sdma_address: u64,
    pio_offset: usize,
}

impl<'p, P: Platform> TransferRequestBlock<'p, P> {
    /// Classify a request and acquire the DMA resources it needs
    pub fn create(
        platform: &'p P,
        request: &CommandRequest<'_>,
        card: CardKind,
        capability: &HostCapability,
    ) -> SdResult<Self> {
        request.validate()?;
        let mode = select_transfer_mode(request, card, capability);
        let (block_size, block_count) = block_geometry(request.data.len())?;
        let read = request.data.is_read();

        let mut trb = Self {
            mode,
            block_size,
            block_count,
            read,
            tuning: is_tuning_command(request.index, card),
            buffer: None,
            table: None,
            sdma_address: 0,
            pio_offset: 0,
        };

        if matches!(mode, TransferMode::Sdma | TransferMode::Adma2) {
            let direction = if read {
                DmaDirection::FromDevice
            } else {
                DmaDirection::ToDevice
            };
            let len = request.data.len();
            let buffer = DmaBuffer::map(platform, request.data.host_address(), len, direction)?;
            let device = buffer.device_address();
            trb.buffer = Some(buffer);

            if mode == TransferMode::Sdma {
                match device.checked_add(len as u64) {
                    Some(end) if end.as_u64() <= ADMA_ADDRESS_LIMIT => {}
                    _ => return Err(SdError::Unsupported),
                }
                trb.sdma_address = device.as_u64();
            } else {
                trb.table = Some(DescriptorTable::build(platform, device, len)?);
            }
        }
        Ok(trb)
    }

    /// Transfer mode register value
    pub fn transfer_mode_bits(&self, card: CardKind) -> u16 {
        let mut flags = TransferModeFlags::empty();
        if self.mode == TransferMode::NoData {
            return flags.bits();
        }
        if matches!(self.mode, TransferMode::Sdma | TransferMode::Adma2) {
            flags |= TransferModeFlags::DMA_ENABLE;
        }
        if self.read {
            flags |= TransferModeFlags::READ;
        }
        if self.block_count > 1 {
            flags |= TransferModeFlags::MULTI_BLOCK | TransferModeFlags::BLOCK_COUNT_ENABLE;
            if card == CardKind::Sd {
                flags |= TransferModeFlags::AUTO_CMD12;
            }
        }
        flags.bits()
    }
}

impl<P: Platform> core::fmt::Debug for TransferRequestBlock<'_, P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TransferRequestBlock")
            .field("mode", &self.mode)
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count)
            .field("read", &self.read)
            .field("dma", &self.buffer.as_ref().map(DmaBuffer::device_address))
            .finish()
    }
}

impl<'a, P: Platform> SdHost<'a, P> {
    /// Run one command to completion and return its response
    pub fn execute(&mut self, mut request: CommandRequest<'_>) -> SdResult<Response> {
        let platform = self.platform;
        let card = self.state.slot.card;
        let mut trb =
            TransferRequestBlock::create(platform, &request, card, &self.state.capability)?;

        log::debug!(
            "SDHC: CMD{} arg {:#010x} {:?} {}x{}",
            request.index,
            request.argument,
            trb.mode,
            trb.block_count,
            trb.block_size
        );

        self.wait_environment(&request)?;
        self.submit(&request, &trb)?;
        self.wait_completion(&mut request, &mut trb)?;

        if request.class == CommandClass::Bc {
            return Ok(Response::None);
        }
        let mut words = [0u32; 4];
        for (i, word) in words.iter_mut().enumerate() {
            *word = self.bus.read_reg(sdhc_regs::RESPONSE + i * 4)?;
        }
        Ok(Response::from_words(request.response, words))
    }

    /// Wait for the command (and, if needed, data) line to go idle
    fn wait_environment(&mut self, request: &CommandRequest<'_>) -> SdResult<()> {
        let mut mask = PresentState::CMD_INHIBIT;
        if request.needs_data_line() {
            mask |= PresentState::DAT_INHIBIT;
        }
        self.wait(sdhc_regs::PRESENT_STATE, mask.bits(), 0, request.timeout_us)
            .map_err(|err| {
                log::warn!("SDHC: CMD{} lines busy ({:?})", request.index, mask);
                err
            })
    }

    fn submit(
        &mut self,
        request: &CommandRequest<'_>,
        trb: &TransferRequestBlock<'_, P>,
    ) -> SdResult<()> {
        self.bus.write_reg::<u16>(sdhc_regs::ERROR_INT_STATUS, 0xFFFF)?;
        self.bus
            .write_reg::<u16>(sdhc_regs::NORMAL_INT_STATUS, NormalInt::CLEAR_FOR_COMMAND)?;

        self.bus
            .and_reg(sdhc_regs::HOST_CONTROL1, !HostControl1::DMA_SELECT.bits())?;
        match trb.mode {
            TransferMode::Adma2 => {
                self.bus
                    .or_reg(sdhc_regs::HOST_CONTROL1, HostControl1::DMA_ADMA2.bits())?;
                let table = trb
                    .table
                    .as_ref()
                    .map_or(0, |table| table.device_address().as_u64());
                self.bus.write_reg::<u64>(sdhc_regs::ADMA_ADDR, table)?;
            }
            TransferMode::Sdma => {
                self.bus
                    .write_reg::<u32>(sdhc_regs::SDMA_ADDR, trb.sdma_address as u32)?;
            }
            TransferMode::NoData | TransferMode::Pio => {}
        }

        let mut block_size = trb.block_size as u16;
        if trb.mode == TransferMode::Sdma {
            block_size |= SDMA_BOUNDARY_BITS;
        }
        self.bus.write_reg(sdhc_regs::BLOCK_SIZE, block_size)?;
        self.bus
            .write_reg::<u16>(sdhc_regs::BLOCK_COUNT, trb.block_count as u16)?;
        self.bus.write_reg(sdhc_regs::ARGUMENT, request.argument)?;
        self.bus
            .write_reg(sdhc_regs::TRANSFER_MODE, trb.transfer_mode_bits(self.state.slot.card))?;
        self.bus
            .write_reg(sdhc_regs::COMMAND, request.register_value())?;
        Ok(())
    }

    fn wait_completion(
        &mut self,
        request: &mut CommandRequest<'_>,
        trb: &mut TransferRequestBlock<'_, P>,
    ) -> SdResult<()> {
        let infinite = request.timeout_us == 0;
        let mut remaining = request.timeout_us;
        loop {
            if self.check_trb(request, trb)? {
                return Ok(());
            }
            if !infinite {
                if remaining == 0 {
                    log::warn!("SDHC: CMD{} timed out", request.index);
                    return Err(SdError::Timeout);
                }
                remaining -= 1;
            }
            self.stall(1);
        }
    }

    /// One poll of the interrupt status; `Ok(true)` once the request is done
    fn check_trb(
        &mut self,
        request: &mut CommandRequest<'_>,
        trb: &mut TransferRequestBlock<'_, P>,
    ) -> SdResult<bool> {
        let status = NormalInt::from_bits_retain(self.bus.read_reg(sdhc_regs::NORMAL_INT_STATUS)?);
        log::trace!("SDHC: CMD{} status {:#06x}", request.index, status.bits());

        // Completion wins over any error raised alongside it
        if status.contains(NormalInt::TRANSFER_COMPLETE) {
            self.bus.write_reg(
                sdhc_regs::NORMAL_INT_STATUS,
                NormalInt::TRANSFER_COMPLETE.bits(),
            )?;
            return Ok(true);
        }

        if status.contains(NormalInt::ERROR_INT) {
            return Err(self.recover_from_error(request.index)?);
        }

        if trb.mode == TransferMode::Sdma && status.contains(NormalInt::DMA_INT) {
            self.bus
                .write_reg(sdhc_regs::NORMAL_INT_STATUS, NormalInt::DMA_INT.bits())?;
            trb.sdma_address = PhysAddr::new(trb.sdma_address)
                .add(SDMA_BOUNDARY)
                .align_down(SDMA_BOUNDARY)
                .as_u64();
            self.bus
                .write_reg::<u32>(sdhc_regs::SDMA_ADDR, trb.sdma_address as u32)?;
            return Ok(false);
        }

        if request.class != CommandClass::Adtc
            && !request.response.is_some_and(|shape| shape.is_busy())
        {
            if status.contains(NormalInt::CMD_COMPLETE) {
                self.bus
                    .write_reg(sdhc_regs::NORMAL_INT_STATUS, NormalInt::CMD_COMPLETE.bits())?;
                return Ok(true);
            }
            return Ok(false);
        }

        if trb.mode == TransferMode::Pio {
            if trb.tuning {
                if status.contains(NormalInt::BUF_READ_READY) {
                    self.bus.write_reg(
                        sdhc_regs::NORMAL_INT_STATUS,
                        NormalInt::BUF_READ_READY.bits(),
                    )?;
                    self.pio_transfer(&mut request.data, trb)?;
                    return Ok(true);
                }
                return Ok(false);
            }

            let ready = if trb.read {
                NormalInt::BUF_READ_READY
            } else {
                NormalInt::BUF_WRITE_READY
            };
            if status.contains(ready) && trb.pio_offset < trb.block_size * trb.block_count {
                self.bus
                    .write_reg(sdhc_regs::NORMAL_INT_STATUS, ready.bits())?;
                self.pio_transfer(&mut request.data, trb)?;
            }
        }
        Ok(false)
    }

    /// Move one block through the buffer data port
    fn pio_transfer(
        &mut self,
        data: &mut DataBuffer<'_>,
        trb: &mut TransferRequestBlock<'_, P>,
    ) -> SdResult<()> {
        let start = trb.pio_offset;
        let end = (start + trb.block_size).min(data.len());
        match data {
            DataBuffer::Read(buffer) => {
                for chunk in buffer[start..end].chunks_mut(4) {
                    let word: u32 = self.bus.read_reg(sdhc_regs::BUFFER_DATA)?;
                    chunk.copy_from_slice(&word.to_le_bytes()[..chunk.len()]);
                }
            }
            DataBuffer::Write(buffer) => {
                for chunk in buffer[start..end].chunks(4) {
                    let mut bytes = [0u8; 4];
                    bytes[..chunk.len()].copy_from_slice(chunk);
                    self.bus
                        .write_reg(sdhc_regs::BUFFER_DATA, u32::from_le_bytes(bytes))?;
                }
            }
            DataBuffer::None => return Err(SdError::InvalidArgument),
        }
        trb.pio_offset = end;
        Ok(())
    }

    /// Decode the error status, reset the failing line circuits and classify
    fn recover_from_error(&mut self, index: u8) -> SdResult<SdError> {
        let errors = ErrorInt::from_bits_retain(self.bus.read_reg(sdhc_regs::ERROR_INT_STATUS)?);

        let mut lines = SoftwareReset::empty();
        if errors.intersects(ErrorInt::COMMAND_ERRORS) {
            lines |= SoftwareReset::CMD_LINE;
        }
        if errors.intersects(ErrorInt::DATA_ERRORS) {
            lines |= SoftwareReset::DAT_LINE;
        }
        log::warn!(
            "SDHC: CMD{} error status {:#06x}, resetting {:?}",
            index,
            errors.bits(),
            lines
        );
        if self.reset_lines(lines).is_err() {
            log::error!("SDHC: line reset did not complete");
            return Err(SdError::DeviceError);
        }
        self.bus.write_reg(sdhc_regs::ERROR_INT_STATUS, errors.bits())?;

        if errors.intersects(ErrorInt::CRC_ERRORS) {
            Ok(SdError::CrcError)
        } else {
            Ok(SdError::DeviceError)
        }
    }
}
