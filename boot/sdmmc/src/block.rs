//! Block I/O facade
//!
//! Splits a byte range into hardware-legal chunks, selects the eMMC
//! partition behind a logical device index and drives one read or write
//! command per chunk.

use crate::card::{CardState, Csd, ExtCsd};
use crate::error::{SdError, SdResult};
use crate::host::SdHost;
use crate::state::{CardKind, ControllerState};
use crate::Platform;

/// Block length committed for every card
pub const BLOCK_LEN: u32 = 512;

/// Logical device indices of an eMMC device
pub mod partition {
    /// User data area
    pub const USER: u8 = 0;
    /// Boot area 1
    pub const BOOT1: u8 = 1;
    /// Boot area 2
    pub const BOOT2: u8 = 2;
    /// Replay protected memory block
    pub const RPMB: u8 = 3;
    /// General purpose partition 1 (2..4 follow)
    pub const GP1: u8 = 4;
    /// Highest valid index
    pub const LAST: u8 = 7;
}

/// Geometry of one logical device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaInfo {
    /// Block size in bytes
    pub block_size: u32,
    /// Number of blocks
    pub block_count: u64,
}

/// Addressing mode and byte capacity of the user area
pub fn card_capacity(card: CardKind, csd: &Csd, ext_csd: &ExtCsd) -> (bool, u64) {
    if !csd.is_sector_addressed() {
        return (false, csd.byte_addressed_capacity());
    }
    let bytes = match card {
        CardKind::Emmc => u64::from(ext_csd.sec_count()) * u64::from(BLOCK_LEN),
        CardKind::Sd => csd.sd_high_capacity(),
    };
    (true, bytes)
}

/// Size in bytes of logical device `device`
pub fn partition_bytes(state: &ControllerState, device: u8) -> SdResult<u64> {
    let identity = &state.slot.identity;
    let user = identity.block_count() * u64::from(identity.block_len());
    let bytes = match (state.slot.card, device) {
        (_, partition::USER) => user,
        (CardKind::Sd, _) => return Err(SdError::InvalidArgument),
        (CardKind::Emmc, partition::BOOT1 | partition::BOOT2) => {
            identity.ext_csd.boot_partition_bytes()
        }
        (CardKind::Emmc, partition::RPMB) => identity.ext_csd.rpmb_bytes(),
        (CardKind::Emmc, partition::GP1..=partition::LAST) => identity
            .ext_csd
            .gp_partition_bytes(usize::from(device - partition::GP1)),
        (CardKind::Emmc, _) => return Err(SdError::InvalidArgument),
    };
    if bytes == 0 {
        return Err(SdError::InvalidArgument);
    }
    Ok(bytes)
}

/// Geometry of logical device `device`
pub fn media_info(state: &ControllerState, device: u8) -> SdResult<MediaInfo> {
    if !state.is_valid() || !state.is_initialized() {
        return Err(SdError::NotReady);
    }
    let block_size = state.slot.identity.block_len();
    let bytes = partition_bytes(state, device)?;
    Ok(MediaInfo {
        block_size,
        block_count: bytes / u64::from(block_size),
    })
}

/// One hardware command worth of blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// First block
    pub lba: u64,
    /// Number of blocks
    pub blocks: u32,
}

/// Iterator over the chunks of a block range
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    next: u64,
    remaining: u64,
    max: u32,
}

impl ChunkPlan {
    /// Split `blocks` blocks from `lba` into chunks of at most `max` blocks
    pub fn new(lba: u64, blocks: u64, max: u32) -> Self {
        Self {
            next: lba,
            remaining: blocks,
            max: max.max(1),
        }
    }
}

impl Iterator for ChunkPlan {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.remaining == 0 {
            return None;
        }
        let blocks = self.remaining.min(u64::from(self.max)) as u32;
        let chunk = Chunk {
            lba: self.next,
            blocks,
        };
        self.next += u64::from(blocks);
        self.remaining -= u64::from(blocks);
        Some(chunk)
    }
}

/// Direction and buffer of a block request
#[derive(Debug)]
pub enum BlockIo<'b> {
    /// Card to memory
    Read(&'b mut [u8]),
    /// Memory to card
    Write {
        /// Source data
        data: &'b [u8],
        /// eMMC reliable write
        reliable: bool,
    },
}

impl BlockIo<'_> {
    fn len(&self) -> usize {
        match self {
            BlockIo::Read(buffer) => buffer.len(),
            BlockIo::Write { data, .. } => data.len(),
        }
    }
}

impl<'a, P: Platform> SdHost<'a, P> {
    /// Derive and commit the card geometry
    pub fn commit_capacity(&mut self) -> SdResult<()> {
        let card = self.state.slot.card;
        let identity = &self.state.slot.identity;
        let (sector, bytes) = card_capacity(card, &identity.csd, &identity.ext_csd);

        if !sector && card == CardKind::Sd {
            self.set_block_len(BLOCK_LEN)?;
        }
        self.state.slot.sector_addressing = sector;
        self.state
            .slot
            .identity
            .commit_capacity(BLOCK_LEN, bytes / u64::from(BLOCK_LEN))?;
        log::info!(
            "SDHC: {:?} capacity {} MiB, {} addressing",
            card,
            bytes >> 20,
            if sector { "sector" } else { "byte" }
        );
        Ok(())
    }

    /// Read or write whole blocks of logical device `device`
    pub fn transfer_blocks(&mut self, device: u8, lba: u64, mut io: BlockIo<'_>) -> SdResult<()> {
        if !self.state.is_initialized() || !self.state.slot.media_present {
            return Err(SdError::NotReady);
        }
        let block_len = self.state.slot.identity.block_len() as usize;
        let len = io.len();
        if block_len == 0 || len % block_len != 0 {
            return Err(SdError::InvalidArgument);
        }
        if len == 0 {
            return Ok(());
        }

        let partition_blocks = partition_bytes(self.state(), device)? / block_len as u64;
        let blocks = (len / block_len) as u64;
        match lba.checked_add(blocks) {
            Some(end) if end <= partition_blocks => {}
            _ => return Err(SdError::InvalidArgument),
        }

        if self.state.slot.card == CardKind::Emmc && self.state.active_partition != device {
            self.mmc_switch_partition(device)?;
        }

        let max = self.state.policy.chunk_blocks(block_len as u32);
        log::debug!("SDHC: {} blocks at {} in chunks of {}", blocks, lba, max);

        for chunk in ChunkPlan::new(lba, blocks, max) {
            let start = (chunk.lba - lba) as usize * block_len;
            let end = start + chunk.blocks as usize * block_len;
            if let Err(err) = self.transfer_chunk(chunk, &mut io, start..end, block_len) {
                self.recover_transfer();
                return Err(err);
            }
        }
        Ok(())
    }

    fn transfer_chunk(
        &mut self,
        chunk: Chunk,
        io: &mut BlockIo<'_>,
        range: core::ops::Range<usize>,
        block_len: usize,
    ) -> SdResult<()> {
        let address = if self.state.slot.sector_addressing {
            chunk.lba
        } else {
            chunk.lba * block_len as u64
        };
        let address = u32::try_from(address).map_err(|_| SdError::InvalidArgument)?;

        if self.state.slot.card == CardKind::Emmc {
            let reliable = matches!(io, BlockIo::Write { reliable: true, .. });
            self.set_block_count(chunk.blocks, reliable)?;
        }
        match io {
            BlockIo::Read(buffer) => self.read_blocks_at(address, &mut buffer[range], block_len),
            BlockIo::Write { data, .. } => self.write_blocks_at(address, &data[range], block_len),
        }
    }

    /// Leave the card in the transfer state after a failed chunk
    fn recover_transfer(&mut self) {
        let rca = self.state.slot.identity.rca;
        match self.send_status(rca) {
            Ok(status) if status.current_state() == CardState::Rcv => {
                log::warn!("SDHC: card left receiving data, stopping transmission");
                if let Err(err) = self.stop_transmission() {
                    log::warn!("SDHC: stop transmission failed: {}", err);
                }
            }
            Ok(_) => {}
            Err(err) => log::warn!("SDHC: status query after failed transfer: {}", err),
        }
    }
}
