//! Controller, slot and card state
//!
//! State survives between the early and late initialization phases and
//! between block I/O calls. It is owned by the caller through an
//! [`SdMmcContext`] and handed to every driver entry point.

use crate::bus_mode::{BusTiming, BusWidth};
use crate::card::{Cid, Csd, ExtCsd};
use crate::config::{DriverPolicy, InitConfig};
use crate::error::{SdError, SdResult};
use crate::regs::{HostCapability, HostVersion};

/// Validity tag of an initialized [`ControllerState`]
pub const CONTROLLER_SIGNATURE: u32 = u32::from_le_bytes(*b"SDHC");

/// Kind of device behind the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CardKind {
    /// Removable SD memory card
    #[default]
    Sd,
    /// Embedded MMC device
    Emmc,
}

/// Where controller state lives, which decides how it is released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryOrigin {
    /// Ordinary memory: dropped on failure
    #[default]
    General,
    /// Reserved memory that must outlive the call: zeroed on failure
    Reserved,
}

/// Initialization phase selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPhase {
    /// Reset, capability, host init and the first card handshake
    Early,
    /// Identification, bus negotiation and capacity
    Late,
    /// Early followed by late
    Both,
    /// Power down and clear state
    Deinit,
}

impl InitPhase {
    /// Phase includes the early part
    pub const fn runs_early(self) -> bool {
        matches!(self, InitPhase::Early | InitPhase::Both)
    }

    /// Phase includes the late part
    pub const fn runs_late(self) -> bool {
        matches!(self, InitPhase::Late | InitPhase::Both)
    }
}

/// Committed geometry of the user area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    /// Block length in bytes
    pub block_len: u32,
    /// Number of blocks
    pub block_count: u64,
}

/// Card-reported identity, filled in over the course of identification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CardIdentity {
    /// Operating conditions register
    pub ocr: u32,
    /// Card identification register
    pub cid: Cid,
    /// Card specific data register
    pub csd: Csd,
    /// Extended CSD (eMMC only)
    pub ext_csd: ExtCsd,
    /// Relative card address
    pub rca: u16,
    capacity: Option<Capacity>,
}

impl CardIdentity {
    /// Record the geometry; it can only be set once
    pub fn commit_capacity(&mut self, block_len: u32, block_count: u64) -> SdResult<()> {
        if self.capacity.is_some() {
            log::error!("card capacity already committed");
            return Err(SdError::DeviceError);
        }
        self.capacity = Some(Capacity { block_len, block_count });
        Ok(())
    }

    /// Committed geometry
    pub const fn capacity(&self) -> Option<Capacity> {
        self.capacity
    }

    /// Block length in bytes (0 before commit)
    pub fn block_len(&self) -> u32 {
        self.capacity.map_or(0, |c| c.block_len)
    }

    /// Number of blocks (0 before commit)
    pub fn block_count(&self) -> u64 {
        self.capacity.map_or(0, |c| c.block_count)
    }
}

/// Per-slot state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotState {
    /// Kind of card in the slot
    pub card: CardKind,
    /// Card detected
    pub media_present: bool,
    /// Identification, negotiation and capacity all succeeded
    pub initialized: bool,
    /// Block addresses (true) or byte addresses (false)
    pub sector_addressing: bool,
    /// Negotiated timing
    pub timing: BusTiming,
    /// Negotiated bus width
    pub bus_width: BusWidth,
    /// SD card accepted 1.8V signalling
    pub s18a: bool,
    /// Card identity
    pub identity: CardIdentity,
}

/// Durable record of one host controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControllerState {
    signature: u32,
    /// Memory this state was created in
    pub origin: MemoryOrigin,
    /// Configuration-space base of the controller
    pub pci_base: u64,
    /// Controller version register
    pub version: HostVersion,
    /// Capability snapshot
    pub capability: HostCapability,
    current_freq_khz: u32,
    /// Currently selected eMMC partition
    pub active_partition: u8,
    /// The slot
    pub slot: SlotState,
    /// Early phase completed
    pub early_done: bool,
    /// Policy recorded at initialization
    pub policy: DriverPolicy,
}

impl ControllerState {
    /// Fresh state for a controller
    pub fn new(pci_base: u64, card: CardKind, origin: MemoryOrigin, policy: DriverPolicy) -> Self {
        Self {
            signature: CONTROLLER_SIGNATURE,
            origin,
            pci_base,
            policy,
            slot: SlotState {
                card,
                ..SlotState::default()
            },
            ..Self::default()
        }
    }

    /// Validity tag is intact
    pub const fn is_valid(&self) -> bool {
        self.signature == CONTROLLER_SIGNATURE
    }

    /// SD clock frequency last written to the clock control register
    pub const fn current_freq_khz(&self) -> u32 {
        self.current_freq_khz
    }

    pub(crate) fn record_clock(&mut self, khz: u32) {
        self.current_freq_khz = khz;
    }

    /// Card fully initialized
    pub const fn is_initialized(&self) -> bool {
        self.slot.initialized
    }
}

/// Caller-owned driver context
#[derive(Debug, Default)]
pub struct SdMmcContext {
    state: Option<ControllerState>,
    origin: MemoryOrigin,
}

impl SdMmcContext {
    /// Empty context; new state is created in `origin` memory
    pub const fn new(origin: MemoryOrigin) -> Self {
        Self { state: None, origin }
    }

    /// Current controller state
    pub fn state(&self) -> Option<&ControllerState> {
        self.state.as_ref()
    }

    pub(crate) fn state_mut(&mut self) -> Option<&mut ControllerState> {
        self.state.as_mut()
    }

    /// Valid state for `config`, created or re-created as needed
    pub(crate) fn acquire(&mut self, config: &InitConfig) -> &mut ControllerState {
        let reuse = matches!(
            &self.state,
            Some(state) if state.is_valid()
                && state.slot.card == config.card
                && state.pci_base == config.pci_base
        );
        if !reuse {
            if self.state.as_ref().is_some_and(ControllerState::is_valid) {
                log::debug!("controller state reset for {:?}", config.card);
            }
            self.state = None;
        }
        let origin = self.origin;
        self.state.get_or_insert_with(|| {
            ControllerState::new(config.pci_base, config.card, origin, config.policy)
        })
    }

    /// Release state after a failed initialization
    pub(crate) fn release_after_failure(&mut self) {
        match self.origin {
            MemoryOrigin::General => self.state = None,
            MemoryOrigin::Reserved => {
                if let Some(state) = self.state.as_mut() {
                    *state = ControllerState::default();
                }
            }
        }
    }

    /// Drop all state
    pub(crate) fn clear(&mut self) {
        self.state = None;
    }
}
