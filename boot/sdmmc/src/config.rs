//! Driver configuration

use crate::state::{CardKind, InitPhase};

/// Largest block count the block count register can hold
pub const MAX_BLOCK_COUNT: u32 = 0xFFFF;

/// DMA buffer protection: transfers must fit in half of the protected buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaProtection {
    /// Size of the protected DMA buffer in bytes
    pub buffer_size: u32,
}

/// Behavioural knobs for bus negotiation and block I/O
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverPolicy {
    /// Stop at HS200 even when both sides support HS400
    pub hs400_downgrade: bool,
    /// Upper bound on blocks per hardware command
    pub max_blocks_per_transfer: u32,
    /// Cap transfers to half of a protected DMA buffer
    pub dma_protection: Option<DmaProtection>,
    /// Request 1.8V signalling from SD cards when the host supports UHS-I
    pub sd_uhs: bool,
}

impl DriverPolicy {
    /// Default policy
    pub const fn new() -> Self {
        Self {
            hs400_downgrade: false,
            max_blocks_per_transfer: MAX_BLOCK_COUNT,
            dma_protection: None,
            sd_uhs: true,
        }
    }

    /// Downgrade HS400 to HS200
    pub const fn with_hs400_downgrade(mut self, downgrade: bool) -> Self {
        self.hs400_downgrade = downgrade;
        self
    }

    /// Limit blocks per hardware command (clamped to the register limit)
    pub const fn with_max_blocks(mut self, blocks: u32) -> Self {
        self.max_blocks_per_transfer = if blocks > MAX_BLOCK_COUNT {
            MAX_BLOCK_COUNT
        } else {
            blocks
        };
        self
    }

    /// Enable DMA buffer protection
    pub const fn with_dma_protection(mut self, buffer_size: u32) -> Self {
        self.dma_protection = Some(DmaProtection { buffer_size });
        self
    }

    /// Enable or disable the SD 1.8V request
    pub const fn with_sd_uhs(mut self, enabled: bool) -> Self {
        self.sd_uhs = enabled;
        self
    }

    /// Blocks per hardware command for a given block length, at least 1
    pub const fn chunk_blocks(&self, block_len: u32) -> u32 {
        let mut max = if self.max_blocks_per_transfer > MAX_BLOCK_COUNT {
            MAX_BLOCK_COUNT
        } else {
            self.max_blocks_per_transfer
        };
        if let Some(protection) = self.dma_protection {
            if block_len != 0 {
                let limit = protection.buffer_size / 2 / block_len;
                if limit < max {
                    max = limit;
                }
            }
        }
        if max == 0 {
            1
        } else {
            max
        }
    }
}

impl Default for DriverPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Arguments of one initialization call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitConfig {
    /// Configuration-space base of the controller
    pub pci_base: u64,
    /// Kind of device behind the controller
    pub card: CardKind,
    /// Which part of initialization to run
    pub phase: InitPhase,
    /// Policy recorded with the controller state
    pub policy: DriverPolicy,
}

impl InitConfig {
    /// Full initialization with the default policy
    pub const fn new(pci_base: u64, card: CardKind) -> Self {
        Self {
            pci_base,
            card,
            phase: InitPhase::Both,
            policy: DriverPolicy::new(),
        }
    }

    /// Select the phase
    pub const fn with_phase(mut self, phase: InitPhase) -> Self {
        self.phase = phase;
        self
    }

    /// Replace the policy
    pub const fn with_policy(mut self, policy: DriverPolicy) -> Self {
        self.policy = policy;
        self
    }
}
