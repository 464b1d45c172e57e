//! eMMC identification

use crate::card::{OCR_BUSY, OCR_HCS};
use crate::error::{SdError, SdResult};
use crate::host::SdHost;
use crate::Platform;

/// Operating condition polls before giving up
pub const OCR_POLL_ATTEMPTS: usize = 100;

/// Delay between operating condition polls (10 ms)
pub const OCR_POLL_INTERVAL_US: u64 = 10_000;

/// Host-assigned relative address (slot 0 + 1)
pub const EMMC_RCA: u16 = 1;

impl<'a, P: Platform> SdHost<'a, P> {
    /// CMD0 and the first operating condition inquiry
    pub fn emmc_early_init(&mut self) -> SdResult<()> {
        self.go_idle()?;
        let ocr = self.mmc_send_op_cond(0)?;
        self.state.slot.identity.ocr = ocr;
        log::debug!("eMMC: OCR {:#010x}", ocr);
        Ok(())
    }

    /// Identification, bus negotiation and capacity
    pub fn emmc_late_init(&mut self) -> SdResult<()> {
        let argument = (self.state.slot.identity.ocr & !OCR_BUSY) | OCR_HCS;
        let mut ready = None;
        for _ in 0..OCR_POLL_ATTEMPTS {
            let ocr = self.mmc_send_op_cond(argument)?;
            if ocr & OCR_BUSY != 0 {
                ready = Some(ocr);
                break;
            }
            self.stall(OCR_POLL_INTERVAL_US);
        }
        let Some(ocr) = ready else {
            log::error!("eMMC: device never left the busy state");
            return Err(SdError::Timeout);
        };
        self.state.slot.identity.ocr = ocr;

        let cid = self.all_send_cid()?;
        self.state.slot.identity.cid = cid;
        self.mmc_set_rca(EMMC_RCA)?;
        self.state.slot.identity.rca = EMMC_RCA;
        self.state.slot.identity.csd = self.send_csd(EMMC_RCA)?;
        self.select_card(EMMC_RCA)?;
        log::info!(
            "eMMC: MID {:#04x} PNM {:?} serial {:#010x}",
            cid.manufacturer_id(),
            core::str::from_utf8(&cid.mmc_product_name()).unwrap_or("?"),
            cid.mmc_serial()
        );

        let ext_csd = self.send_ext_csd()?;
        self.state.slot.identity.ext_csd = ext_csd;
        self.state.active_partition = ext_csd.partition_config() & 0x07;

        self.negotiate_emmc_bus()?;
        self.commit_capacity()
    }
}
