//! SD memory card identification

use crate::card::{OCR_BUSY, OCR_HCS, OCR_S18, OCR_VOLTAGE_WINDOW};
use crate::emmc::{OCR_POLL_ATTEMPTS, OCR_POLL_INTERVAL_US};
use crate::error::{SdError, SdResult};
use crate::host::SdHost;
use crate::Platform;

/// SEND_IF_COND attempts
pub const IF_COND_ATTEMPTS: usize = 3;

/// Delay between SEND_IF_COND attempts (1 ms)
pub const IF_COND_RETRY_US: u64 = 1_000;

impl<'a, P: Platform> SdHost<'a, P> {
    /// CMD0, voltage check and the first ACMD41 inquiry
    pub fn sd_early_init(&mut self) -> SdResult<()> {
        self.go_idle()?;

        let mut attempt = 0;
        loop {
            match self.send_if_cond() {
                Ok(()) => break,
                Err(err) if attempt + 1 >= IF_COND_ATTEMPTS => {
                    log::error!("SD: voltage check failed: {}", err);
                    return Err(err);
                }
                Err(_) => {
                    attempt += 1;
                    self.stall(IF_COND_RETRY_US);
                }
            }
        }

        let ocr = self.sd_send_op_cond(0)?;
        self.state.slot.identity.ocr = ocr;
        log::debug!("SD: OCR {:#010x}", ocr);
        Ok(())
    }

    /// Identification, bus negotiation and capacity
    pub fn sd_late_init(&mut self) -> SdResult<()> {
        let capability = self.state.capability;
        let s18r = self.state.policy.sd_uhs && capability.uhs();
        let mut argument = (self.state.slot.identity.ocr & OCR_VOLTAGE_WINDOW) | OCR_HCS;
        if s18r {
            argument |= OCR_S18;
        }

        let mut ready = None;
        for _ in 0..OCR_POLL_ATTEMPTS {
            let ocr = self.sd_send_op_cond(argument)?;
            if ocr & OCR_BUSY != 0 {
                ready = Some(ocr);
                break;
            }
            self.stall(OCR_POLL_INTERVAL_US);
        }
        let Some(ocr) = ready else {
            log::error!("SD: card never left the busy state");
            return Err(SdError::Timeout);
        };
        self.state.slot.identity.ocr = ocr;

        if s18r && ocr & OCR_S18 != 0 {
            self.voltage_switch()?;
            self.switch_to_1v8_signaling()?;
            self.state.slot.s18a = true;
            log::debug!("SD: switched to 1.8V signalling");
        }

        let cid = self.all_send_cid()?;
        self.state.slot.identity.cid = cid;
        let rca = self.sd_send_rca()?;
        self.state.slot.identity.rca = rca;
        let csd = self.send_csd(rca)?;
        self.state.slot.identity.csd = csd;
        self.select_card(rca)?;
        log::info!(
            "SD: MID {:#04x} PNM {:?} PSN {:#010x} RCA {:#06x}",
            cid.manufacturer_id(),
            core::str::from_utf8(&cid.sd_product_name()).unwrap_or("?"),
            cid.sd_serial(),
            rca
        );
        log::debug!(
            "SD: CSD structure {} TRAN_SPEED {:#04x} CCC {:#05x}",
            csd.structure(),
            csd.tran_speed(),
            csd.ccc()
        );

        self.negotiate_sd_bus()?;
        self.commit_capacity()
    }
}
