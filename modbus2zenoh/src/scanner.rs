//! Register scanner for mapping out an undocumented device.
//!
//! Reads the holding register space in stripes of [`STRIPE_SIZE`] words and
//! reports each stripe whose contents differ from the last time it was seen.
//! A stripe never seen before is compared against all-zero words, so empty
//! space stays quiet. Later passes re-read only stripes that ever reported.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::time::Duration;

use tokio::time::{Instant, timeout};
use tracing::{debug, info};

use crate::definition::RegisterKind;
use crate::detector::PollState;
use crate::transport::{RegisterTransport, TransportError};

/// Words per scanned stripe.
pub const STRIPE_SIZE: u16 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSettings {
    /// First register address of the sweep.
    pub start: u16,
    /// Last register address covered by the sweep (inclusive).
    pub end: u16,
    /// Re-reads of known stripes after the initial sweep.
    pub passes: usize,
    pub read_timeout: Duration,
    /// Pause between two passes.
    pub pass_delay: Duration,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            start: 0x0000,
            end: 0xFFFF,
            passes: 20,
            read_timeout: Duration::from_millis(1000),
            pass_delay: Duration::from_secs(1),
        }
    }
}

/// A stripe whose contents changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripeChange {
    /// Pass the change was seen in; 0 is the initial sweep.
    pub pass: usize,
    pub address: u16,
    pub words: Vec<u16>,
}

impl StripeChange {
    /// Hex and decimal rendering; zero words are left blank.
    pub fn render(&self) -> String {
        let mut hex = format!("{:04x}:", self.address);
        let mut dec = format!("{:04x}:", self.address);
        for word in &self.words {
            if *word == 0 {
                hex.push_str("   -  ");
                dec.push_str("      ");
            } else {
                let _ = write!(hex, " {:04x} ", word);
                let _ = write!(dec, " {:05}", word);
            }
        }
        format!("{}\n{}", hex.trim_end(), dec.trim_end())
    }
}

/// Summary of a finished scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub changes: Vec<StripeChange>,
    /// Stripes the device refused or failed to return.
    pub failed_reads: usize,
}

impl ScanReport {
    /// Addresses of every stripe that reported at least once.
    pub fn active_stripes(&self) -> BTreeSet<u16> {
        self.changes.iter().map(|c| c.address).collect()
    }
}

pub struct RegisterScanner<T> {
    device: String,
    transport: T,
    settings: ScanSettings,
    stripes: BTreeMap<u16, PollState>,
    known: BTreeSet<u16>,
}

impl<T: RegisterTransport> RegisterScanner<T> {
    pub fn new(device: impl Into<String>, transport: T, settings: ScanSettings) -> Self {
        Self {
            device: device.into(),
            transport,
            settings,
            stripes: BTreeMap::new(),
            known: BTreeSet::new(),
        }
    }

    /// Sweep the configured range, then re-read known stripes `passes` times.
    pub async fn run(&mut self) -> ScanReport {
        let mut report = ScanReport::default();

        info!(
            device = %self.device,
            start = self.settings.start,
            end = self.settings.end,
            "Sweeping holding registers"
        );
        let addresses: Vec<u16> = (u32::from(self.settings.start)..=u32::from(self.settings.end))
            .step_by(usize::from(STRIPE_SIZE))
            .filter_map(|a| u16::try_from(a).ok())
            .collect();
        self.pass(0, &addresses, &mut report).await;

        for pass in 1..=self.settings.passes {
            tokio::time::sleep(self.settings.pass_delay).await;
            let known: Vec<u16> = self.known.iter().copied().collect();
            debug!(device = %self.device, pass, stripes = known.len(), "Re-reading known stripes");
            self.pass(pass, &known, &mut report).await;
        }

        report
    }

    async fn pass(&mut self, pass: usize, addresses: &[u16], report: &mut ScanReport) {
        for &address in addresses {
            match self.read_stripe(pass, address).await {
                Ok(Some(change)) => {
                    info!(
                        device = %self.device,
                        address = change.address,
                        pass,
                        "Stripe changed\n{}",
                        change.render()
                    );
                    report.changes.push(change);
                }
                Ok(None) => {}
                Err(e) => {
                    report.failed_reads += 1;
                    debug!(device = %self.device, address, "Stripe read failed: {}", e);
                }
            }
        }
    }

    async fn read_stripe(
        &mut self,
        pass: usize,
        address: u16,
    ) -> Result<Option<StripeChange>, TransportError> {
        // the final stripe may be cut short by the end of the address space
        let count = (0x1_0000 - u32::from(address)).min(u32::from(STRIPE_SIZE)) as u16;
        let words = timeout(
            self.settings.read_timeout,
            self.transport
                .read_registers(address, count, RegisterKind::Holding),
        )
        .await
        .unwrap_or(Err(TransportError::Timeout))?;

        let state = self
            .stripes
            .entry(address)
            .or_insert_with(|| PollState::with_last_words(vec![0; usize::from(count)]));
        if !state.observe(&words, Instant::now()) {
            return Ok(None);
        }

        self.known.insert(address);
        Ok(Some(StripeChange {
            pass,
            address,
            words,
        }))
    }
}
