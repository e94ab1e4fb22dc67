//! Per-device polling loop.
//!
//! A [`DevicePoller`] owns one transport and the [`PollState`] of every
//! polled definition on its device. Reads are issued one at a time, each
//! definition on its own interval, earliest due first.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, error, info, warn};

use crate::definition::{Definition, MAX_INTERVAL};
use crate::detector::{BitFieldTrigger, PollPhase, PollState, detect_changes};
use crate::emitter::{Emission, EmissionSender};
use crate::transport::{RegisterTransport, TransportError};

/// Knobs for one device loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerSettings {
    /// Upper bound for a single read.
    pub read_timeout: Duration,
    /// Extra intervals skipped after a failed read.
    pub backoff_intervals: u32,
    pub bit_field_trigger: BitFieldTrigger,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(1000),
            backoff_intervals: 1,
            bit_field_trigger: BitFieldTrigger::default(),
        }
    }
}

/// Result of one read transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Unchanged,
    Changed { emissions: Vec<Emission> },
    Failed(TransportError),
}

struct Slot {
    definition: Arc<Definition>,
    state: PollState,
}

pub struct DevicePoller<T> {
    device: String,
    transport: T,
    slots: Vec<Slot>,
    schedule: BinaryHeap<Reverse<(Instant, usize)>>,
    settings: PollerSettings,
}

impl<T: RegisterTransport> DevicePoller<T> {
    /// Create a poller; every definition is due immediately, in order.
    pub fn new(
        device: impl Into<String>,
        transport: T,
        definitions: Vec<Arc<Definition>>,
        settings: PollerSettings,
    ) -> Self {
        let now = Instant::now();
        let slots: Vec<Slot> = definitions
            .into_iter()
            .map(|definition| Slot {
                state: PollState::for_definition(&definition),
                definition,
            })
            .collect();
        let schedule = (0..slots.len()).map(|index| Reverse((now, index))).collect();

        Self {
            device: device.into(),
            transport,
            slots,
            schedule,
            settings,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// When the next read is due, if anything is scheduled.
    pub fn next_due(&self) -> Option<Instant> {
        self.schedule.peek().map(|Reverse((due, _))| *due)
    }

    /// State of the `index`-th definition.
    pub fn state(&self, index: usize) -> Option<&PollState> {
        self.slots.get(index).map(|slot| &slot.state)
    }

    /// Wait for the earliest due definition, read it and reschedule it.
    ///
    /// Returns `None` when nothing is scheduled.
    pub async fn poll_next(&mut self) -> Option<(Arc<Definition>, PollOutcome)> {
        let Reverse((due, index)) = self.schedule.pop()?;
        let slot = &mut self.slots[index];
        slot.state.phase = PollPhase::Due;
        let definition = slot.definition.clone();

        sleep_until(due).await;
        let outcome = self.read(index).await;
        Some((definition, outcome))
    }

    async fn read(&mut self, index: usize) -> PollOutcome {
        let slot = &mut self.slots[index];
        let definition = &slot.definition;
        slot.state.phase = PollPhase::Reading;

        let expected = definition.word_count();
        let result = timeout(
            self.settings.read_timeout,
            self.transport
                .read_registers(definition.address, expected, definition.register_kind),
        )
        .await
        .unwrap_or(Err(TransportError::Timeout))
        .and_then(|words| {
            if words.len() == usize::from(expected) {
                Ok(words)
            } else {
                Err(TransportError::Malformed {
                    expected: usize::from(expected),
                    actual: words.len(),
                })
            }
        });

        let now = Instant::now();
        let words = match result {
            Ok(words) => words,
            Err(e) => {
                slot.state.phase = PollPhase::Backoff;
                slot.state.consecutive_failures += 1;
                let retry = definition
                    .interval
                    .saturating_mul(self.settings.backoff_intervals.saturating_add(1))
                    .min(MAX_INTERVAL.max(definition.interval));
                warn!(
                    device = %self.device,
                    address = definition.address,
                    kind = %definition.register_kind,
                    failures = slot.state.consecutive_failures,
                    retry_in = ?retry,
                    "Read failed: {}",
                    e
                );
                self.schedule.push(Reverse((due_after(now, retry), index)));
                return PollOutcome::Failed(e);
            }
        };

        slot.state.phase = PollPhase::Idle;
        slot.state.consecutive_failures = 0;
        self.schedule
            .push(Reverse((due_after(now, definition.interval), index)));

        if !slot.state.observe(&words, now) {
            return PollOutcome::Unchanged;
        }

        let timestamp = chrono::Utc::now().timestamp_millis();
        match detect_changes(
            definition,
            &mut slot.state,
            &words,
            self.settings.bit_field_trigger,
            timestamp,
        ) {
            Ok(emissions) => PollOutcome::Changed { emissions },
            Err(e) => {
                error!(
                    device = %self.device,
                    address = definition.address,
                    topic = %definition.topic,
                    "Decode failed on a validated definition: {}",
                    e
                );
                PollOutcome::Changed {
                    emissions: Vec::new(),
                }
            }
        }
    }

    /// Poll until `shutdown` is raised or its sender is dropped.
    ///
    /// A read in flight is allowed to finish; idle waits end at once.
    pub async fn run(mut self, emissions: EmissionSender, mut shutdown: watch::Receiver<bool>) {
        info!(
            device = %self.device,
            definitions = self.slots.len(),
            "Starting device poller"
        );

        let mut reads = 0usize;
        let mut changes = 0usize;
        let mut failures = 0usize;

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            let Some(due) = self.next_due() else {
                debug!(device = %self.device, "Nothing to poll");
                let _ = shutdown.wait_for(|stop| *stop).await;
                break;
            };

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = sleep_until(due) => {}
            }

            let Some((definition, outcome)) = self.poll_next().await else {
                continue;
            };
            reads += 1;

            match outcome {
                PollOutcome::Unchanged => {}
                PollOutcome::Changed { emissions: batch } => {
                    changes += 1;
                    debug!(
                        device = %self.device,
                        address = definition.address,
                        emissions = batch.len(),
                        "Value changed"
                    );
                    for emission in batch {
                        if emissions.send(emission).is_err() {
                            warn!(device = %self.device, "Emitter stopped, ending poller");
                            return;
                        }
                    }
                }
                PollOutcome::Failed(_) => failures += 1,
            }
        }

        info!(
            device = %self.device,
            reads,
            changes,
            failures,
            "Device poller stopped"
        );
    }
}

/// `now + delay`, or [`MAX_INTERVAL`] from now if that overflows.
fn due_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(MAX_INTERVAL))
        .unwrap_or(now)
}
