//! Stitches hardware-bounded sleeps into one logical rest.
//!
//! A rest longer than the hardware sleep budget is split into cycles. The persisted tick counts
//! the cycles already started, so a mode that resets the device (deep sleep) picks the rest up
//! again at the next boot via [`SleepScheduler::resume`].

use tracing::{debug, error, info};

use crate::config::PowerMode;
use crate::platform::{Platform, ResetCause, SleepResult};
use crate::state::PersistedState;
use crate::storage::DurableStore;

/// Next move of a multi-cycle rest, given the cycles already consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestStep {
    Complete,
    Sleep { seconds: u64, next_tick: u32 },
}

pub fn next_step(tick: u32, requested_secs: u64, budget_secs: u64) -> RestStep {
    let elapsed = u64::from(tick).saturating_mul(budget_secs);
    if elapsed >= requested_secs {
        RestStep::Complete
    } else {
        RestStep::Sleep {
            seconds: (requested_secs - elapsed).min(budget_secs),
            next_tick: tick.saturating_add(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestOutcome {
    /// Nothing to rest: always-on, a non-positive interval, or no rest in progress.
    Skipped,
    /// The rest ran to completion without a reset.
    Completed,
    /// The device reset mid-rest; the next boot continues it.
    Reset,
}

pub struct SleepScheduler<'a, P, S> {
    platform: &'a mut P,
    state: &'a mut PersistedState<S>,
}

impl<'a, P: Platform, S: DurableStore> SleepScheduler<'a, P, S> {
    pub fn new(platform: &'a mut P, state: &'a mut PersistedState<S>) -> Self {
        Self { platform, state }
    }

    fn budget(&self) -> u64 {
        self.platform.hardware_sleep_budget().max(1)
    }

    /// Drops any rest in progress unless this boot is a wake from sleep.
    pub fn apply_reset_cause(&mut self, cause: ResetCause) {
        if cause.is_sleep_wake() {
            debug!(tick = ?self.state.rest_tick(), "Woke from sleep");
            return;
        }
        info!(?cause, "Not a sleep wake, clearing rest tick");
        if let Err(e) = self.state.clear_rest_tick() {
            error!(error = %e, "Failed to clear rest tick");
        }
    }

    /// Continues a rest interrupted by a reset. Runs once per boot, before connecting.
    pub async fn resume(&mut self, requested_secs: i64, mode: PowerMode) -> RestOutcome {
        let Some(requested) = Self::restable(requested_secs, mode) else {
            return RestOutcome::Skipped;
        };
        if requested <= self.budget() {
            return RestOutcome::Skipped;
        }

        match self.state.rest_tick() {
            None => {
                info!("First run, starting rest accounting");
                self.persist_tick(1);
                RestOutcome::Skipped
            }
            Some(tick) => {
                info!(tick, "Resuming rest");
                self.continue_from(tick, requested, mode).await
            }
        }
    }

    /// Rests for `requested_secs` in `mode`.
    pub async fn request_rest(&mut self, requested_secs: i64, mode: PowerMode) -> RestOutcome {
        let Some(requested) = Self::restable(requested_secs, mode) else {
            return RestOutcome::Skipped;
        };

        let budget = self.budget();
        if requested <= budget {
            return match self.platform.sleep(mode, requested).await {
                SleepResult::Reset => RestOutcome::Reset,
                SleepResult::Resumed => RestOutcome::Completed,
            };
        }

        // The opening cycle of a fresh rest is tick 1.
        self.persist_tick(1);
        info!(requested, budget, "Starting multi-cycle rest");
        match self.platform.sleep(mode, budget).await {
            SleepResult::Reset => RestOutcome::Reset,
            SleepResult::Resumed => self.continue_from(1, requested, mode).await,
        }
    }

    async fn continue_from(&mut self, tick: u32, requested: u64, mode: PowerMode) -> RestOutcome {
        let mut tick = tick;
        loop {
            match next_step(tick, requested, self.budget()) {
                RestStep::Complete => {
                    info!(tick, "Rest complete");
                    self.persist_tick(1);
                    return RestOutcome::Completed;
                }
                RestStep::Sleep { seconds, next_tick } => {
                    info!(tick = next_tick, remaining = seconds, "Remaining sleep time");
                    self.persist_tick(next_tick);
                    if self.platform.sleep(mode, seconds).await == SleepResult::Reset {
                        return RestOutcome::Reset;
                    }
                    tick = next_tick;
                }
            }
        }
    }

    fn restable(requested_secs: i64, mode: PowerMode) -> Option<u64> {
        if mode == PowerMode::AlwaysOn || requested_secs <= 0 {
            None
        } else {
            Some(requested_secs.unsigned_abs())
        }
    }

    fn persist_tick(&mut self, tick: u32) {
        if let Err(e) = self.state.set_rest_tick(tick) {
            error!(error = %e, tick, "Failed to persist rest tick");
        }
    }
}
