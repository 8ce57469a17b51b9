//! Fixed-rate frame loop.
//!
//! Calls the frame closure at `tick_rate` per second, sleeping out the rest of
//! each budget. The loop ends when the closure breaks, fails, or `max_ticks`
//! frames have run.

use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use tracing::{debug, info, warn};

/// Configuration for the frame loop.
#[derive(Debug, Clone)]
pub struct TickConfig {
    /// Target ticks per second.
    pub tick_rate: f64,
    /// Maximum number of ticks to run (0 = unlimited).
    pub max_ticks: u64,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60.0,
            max_ticks: 0,
        }
    }
}

/// Frame loop state.
#[derive(Debug)]
pub struct TickLoop {
    tick_id: u64,
    config: TickConfig,
}

impl TickLoop {
    #[must_use]
    pub fn new(config: TickConfig) -> Self {
        Self { tick_id: 0, config }
    }

    /// Ticks completed so far.
    #[must_use]
    pub fn tick_id(&self) -> u64 {
        self.tick_id
    }

    /// Run `tick` once per frame until it returns [`ControlFlow::Break`],
    /// fails, or the tick limit is reached. Returns the number of ticks run.
    ///
    /// # Errors
    ///
    /// Fails on a non-positive tick rate, otherwise returns the first error
    /// produced by `tick`.
    pub fn run(&mut self, mut tick: impl FnMut(u64) -> Result<ControlFlow<()>>) -> Result<u64> {
        if !self.config.tick_rate.is_finite() || self.config.tick_rate <= 0.0 {
            bail!("tick rate must be positive, got {}", self.config.tick_rate);
        }
        let tick_duration = Duration::from_secs_f64(1.0 / self.config.tick_rate);

        info!(
            tick_rate = self.config.tick_rate,
            max_ticks = self.config.max_ticks,
            "starting tick loop"
        );

        loop {
            let start = Instant::now();

            self.tick_id += 1;
            let flow = tick(self.tick_id)?;

            if flow.is_break() {
                info!(ticks = self.tick_id, "tick loop stopped");
                break;
            }
            if self.config.max_ticks > 0 && self.tick_id >= self.config.max_ticks {
                info!(ticks = self.tick_id, "tick loop complete");
                break;
            }

            let elapsed = start.elapsed();
            if elapsed < tick_duration {
                std::thread::sleep(tick_duration - elapsed);
            } else {
                warn!(
                    tick_id = self.tick_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    budget_ms = tick_duration.as_millis() as u64,
                    "tick exceeded time budget"
                );
            }
            debug!(tick_id = self.tick_id, "tick done");
        }

        Ok(self.tick_id)
    }
}
