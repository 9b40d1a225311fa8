//! Idle Strategies
//!
//! What a hot loop does when an attempt made no progress: retry after
//! back-pressure on the publish side, an empty poll on the subscribe side.
//! None of the strategies sleep or park the thread.

use std::fmt;
use std::str::FromStr;

/// Default spin budget before a backoff strategy starts yielding.
pub const DEFAULT_MAX_SPINS: u32 = 10;

/// Default yield budget of a backoff strategy.
pub const DEFAULT_MAX_YIELDS: u32 = 5;

/// Spin-then-yield backoff state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffIdle {
    max_spins: u32,
    max_yields: u32,
    spins: u32,
    yields: u32,
}

impl BackoffIdle {
    /// Create a backoff with the given spin and yield budgets.
    #[must_use]
    pub const fn new(max_spins: u32, max_yields: u32) -> Self {
        Self {
            max_spins,
            max_yields,
            spins: 0,
            yields: 0,
        }
    }

    fn step(&mut self) {
        if self.spins < self.max_spins {
            self.spins += 1;
            std::hint::spin_loop();
        } else {
            // Past the yield budget we keep yielding rather than park.
            self.yields = self.yields.saturating_add(1).min(self.max_yields);
            std::thread::yield_now();
        }
    }

    const fn reset(&mut self) {
        self.spins = 0;
        self.yields = 0;
    }

    /// Spins performed since the last reset.
    #[must_use]
    pub const fn spins(&self) -> u32 {
        self.spins
    }

    /// Yields performed since the last reset, capped at the budget.
    #[must_use]
    pub const fn yields(&self) -> u32 {
        self.yields
    }
}

impl Default for BackoffIdle {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SPINS, DEFAULT_MAX_YIELDS)
    }
}

/// Idle behaviour between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdleStrategy {
    /// One `spin_loop` hint per step.
    #[default]
    BusySpin,
    /// Spin up to a budget, then yield the thread.
    Backoff(BackoffIdle),
    /// Return immediately.
    Noop,
}

impl IdleStrategy {
    /// Backoff with the default budgets.
    #[must_use]
    pub fn backoff() -> Self {
        Self::Backoff(BackoffIdle::default())
    }

    /// Perform one idle step unconditionally.
    pub fn idle(&mut self) {
        match self {
            Self::BusySpin => std::hint::spin_loop(),
            Self::Backoff(state) => state.step(),
            Self::Noop => {}
        }
    }

    /// Idle according to how much work the last iteration did.
    ///
    /// Any work resets the backoff and returns without idling.
    pub fn idle_for(&mut self, work_count: usize) {
        if work_count > 0 {
            self.reset();
            return;
        }
        self.idle();
    }

    /// Clear accumulated backoff state.
    pub const fn reset(&mut self) {
        if let Self::Backoff(state) = self {
            state.reset();
        }
    }

    /// Name used on the command line.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::BusySpin => "busy-spin",
            Self::Backoff(_) => "backoff",
            Self::Noop => "noop",
        }
    }
}

impl fmt::Display for IdleStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognised idle strategy name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown idle strategy '{0}' (expected busy-spin, backoff or noop)")]
pub struct UnknownIdleStrategy(String);

impl FromStr for IdleStrategy {
    type Err = UnknownIdleStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "busy-spin" | "busyspin" | "spin" => Ok(Self::BusySpin),
            "backoff" => Ok(Self::backoff()),
            "noop" | "none" => Ok(Self::Noop),
            other => Err(UnknownIdleStrategy(other.to_string())),
        }
    }
}
