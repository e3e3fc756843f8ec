//! Adaptive interrupt moderation.
//!
//! Each poll adds to a load score (two points per receive completion, one
//! per transmit completion event). Every [`EVAL_INTERVAL`] completed polls
//! the score is compared against a low and a high threshold and the
//! moderation delay moves one step down or up, within the configured floor
//! and ceiling.

use crate::config::ModerationConfig;

/// Completed polls between adjustments.
pub(crate) const EVAL_INTERVAL: u32 = 1000;

const RX_SCORE: u32 = 2;
const TX_SCORE: u32 = 1;

#[derive(Debug, Clone)]
pub(crate) struct IrqModeration {
    adaptive: bool,
    usecs: u32,
    ceiling: u32,
    floor: u32,
    step: u32,
    low: u32,
    high: u32,
    score: u32,
    polls: u32,
}

impl IrqModeration {
    /// Controller for a channel whose initial delay is `usecs`.
    pub(crate) fn new(cfg: &ModerationConfig, usecs: u32) -> Self {
        IrqModeration {
            adaptive: cfg.adaptive,
            usecs,
            ceiling: cfg.rx_usecs,
            floor: cfg.floor_usecs.min(cfg.rx_usecs),
            step: cfg.step_usecs.max(1),
            low: cfg.low_thresh,
            high: cfg.high_thresh,
            score: 0,
            polls: 0,
        }
    }

    #[inline]
    pub(crate) fn usecs(&self) -> u32 {
        self.usecs
    }

    #[inline]
    pub(crate) fn on_rx(&mut self, n: u32) {
        self.score = self.score.saturating_add(n * RX_SCORE);
    }

    #[inline]
    pub(crate) fn on_tx(&mut self, n: u32) {
        self.score = self.score.saturating_add(n * TX_SCORE);
    }

    /// Account one completed poll. Returns the new delay when it changed.
    pub(crate) fn end_poll(&mut self) -> Option<u32> {
        if !self.adaptive {
            return None;
        }
        self.polls += 1;
        if self.polls < EVAL_INTERVAL {
            return None;
        }
        let score = std::mem::take(&mut self.score);
        self.polls = 0;
        let old = self.usecs;
        if score < self.low && self.usecs > self.floor {
            self.usecs = self.usecs.saturating_sub(self.step).max(self.floor);
        } else if score > self.high && self.usecs < self.ceiling {
            self.usecs = (self.usecs + self.step).min(self.ceiling);
        }
        (self.usecs != old).then_some(self.usecs)
    }

    /// Set a new delay and ceiling, as from an explicit moderation request.
    pub(crate) fn set(&mut self, usecs: u32, adaptive: bool) {
        self.usecs = usecs;
        self.ceiling = usecs.max(self.floor);
        self.adaptive = adaptive;
        self.score = 0;
        self.polls = 0;
    }
}
