//! The randomized countdown ticker driving elections and heartbeats.

use rand::Rng;

use crate::config::Config;

/// A countdown of ticks until the node acts on the absence of a leader.
///
/// Non-leaders reset to a uniform draw from `[tick_min, tick_max]`; the
/// randomization is what breaks election ties. Leaders reset to
/// `max(1, tick_min - 1)`, one tick short of the fastest possible follower
/// timeout, so heartbeats always precede it.
///
/// Expiry on a follower or candidate starts an election; on a leader it
/// triggers a round of heartbeats.
pub(crate) struct Ticker {
    leader_timeout: u64,
    tick_min: u64,
    tick_max: u64,
}

impl Ticker {
    pub(crate) fn new(config: &Config) -> Self {
        let mut ticker = Self {
            leader_timeout: 0,
            tick_min: config.tick_min,
            tick_max: config.tick_max,
        };
        ticker.reset();
        ticker
    }

    /// Count down one tick; true when the timer has expired.
    pub(crate) fn tick(&mut self) -> bool {
        self.leader_timeout = self.leader_timeout.saturating_sub(1);
        self.leader_timeout == 0
    }

    /// Reset for a non-leader.
    pub(crate) fn reset(&mut self) {
        self.leader_timeout = rand::thread_rng().gen_range(self.tick_min..=self.tick_max);
    }

    /// Reset for a leader.
    pub(crate) fn reset_leader(&mut self) {
        self.leader_timeout = std::cmp::max(1, self.tick_min - 1);
    }

    #[cfg(test)]
    fn remaining(&self) -> u64 {
        self.leader_timeout
    }
}
