//! Round-scoped results reported by gameplay: who finished, in which order,
//! who failed to clear the stage, and point totals on collection maps.
//!
//! Only the authority's tally feeds settlement. Replicas keep a mirror of the
//! finish order purely for display.

use indexmap::{IndexMap, IndexSet};

use crate::state::round::PlayerId;

/// What recording a finish means for the round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TallyOutcome {
    /// The entry was recorded at this one-based finish position.
    Recorded(usize),
    /// Recorded, and the finish list is now full (or everybody finished).
    RoundComplete(usize),
    /// The player had already finished; nothing changed.
    Duplicate,
}

/// Transient per-round results. Cleared once settlement has consumed them.
#[derive(Debug, Clone, Default)]
pub struct RoundTally {
    finish_order: IndexSet<PlayerId>,
    failed: IndexSet<PlayerId>,
    points: IndexMap<PlayerId, u32>,
}

impl RoundTally {
    /// Empty tally.
    pub fn new() -> Self {
        Self::default()
    }

    /// Players in the order they finished.
    pub fn finish_order(&self) -> Vec<PlayerId> {
        self.finish_order.iter().copied().collect()
    }

    /// Players that failed to clear the stage, in report order.
    pub fn failed(&self) -> Vec<PlayerId> {
        self.failed.iter().copied().collect()
    }

    /// Points collected so far by `player`.
    pub fn points(&self, player: PlayerId) -> u32 {
        self.points.get(&player).copied().unwrap_or(0)
    }

    /// Append `player` to the finish order.
    ///
    /// `max_finishers` caps the finish list and `tracked_players` is the number
    /// of players still in the round; reaching either completes the round.
    pub fn record_finish(
        &mut self,
        player: PlayerId,
        max_finishers: usize,
        tracked_players: usize,
    ) -> TallyOutcome {
        if !self.finish_order.insert(player) {
            return TallyOutcome::Duplicate;
        }
        self.failed.shift_remove(&player);
        let position = self.finish_order.len();
        if position >= max_finishers || position >= tracked_players {
            TallyOutcome::RoundComplete(position)
        } else {
            TallyOutcome::Recorded(position)
        }
    }

    /// Record a survivor on a non-elimination map. Survivors are ordered like finishers.
    pub fn record_survivor(&mut self, player: PlayerId) -> bool {
        let inserted = self.finish_order.insert(player);
        if inserted {
            self.failed.shift_remove(&player);
        }
        inserted
    }

    /// Mark `player` as having failed to clear the stage. Finishers are never demoted.
    pub fn record_failure(&mut self, player: PlayerId) -> bool {
        if self.finish_order.contains(&player) {
            return false;
        }
        self.failed.insert(player)
    }

    /// Mirror a finish that the authority already accepted (replica display only).
    pub fn mirror_finish(&mut self, player: PlayerId) {
        self.finish_order.insert(player);
    }

    /// Add collected points for `player`; returns the new total.
    pub fn add_points(&mut self, player: PlayerId, amount: u32) -> u32 {
        let total = self.points.entry(player).or_insert(0);
        *total = total.saturating_add(amount);
        *total
    }

    /// Turn point totals into a finish order on collection maps.
    ///
    /// The top `max_finishers` by points (ties keep first-scored order) become
    /// finishers; everyone else with a total lands in the failed set.
    pub fn resolve_points(&mut self, max_finishers: usize) {
        if self.points.is_empty() {
            return;
        }
        let mut ranked: Vec<(PlayerId, u32)> =
            self.points.iter().map(|(id, points)| (*id, *points)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));

        for (index, (player, _)) in ranked.into_iter().enumerate() {
            if index < max_finishers {
                self.finish_order.insert(player);
                self.failed.shift_remove(&player);
            } else if !self.finish_order.contains(&player) {
                self.failed.insert(player);
            }
        }
        self.points.clear();
    }

    /// Drop everything so nothing leaks into the next round.
    pub fn clear(&mut self) {
        self.finish_order.clear();
        self.failed.clear();
        self.points.clear();
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.finish_order.is_empty() && self.failed.is_empty() && self.points.is_empty()
    }
}
