//! One-time settlement of a round: bonuses, ranking and the canonical snapshot.
//!
//! Runs on the authority only. Every other peer receives the resulting
//! [`RankingSnapshot`] and replaces its replicated state with it.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::RoundError,
    state::round::{MapType, PlayerId},
};

/// Score bookkeeping for a single player, cumulative across the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerScoreRecord {
    /// Stable player identifier.
    pub id: PlayerId,
    /// Cumulative score; only ever increases.
    pub score: u32,
    /// Whether the player was still tracked (connected) at settlement.
    pub alive: bool,
    /// One-based position in the latest ranking.
    pub rank: Option<u32>,
}

impl PlayerScoreRecord {
    /// Fresh record with no score.
    pub fn new(id: PlayerId) -> Self {
        Self {
            id,
            score: 0,
            alive: true,
            rank: None,
        }
    }
}

/// Score records keyed by player, in first-seen order.
pub type ScoreMap = IndexMap<PlayerId, PlayerScoreRecord>;

/// The authoritative round outcome broadcast to every peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingSnapshot {
    /// Zero-based round the snapshot settles.
    pub round: u32,
    /// Every known player's cumulative record.
    pub scores: ScoreMap,
    /// Player ids by descending cumulative score.
    pub ranking: Vec<PlayerId>,
    /// Finish order of the settled round (empty once settlement consumed it).
    pub finish_order: Vec<PlayerId>,
}

impl RankingSnapshot {
    /// Snapshot with no players, used before the first settlement.
    pub fn empty() -> Self {
        Self {
            round: 0,
            scores: ScoreMap::new(),
            ranking: Vec::new(),
            finish_order: Vec::new(),
        }
    }

    /// Serialize into the wire payload.
    pub fn encode(&self) -> Result<String, RoundError> {
        serde_json::to_string(self).map_err(RoundError::Encode)
    }

    /// Score of `player`, if known.
    pub fn score_of(&self, player: PlayerId) -> Option<u32> {
        self.scores.get(&player).map(|record| record.score)
    }
}

/// Bonus amounts handed out at settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardTable {
    /// Flat bonus for every recorded survivor on non-elimination maps.
    pub survivor_bonus: u32,
    /// Tiered bonuses for the first finishers on ranked maps; its length is the
    /// number of ranks that earn a bonus.
    pub rank_bonuses: Vec<u32>,
    /// Flat bonus for every player that failed to clear the stage.
    pub consolation_bonus: u32,
}

impl Default for RewardTable {
    fn default() -> Self {
        Self {
            survivor_bonus: 2500,
            rank_bonuses: vec![5000, 2000, 500],
            consolation_bonus: 100,
        }
    }
}

/// What to do when the round results name a player without a score record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownPlayerPolicy {
    /// Log the reference and carry on without it.
    #[default]
    Skip,
    /// Refuse to settle.
    Reject,
}

/// Everything settlement reads. Nothing here is mutated.
#[derive(Debug, Clone, Copy)]
pub struct SettlementInput<'a> {
    /// Round being settled.
    pub round: u32,
    /// Map type of the round.
    pub map_type: MapType,
    /// Cumulative scores before this round (the replicated store's contents).
    pub prior: &'a ScoreMap,
    /// Players still tracked by the room.
    pub tracked: &'a IndexSet<PlayerId>,
    /// Finish order (or survivors) of the round.
    pub finish_order: &'a [PlayerId],
    /// Players that failed to clear the stage.
    pub failed: &'a [PlayerId],
}

/// Result of a settlement run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    /// Canonical snapshot to broadcast.
    pub snapshot: RankingSnapshot,
    /// Bonuses awarded, in award order.
    pub awards: Vec<(PlayerId, u32)>,
    /// References that were skipped under [`UnknownPlayerPolicy::Skip`].
    pub skipped: Vec<PlayerId>,
}

/// Computes final scores and the ranking for a round.
#[derive(Debug, Clone)]
pub struct SettlementEngine {
    rewards: RewardTable,
    policy: UnknownPlayerPolicy,
}

impl SettlementEngine {
    /// Engine using `rewards`, handling unknown references per `policy`.
    pub fn new(rewards: RewardTable, policy: UnknownPlayerPolicy) -> Self {
        Self { rewards, policy }
    }

    /// Settle a round.
    pub fn settle(&self, input: SettlementInput<'_>) -> Result<Settlement, RoundError> {
        let mut scores = input.prior.clone();
        for record in scores.values_mut() {
            record.alive = input.tracked.contains(&record.id);
        }
        for player in input.tracked {
            scores
                .entry(*player)
                .or_insert_with(|| PlayerScoreRecord::new(*player));
        }

        let mut awards = Vec::new();
        let mut skipped = Vec::new();

        if input.map_type.is_ranked() {
            for (player, bonus) in input.finish_order.iter().zip(&self.rewards.rank_bonuses) {
                self.award(&mut scores, *player, *bonus, &mut awards, &mut skipped)?;
            }
        } else {
            for player in input.finish_order {
                self.award(
                    &mut scores,
                    *player,
                    self.rewards.survivor_bonus,
                    &mut awards,
                    &mut skipped,
                )?;
            }
        }

        for player in input.failed {
            self.award(
                &mut scores,
                *player,
                self.rewards.consolation_bonus,
                &mut awards,
                &mut skipped,
            )?;
        }

        let ranking = rank_players(&mut scores);
        debug!(round = input.round, ?ranking, "ranking recomputed");

        Ok(Settlement {
            snapshot: RankingSnapshot {
                round: input.round,
                scores,
                ranking,
                finish_order: Vec::new(),
            },
            awards,
            skipped,
        })
    }

    fn award(
        &self,
        scores: &mut ScoreMap,
        player: PlayerId,
        bonus: u32,
        awards: &mut Vec<(PlayerId, u32)>,
        skipped: &mut Vec<PlayerId>,
    ) -> Result<(), RoundError> {
        match scores.get_mut(&player) {
            Some(record) => {
                record.score = record.score.saturating_add(bonus);
                awards.push((player, bonus));
                Ok(())
            }
            None => match self.policy {
                UnknownPlayerPolicy::Skip => {
                    warn!(%player, bonus, "skipping bonus for player without a score record");
                    skipped.push(player);
                    Ok(())
                }
                UnknownPlayerPolicy::Reject => Err(RoundError::UnknownPlayerReference { player }),
            },
        }
    }
}

/// Order players by descending score, keeping map order for ties, and write
/// each player's one-based rank back into its record.
pub fn rank_players(scores: &mut ScoreMap) -> Vec<PlayerId> {
    let mut ordered: Vec<(PlayerId, u32)> = scores
        .values()
        .map(|record| (record.id, record.score))
        .collect();
    ordered.sort_by(|a, b| b.1.cmp(&a.1));

    let ranking: Vec<PlayerId> = ordered.into_iter().map(|(id, _)| id).collect();
    for (index, player) in ranking.iter().enumerate() {
        if let Some(record) = scores.get_mut(player) {
            record.rank = Some(index as u32 + 1);
        }
    }
    ranking
}
