//! Replicated round outcome. The only way in is a whole snapshot.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::state::{
    round::PlayerId,
    settlement::{PlayerScoreRecord, RankingSnapshot, ScoreMap},
};

/// Reasons a snapshot payload was refused.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// The payload is not a valid snapshot document.
    #[error("malformed snapshot payload")]
    Malformed(#[source] serde_json::Error),
    /// The payload decoded but references players it does not score.
    #[error("snapshot lists {player} without a score record")]
    Inconsistent {
        /// Player missing from the score map.
        player: PlayerId,
    },
    /// A previous payload failed and the store is waiting for a resync.
    #[error("store is waiting for a resync")]
    NeedsResync,
}

/// Effect of applying a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The store contents were replaced.
    Applied,
    /// The payload matched what the store already held.
    Unchanged,
}

/// Holds the score map, ranking and finish order mirrored from the authority.
#[derive(Debug, Clone)]
pub struct StateReplicationStore {
    snapshot: RankingSnapshot,
    applied: usize,
    needs_resync: bool,
}

impl Default for StateReplicationStore {
    fn default() -> Self {
        Self {
            snapshot: RankingSnapshot::empty(),
            applied: 0,
            needs_resync: false,
        }
    }
}

impl StateReplicationStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `payload` and replace the contents wholesale.
    ///
    /// Decoding and validation complete before anything is touched, so a bad
    /// payload leaves the previous contents intact and flags the store for a
    /// resync. A valid payload always clears that flag.
    pub fn apply_snapshot(&mut self, payload: &str) -> Result<ApplyOutcome, ReplicationError> {
        let decoded = match decode(payload) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(error = %err, "snapshot rejected; resync required");
                self.needs_resync = true;
                return Err(err);
            }
        };
        self.needs_resync = false;

        if self.applied > 0 && decoded == self.snapshot {
            debug!(round = decoded.round, "snapshot already applied");
            return Ok(ApplyOutcome::Unchanged);
        }

        info!(
            round = decoded.round,
            players = decoded.scores.len(),
            ranking = ?decoded.ranking,
            "snapshot applied"
        );
        self.snapshot = decoded;
        self.applied += 1;
        Ok(ApplyOutcome::Applied)
    }

    /// Refuse work that depends on the replicated state while a resync is pending.
    pub fn ensure_consistent(&self) -> Result<(), ReplicationError> {
        if self.needs_resync {
            Err(ReplicationError::NeedsResync)
        } else {
            Ok(())
        }
    }

    /// Whether the last payload failed to apply.
    pub fn needs_resync(&self) -> bool {
        self.needs_resync
    }

    /// Number of distinct snapshots applied.
    pub fn applied_count(&self) -> usize {
        self.applied
    }

    /// Cumulative score records.
    pub fn scores(&self) -> &ScoreMap {
        &self.snapshot.scores
    }

    /// Record for `player`.
    pub fn score(&self, player: PlayerId) -> Option<&PlayerScoreRecord> {
        self.snapshot.scores.get(&player)
    }

    /// Player ids by descending score.
    pub fn ranking(&self) -> &[PlayerId] {
        &self.snapshot.ranking
    }

    /// Finish order carried by the last snapshot.
    pub fn finish_order(&self) -> &[PlayerId] {
        &self.snapshot.finish_order
    }

    /// The full replicated snapshot.
    pub fn ranking_snapshot(&self) -> &RankingSnapshot {
        &self.snapshot
    }

    /// Canonical serialization of the current contents.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.snapshot)
    }
}

fn decode(payload: &str) -> Result<RankingSnapshot, ReplicationError> {
    let snapshot: RankingSnapshot =
        serde_json::from_str(payload).map_err(ReplicationError::Malformed)?;

    let dangling = snapshot
        .ranking
        .iter()
        .chain(&snapshot.finish_order)
        .find(|player| !snapshot.scores.contains_key(*player));
    if let Some(player) = dangling {
        return Err(ReplicationError::Inconsistent { player: *player });
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::round::PeerId;

    fn sample() -> RankingSnapshot {
        let mut scores = ScoreMap::new();
        for (id, score, rank) in [(2, 5000, 1), (1, 2000, 2), (3, 500, 3)] {
            scores.insert(
                PeerId(id),
                PlayerScoreRecord {
                    id: PeerId(id),
                    score,
                    alive: true,
                    rank: Some(rank),
                },
            );
        }
        RankingSnapshot {
            round: 0,
            scores,
            ranking: vec![PeerId(2), PeerId(1), PeerId(3)],
            finish_order: Vec::new(),
        }
    }

    #[test]
    fn applying_twice_equals_applying_once() {
        let payload = sample().encode().unwrap();
        let mut store = StateReplicationStore::new();

        assert_eq!(store.apply_snapshot(&payload).unwrap(), ApplyOutcome::Applied);
        let once = store.encode().unwrap();
        assert_eq!(
            store.apply_snapshot(&payload).unwrap(),
            ApplyOutcome::Unchanged
        );

        assert_eq!(store.encode().unwrap(), once);
        assert_eq!(once, payload);
        assert_eq!(store.applied_count(), 1);
        assert_eq!(store.ranking(), &[PeerId(2), PeerId(1), PeerId(3)]);
    }

    #[test]
    fn malformed_payload_keeps_previous_state() {
        let mut store = StateReplicationStore::new();
        store.apply_snapshot(&sample().encode().unwrap()).unwrap();
        let before = store.encode().unwrap();

        let err = store.apply_snapshot("{\"round\":1,\"scores\":").unwrap_err();
        assert!(matches!(err, ReplicationError::Malformed(_)));
        assert!(store.needs_resync());
        assert!(matches!(
            store.ensure_consistent(),
            Err(ReplicationError::NeedsResync)
        ));
        assert_eq!(store.encode().unwrap(), before);

        store.apply_snapshot(&sample().encode().unwrap()).unwrap();
        assert!(!store.needs_resync());
    }

    #[test]
    fn dangling_ranking_entries_are_rejected() {
        let mut snapshot = sample();
        snapshot.ranking.push(PeerId(9));
        let mut store = StateReplicationStore::new();

        match store.apply_snapshot(&snapshot.encode().unwrap()) {
            Err(ReplicationError::Inconsistent { player }) => assert_eq!(player, PeerId(9)),
            other => panic!("expected inconsistency, got {other:?}"),
        }
        assert!(store.scores().is_empty());
    }

    #[test]
    fn newer_snapshot_replaces_everything() {
        let mut store = StateReplicationStore::new();
        store.apply_snapshot(&sample().encode().unwrap()).unwrap();

        let mut next = sample();
        next.round = 1;
        next.scores.shift_remove(&PeerId(3));
        next.ranking.retain(|player| *player != PeerId(3));
        store.apply_snapshot(&next.encode().unwrap()).unwrap();

        assert!(store.score(PeerId(3)).is_none());
        assert_eq!(store.ranking_snapshot().round, 1);
    }
}
