//! Authority-side readiness barrier gating round start.

use indexmap::IndexSet;

use crate::state::round::PeerId;

/// Result of feeding a readiness signal (or an eviction) into the barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyOutcome {
    /// Still waiting for more peers.
    Waiting {
        /// Distinct peers that reported ready.
        ready: usize,
        /// Peers the barrier waits for.
        expected: usize,
    },
    /// This call opened the barrier. Returned exactly once per barrier.
    Satisfied,
    /// The peer had already reported ready; nothing changed.
    Duplicate,
    /// The barrier had opened earlier; nothing changed.
    AlreadySatisfied,
}

/// Peers evicted because they never reported ready before the deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallReport {
    /// Known room members that were dropped from the expected set.
    pub evicted: Vec<PeerId>,
    /// Barrier state after the eviction.
    pub outcome: ReadyOutcome,
}

/// Counts distinct ready peers (the authority included) against the expected
/// room size and opens exactly once.
#[derive(Debug, Clone)]
pub struct ReadinessBarrier {
    expected: usize,
    members: IndexSet<PeerId>,
    ready: IndexSet<PeerId>,
    satisfied: bool,
    deadline: Option<f64>,
}

impl ReadinessBarrier {
    /// Barrier waiting for `expected` distinct peers.
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            members: IndexSet::new(),
            ready: IndexSet::new(),
            satisfied: false,
            deadline: None,
        }
    }

    /// Barrier waiting for every listed room member.
    pub fn for_members(members: impl IntoIterator<Item = PeerId>) -> Self {
        let members: IndexSet<PeerId> = members.into_iter().collect();
        Self {
            expected: members.len(),
            members,
            ready: IndexSet::new(),
            satisfied: false,
            deadline: None,
        }
    }

    /// Give up on silent peers once local time passes `deadline`.
    pub fn with_deadline(mut self, deadline: f64) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Whether the barrier has opened.
    pub fn is_satisfied(&self) -> bool {
        self.satisfied
    }

    /// Distinct peers that reported ready so far.
    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Peers the barrier currently waits for.
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Known members that have not reported ready yet.
    pub fn missing(&self) -> Vec<PeerId> {
        self.members
            .iter()
            .filter(|peer| !self.ready.contains(*peer))
            .copied()
            .collect()
    }

    /// Record a readiness signal from `peer`.
    pub fn mark_ready(&mut self, peer: PeerId) -> ReadyOutcome {
        if self.satisfied {
            return ReadyOutcome::AlreadySatisfied;
        }
        if !self.ready.insert(peer) {
            return ReadyOutcome::Duplicate;
        }
        self.evaluate()
    }

    /// Stop waiting for `peer` (it left the room or was kicked).
    pub fn evict(&mut self, peer: PeerId) -> ReadyOutcome {
        if self.satisfied {
            return ReadyOutcome::AlreadySatisfied;
        }
        let was_member = self.members.shift_remove(&peer);
        let was_ready = self.ready.shift_remove(&peer);
        if was_member || was_ready || self.members.is_empty() {
            self.expected = self.expected.saturating_sub(1);
        }
        self.evaluate()
    }

    /// Evict everyone still missing when the deadline has passed.
    ///
    /// Returns `None` while the deadline has not been reached, when no deadline
    /// is configured, or when the barrier already opened.
    pub fn poll_deadline(&mut self, local_now: f64) -> Option<StallReport> {
        let deadline = self.deadline?;
        if self.satisfied || local_now < deadline {
            return None;
        }
        self.deadline = None;

        let evicted = self.missing();
        self.members.retain(|peer| self.ready.contains(peer));
        self.expected = self.ready.len();
        let outcome = self.evaluate();
        Some(StallReport { evicted, outcome })
    }

    fn evaluate(&mut self) -> ReadyOutcome {
        if self.expected > 0 && self.ready.len() >= self.expected {
            self.satisfied = true;
            ReadyOutcome::Satisfied
        } else {
            ReadyOutcome::Waiting {
                ready: self.ready.len(),
                expected: self.expected,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_exactly_once_at_expected_count() {
        let mut barrier = ReadinessBarrier::new(3);

        assert_eq!(
            barrier.mark_ready(PeerId(1)),
            ReadyOutcome::Waiting {
                ready: 1,
                expected: 3
            }
        );
        assert_eq!(
            barrier.mark_ready(PeerId(2)),
            ReadyOutcome::Waiting {
                ready: 2,
                expected: 3
            }
        );
        assert!(!barrier.is_satisfied());

        assert_eq!(barrier.mark_ready(PeerId(3)), ReadyOutcome::Satisfied);
        assert!(barrier.is_satisfied());
        assert_eq!(
            barrier.mark_ready(PeerId(4)),
            ReadyOutcome::AlreadySatisfied
        );
        assert_eq!(
            barrier.mark_ready(PeerId(3)),
            ReadyOutcome::AlreadySatisfied
        );
    }

    #[test]
    fn duplicate_ready_does_not_count_twice() {
        let mut barrier = ReadinessBarrier::new(2);
        barrier.mark_ready(PeerId(1));
        assert_eq!(barrier.mark_ready(PeerId(1)), ReadyOutcome::Duplicate);
        assert_eq!(barrier.ready_count(), 1);
        assert!(!barrier.is_satisfied());
    }

    #[test]
    fn leaving_peer_can_open_the_barrier() {
        let mut barrier = ReadinessBarrier::for_members([PeerId(1), PeerId(2), PeerId(3)]);
        barrier.mark_ready(PeerId(1));
        barrier.mark_ready(PeerId(2));
        assert_eq!(barrier.missing(), vec![PeerId(3)]);

        assert_eq!(barrier.evict(PeerId(3)), ReadyOutcome::Satisfied);
    }

    #[test]
    fn ready_peer_leaving_is_no_longer_counted() {
        let mut barrier = ReadinessBarrier::for_members([PeerId(1), PeerId(2), PeerId(3)]);
        barrier.mark_ready(PeerId(1));
        assert_eq!(
            barrier.evict(PeerId(1)),
            ReadyOutcome::Waiting {
                ready: 0,
                expected: 2
            }
        );
    }

    #[test]
    fn deadline_evicts_silent_members() {
        let mut barrier =
            ReadinessBarrier::for_members([PeerId(1), PeerId(2), PeerId(3)]).with_deadline(30.0);
        barrier.mark_ready(PeerId(1));
        barrier.mark_ready(PeerId(3));

        assert_eq!(barrier.poll_deadline(29.9), None);
        let report = barrier.poll_deadline(30.0).unwrap();
        assert_eq!(report.evicted, vec![PeerId(2)]);
        assert_eq!(report.outcome, ReadyOutcome::Satisfied);
        assert_eq!(barrier.poll_deadline(31.0), None);
    }

    #[test]
    fn deadline_with_nobody_ready_stays_closed() {
        let mut barrier = ReadinessBarrier::for_members([PeerId(1), PeerId(2)]).with_deadline(1.0);
        let report = barrier.poll_deadline(2.0).unwrap();
        assert_eq!(report.evicted, vec![PeerId(1), PeerId(2)]);
        assert_eq!(
            report.outcome,
            ReadyOutcome::Waiting {
                ready: 0,
                expected: 0
            }
        );
        assert!(!barrier.is_satisfied());
    }
}
