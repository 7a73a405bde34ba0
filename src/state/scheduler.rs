//! Actions that fire at an agreed synchronized instant.
//!
//! Every peer schedules the same action against the same authority instant and
//! fires it from its own loop once its estimate of synchronized time reaches the
//! target. No message is exchanged at fire time.

use std::collections::{BTreeMap, HashMap};

use crate::state::{cancel::CancelWatch, clock::SyncInstant};

/// Handle to a single pending action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionHandle(u64);

/// Pending actions ordered by target instant, then registration order.
#[derive(Debug)]
pub struct ScheduledActionRunner<A> {
    pending: BTreeMap<(SyncInstant, u64), A>,
    targets: HashMap<u64, SyncInstant>,
    next_seq: u64,
    cancel: CancelWatch,
}

impl<A> ScheduledActionRunner<A> {
    /// Runner whose pending actions are all dropped once `cancel` triggers.
    pub fn new(cancel: CancelWatch) -> Self {
        Self {
            pending: BTreeMap::new(),
            targets: HashMap::new(),
            next_seq: 0,
            cancel,
        }
    }

    /// Register `action` to fire once synchronized time reaches `target`.
    ///
    /// Scheduling on a cancelled runner is a no-op; the returned handle never fires.
    pub fn schedule(&mut self, target: SyncInstant, action: A) -> ActionHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        if !self.cancel.is_cancelled() {
            self.pending.insert((target, seq), action);
            self.targets.insert(seq, target);
        }
        ActionHandle(seq)
    }

    /// Remove a single pending action, returning it if it had not fired yet.
    pub fn cancel(&mut self, handle: ActionHandle) -> Option<A> {
        let target = self.targets.remove(&handle.0)?;
        self.pending.remove(&(target, handle.0))
    }

    /// Drop every pending action. Returns how many were dropped.
    pub fn cancel_all(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.targets.clear();
        dropped
    }

    /// Remove and return, in firing order, every action whose target is at or
    /// before `now`.
    pub fn poll(&mut self, now: SyncInstant) -> Vec<A> {
        if self.cancel.is_cancelled() {
            self.cancel_all();
            return Vec::new();
        }

        let mut due = Vec::new();
        while let Some(entry) = self.pending.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, seq), action) = entry.remove_entry();
            self.targets.remove(&seq);
            due.push(action);
        }
        due
    }

    /// Earliest pending target.
    pub fn next_due(&self) -> Option<SyncInstant> {
        self.pending.keys().next().map(|(target, _)| *target)
    }

    /// Number of actions still waiting to fire.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is waiting to fire.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::cancel::SessionCancel;

    fn at(secs: f64) -> SyncInstant {
        SyncInstant::from_secs(secs)
    }

    #[test]
    fn nothing_fires_before_target() {
        let cancel = SessionCancel::new();
        let mut runner = ScheduledActionRunner::new(cancel.watch());
        runner.schedule(at(10.0), "start");

        assert!(runner.poll(at(9.999)).is_empty());
        assert_eq!(runner.poll(at(10.0)), vec!["start"]);
        assert!(runner.poll(at(11.0)).is_empty());
    }

    #[test]
    fn fires_in_target_order_with_ties_by_registration() {
        let cancel = SessionCancel::new();
        let mut runner = ScheduledActionRunner::new(cancel.watch());
        runner.schedule(at(3.0), "late");
        runner.schedule(at(1.0), "first-tie");
        runner.schedule(at(2.0), "middle");
        runner.schedule(at(1.0), "second-tie");

        assert_eq!(
            runner.poll(at(5.0)),
            vec!["first-tie", "second-tie", "middle", "late"]
        );
        assert!(runner.is_empty());
    }

    #[test]
    fn single_action_can_be_cancelled() {
        let cancel = SessionCancel::new();
        let mut runner = ScheduledActionRunner::new(cancel.watch());
        let keep = runner.schedule(at(1.0), 1);
        let dropped = runner.schedule(at(1.0), 2);

        assert_eq!(runner.cancel(dropped), Some(2));
        assert_eq!(runner.cancel(dropped), None);
        assert_eq!(runner.next_due(), Some(at(1.0)));
        assert_eq!(runner.poll(at(1.0)), vec![1]);
        assert_eq!(runner.cancel(keep), None);
    }

    #[test]
    fn session_cancel_drops_everything() {
        let cancel = SessionCancel::new();
        let mut runner = ScheduledActionRunner::new(cancel.watch());
        runner.schedule(at(1.0), "a");
        runner.schedule(at(2.0), "b");

        cancel.cancel();
        assert!(runner.poll(at(100.0)).is_empty());
        assert!(runner.is_empty());

        runner.schedule(at(3.0), "c");
        assert!(runner.poll(at(100.0)).is_empty());
    }

    #[test]
    fn polling_cadence_fires_within_one_interval() {
        let cancel = SessionCancel::new();
        let mut runner = ScheduledActionRunner::new(cancel.watch());
        runner.schedule(at(1.03), ());

        let interval = 0.02;
        let mut now = 0.0;
        let mut fired_at = None;
        while fired_at.is_none() {
            now += interval;
            if !runner.poll(at(now)).is_empty() {
                fired_at = Some(now);
            }
        }
        let fired_at = fired_at.unwrap();
        assert!(fired_at >= 1.03);
        assert!(fired_at - 1.03 <= interval);
    }
}
