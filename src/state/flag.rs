use tokio::sync::watch;

/// Direction of a change on a [`SharedFlag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagEdge {
    /// false -> true
    Rising,
    /// true -> false
    Falling,
}

/// Boolean round flag (game active, round over) observable by collaborators.
///
/// Writes only report an edge when the value actually changes, and subscribers
/// start with the current value already marked as seen, so they are woken once
/// per real transition and never for the initial value.
#[derive(Debug)]
pub struct SharedFlag {
    tx: watch::Sender<bool>,
}

impl SharedFlag {
    /// Flag starting at `initial`.
    pub fn new(initial: bool) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Current value.
    pub fn get(&self) -> bool {
        *self.tx.borrow()
    }

    /// Write `value`, returning the edge when it differs from the current value.
    pub fn set(&self, value: bool) -> Option<FlagEdge> {
        let changed = self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
        match (changed, value) {
            (false, _) => None,
            (true, true) => Some(FlagEdge::Rising),
            (true, false) => Some(FlagEdge::Falling),
        }
    }

    /// Subscribe to future transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_changes_produce_edges() {
        let flag = SharedFlag::new(false);
        assert_eq!(flag.set(false), None);
        assert_eq!(flag.set(true), Some(FlagEdge::Rising));
        assert_eq!(flag.set(true), None);
        assert_eq!(flag.set(false), Some(FlagEdge::Falling));
        assert!(!flag.get());
    }

    #[test]
    fn subscribers_skip_the_initial_value() {
        let flag = SharedFlag::new(false);
        let mut rx = flag.subscribe();
        assert!(!rx.has_changed().unwrap());

        flag.set(false);
        assert!(!rx.has_changed().unwrap());

        flag.set(true);
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());
    }
}
