use tokio::sync::watch;

/// Session-wide cancellation handle.
///
/// One handle is created per round session. Triggering it cancels every pending
/// scheduled action and stops the peer's driver loop together.
#[derive(Debug)]
pub struct SessionCancel {
    tx: watch::Sender<bool>,
}

impl SessionCancel {
    /// Fresh, untriggered handle.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Trigger cancellation. Returns `false` when it was already triggered.
    pub fn cancel(&self) -> bool {
        self.tx.send_if_modified(|cancelled| {
            if *cancelled {
                false
            } else {
                *cancelled = true;
                true
            }
        })
    }

    /// Whether cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Observer handed to components that must stop when the session does.
    pub fn watch(&self) -> CancelWatch {
        CancelWatch {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for SessionCancel {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side of a [`SessionCancel`].
#[derive(Debug, Clone)]
pub struct CancelWatch {
    rx: watch::Receiver<bool>,
}

impl CancelWatch {
    /// Whether the owning session has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the owning session is cancelled (or dropped).
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_observed_by_every_watch() {
        let cancel = SessionCancel::new();
        let first = cancel.watch();
        let second = cancel.watch();
        assert!(!first.is_cancelled());

        assert!(cancel.cancel());
        assert!(!cancel.cancel());
        assert!(cancel.is_cancelled());
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_resolves_after_trigger() {
        let cancel = SessionCancel::new();
        let mut watch = cancel.watch();
        let waiter = tokio::spawn(async move { watch.cancelled().await });
        cancel.cancel();
        waiter.await.unwrap();
    }
}
