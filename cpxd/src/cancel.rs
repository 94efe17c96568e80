//! Cancellation tokens for tasks and delayed work.
//!
//! A [`CancelSource`] is held by whoever owns the operation; [`CancelToken`]
//! clones travel with sub-operations. Cancellation is level-triggered: a
//! token observed cancelled stays cancelled.

use tokio::sync::watch;

/// Owning side of a cancellation signal.
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

/// Observing side; cheap to clone.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelSource {
    pub fn new() -> (Self, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelToken { rx })
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation fires. If the source is dropped without
    /// cancelling, this pends forever; callers always race it against the
    /// operation they are guarding.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        loop {
            if rx.changed().await.is_err() {
                // Source gone without cancelling; never resolves.
                std::future::pending::<()>().await;
            }
            if *rx.borrow() {
                return;
            }
        }
    }

    /// A token that can never fire, for call sites without a task scope.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Leak the sender so the channel stays open.
        std::mem::forget(tx);
        Self { rx }
    }
}
