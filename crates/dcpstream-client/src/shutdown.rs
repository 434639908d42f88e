//! Shutdown coordination for feed tasks.
//!
//! A cloneable handle backed by a `watch` channel. Every long-running task
//! (workers, supervisor, transport replay in tests) holds a clone and
//! observes it from its select loop; `Feed::close()` flips it once.

use tokio::sync::watch;

/// Handle for triggering and observing shutdown.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    sender: watch::Sender<bool>,
    receiver: watch::Receiver<bool>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self { sender, receiver }
    }

    /// Signal shutdown to all holders.
    pub fn shutdown(&self) {
        let _ = self.sender.send(true);
    }

    /// Whether shutdown has been signaled.
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait until shutdown is signaled.
    pub async fn wait(&self) {
        let mut rx = self.receiver.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}
