//! Cooperative shutdown signalling.
//!
//! Both long-running tasks observe the listener at every suspension point
//! and exit at the next step boundary once the signal fires.

use tokio::sync::watch;

/// Create a connected signal/listener pair.
pub fn channel() -> (ShutdownSignal, ShutdownListener) {
    let (tx, rx) = watch::channel(false);
    (ShutdownSignal(tx), ShutdownListener(rx))
}

/// Handle used to trigger shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch::Sender<bool>);

impl ShutdownSignal {
    /// Signal all listeners to shut down.
    pub fn signal(&self) {
        // Listeners having gone away is fine; they are already done.
        let _ = self.0.send(true);
    }
}

/// Handle used to wait for shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownListener(watch::Receiver<bool>);

impl ShutdownListener {
    /// Wait until shutdown is signalled.
    ///
    /// Also resolves when the signalling side is dropped, so an orphaned
    /// task never outlives the process that spawned it.
    pub async fn wait(&mut self) {
        if *self.0.borrow() {
            return;
        }
        while self.0.changed().await.is_ok() {
            if *self.0.borrow() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listener_resolves_on_signal() {
        let (signal, mut listener) = channel();
        signal.signal();
        listener.wait().await;
    }

    #[tokio::test]
    async fn listener_resolves_on_dropped_signal() {
        let (signal, mut listener) = channel();
        drop(signal);
        listener.wait().await;
    }
}
