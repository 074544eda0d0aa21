use tokio::sync::watch;

/// Sending side of the shutdown signal.
///
/// Cloning is cheap; every clone drives the same signal.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<bool>);

impl ShutdownTx {
    /// Signals shutdown to every subscribed [`ShutdownRx`].
    ///
    /// The signal is sticky: receivers subscribed afterwards observe it immediately.
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }

    /// Creates a new receiver observing this signal.
    pub fn subscribe(&self) -> ShutdownRx {
        ShutdownRx(self.0.subscribe())
    }
}

/// Receiving side of the shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<bool>);

impl ShutdownRx {
    /// Returns `true` once shutdown has been signaled.
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Waits until shutdown is signaled.
    ///
    /// Returns immediately when the signal was already raised. If every sender is dropped without
    /// signaling, this never resolves, so it can always be used as a `select!` branch.
    pub async fn wait_for_shutdown(&mut self) {
        if self.0.wait_for(|shutdown| *shutdown).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Creates a new shutdown channel in the non-signaled state.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTx(tx), ShutdownRx(rx))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn late_subscribers_observe_shutdown() {
        let (tx, rx) = create_shutdown_channel();
        assert!(!rx.is_shutdown());

        tx.shutdown();

        let mut late = tx.subscribe();
        assert!(late.is_shutdown());
        tokio::time::timeout(Duration::from_secs(1), late.wait_for_shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn waiting_without_signal_does_not_resolve() {
        let (tx, mut rx) = create_shutdown_channel();
        drop(tx);

        let result = tokio::time::timeout(Duration::from_millis(50), rx.wait_for_shutdown()).await;
        assert!(result.is_err());
    }
}
