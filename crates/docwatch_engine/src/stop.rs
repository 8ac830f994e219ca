//! Cooperative stop signal.

use tokio_util::sync::CancellationToken;

/// A one-shot "stop" signal shared between a watch loop and its owner.
///
/// The only operation is [`stop`](Self::stop); nothing else can be sent
/// through it. Clones observe the same signal.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
}

impl StopSignal {
    /// Creates a signal that has not been stopped.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a signal nobody else holds, so it never fires.
    ///
    /// Substituted when a loop is started without a stop signal.
    pub fn never() -> Self {
        Self::default()
    }

    /// Stops every holder of this signal. Idempotent.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Returns true once the signal has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes when the signal is stopped.
    pub async fn stopped(&self) {
        self.token.cancelled().await;
    }

    /// Sleeps for `duration` unless stopped first.
    ///
    /// Returns `false` if the sleep was cut short by a stop.
    pub async fn sleep(&self, duration: std::time::Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// A child signal: stopped with its parent, or on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn stop_is_shared_by_clones() {
        let signal = StopSignal::new();
        let clone = signal.clone();
        assert!(!clone.is_stopped());
        signal.stop();
        assert!(clone.is_stopped());
        clone.stopped().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_is_cut_short() {
        let signal = StopSignal::new();
        let waker = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waker.stop();
        });
        let start = tokio::time::Instant::now();
        assert!(!signal.sleep(Duration::from_secs(60)).await);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_without_stop() {
        assert!(StopSignal::never().sleep(Duration::from_millis(5)).await);
    }

    #[test]
    fn child_follows_parent() {
        let parent = StopSignal::new();
        let child = parent.child();
        child.stop();
        assert!(!parent.is_stopped());
        let child = parent.child();
        parent.stop();
        assert!(child.is_stopped());
    }
}
