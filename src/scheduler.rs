use std::future::Future;
use std::time::Duration;

use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

/// A one-shot action that runs after `delay` unless cancelled first.
///
/// Runs on the tokio clock, so tests driven with a paused runtime can move
/// time forward deterministically. Dropping the handle cancels the action if
/// it has not started yet; once started, the action always runs to completion.
pub struct DeferredTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
    due_at: Instant,
}

impl DeferredTask {
    pub fn spawn<F>(delay: Duration, action: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();
        let due_at = Instant::now() + delay;

        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = child.cancelled() => {}
                _ = tokio::time::sleep_until(due_at) => action.await,
            }
        });

        Self {
            token,
            handle,
            due_at,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn remaining(&self) -> Duration {
        self.due_at.saturating_duration_since(Instant::now())
    }
}

impl Drop for DeferredTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
