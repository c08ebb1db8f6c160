use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Deadline,
    ClientDisconnected,
}

impl CancelReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CancelReason::Deadline => "deadline",
            CancelReason::ClientDisconnected => "client_disconnected",
        }
    }
}

/// Per-request cancellation. Two independent triggers feed one token; the first trigger to fire
/// is recorded as the reason and later triggers are ignored.
#[derive(Debug, Clone, Default)]
pub struct CancelContext {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl CancelContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this call was the one that cancelled the context.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the context is cancelled and yields the recorded reason.
    pub async fn cancelled(&self) -> CancelReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(CancelReason::ClientDisconnected)
    }

    /// Arms the deadline trigger. The timer is disarmed when the returned guard drops.
    pub fn arm_deadline(&self, deadline: Duration) -> DeadlineGuard {
        let ctx = self.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(deadline) => {
                    if ctx.cancel(CancelReason::Deadline) {
                        tracing::debug!(deadline_ms = deadline.as_millis() as u64, "relay deadline elapsed");
                    }
                }
                _ = ctx.token.cancelled() => {}
            }
        });
        DeadlineGuard { handle }
    }
}

#[derive(Debug)]
pub struct DeadlineGuard {
    handle: JoinHandle<()>,
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
