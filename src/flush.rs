use std::sync::Weak;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::FlushConfig;
use crate::error::Result;
use crate::store::FlushReport;

/// When buffered outcomes must be written out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Flush once this many outcomes are buffered (0 disables the count trigger).
    pub max_pending: usize,
    /// Flush once this much time has passed since the last flush.
    pub interval: Duration,
}

impl FlushPolicy {
    pub fn is_due(&self, pending: usize, since_last: Duration) -> bool {
        if pending == 0 {
            return false;
        }
        self.count_reached(pending) || since_last >= self.interval
    }

    /// The count trigger alone; the scheduler's ticker covers the interval.
    pub fn count_reached(&self, pending: usize) -> bool {
        self.max_pending > 0 && pending >= self.max_pending
    }
}

impl From<&FlushConfig> for FlushPolicy {
    fn from(cfg: &FlushConfig) -> Self {
        Self {
            max_pending: cfg.max_pending,
            interval: cfg.interval,
        }
    }
}

/// Something the scheduler can flush from a blocking thread.
pub trait FlushTarget: Send + Sync + 'static {
    fn pending(&self) -> usize;
    fn flush_pending(&self) -> Result<FlushReport>;
}

/// Background task that flushes a target on a timer, or early when woken.
///
/// Holds only a weak reference so the target can still be dropped (and finalize itself)
/// while the task is running.
pub struct FlushScheduler {
    cancel: CancellationToken,
    wake: std::sync::Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for FlushScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushScheduler")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl FlushScheduler {
    /// Spawns the scheduler on `runtime`.
    pub fn start<T: FlushTarget>(
        runtime: &tokio::runtime::Handle,
        policy: FlushPolicy,
        target: Weak<T>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let wake = std::sync::Arc::new(Notify::new());

        let task_cancel = cancel.clone();
        let task_wake = std::sync::Arc::clone(&wake);
        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(policy.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            let mut last_flush = Instant::now();

            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        debug!("flush scheduler stopped");
                        break;
                    }
                    _ = ticker.tick() => {}
                    _ = task_wake.notified() => {}
                }

                let Some(strong) = target.upgrade() else {
                    debug!("flush target dropped, scheduler exiting");
                    break;
                };
                if !policy.is_due(strong.pending(), last_flush.elapsed()) {
                    continue;
                }

                match tokio::task::spawn_blocking(move || strong.flush_pending()).await {
                    Ok(Ok(report)) => {
                        last_flush = Instant::now();
                        debug!(keys = report.keys, outcomes = report.outcomes, "scheduled flush");
                    }
                    Ok(Err(e)) => warn!(error = %e, "scheduled flush failed, will retry"),
                    Err(e) => error!(error = %e, "scheduled flush task panicked"),
                }
            }
        });

        Self {
            cancel,
            wake,
            task: Some(task),
        }
    }

    /// Asks the task to check the policy now instead of at the next tick.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Stops the task. In-flight flushes run to completion.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        self.task.take();
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
