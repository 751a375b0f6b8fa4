use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::trace;

pub type Task = Pin<Box<dyn Future<Output=()> + Send + 'static>>;

/// Executes callbacks now or after a delay. All timer-driven work of the reliability layer goes
///  through this, so that nothing in the layer ever blocks its caller.
pub trait Scheduler: Send + Sync + 'static {
    fn submit(&self, task: Task);
    fn schedule_after(&self, delay: Duration, task: Task) -> TimerHandle;
}

/// Cancellation handle for a scheduled task.
///
/// Cancellation is best effort: a task that already started running may be interrupted at its next
///  await point or may run to completion. Scheduled callbacks must therefore re-check the state
///  they act on.
#[derive(Debug)]
pub struct TimerHandle {
    abort_handle: AbortHandle,
}
impl TimerHandle {
    /// returns `true` if the task had not finished yet
    pub fn cancel(&self) -> bool {
        let was_pending = !self.abort_handle.is_finished();
        self.abort_handle.abort();
        was_pending
    }

    pub fn is_finished(&self) -> bool {
        self.abort_handle.is_finished()
    }
}

pub struct TokioScheduler {
    handle: Handle,
}
impl TokioScheduler {
    /// binds to the tokio runtime this is called from
    pub fn new() -> anyhow::Result<TokioScheduler> {
        Ok(TokioScheduler {
            handle: Handle::try_current()?,
        })
    }
}

impl Scheduler for TokioScheduler {
    fn submit(&self, task: Task) {
        self.handle.spawn(task);
    }

    fn schedule_after(&self, delay: Duration, task: Task) -> TimerHandle {
        trace!("scheduling task after {:?}", delay);
        let join_handle = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        TimerHandle {
            abort_handle: join_handle.abort_handle(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::runtime::Builder;
    use super::*;

    #[test]
    fn test_schedule_and_cancel() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let scheduler = TokioScheduler::new().unwrap();
            let counter = Arc::new(AtomicU32::new(0));

            let c = counter.clone();
            let fired = scheduler.schedule_after(Duration::from_secs(1), Box::pin(async move { c.fetch_add(1, Ordering::SeqCst); }));
            let c = counter.clone();
            let cancelled = scheduler.schedule_after(Duration::from_secs(2), Box::pin(async move { c.fetch_add(10, Ordering::SeqCst); }));
            let c = counter.clone();
            scheduler.submit(Box::pin(async move { c.fetch_add(100, Ordering::SeqCst); }));

            tokio::time::sleep(Duration::from_millis(1500)).await;
            assert_eq!(counter.load(Ordering::SeqCst), 101);
            assert!(fired.is_finished());
            assert!(!fired.cancel());

            assert!(cancelled.cancel());
            tokio::time::sleep(Duration::from_secs(5)).await;
            assert_eq!(counter.load(Ordering::SeqCst), 101);
        });
    }

    #[test]
    fn test_new_outside_runtime() {
        assert!(TokioScheduler::new().is_err());
    }
}
