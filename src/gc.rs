//! Periodic garbage collection.

use std::{sync::Arc, time::Duration};

use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{Instrument, Span, debug, error, info_span};

/// Handle to a task started by [`schedule_periodic`]. Dropping it aborts the task.
#[derive(Debug)]
pub struct GcHandle {
    cancel: CancellationToken,
    task: AbortOnDropHandle<()>,
}

impl GcHandle {
    /// Stop scheduling runs. A run already in progress completes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait until the task has exited.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            error!("gc task failed: {err}");
        }
    }
}

/// Run `task` on the blocking pool every `interval`, starting one interval from now.
///
/// The next interval starts only after the previous run has finished, so runs never
/// overlap. Must be called from within a tokio runtime.
pub fn schedule_periodic<F>(interval: Duration, task: F) -> GcHandle
where
    F: Fn() + Send + Sync + 'static,
{
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(
        gc_loop(interval, Arc::new(task), cancel.clone()).instrument(info_span!("gc")),
    );
    GcHandle {
        cancel,
        task: AbortOnDropHandle::new(handle),
    }
}

async fn gc_loop<F>(interval: Duration, task: Arc<F>, cancel: CancellationToken)
where
    F: Fn() + Send + Sync + 'static,
{
    debug!("GC loop starting {:?}", interval);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let task = task.clone();
        let span = Span::current();
        if let Err(err) = tokio::task::spawn_blocking(move || span.in_scope(|| task())).await {
            error!("GC run panicked: {err}");
        }
    }
    debug!("GC loop stopped");
}
