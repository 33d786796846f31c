use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Owns a spawned delayed task. Cancelling or dropping the handle aborts it.
#[derive(Debug)]
pub struct TimerHandle(JoinHandle<()>);

impl TimerHandle {
    pub fn cancel(&self) {
        self.0.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run `f` once after `delay`. The deadline is fixed at call time, not when the
/// task is first polled.
pub fn schedule<F>(delay: Duration, f: F) -> TimerHandle
where
    F: FnOnce() + Send + 'static,
{
    let sleep = tokio::time::sleep(delay);
    TimerHandle(tokio::spawn(async move {
        sleep.await;
        f();
    }))
}

/// Run a long-lived task (e.g. an interval loop) under a cancellable handle.
pub fn spawn<F>(task: F) -> TimerHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    TimerHandle(tokio::spawn(task))
}
