use std::fmt;
use std::time::Duration;
use tokio::task::AbortHandle;

pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Timer service used to arm reply timeouts.
pub trait Timer: Send + Sync + 'static {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;
}

/// Cancellation handle for a scheduled callback. Dropping it does not cancel.
pub struct TimerHandle {
    cancel: Box<dyn FnOnce() + Send + 'static>,
}

impl TimerHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Box::new(cancel),
        }
    }

    pub fn from_abort(handle: AbortHandle) -> Self {
        Self::new(move || handle.abort())
    }

    pub fn cancel(self) {
        (self.cancel)()
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TimerHandle")
    }
}

/// Timers backed by `tokio::time`; each schedule spawns one sleeping task.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

impl Timer for TokioTimer {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        TimerHandle::from_abort(task.abort_handle())
    }
}
