//! Inactivity timer.
//!
//! A single timer handle with clear-before-reset discipline: arming always
//! cancels the previous timer task first, so at most one is ever pending.
//! Activity resets the countdown without respawning the task.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::util::lock;

struct ArmedTimer {
    cancel: CancellationToken,
    activity: Arc<Notify>,
    deadline: Instant,
}

/// Fires a callback once after `timeout` without activity.
pub struct InactivityTimer {
    timeout: Duration,
    slot: Mutex<Option<ArmedTimer>>,
}

impl InactivityTimer {
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            slot: Mutex::new(None),
        }
    }

    /// Arm the timer, replacing any previously armed one.
    ///
    /// `on_expire` runs at most once, on the runtime, when `timeout` elapses
    /// with no [`touch`](Self::touch) in between. Must be called from within a
    /// tokio runtime.
    pub fn arm<F, Fut>(&self, on_expire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = lock(&self.slot);
        if let Some(previous) = slot.take() {
            previous.cancel.cancel();
        }

        let cancel = CancellationToken::new();
        let activity = Arc::new(Notify::new());
        let timeout = self.timeout;

        let task_cancel = cancel.clone();
        let task_activity = Arc::clone(&activity);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = task_cancel.cancelled() => return,
                    () = task_activity.notified() => trace!("inactivity countdown reset"),
                    () = tokio::time::sleep(timeout) => break,
                }
            }
            if task_cancel.is_cancelled() {
                return;
            }
            debug!(?timeout, "inactivity timeout elapsed");
            on_expire().await;
        });

        *slot = Some(ArmedTimer {
            cancel,
            activity,
            deadline: Instant::now() + timeout,
        });
    }

    /// Cancel the armed timer. Returns whether one was armed.
    pub fn disarm(&self) -> bool {
        lock(&self.slot).take().is_some_and(|armed| {
            armed.cancel.cancel();
            true
        })
    }

    /// Restart the countdown. No-op when not armed.
    pub fn touch(&self) -> bool {
        let mut slot = lock(&self.slot);
        match slot.as_mut() {
            Some(armed) => {
                armed.deadline = Instant::now() + self.timeout;
                armed.activity.notify_one();
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        lock(&self.slot).is_some()
    }

    /// When the armed timer will fire absent further activity.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        lock(&self.slot).as_ref().map(|armed| armed.deadline)
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Drop for InactivityTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}

impl std::fmt::Debug for InactivityTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InactivityTimer")
            .field("timeout", &self.timeout)
            .field("armed", &self.is_armed())
            .finish()
    }
}
