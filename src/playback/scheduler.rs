// Session-scoped timers
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::playback::session::SessionToken;

pub enum TaskControl {
    Continue,
    Stop,
}

/// A tokio task that calls `tick` after `first_delay` and then every `period`
/// (once only when `period` is `None`). Aborted when dropped.
pub struct PeriodicTask {
    handle: JoinHandle<()>,
    token: SessionToken,
}

impl PeriodicTask {
    pub fn spawn<F>(
        token: SessionToken,
        first_delay: Duration,
        period: Option<Duration>,
        mut tick: F,
    ) -> Self
    where
        F: FnMut() -> TaskControl + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            sleep(first_delay).await;
            loop {
                if let TaskControl::Stop = tick() {
                    break;
                }
                match period {
                    Some(period) => sleep(period).await,
                    None => break,
                }
            }
        });
        Self { handle, token }
    }

    pub fn once<F>(token: SessionToken, delay: Duration, task: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let mut task = Some(task);
        Self::spawn(token, delay, None, move || {
            if let Some(task) = task.take() {
                task();
            }
            TaskControl::Stop
        })
    }

    pub fn token(&self) -> SessionToken {
        self.token
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// All timers belonging to the current session
#[derive(Default)]
pub struct SessionTimers {
    pub drift: Option<PeriodicTask>,
    pub settle: Option<PeriodicTask>,
    pub progress: Option<PeriodicTask>,
}

impl SessionTimers {
    pub fn cancel_all(&mut self) {
        self.drift = None;
        self.settle = None;
        self.progress = None;
    }

    pub fn is_idle(&self) -> bool {
        [&self.drift, &self.settle, &self.progress]
            .iter()
            .all(|t| t.as_ref().map_or(true, PeriodicTask::is_finished))
    }
}
