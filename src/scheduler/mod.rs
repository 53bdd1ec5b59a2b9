use std::future;
use tokio::time::{Duration, Instant, sleep_until};

/// The next refresh deadline. Scheduling while a refresh is already pending
/// keeps whichever deadline comes first, so at most one is ever pending.
#[derive(Debug, Default)]
pub struct RefreshSchedule {
    deadline: Option<Instant>,
}

impl RefreshSchedule {
    pub fn schedule_in(&mut self, delay: Duration) -> bool {
        self.schedule_at(Instant::now() + delay)
    }

    /// `false` when an earlier deadline was already pending.
    pub fn schedule_at(&mut self, at: Instant) -> bool {
        match self.deadline {
            Some(existing) if existing <= at => false,
            _ => {
                self.deadline = Some(at);
                true
            }
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Clears and reports a deadline that has passed by `now`.
    pub fn take_due(&mut self, now: Instant) -> bool {
        if self.deadline.is_some_and(|deadline| deadline <= now) {
            self.deadline = None;
            return true;
        }
        false
    }
}

/// Resolves at `deadline`, or never when nothing is scheduled.
pub async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending::<()>().await,
    }
}
