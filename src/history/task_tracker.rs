use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

pub type TaskId = u64;

#[derive(Debug, Default)]
struct Tasks {
    pending: HashMap<TaskId, CancellationToken>,
    delivering: usize,
}

#[derive(Debug, Default)]
struct TrackerInner {
    next_id: AtomicU64,
    tasks: Mutex<Tasks>,
}

/// Tracks outstanding requests so they can be canceled individually or all
/// at once. A reply is delivered only by claiming its task, and a task that
/// was canceled can no longer be claimed.
#[derive(Debug, Clone, Default)]
pub struct CancelableTaskTracker {
    inner: Arc<TrackerInner>,
}

/// Held while a claimed reply runs. The tracker counts it as outstanding
/// until it is dropped.
#[must_use]
pub(crate) struct Delivery {
    tracker: CancelableTaskTracker,
}

impl Drop for Delivery {
    fn drop(&mut self) {
        let mut tasks = self.tracker.tasks();
        tasks.delivering = tasks.delivering.saturating_sub(1);
    }
}

impl CancelableTaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_tracked_task(&self) -> (TaskId, CancellationToken) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        self.tasks().pending.insert(id, token.clone());
        (id, token)
    }

    /// Wraps `callback` so it becomes a no-op once the returned task is
    /// canceled.
    pub fn track<T, F>(&self, callback: F) -> (TaskId, impl FnOnce(T) + Send + 'static)
    where
        T: 'static,
        F: FnOnce(T) + Send + 'static,
    {
        let (id, _) = self.new_tracked_task();
        let tracker = self.clone();
        let wrapped = move |value: T| {
            if let Some(_delivery) = tracker.claim(id) {
                callback(value);
            }
        };
        (id, wrapped)
    }

    /// Takes `id` out of the pending set for delivery. Returns `None` when
    /// the task was canceled first; a cancel that comes after the claim
    /// does not stop the claimed reply.
    pub(crate) fn claim(&self, id: TaskId) -> Option<Delivery> {
        let mut tasks = self.tasks();
        let token = tasks.pending.remove(&id)?;
        if token.is_cancelled() {
            return None;
        }
        tasks.delivering += 1;
        Some(Delivery {
            tracker: self.clone(),
        })
    }

    pub fn try_cancel(&self, id: TaskId) {
        if let Some(token) = self.tasks().pending.remove(&id) {
            token.cancel();
        }
    }

    pub fn try_cancel_all(&self) {
        for (_, token) in self.tasks().pending.drain() {
            token.cancel();
        }
    }

    /// True while any task is pending or a claimed reply is still running.
    pub fn has_tracked_tasks(&self) -> bool {
        let tasks = self.tasks();
        !tasks.pending.is_empty() || tasks.delivering > 0
    }

    pub(crate) fn untrack(&self, id: TaskId) {
        self.tasks().pending.remove(&id);
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn tracked_callback_runs_and_untracks() {
        let tracker = CancelableTaskTracker::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let (_, callback) = tracker.track(move |value: usize| {
            counter.fetch_add(value, Ordering::SeqCst);
        });
        assert!(tracker.has_tracked_tasks());

        callback(3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!tracker.has_tracked_tasks());
    }

    #[test]
    fn canceled_callback_never_runs() {
        let tracker = CancelableTaskTracker::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let (first, first_callback) = tracker.track(move |_: ()| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = calls.clone();
        let (_, second_callback) = tracker.track(move |_: ()| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tracker.try_cancel(first);
        first_callback(());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tracker.try_cancel_all();
        assert!(!tracker.has_tracked_tasks());
        second_callback(());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_reaches_the_task_token() {
        let tracker = CancelableTaskTracker::new();
        let (id, token) = tracker.new_tracked_task();
        assert!(!token.is_cancelled());

        tracker.try_cancel(id);
        assert!(token.is_cancelled());
        assert!(tracker.claim(id).is_none());
    }

    #[test]
    fn claimed_reply_outlives_a_later_cancel() {
        let tracker = CancelableTaskTracker::new();
        let (claimed, _) = tracker.new_tracked_task();
        let (queued, _) = tracker.new_tracked_task();

        let delivery = tracker.claim(claimed).expect("claim");
        tracker.try_cancel_all();
        assert!(tracker.claim(queued).is_none());
        assert!(tracker.claim(claimed).is_none());

        // The claimed reply still counts until it finishes.
        assert!(tracker.has_tracked_tasks());
        drop(delivery);
        assert!(!tracker.has_tracked_tasks());
    }

    #[test]
    fn ids_are_unique() {
        let tracker = CancelableTaskTracker::new();
        let (a, _) = tracker.new_tracked_task();
        let (b, _) = tracker.new_tracked_task();
        assert_ne!(a, b);
    }
}
