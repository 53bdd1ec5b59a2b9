use crate::history::task_tracker::{CancelableTaskTracker, TaskId};
use crate::history::types::MostVisitedUrl;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

pub type MostVisitedCallback = Box<dyn FnOnce(Vec<MostVisitedUrl>) + Send>;

#[derive(Default)]
struct Published {
    loaded: bool,
    urls: Vec<MostVisitedUrl>,
    pending: Vec<MostVisitedCallback>,
}

/// Thread-safe view of the published, block-filtered top sites. Clones share
/// the same list.
#[derive(Clone, Default)]
pub struct TopSitesReader {
    published: Arc<Mutex<Published>>,
}

impl TopSitesReader {
    /// Runs `callback` with the published list right away, or once the list
    /// has loaded. Never invoked with the lock held.
    pub fn get_most_visited_urls<F>(&self, callback: F)
    where
        F: FnOnce(Vec<MostVisitedUrl>) + Send + 'static,
    {
        let urls = {
            let mut published = self.lock();
            if !published.loaded {
                published.pending.push(Box::new(callback));
                return;
            }
            published.urls.clone()
        };
        callback(urls);
    }

    pub fn get_most_visited_urls_cancelable<F>(
        &self,
        tracker: &CancelableTaskTracker,
        callback: F,
    ) -> TaskId
    where
        F: FnOnce(Vec<MostVisitedUrl>) + Send + 'static,
    {
        let (id, callback) = tracker.track(callback);
        self.get_most_visited_urls(callback);
        id
    }

    pub async fn most_visited_urls(&self) -> Vec<MostVisitedUrl> {
        let (sender, receiver) = oneshot::channel();
        self.get_most_visited_urls(move |urls| {
            let _ = sender.send(urls);
        });
        receiver.await.unwrap_or_default()
    }

    pub fn is_loaded(&self) -> bool {
        self.lock().loaded
    }

    pub(super) fn publish(&self, urls: Vec<MostVisitedUrl>) {
        self.lock().urls = urls;
    }

    /// Flips to loaded and hands back the queued callbacks with the list
    /// they should receive.
    pub(super) fn mark_loaded(&self) -> (Vec<MostVisitedCallback>, Vec<MostVisitedUrl>) {
        let mut published = self.lock();
        published.loaded = true;
        (std::mem::take(&mut published.pending), published.urls.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Published> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
