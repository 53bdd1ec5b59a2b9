use super::backend::HistoryBackend;
use super::task_tracker::{CancelableTaskTracker, TaskId};
use super::types::TopSitesDelta;
use crate::config::Config;
use crate::top_sites::{MostVisitedCallback, QueriesCallback, TopSitesBackend};
use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type Job = Box<dyn FnOnce(&mut HistoryBackend) + Send>;

/// Owns a [`HistoryBackend`] on a dedicated worker thread. Requests run in
/// submission order; replies are delivered on the worker.
pub struct HistoryService {
    sender: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl HistoryService {
    /// Opens the store on the worker. Open failures, including a database
    /// that is too new, come back here.
    pub fn open(config: &Config) -> Result<Self> {
        let config = config.clone();
        Self::start(move || HistoryBackend::open(&config))
    }

    fn start<F>(init: F) -> Result<Self>
    where
        F: FnOnce() -> Result<HistoryBackend> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel::<Job>();
        let (ready_sender, ready) = mpsc::sync_channel::<Result<()>>(1);

        let worker = thread::Builder::new()
            .name("history-db".to_string())
            .spawn(move || {
                let mut backend = match init() {
                    Ok(backend) => {
                        let _ = ready_sender.send(Ok(()));
                        backend
                    }
                    Err(error) => {
                        let _ = ready_sender.send(Err(error));
                        return;
                    }
                };

                for job in receiver {
                    job(&mut backend);
                }
                debug!("History worker stopped");
            })
            .context("Failed to spawn history worker")?;

        match ready.recv() {
            Ok(Ok(())) => {
                info!("History service started");
                Ok(Self {
                    sender: Some(sender),
                    worker: Some(worker),
                })
            }
            Ok(Err(error)) => {
                let _ = worker.join();
                Err(error)
            }
            Err(_) => {
                let _ = worker.join();
                Err(anyhow!("History worker exited during startup"))
            }
        }
    }

    /// Runs `task` on the worker, then `reply` with its result, unless
    /// `tracker` cancels the request first.
    pub fn schedule<T, Task, Reply>(
        &self,
        tracker: &CancelableTaskTracker,
        task: Task,
        reply: Reply,
    ) -> TaskId
    where
        T: 'static,
        Task: FnOnce(&mut HistoryBackend) -> T + Send + 'static,
        Reply: FnOnce(T) + Send + 'static,
    {
        let (id, token) = tracker.new_tracked_task();
        let owner = tracker.clone();
        let job: Job = Box::new(move |backend| {
            if token.is_cancelled() {
                return;
            }
            let result = task(backend);
            if let Some(_delivery) = owner.claim(id) {
                reply(result);
            }
        });

        if !self.post(job) {
            tracker.untrack(id);
        }
        id
    }

    /// Like [`HistoryService::schedule`], but a failed task is logged and
    /// never replies.
    fn schedule_query<T, Task, Reply>(
        &self,
        tracker: &CancelableTaskTracker,
        query: &'static str,
        task: Task,
        reply: Reply,
    ) -> TaskId
    where
        T: 'static,
        Task: FnOnce(&mut HistoryBackend) -> Result<T> + Send + 'static,
        Reply: FnOnce(T) + Send + 'static,
    {
        self.schedule(tracker, task, move |result: Result<T>| match result {
            Ok(value) => reply(value),
            Err(error) => warn!(query, error = %error, "History query failed"),
        })
    }

    pub async fn run<T, Task>(&self, task: Task) -> Result<T>
    where
        T: Send + 'static,
        Task: FnOnce(&mut HistoryBackend) -> Result<T> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let job: Job = Box::new(move |backend| {
            let _ = sender.send(task(backend));
        });
        if !self.post(job) {
            bail!("History worker is not running");
        }

        receiver
            .await
            .context("History worker dropped the request")?
    }

    fn post(&self, job: Job) -> bool {
        let posted = self
            .sender
            .as_ref()
            .is_some_and(|sender| sender.send(job).is_ok());
        if !posted {
            warn!("History worker is gone; dropping request");
        }
        posted
    }
}

impl Drop for HistoryService {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!("History worker panicked");
        }
    }
}

impl TopSitesBackend for HistoryService {
    fn get_top_sites(
        &self,
        tracker: &CancelableTaskTracker,
        callback: MostVisitedCallback,
    ) -> TaskId {
        self.schedule(
            tracker,
            |backend| {
                backend.get_top_sites().unwrap_or_else(|error| {
                    warn!(error = %error, "Failed to read persisted top sites");
                    Vec::new()
                })
            },
            callback,
        )
    }

    fn query_most_visited_urls(
        &self,
        limit: usize,
        tracker: &CancelableTaskTracker,
        callback: MostVisitedCallback,
    ) -> TaskId {
        self.schedule_query(
            tracker,
            "most_visited_urls",
            move |backend| backend.query_most_visited_urls(limit, Utc::now()),
            callback,
        )
    }

    fn query_most_repeated_queries_for_keyword(
        &self,
        keyword_id: i64,
        limit: usize,
        tracker: &CancelableTaskTracker,
        callback: QueriesCallback,
    ) -> TaskId {
        self.schedule_query(
            tracker,
            "most_repeated_queries",
            move |backend| backend.query_most_repeated_queries_for_keyword(keyword_id, limit, Utc::now()),
            callback,
        )
    }

    fn update_top_sites(&self, delta: TopSitesDelta) {
        self.post(Box::new(move |backend| {
            if let Err(error) = backend.update_top_sites(&delta) {
                warn!(error = %error, "Failed to persist top sites");
            }
        }));
    }
}
