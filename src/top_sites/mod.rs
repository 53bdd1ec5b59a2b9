pub mod block_list;
mod cache;
pub mod diff;
pub mod merge;
mod request;
pub mod search_provider;

pub use cache::{MostVisitedCallback, TopSitesReader};

use crate::config::{Config, RepeatableQueriesConfig};
use crate::history::task_tracker::{CancelableTaskTracker, TaskId};
use crate::history::types::{MostVisitedUrl, MostVisitedUrlWithRank, TopSitesDelta, normalize_url};
use crate::scheduler::{self, RefreshSchedule};
use crate::search_terms::KeywordSearchTermVisit;
use anyhow::Result;
use block_list::BlockList;
use diff::{diff_most_visited, do_titles_differ};
use merge::{add_prepopulated_pages, build_top_sites, dedup_and_cap};
use request::SitesAndQueriesRequest;
use search_provider::SearchProvider;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const TOP_SITES_NUMBER: usize = 10;
pub const NAVIGATION_REFRESH_DELAY: Duration = Duration::from_secs(30);

pub type QueriesCallback = Box<dyn FnOnce(Vec<KeywordSearchTermVisit>) + Send>;

/// What the cache needs from history. Reads are single-shot and tracked by
/// `tracker`; a read that fails never replies, except `get_top_sites`, which
/// replies with an empty list.
pub trait TopSitesBackend: Send + Sync {
    fn get_top_sites(
        &self,
        tracker: &CancelableTaskTracker,
        callback: MostVisitedCallback,
    ) -> TaskId;

    fn query_most_visited_urls(
        &self,
        limit: usize,
        tracker: &CancelableTaskTracker,
        callback: MostVisitedCallback,
    ) -> TaskId;

    fn query_most_repeated_queries_for_keyword(
        &self,
        keyword_id: i64,
        limit: usize,
        tracker: &CancelableTaskTracker,
        callback: QueriesCallback,
    ) -> TaskId;

    fn update_top_sites(&self, delta: TopSitesDelta);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    MostVisited,
    BlockedUrls,
}

pub trait TopSitesObserver: Send {
    fn top_sites_loaded(&mut self) {}
    fn top_sites_changed(&mut self, reason: ChangeReason);
}

#[derive(Debug, Clone)]
pub struct TopSitesSettings {
    pub refresh_delay: Duration,
    pub search_provider: Option<SearchProvider>,
    pub repeatable_queries: RepeatableQueriesConfig,
    /// Appended after the ranked sites while the list has room.
    pub prepopulated_pages: Vec<MostVisitedUrl>,
}

impl TopSitesSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            refresh_delay: config.refresh_delay(),
            search_provider: config.search_provider.clone(),
            repeatable_queries: config.repeatable_queries.clone(),
            prepopulated_pages: config
                .prepopulated_pages
                .iter()
                .map(|page| MostVisitedUrl::new(normalize_url(&page.url), page.title.clone(), 0.0))
                .collect(),
        }
    }
}

/// Requests applied on the task that owns [`TopSites`], sent through
/// [`TopSites::command_sender`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopSitesCommand {
    NavigationCommitted,
    HistoryDeleted { all_history: bool, urls: Vec<String> },
    Block(String),
    Unblock(String),
    ClearBlocked,
}

#[derive(Debug)]
enum TopSitesEvent {
    Loaded(Vec<MostVisitedUrl>),
    Refreshed {
        sites: Vec<MostVisitedUrl>,
        queries: Vec<KeywordSearchTermVisit>,
    },
}

/// Ranked most-visited sites merged with repeated search queries.
///
/// All mutation happens through `&mut self` on the owning task. Backend
/// replies arrive on an internal channel and are applied by
/// [`TopSites::process_pending_events`] or inside [`TopSites::run`].
/// Readers on other threads go through a [`TopSitesReader`].
pub struct TopSites {
    backend: Arc<dyn TopSitesBackend>,
    settings: TopSitesSettings,
    block_list: BlockList,
    top_sites: Vec<MostVisitedUrl>,
    reader: TopSitesReader,
    load_state: LoadState,
    observers: Vec<Box<dyn TopSitesObserver>>,
    tracker: CancelableTaskTracker,
    schedule: RefreshSchedule,
    events: mpsc::UnboundedReceiver<TopSitesEvent>,
    event_sender: mpsc::UnboundedSender<TopSitesEvent>,
    commands: mpsc::UnboundedReceiver<TopSitesCommand>,
    command_sender: mpsc::UnboundedSender<TopSitesCommand>,
    shut_down: bool,
}

impl TopSites {
    pub fn new(
        backend: Arc<dyn TopSitesBackend>,
        settings: TopSitesSettings,
        block_list: BlockList,
    ) -> Self {
        let (event_sender, events) = mpsc::unbounded_channel();
        let (command_sender, commands) = mpsc::unbounded_channel();
        Self {
            backend,
            settings,
            block_list,
            top_sites: Vec::new(),
            reader: TopSitesReader::default(),
            load_state: LoadState::Unloaded,
            observers: Vec::new(),
            tracker: CancelableTaskTracker::new(),
            schedule: RefreshSchedule::default(),
            events,
            event_sender,
            commands,
            command_sender,
            shut_down: false,
        }
    }

    pub fn reader(&self) -> TopSitesReader {
        self.reader.clone()
    }

    pub fn load_state(&self) -> LoadState {
        self.load_state
    }

    /// The authoritative list, blocked sites included.
    pub fn top_sites(&self) -> &[MostVisitedUrl] {
        &self.top_sites
    }

    pub fn block_list(&self) -> &BlockList {
        &self.block_list
    }

    pub fn add_observer(&mut self, observer: Box<dyn TopSitesObserver>) {
        self.observers.push(observer);
    }

    /// Commands sent here are applied inside [`TopSites::run`].
    pub fn command_sender(&self) -> mpsc::UnboundedSender<TopSitesCommand> {
        self.command_sender.clone()
    }

    pub fn get_most_visited_urls<F>(&self, callback: F)
    where
        F: FnOnce(Vec<MostVisitedUrl>) + Send + 'static,
    {
        self.reader.get_most_visited_urls(callback);
    }

    pub fn get_most_visited_urls_cancelable<F>(
        &self,
        tracker: &CancelableTaskTracker,
        callback: F,
    ) -> TaskId
    where
        F: FnOnce(Vec<MostVisitedUrl>) + Send + 'static,
    {
        self.reader.get_most_visited_urls_cancelable(tracker, callback)
    }

    /// Starts reading the persisted list. Later calls do nothing.
    pub fn init(&mut self) {
        if self.load_state != LoadState::Unloaded || self.shut_down {
            return;
        }
        self.load_state = LoadState::Loading;

        let sender = self.event_sender.clone();
        self.backend.get_top_sites(
            &self.tracker,
            Box::new(move |sites| {
                let _ = sender.send(TopSitesEvent::Loaded(sites));
            }),
        );
    }

    /// Applies every backend reply received so far.
    pub fn process_pending_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Loads, then keeps the list fresh until `shutdown` resolves.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        self.init();
        info!(
            refresh_minutes = self.settings.refresh_delay.as_secs() / 60,
            "Top sites refresh loop started"
        );

        loop {
            let deadline = self.schedule.deadline();
            tokio::select! {
                _ = &mut shutdown => break,
                Some(event) = self.events.recv() => self.handle_event(event),
                Some(command) = self.commands.recv() => self.apply_command(command),
                _ = scheduler::wait_for(deadline) => {
                    self.refresh_if_due(Instant::now());
                }
            }
        }

        self.shutdown();
        info!("Top sites refresh loop stopped");
    }

    /// Loads and waits out one refresh, for callers that only need a
    /// snapshot. Returns once no backend read is outstanding.
    pub async fn load_and_refresh(&mut self) {
        self.init();
        let mut check = tokio::time::interval(Duration::from_millis(50));
        loop {
            tokio::select! {
                Some(event) = self.events.recv() => self.handle_event(event),
                _ = check.tick() => {}
            }
            if !self.tracker.has_tracked_tasks() {
                self.process_pending_events();
                if !self.tracker.has_tracked_tasks() {
                    break;
                }
            }
        }
    }

    /// Starts a refresh if the pending deadline has passed by `now`.
    pub fn refresh_if_due(&mut self, now: Instant) -> bool {
        if !self.schedule.take_due(now) {
            return false;
        }
        self.start_query_for_most_visited();
        true
    }

    pub fn refresh_pending(&self) -> bool {
        self.schedule.is_pending()
    }

    /// Issues the most-visited and repeated-queries reads. The merge runs
    /// once both have replied.
    pub fn start_query_for_most_visited(&mut self) {
        if self.load_state != LoadState::Loaded || self.shut_down {
            return;
        }
        self.schedule.cancel();

        let sender = self.event_sender.clone();
        let request = SitesAndQueriesRequest::new(move |sites, queries| {
            let _ = sender.send(TopSitesEvent::Refreshed { sites, queries });
        });

        let blocked = self.block_list.len();
        let sites_half = request.clone();
        self.backend.query_most_visited_urls(
            TOP_SITES_NUMBER + blocked,
            &self.tracker,
            Box::new(move |sites| sites_half.set_sites(sites)),
        );

        match self.repeated_queries_keyword() {
            Some(keyword_id) => {
                let limit = self
                    .settings
                    .repeatable_queries
                    .max_queries
                    .min(TOP_SITES_NUMBER)
                    + blocked;
                self.backend.query_most_repeated_queries_for_keyword(
                    keyword_id,
                    limit,
                    &self.tracker,
                    Box::new(move |queries| request.set_queries(queries)),
                );
            }
            None => request.set_queries(Vec::new()),
        }

        self.schedule.schedule_in(self.settings.refresh_delay);
        debug!("Top sites refresh started");
    }

    pub fn add_blocked_url(&mut self, url: &str) -> Result<bool> {
        if !self.block_list.add(url)? {
            return Ok(false);
        }
        info!(url = %normalize_url(url), "Blocked top site");
        self.publish();
        self.notify_changed(ChangeReason::BlockedUrls);
        Ok(true)
    }

    pub fn remove_blocked_url(&mut self, url: &str) -> Result<bool> {
        if !self.block_list.remove(url)? {
            return Ok(false);
        }
        info!(url = %normalize_url(url), "Unblocked top site");
        self.publish();
        self.notify_changed(ChangeReason::BlockedUrls);
        self.start_query_for_most_visited();
        Ok(true)
    }

    pub fn clear_blocked_urls(&mut self) -> Result<()> {
        if self.block_list.is_empty() {
            return Ok(());
        }
        self.block_list.clear()?;
        info!("Cleared blocked top sites");
        self.publish();
        self.notify_changed(ChangeReason::BlockedUrls);
        self.start_query_for_most_visited();
        Ok(())
    }

    pub fn is_blocked(&self, url: &str) -> bool {
        self.block_list.contains(url)
    }

    pub fn has_blocked_urls(&self) -> bool {
        !self.block_list.is_empty()
    }

    /// History deletion hook. Deleting everything empties the list at once;
    /// a partial deletion only matters when it touches a listed site.
    pub fn on_history_deleted(&mut self, all_history: bool, deleted_urls: &[String]) {
        if self.load_state != LoadState::Loaded {
            return;
        }

        if all_history {
            let sites = self.with_prepopulated(Vec::new());
            self.set_top_sites(sites, ChangeReason::MostVisited);
            self.start_query_for_most_visited();
            return;
        }

        let listed = deleted_urls.iter().map(|url| normalize_url(url)).any(|url| {
            self.top_sites.iter().any(|site| site.url == url)
        });
        if listed {
            self.start_query_for_most_visited();
        }
    }

    pub fn on_navigation_committed(&mut self) {
        if self.load_state != LoadState::Loaded || self.shut_down {
            return;
        }
        if self.schedule.schedule_in(NAVIGATION_REFRESH_DELAY) {
            debug!("Top sites refresh scheduled after navigation");
        }
    }

    pub fn apply_command(&mut self, command: TopSitesCommand) {
        if self.shut_down {
            return;
        }
        let result = match command {
            TopSitesCommand::NavigationCommitted => {
                self.on_navigation_committed();
                Ok(())
            }
            TopSitesCommand::HistoryDeleted { all_history, urls } => {
                self.on_history_deleted(all_history, &urls);
                Ok(())
            }
            TopSitesCommand::Block(url) => self.add_blocked_url(&url).map(drop),
            TopSitesCommand::Unblock(url) => self.remove_blocked_url(&url).map(drop),
            TopSitesCommand::ClearBlocked => self.clear_blocked_urls(),
        };
        if let Err(error) = result {
            warn!(error = %error, "Top sites command failed");
        }
    }

    /// Cancels every outstanding read; their replies never arrive.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.tracker.try_cancel_all();
        self.schedule.cancel();
        while self.events.try_recv().is_ok() {}
        debug!("Top sites shut down");
    }

    fn handle_event(&mut self, event: TopSitesEvent) {
        if self.shut_down {
            return;
        }
        match event {
            TopSitesEvent::Loaded(sites) => self.on_top_sites_loaded(sites),
            TopSitesEvent::Refreshed { sites, queries } => self.on_sites_and_queries(sites, queries),
        }
    }

    fn on_top_sites_loaded(&mut self, sites: Vec<MostVisitedUrl>) {
        if self.load_state != LoadState::Loading {
            return;
        }
        self.top_sites = self.with_prepopulated(dedup_and_cap(sites, TOP_SITES_NUMBER));
        self.publish();
        self.load_state = LoadState::Loaded;
        info!(sites = self.top_sites.len(), "Top sites loaded");

        let (pending, urls) = self.reader.mark_loaded();
        for callback in pending {
            callback(urls.clone());
        }
        for observer in &mut self.observers {
            observer.top_sites_loaded();
        }

        self.start_query_for_most_visited();
    }

    fn on_sites_and_queries(
        &mut self,
        sites: Vec<MostVisitedUrl>,
        queries: Vec<KeywordSearchTermVisit>,
    ) {
        let merged = build_top_sites(
            sites,
            queries,
            self.settings.search_provider.as_ref(),
            &self.block_list,
            &self.settings.repeatable_queries,
            TOP_SITES_NUMBER,
        );
        let sites = self.with_prepopulated(merged);
        self.set_top_sites(sites, ChangeReason::MostVisited);
    }

    fn with_prepopulated(&self, mut sites: Vec<MostVisitedUrl>) -> Vec<MostVisitedUrl> {
        add_prepopulated_pages(
            &mut sites,
            &self.settings.prepopulated_pages,
            &self.block_list,
            TOP_SITES_NUMBER,
        );
        sites
    }

    /// Replaces the authoritative list. Persists the difference and notifies
    /// only when URLs, ranks or titles changed.
    fn set_top_sites(&mut self, sites: Vec<MostVisitedUrl>, reason: ChangeReason) {
        let delta = diff_most_visited(&self.top_sites, &sites);
        let titles_changed = do_titles_differ(&self.top_sites, &sites);
        if delta.is_empty() && !titles_changed {
            self.top_sites = sites;
            return;
        }

        let mut persisted = delta;
        persisted.moved.extend(retitled_in_place(&self.top_sites, &sites));
        if !persisted.is_empty() {
            info!(
                added = persisted.added.len(),
                moved = persisted.moved.len(),
                deleted = persisted.deleted.len(),
                "Top sites changed"
            );
            self.backend.update_top_sites(persisted);
        }

        self.top_sites = sites;
        self.publish();
        self.notify_changed(reason);
    }

    fn publish(&self) {
        let visible = self
            .top_sites
            .iter()
            .filter(|site| !self.block_list.contains(&site.url))
            .take(TOP_SITES_NUMBER)
            .cloned()
            .collect();
        self.reader.publish(visible);
    }

    fn notify_changed(&mut self, reason: ChangeReason) {
        for observer in &mut self.observers {
            observer.top_sites_changed(reason);
        }
    }

    fn repeated_queries_keyword(&self) -> Option<i64> {
        if !self.settings.repeatable_queries.enabled {
            return None;
        }
        self.settings
            .search_provider
            .as_ref()
            .map(|provider| provider.keyword_id)
    }
}

/// Sites that kept their rank but changed title; the diff leaves them out.
fn retitled_in_place(old: &[MostVisitedUrl], new: &[MostVisitedUrl]) -> Vec<MostVisitedUrlWithRank> {
    new.iter()
        .enumerate()
        .filter(|(rank, site)| {
            old.get(*rank)
                .is_some_and(|before| before.url == site.url && before.title != site.title)
        })
        .map(|(rank, site)| MostVisitedUrlWithRank {
            url: site.clone(),
            rank,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct FakeState {
        loads: VecDeque<MostVisitedCallback>,
        site_reads: VecDeque<(usize, MostVisitedCallback)>,
        query_reads: VecDeque<(i64, usize, QueriesCallback)>,
        updates: Vec<TopSitesDelta>,
    }

    /// Holds replies until the test releases them.
    #[derive(Default)]
    struct FakeBackend {
        state: Mutex<FakeState>,
    }

    impl FakeBackend {
        fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
            self.state.lock().expect("fake backend lock")
        }

        fn finish_load(&self, sites: Vec<MostVisitedUrl>) {
            let callback = self.state().loads.pop_front().expect("load requested");
            callback(sites);
        }

        fn finish_sites(&self, sites: Vec<MostVisitedUrl>) -> usize {
            let (limit, callback) = self.state().site_reads.pop_front().expect("sites requested");
            callback(sites);
            limit
        }

        fn finish_queries(&self, queries: Vec<KeywordSearchTermVisit>) {
            let (_, _, callback) = self.state().query_reads.pop_front().expect("queries requested");
            callback(queries);
        }
    }

    impl TopSitesBackend for FakeBackend {
        fn get_top_sites(
            &self,
            tracker: &CancelableTaskTracker,
            callback: MostVisitedCallback,
        ) -> TaskId {
            let (id, callback) = tracker.track(callback);
            self.state().loads.push_back(Box::new(callback));
            id
        }

        fn query_most_visited_urls(
            &self,
            limit: usize,
            tracker: &CancelableTaskTracker,
            callback: MostVisitedCallback,
        ) -> TaskId {
            let (id, callback) = tracker.track(callback);
            self.state().site_reads.push_back((limit, Box::new(callback)));
            id
        }

        fn query_most_repeated_queries_for_keyword(
            &self,
            keyword_id: i64,
            limit: usize,
            tracker: &CancelableTaskTracker,
            callback: QueriesCallback,
        ) -> TaskId {
            let (id, callback) = tracker.track(callback);
            self.state()
                .query_reads
                .push_back((keyword_id, limit, Box::new(callback)));
            id
        }

        fn update_top_sites(&self, delta: TopSitesDelta) {
            self.state().updates.push(delta);
        }
    }

    /// Replies inline with fixed results.
    struct ImmediateBackend {
        persisted: Vec<MostVisitedUrl>,
        sites: Vec<MostVisitedUrl>,
    }

    impl TopSitesBackend for ImmediateBackend {
        fn get_top_sites(
            &self,
            tracker: &CancelableTaskTracker,
            callback: MostVisitedCallback,
        ) -> TaskId {
            let (id, callback) = tracker.track(callback);
            callback(self.persisted.clone());
            id
        }

        fn query_most_visited_urls(
            &self,
            _limit: usize,
            tracker: &CancelableTaskTracker,
            callback: MostVisitedCallback,
        ) -> TaskId {
            let (id, callback) = tracker.track(callback);
            callback(self.sites.clone());
            id
        }

        fn query_most_repeated_queries_for_keyword(
            &self,
            _keyword_id: i64,
            _limit: usize,
            tracker: &CancelableTaskTracker,
            callback: QueriesCallback,
        ) -> TaskId {
            let (id, callback) = tracker.track(callback);
            callback(Vec::new());
            id
        }

        fn update_top_sites(&self, _delta: TopSitesDelta) {}
    }

    struct RecordingObserver(Arc<Mutex<Vec<String>>>);

    impl TopSitesObserver for RecordingObserver {
        fn top_sites_loaded(&mut self) {
            self.0.lock().expect("lock").push("loaded".to_string());
        }

        fn top_sites_changed(&mut self, reason: ChangeReason) {
            self.0.lock().expect("lock").push(format!("{reason:?}"));
        }
    }

    fn provider() -> SearchProvider {
        SearchProvider {
            keyword_id: 7,
            name: "Search".to_string(),
            url_template: "https://search.example/s?q={searchTerms}".to_string(),
        }
    }

    fn settings() -> TopSitesSettings {
        TopSitesSettings {
            refresh_delay: Duration::from_secs(3600),
            search_provider: Some(provider()),
            repeatable_queries: RepeatableQueriesConfig {
                rescale_scores: false,
                ..RepeatableQueriesConfig::default()
            },
            prepopulated_pages: Vec::new(),
        }
    }

    struct ChangeSignal(mpsc::UnboundedSender<ChangeReason>);

    impl TopSitesObserver for ChangeSignal {
        fn top_sites_changed(&mut self, reason: ChangeReason) {
            let _ = self.0.send(reason);
        }
    }

    fn site(url: &str, score: f64) -> MostVisitedUrl {
        MostVisitedUrl::new(url, url, score)
    }

    fn query(term: &str, score: f64) -> KeywordSearchTermVisit {
        KeywordSearchTermVisit {
            term: term.to_string(),
            normalized_term: term.to_string(),
            visit_count: 3,
            last_visit_time: Utc::now(),
            score: Some(score),
        }
    }

    fn urls(list: &[MostVisitedUrl]) -> Vec<String> {
        list.iter().map(|site| site.url.clone()).collect()
    }

    fn published(top_sites: &TopSites) -> Vec<String> {
        let (sender, receiver) = std::sync::mpsc::channel();
        top_sites.get_most_visited_urls(move |list| sender.send(list).expect("send"));
        urls(&receiver.try_recv().expect("served synchronously"))
    }

    struct Harness {
        backend: Arc<FakeBackend>,
        top_sites: TopSites,
        log: Arc<Mutex<Vec<String>>>,
    }

    fn harness(settings: TopSitesSettings) -> Harness {
        let backend = Arc::new(FakeBackend::default());
        let mut top_sites = TopSites::new(backend.clone(), settings, BlockList::in_memory());
        let log = Arc::new(Mutex::new(Vec::new()));
        top_sites.add_observer(Box::new(RecordingObserver(log.clone())));
        Harness {
            backend,
            top_sites,
            log,
        }
    }

    fn loaded(persisted: Vec<MostVisitedUrl>) -> Harness {
        let mut harness = harness(settings());
        harness.top_sites.init();
        harness.backend.finish_load(persisted);
        harness.top_sites.process_pending_events();
        harness
    }

    fn refresh(harness: &mut Harness, sites: Vec<MostVisitedUrl>, queries: Vec<KeywordSearchTermVisit>) {
        harness.backend.finish_sites(sites);
        harness.backend.finish_queries(queries);
        harness.top_sites.process_pending_events();
    }

    #[test]
    fn reads_before_load_are_served_once_loaded() {
        let mut harness = harness(settings());
        let (sender, receiver) = std::sync::mpsc::channel();
        harness
            .top_sites
            .get_most_visited_urls(move |list| sender.send(list).expect("send"));

        harness.top_sites.init();
        assert_eq!(harness.top_sites.load_state(), LoadState::Loading);
        assert!(receiver.try_recv().is_err());

        harness
            .backend
            .finish_load(vec![site("https://a.example/", 2.0), site("https://b.example/", 1.0)]);
        harness.top_sites.process_pending_events();

        assert_eq!(harness.top_sites.load_state(), LoadState::Loaded);
        assert_eq!(
            urls(&receiver.try_recv().expect("queued read served")),
            vec!["https://a.example/", "https://b.example/"]
        );
        assert_eq!(*harness.log.lock().expect("lock"), vec!["loaded"]);

        let state = harness.backend.state();
        assert_eq!(state.site_reads.len(), 1);
        assert_eq!(state.site_reads[0].0, TOP_SITES_NUMBER);
        assert_eq!(state.query_reads[0].0, 7);
    }

    #[test]
    fn refresh_merges_only_after_both_reads() {
        let mut harness = loaded(vec![site("https://a.example/", 1.0)]);

        harness
            .backend
            .finish_sites(vec![site("https://a.example/", 5.0), site("https://b.example/", 1.0)]);
        harness.top_sites.process_pending_events();
        assert_eq!(published(&harness.top_sites), vec!["https://a.example/"]);

        harness.backend.finish_queries(vec![query("rust", 3.0)]);
        harness.top_sites.process_pending_events();

        assert_eq!(
            published(&harness.top_sites),
            vec![
                "https://a.example/",
                "https://search.example/s?q=rust",
                "https://b.example/",
            ]
        );
        assert_eq!(
            *harness.log.lock().expect("lock"),
            vec!["loaded", "MostVisited"]
        );

        let state = harness.backend.state();
        assert_eq!(state.updates.len(), 1);
        assert_eq!(state.updates[0].added.len(), 2);
    }

    #[test]
    fn unchanged_refresh_neither_persists_nor_notifies() {
        let list = vec![site("https://a.example/", 2.0), site("https://b.example/", 1.0)];
        let mut harness = loaded(list.clone());

        refresh(&mut harness, list, Vec::new());

        assert_eq!(*harness.log.lock().expect("lock"), vec!["loaded"]);
        assert!(harness.backend.state().updates.is_empty());
    }

    #[test]
    fn title_change_notifies_and_rewrites_the_row() {
        let mut harness = loaded(vec![site("https://a.example/", 1.0)]);

        refresh(
            &mut harness,
            vec![MostVisitedUrl::new("https://a.example/", "Renamed", 1.0)],
            Vec::new(),
        );

        assert_eq!(
            *harness.log.lock().expect("lock"),
            vec!["loaded", "MostVisited"]
        );
        let state = harness.backend.state();
        assert_eq!(state.updates[0].moved[0].url.title, "Renamed");
        assert_eq!(state.updates[0].moved[0].rank, 0);
    }

    #[test]
    fn blocked_sites_are_hidden_and_widen_the_next_read() {
        let mut harness = loaded(vec![site("https://a.example/", 2.0), site("https://b.example/", 1.0)]);
        refresh(
            &mut harness,
            vec![site("https://a.example/", 2.0), site("https://b.example/", 1.0)],
            Vec::new(),
        );

        assert!(harness.top_sites.add_blocked_url("https://a.example/").expect("block"));
        assert!(harness.top_sites.is_blocked("https://a.example"));
        assert!(harness.top_sites.has_blocked_urls());
        assert_eq!(published(&harness.top_sites), vec!["https://b.example/"]);
        assert_eq!(harness.top_sites.top_sites().len(), 2);
        assert_eq!(
            harness.log.lock().expect("lock").last().map(String::as_str),
            Some("BlockedUrls")
        );

        harness.top_sites.refresh_if_due(Instant::now() + Duration::from_secs(7200));
        assert_eq!(harness.backend.finish_sites(Vec::new()), TOP_SITES_NUMBER + 1);
    }

    #[test]
    fn unblocking_requeries() {
        let mut harness = loaded(Vec::new());
        refresh(&mut harness, Vec::new(), Vec::new());
        harness.top_sites.add_blocked_url("https://a.example/").expect("block");

        assert!(harness.top_sites.remove_blocked_url("https://a.example/").expect("unblock"));
        assert!(!harness.top_sites.has_blocked_urls());
        assert_eq!(harness.backend.state().site_reads.len(), 1);

        assert!(!harness.top_sites.remove_blocked_url("https://a.example/").expect("again"));
    }

    #[test]
    fn shutdown_drops_outstanding_replies() {
        let mut harness = harness(settings());
        harness.top_sites.init();
        harness.top_sites.shutdown();

        harness.backend.finish_load(vec![site("https://a.example/", 1.0)]);
        assert_eq!(harness.top_sites.process_pending_events(), 0);
        assert_eq!(harness.top_sites.load_state(), LoadState::Loading);
        assert!(!harness.top_sites.reader().is_loaded());
    }

    #[test]
    fn canceled_read_is_never_served() {
        let mut harness = harness(settings());
        let tracker = CancelableTaskTracker::new();
        let served = Arc::new(Mutex::new(false));
        let flag = served.clone();
        harness
            .top_sites
            .get_most_visited_urls_cancelable(&tracker, move |_| *flag.lock().expect("lock") = true);
        tracker.try_cancel_all();

        harness.top_sites.init();
        harness.backend.finish_load(Vec::new());
        harness.top_sites.process_pending_events();

        assert!(!*served.lock().expect("lock"));
        assert!(!tracker.has_tracked_tasks());
    }

    #[test]
    fn deleting_all_history_empties_the_list() {
        let mut harness = loaded(vec![site("https://a.example/", 1.0)]);
        refresh(&mut harness, vec![site("https://a.example/", 1.0)], Vec::new());

        harness.top_sites.on_history_deleted(true, &[]);
        assert!(published(&harness.top_sites).is_empty());
        assert_eq!(harness.backend.state().site_reads.len(), 1);
    }

    #[test]
    fn partial_deletion_requeries_only_for_listed_sites() {
        let mut harness = loaded(vec![site("https://a.example/", 1.0)]);
        refresh(&mut harness, vec![site("https://a.example/", 1.0)], Vec::new());

        harness
            .top_sites
            .on_history_deleted(false, &["https://unlisted.example/".to_string()]);
        assert!(harness.backend.state().site_reads.is_empty());

        harness
            .top_sites
            .on_history_deleted(false, &["HTTPS://A.example".to_string()]);
        assert_eq!(harness.backend.state().site_reads.len(), 1);
    }

    #[test]
    fn navigations_coalesce_into_one_refresh() {
        let mut harness = loaded(Vec::new());
        refresh(&mut harness, Vec::new(), Vec::new());

        harness.top_sites.on_navigation_committed();
        harness.top_sites.on_navigation_committed();
        assert!(harness.top_sites.refresh_pending());

        assert!(!harness.top_sites.refresh_if_due(Instant::now()));
        assert!(harness
            .top_sites
            .refresh_if_due(Instant::now() + NAVIGATION_REFRESH_DELAY));
        assert_eq!(harness.backend.state().site_reads.len(), 1);
        assert!(!harness
            .top_sites
            .refresh_if_due(Instant::now() + NAVIGATION_REFRESH_DELAY));
    }

    #[test]
    fn without_a_provider_only_sites_are_read() {
        let mut harness = harness(TopSitesSettings {
            search_provider: None,
            ..settings()
        });
        harness.top_sites.init();
        harness.backend.finish_load(Vec::new());
        harness.top_sites.process_pending_events();

        assert!(harness.backend.state().query_reads.is_empty());
        harness
            .backend
            .finish_sites(vec![site("https://search.example/s?q=kept", 1.0)]);
        harness.top_sites.process_pending_events();

        assert_eq!(
            published(&harness.top_sites),
            vec!["https://search.example/s?q=kept"]
        );
    }

    #[tokio::test]
    async fn load_and_refresh_settles_after_one_cycle() {
        let backend = Arc::new(ImmediateBackend {
            persisted: vec![site("https://a.example/", 1.0)],
            sites: vec![site("https://a.example/", 1.0), site("https://b.example/", 0.5)],
        });
        let mut top_sites = TopSites::new(backend, settings(), BlockList::in_memory());

        top_sites.load_and_refresh().await;

        assert_eq!(top_sites.load_state(), LoadState::Loaded);
        assert_eq!(
            urls(top_sites.top_sites()),
            vec!["https://a.example/", "https://b.example/"]
        );
        assert_eq!(
            published(&top_sites),
            vec!["https://a.example/", "https://b.example/"]
        );
    }

    #[tokio::test]
    async fn run_loads_and_stops_on_shutdown() {
        let backend = Arc::new(ImmediateBackend {
            persisted: vec![site("https://a.example/", 1.0)],
            sites: vec![site("https://a.example/", 1.0), site("https://b.example/", 0.5)],
        });
        let mut top_sites = TopSites::new(backend, settings(), BlockList::in_memory());
        let reader = top_sites.reader();
        let (stop, stopped) = oneshot::channel::<()>();

        let ((), first) = tokio::join!(
            top_sites.run(async {
                let _ = stopped.await;
            }),
            async {
                let first = reader.most_visited_urls().await;
                let _ = stop.send(());
                first
            }
        );

        assert_eq!(urls(&first)[0], "https://a.example/");
        assert_eq!(top_sites.load_state(), LoadState::Loaded);
        assert!(!top_sites.refresh_pending());
    }

    #[test]
    fn prepopulated_pages_follow_ranked_sites() {
        let mut harness = harness(TopSitesSettings {
            prepopulated_pages: vec![
                site("https://welcome.example/", 0.0),
                site("https://a.example/", 0.0),
            ],
            ..settings()
        });
        harness.top_sites.init();
        harness.backend.finish_load(Vec::new());
        harness.top_sites.process_pending_events();
        assert_eq!(
            published(&harness.top_sites),
            vec!["https://welcome.example/", "https://a.example/"]
        );

        refresh(&mut harness, vec![site("https://a.example/", 2.0)], Vec::new());
        assert_eq!(
            published(&harness.top_sites),
            vec!["https://a.example/", "https://welcome.example/"]
        );

        harness
            .top_sites
            .add_blocked_url("https://welcome.example/")
            .expect("block");
        assert_eq!(published(&harness.top_sites), vec!["https://a.example/"]);

        harness.top_sites.on_history_deleted(true, &[]);
        assert_eq!(urls(harness.top_sites.top_sites()), vec!["https://a.example/"]);
        assert_eq!(published(&harness.top_sites), vec!["https://a.example/"]);
    }

    #[test]
    fn disabled_queries_keep_one_results_page() {
        let mut harness = harness(TopSitesSettings {
            repeatable_queries: RepeatableQueriesConfig {
                enabled: false,
                ..settings().repeatable_queries
            },
            ..settings()
        });
        harness.top_sites.init();
        harness.backend.finish_load(Vec::new());
        harness.top_sites.process_pending_events();
        assert!(harness.backend.state().query_reads.is_empty());

        harness.backend.finish_sites(vec![
            site("https://search.example/s?q=two", 3.0),
            site("https://a.example/", 2.0),
            site("https://search.example/s?q=one", 1.0),
        ]);
        harness.top_sites.process_pending_events();

        assert_eq!(
            published(&harness.top_sites),
            vec!["https://search.example/s?q=two", "https://a.example/"]
        );
    }

    #[test]
    fn commands_drive_blocking_and_history_hooks() {
        let mut harness = loaded(vec![site("https://a.example/", 2.0), site("https://b.example/", 1.0)]);
        refresh(
            &mut harness,
            vec![site("https://a.example/", 2.0), site("https://b.example/", 1.0)],
            Vec::new(),
        );

        harness
            .top_sites
            .apply_command(TopSitesCommand::Block("https://a.example/".to_string()));
        assert_eq!(published(&harness.top_sites), vec!["https://b.example/"]);

        harness.top_sites.apply_command(TopSitesCommand::NavigationCommitted);
        assert!(harness
            .top_sites
            .refresh_if_due(Instant::now() + NAVIGATION_REFRESH_DELAY));
        assert_eq!(harness.backend.state().site_reads.len(), 1);

        harness.top_sites.apply_command(TopSitesCommand::HistoryDeleted {
            all_history: false,
            urls: vec!["https://b.example/".to_string()],
        });
        assert_eq!(harness.backend.state().site_reads.len(), 2);

        harness.top_sites.apply_command(TopSitesCommand::ClearBlocked);
        assert!(!harness.top_sites.has_blocked_urls());
        assert_eq!(harness.backend.state().site_reads.len(), 3);
        assert_eq!(
            *harness.log.lock().expect("lock"),
            vec!["loaded", "BlockedUrls", "BlockedUrls"]
        );
    }

    #[tokio::test]
    async fn run_applies_commands_from_other_tasks() {
        let backend = Arc::new(ImmediateBackend {
            persisted: vec![site("https://a.example/", 2.0), site("https://b.example/", 1.0)],
            sites: vec![site("https://a.example/", 2.0), site("https://b.example/", 1.0)],
        });
        let mut top_sites = TopSites::new(backend, settings(), BlockList::in_memory());
        let (changed, mut changes) = mpsc::unbounded_channel();
        top_sites.add_observer(Box::new(ChangeSignal(changed)));

        let commands = top_sites.command_sender();
        let reader = top_sites.reader();

        let ((), ()) = tokio::join!(
            top_sites.run(async {
                while changes.recv().await != Some(ChangeReason::BlockedUrls) {}
            }),
            async {
                reader.most_visited_urls().await;
                commands
                    .send(TopSitesCommand::Block("https://a.example/".to_string()))
                    .expect("send");
            }
        );

        assert!(top_sites.is_blocked("https://a.example/"));
        assert_eq!(published(&top_sites), vec!["https://b.example/"]);
    }
}
