use crate::history::types::MostVisitedUrl;
use crate::search_terms::KeywordSearchTermVisit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

type Completion = Box<dyn FnOnce(Vec<MostVisitedUrl>, Vec<KeywordSearchTermVisit>) + Send>;

#[derive(Default)]
struct Slots {
    sites: Option<Vec<MostVisitedUrl>>,
    queries: Option<Vec<KeywordSearchTermVisit>>,
    on_complete: Option<Completion>,
}

/// Joins the two reads of one refresh. Each half is filled exactly once,
/// from any thread; whichever arrives second runs the completion.
pub(super) struct SitesAndQueriesRequest {
    slots: Mutex<Slots>,
    remaining: AtomicUsize,
}

impl SitesAndQueriesRequest {
    pub(super) fn new<F>(on_complete: F) -> Arc<Self>
    where
        F: FnOnce(Vec<MostVisitedUrl>, Vec<KeywordSearchTermVisit>) + Send + 'static,
    {
        Arc::new(Self {
            slots: Mutex::new(Slots {
                on_complete: Some(Box::new(on_complete)),
                ..Slots::default()
            }),
            remaining: AtomicUsize::new(2),
        })
    }

    pub(super) fn set_sites(&self, sites: Vec<MostVisitedUrl>) {
        self.slots().sites = Some(sites);
        self.finish_half();
    }

    pub(super) fn set_queries(&self, queries: Vec<KeywordSearchTermVisit>) {
        self.slots().queries = Some(queries);
        self.finish_half();
    }

    fn finish_half(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        let (sites, queries, on_complete) = {
            let mut slots = self.slots();
            (
                slots.sites.take().unwrap_or_default(),
                slots.queries.take().unwrap_or_default(),
                slots.on_complete.take(),
            )
        };
        if let Some(on_complete) = on_complete {
            on_complete(sites, queries);
        }
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
