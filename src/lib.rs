//! Browsing history store with search-term aggregation and a cached
//! top-sites ranking.

pub mod collector;
pub mod config;
pub mod db;
pub mod history;
pub mod scheduler;
pub mod search_terms;
pub mod top_sites;
