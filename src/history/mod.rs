pub mod backend;
pub mod service;
pub mod task_tracker;
pub mod types;

pub use backend::HistoryBackend;
pub use service::HistoryService;
