use thiserror::Error;

/// Reasons a history database refuses to open.
///
/// Callers receive these wrapped in `anyhow::Error` and can recover the
/// variant with `downcast_ref::<HistoryDbError>()`.
#[derive(Debug, Error)]
pub enum HistoryDbError {
    /// The file was written by a newer build that this one cannot read. The
    /// file is left untouched.
    #[error(
        "history database is too new: version {version} requires at least {compatible_version}, this build supports {supported}"
    )]
    TooNew {
        version: i64,
        compatible_version: i64,
        supported: i64,
    },
    /// A migration step failed and was rolled back; the version marker still
    /// names the last step that succeeded.
    #[error("history database migration to version {version} failed: {reason}")]
    Migration { version: i64, reason: String },
}
