use serde::Serialize;
use thiserror::Error;

use crate::source::SourceKind;

/// One source could not be reached for this aggregation.
///
/// The failing source is `kind`: thiserror reserves a field called `source`
/// for the underlying error.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{kind} deadlines unavailable: {reason}")]
pub struct SourceUnavailable {
    pub kind: SourceKind,
    pub reason: String,
}

impl SourceUnavailable {
    pub fn new(kind: SourceKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum AggregateError {
    /// Every requested source failed; nothing can be shown.
    #[error("failed to load calendar data")]
    Unavailable { failures: Vec<SourceUnavailable> },
}

/// Rejection of a new personal deadline before it reaches storage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ValidationError {
    #[error("please enter a title")]
    MissingTitle,
    #[error("please enter a deadline date")]
    MissingDate,
    #[error("please enter date in YYYY-MM-DD format")]
    DateFormat,
    #[error("please enter a valid date")]
    InvalidDate,
    #[error("unknown priority {0:?}")]
    UnknownPriority(String),
    #[error("a user id is required")]
    MissingUser,
}
