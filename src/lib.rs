//! Deadline aggregation for an admissions calendar.
//!
//! Personal reminders and school application rounds come from two separate
//! sources; [`aggregate::Aggregator`] merges them into one ordered,
//! colour-tagged list with a per-day index for calendar grids, and
//! [`dates`] holds the overdue/today/upcoming helpers shared with the
//! timeline.

pub mod aggregate;
pub mod dates;
pub mod db;
pub mod error;
pub mod models;
pub mod refresh;
pub mod report;
pub mod source;
pub mod timeline;

pub use aggregate::{aggregate_snapshots, AggregateOptions, Aggregation, Aggregator, CalendarView};
pub use dates::{days_until, is_overdue, is_today, is_upcoming, MonthWindow, Window};
pub use error::{AggregateError, SourceUnavailable, ValidationError};
pub use models::{AggregatedDeadline, Category, DeadlineOrigin, PersonalDeadline, SchoolRoundRecord};
pub use source::{ChangeFeed, DeadlineSource, MemorySource, SchoolRoundSource, SourceKind};
