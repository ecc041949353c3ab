use chrono::NaiveDate;
use serde::Serialize;

use crate::dates::{is_overdue, is_today, is_upcoming};
use crate::models::{AggregatedDeadline, Colour};

/// The linear view of deadlines: everything in date order, plus the open
/// items that need attention.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Timeline {
    pub all: Vec<AggregatedDeadline>,
    pub overdue: Vec<AggregatedDeadline>,
    pub due_today: Vec<AggregatedDeadline>,
    pub upcoming: Vec<AggregatedDeadline>,
}

impl Timeline {
    /// Orders by date, then priority (high first). Completed deadlines stay
    /// in `all` but never count as overdue or upcoming.
    pub fn build(items: impl IntoIterator<Item = AggregatedDeadline>, today: NaiveDate) -> Self {
        let mut all: Vec<AggregatedDeadline> = items.into_iter().collect();
        all.sort_by_key(|item| (item.date, item.priority().rank()));

        let open = |item: &&AggregatedDeadline| !item.is_completed();
        let overdue = all
            .iter()
            .filter(open)
            .filter(|item| is_overdue(item.date, today))
            .cloned()
            .collect();
        let due_today = all
            .iter()
            .filter(|item| is_today(item.date, today))
            .cloned()
            .collect();
        let upcoming = all
            .iter()
            .filter(open)
            .filter(|item| is_upcoming(item.date, today))
            .cloned()
            .collect();

        Self {
            all,
            overdue,
            due_today,
            upcoming,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}

/// Accent for a timeline row: red when overdue, yellow when due within the
/// week, green when due today. Completed rows only keep the today accent.
pub fn highlight(item: &AggregatedDeadline, today: NaiveDate) -> Option<Colour> {
    let open = !item.is_completed();
    if open && is_overdue(item.date, today) {
        Some(Colour::Red)
    } else if open && is_upcoming(item.date, today) {
        Some(Colour::Yellow)
    } else if is_today(item.date, today) {
        Some(Colour::Green)
    } else {
        None
    }
}
