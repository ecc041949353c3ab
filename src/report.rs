use std::fmt::Write;

use chrono::NaiveDate;

use crate::aggregate::Aggregation;
use crate::dates::{classify, days_until, Urgency};
use crate::models::{AggregatedDeadline, Category};
use crate::timeline::Timeline;

fn describe(deadline: &AggregatedDeadline) -> String {
    let mut line = deadline.display_title.clone();
    if let Some(subtitle) = &deadline.display_subtitle {
        let _ = write!(line, " ({subtitle})");
    }
    if deadline.is_important {
        line.push_str(" [important]");
    }
    if deadline.is_completed() {
        line.push_str(" [done]");
    }
    line
}

fn when(deadline: &AggregatedDeadline, today: NaiveDate) -> String {
    match classify(deadline.date, today) {
        Some(Urgency::Today) => "today".to_string(),
        Some(Urgency::Overdue) => format!("{} days overdue", -days_until(deadline.date, today)),
        Some(Urgency::Upcoming) | Some(Urgency::Later) => {
            format!("in {} days", days_until(deadline.date, today))
        }
        None => "unknown".to_string(),
    }
}

pub fn build_report(aggregation: &Aggregation, today: NaiveDate) -> String {
    let view = &aggregation.view;
    let timeline = Timeline::build(view.items().iter().cloned(), today);

    let mut output = String::new();

    let _ = writeln!(output, "# Deadline Calendar");
    let _ = writeln!(
        output,
        "Generated for {} on {} ({} personal, {} school)",
        aggregation.window,
        today,
        view.count_by_category(Category::Personal),
        view.count_by_category(Category::School)
    );

    if aggregation.is_partial() {
        let _ = writeln!(output);
        for warning in &aggregation.warnings {
            let _ = writeln!(output, "> Warning: {warning}");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Needs Attention");

    if timeline.overdue.is_empty() && timeline.due_today.is_empty() && timeline.upcoming.is_empty() {
        let _ = writeln!(output, "Nothing overdue or due this week.");
    } else {
        for deadline in timeline
            .overdue
            .iter()
            .chain(&timeline.due_today)
            .chain(&timeline.upcoming)
        {
            let _ = writeln!(
                output,
                "- {} on {} ({})",
                describe(deadline),
                deadline.date,
                when(deadline, today)
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Important Dates");

    let important: Vec<_> = view.important().collect();
    if important.is_empty() {
        let _ = writeln!(output, "No important deadlines in this window.");
    } else {
        for deadline in important {
            let _ = writeln!(output, "- {}: {}", deadline.date, deadline.display_title);
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## By Day");

    if view.is_empty() {
        let _ = writeln!(output, "No deadlines in this window.");
    } else {
        for (day, deadlines) in view.index_by_day() {
            let _ = writeln!(output, "### {day}");
            for deadline in deadlines {
                let _ = writeln!(
                    output,
                    "- [{}] {}",
                    deadline.category().as_str(),
                    describe(deadline)
                );
            }
        }
    }

    if view.dropped() > 0 {
        let _ = writeln!(output);
        let _ = writeln!(
            output,
            "_{} records skipped for unreadable dates._",
            view.dropped()
        );
    }

    output
}
