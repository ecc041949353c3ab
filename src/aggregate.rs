//! Merges personal deadlines and school rounds into one calendar view.
//!
//! [`aggregate_snapshots`] is the pure part: given what both sources returned
//! it normalises, filters to the window, orders and indexes. [`Aggregator`]
//! fetches the two snapshots concurrently and decides what a failing source
//! means for the result.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, warn};

use crate::dates::{day_key, parse_date, CalendarDate, MonthWindow, Window};
use crate::error::{AggregateError, SourceUnavailable};
use crate::models::{
    AggregatedDeadline, Category, Colour, DeadlineOrigin, PersonalDeadline, Priority, SchoolRound,
    SchoolRoundRecord,
};
use crate::source::{DeadlineSource, SchoolRoundSource, SourceKind};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AggregateOptions {
    pub include_personal: bool,
    pub include_school: bool,
    pub user_id: Option<String>,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            include_personal: true,
            include_school: true,
            user_id: None,
        }
    }
}

impl AggregateOptions {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    /// The user whose personal deadlines should be loaded, if any.
    ///
    /// A missing or blank id means anonymous browsing: personal deadlines are
    /// simply empty.
    pub fn personal_user(&self) -> Option<&str> {
        if !self.include_personal {
            return None;
        }
        self.user_id
            .as_deref()
            .map(str::trim)
            .filter(|user| !user.is_empty())
    }
}

/// The ordered deadlines of one window and their per-day index.
///
/// The index stores positions into `items`, so a day lookup always yields the
/// same entries in the same order as the flat list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CalendarView {
    items: Vec<AggregatedDeadline>,
    index_by_day: BTreeMap<String, Vec<usize>>,
    dropped: usize,
}

impl CalendarView {
    fn from_items(mut items: Vec<AggregatedDeadline>, dropped: usize) -> Self {
        items.sort_by_key(|item| item.date);

        let mut index_by_day: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (position, item) in items.iter().enumerate() {
            index_by_day
                .entry(day_key(item.date))
                .or_default()
                .push(position);
        }

        Self {
            items,
            index_by_day,
            dropped,
        }
    }

    pub fn items(&self) -> &[AggregatedDeadline] {
        &self.items
    }

    pub fn into_items(self) -> Vec<AggregatedDeadline> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Records skipped because their date could not be read.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Deadlines on one calendar day; empty for days without any.
    pub fn deadlines_on(&self, date: impl CalendarDate) -> Vec<&AggregatedDeadline> {
        let Some(day) = date.calendar_day() else {
            return Vec::new();
        };
        self.index_by_day
            .get(&day_key(day))
            .map(|positions| positions.iter().map(|&i| &self.items[i]).collect())
            .unwrap_or_default()
    }

    pub fn index_by_day(&self) -> BTreeMap<&str, Vec<&AggregatedDeadline>> {
        self.index_by_day
            .iter()
            .map(|(key, positions)| {
                (
                    key.as_str(),
                    positions.iter().map(|&i| &self.items[i]).collect(),
                )
            })
            .collect()
    }

    /// Days that carry at least one deadline, in order.
    pub fn days(&self) -> impl Iterator<Item = &str> {
        self.index_by_day.keys().map(String::as_str)
    }

    pub fn important(&self) -> impl Iterator<Item = &AggregatedDeadline> {
        self.items.iter().filter(|item| item.is_important)
    }

    pub fn count_by_category(&self, category: Category) -> usize {
        self.items
            .iter()
            .filter(|item| item.category() == category)
            .count()
    }
}

fn personal_entry(deadline: &PersonalDeadline) -> Option<AggregatedDeadline> {
    let Some(date) = parse_date(&deadline.date) else {
        debug!(id = %deadline.id, date = %deadline.date, "dropping personal deadline with unreadable date");
        return None;
    };

    Some(AggregatedDeadline {
        id: deadline.id.clone(),
        date,
        display_title: deadline.display_title().to_string(),
        display_subtitle: deadline
            .notes
            .as_deref()
            .map(str::trim)
            .filter(|notes| !notes.is_empty())
            .map(str::to_string),
        colour: deadline.kind.colour(),
        is_important: deadline.priority == Priority::High,
        origin: DeadlineOrigin::Personal(deadline.clone()),
    })
}

/// One entry per published round whose date parses; rounds without a date
/// are not drops, the school just has not announced them.
fn school_entries(school: &SchoolRoundRecord, dropped: &mut usize) -> Vec<AggregatedDeadline> {
    let mut entries = Vec::new();

    for (round, raw) in school.rounds() {
        let Some(raw) = raw.filter(|raw| !raw.trim().is_empty()) else {
            continue;
        };
        let Some(date) = parse_date(raw) else {
            debug!(school = %school.school_id, %round, date = raw, "dropping school round with unreadable date");
            *dropped += 1;
            continue;
        };

        let location = school.location.trim();
        entries.push(AggregatedDeadline {
            id: format!("{}-{}", school.school_id, round),
            date,
            display_title: format!("{} - {}", school.school_name, round),
            display_subtitle: (!location.is_empty()).then(|| location.to_string()),
            colour: Colour::Red,
            is_important: round.is_important(),
            origin: DeadlineOrigin::School(SchoolRound {
                school_id: school.school_id.clone(),
                school_name: school.school_name.clone(),
                round,
                date,
                location: school.location.clone(),
                application_fee: school.application_fee.clone(),
            }),
        });
    }

    entries
}

/// Builds the calendar view for `window` from two source snapshots.
///
/// Pure: identical arguments give an identical view. Personal deadlines are
/// ignored unless `options` names a user and includes them; school rounds
/// are ignored unless included.
pub fn aggregate_snapshots(
    window: Window,
    options: &AggregateOptions,
    personal: &[PersonalDeadline],
    schools: &[SchoolRoundRecord],
) -> CalendarView {
    let mut dropped = 0usize;
    let mut items = Vec::new();

    if options.personal_user().is_some() {
        for deadline in personal {
            match personal_entry(deadline) {
                Some(entry) if window.contains(entry.date) => items.push(entry),
                Some(_) => {}
                None => dropped += 1,
            }
        }
    }

    if options.include_school {
        for school in schools {
            items.extend(
                school_entries(school, &mut dropped)
                    .into_iter()
                    .filter(|entry| window.contains(entry.date)),
            );
        }
    }

    CalendarView::from_items(items, dropped)
}

/// A view plus the sources that could not be reached while building it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Aggregation {
    pub window: Window,
    pub view: CalendarView,
    pub warnings: Vec<SourceUnavailable>,
}

impl Aggregation {
    pub fn is_partial(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn deadlines_on(&self, date: impl CalendarDate) -> Vec<&AggregatedDeadline> {
        self.view.deadlines_on(date)
    }
}

/// Fetches both sources and aggregates them for one window.
#[derive(Debug, Clone)]
pub struct Aggregator<P, S> {
    personal: P,
    schools: S,
}

impl<P, S> Aggregator<P, S>
where
    P: DeadlineSource,
    S: SchoolRoundSource,
{
    pub fn new(personal: P, schools: S) -> Self {
        Self { personal, schools }
    }

    /// Both fetches run concurrently; a source that is switched off is never
    /// called. A failing source contributes nothing and is reported in
    /// [`Aggregation::warnings`]. Only when every requested source fails is
    /// the whole call an error.
    pub async fn aggregate(
        &self,
        window: Window,
        options: &AggregateOptions,
    ) -> Result<Aggregation, AggregateError> {
        let personal_fetch = async {
            match options.personal_user() {
                Some(user_id) => Some(self.personal.list_personal_deadlines(user_id).await),
                None => None,
            }
        };
        let school_fetch = async {
            if options.include_school {
                Some(self.schools.list_schools_with_rounds().await)
            } else {
                None
            }
        };
        let (personal, schools) = tokio::join!(personal_fetch, school_fetch);

        let mut requested = 0usize;
        let mut warnings = Vec::new();
        let personal = settle(SourceKind::Personal, personal, &mut requested, &mut warnings);
        let schools = settle(SourceKind::School, schools, &mut requested, &mut warnings);

        if requested > 0 && warnings.len() == requested {
            warn!(%window, failures = warnings.len(), "no calendar source reachable");
            return Err(AggregateError::Unavailable { failures: warnings });
        }

        let view = aggregate_snapshots(window, options, &personal, &schools);
        if view.dropped() > 0 {
            debug!(%window, dropped = view.dropped(), "records skipped during aggregation");
        }

        Ok(Aggregation {
            window,
            view,
            warnings,
        })
    }
}

fn settle<T>(
    kind: SourceKind,
    fetched: Option<Result<Vec<T>, SourceUnavailable>>,
    requested: &mut usize,
    warnings: &mut Vec<SourceUnavailable>,
) -> Vec<T> {
    let Some(result) = fetched else {
        return Vec::new();
    };
    *requested += 1;
    match result {
        Ok(records) => records,
        Err(err) => {
            warn!(source = %kind, error = %err, "treating source as empty");
            warnings.push(err);
            Vec::new()
        }
    }
}

/// The month window containing `date`.
pub fn month_of(date: NaiveDate) -> Window {
    Window::Month(MonthWindow::containing(date))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeadlineKind, UNTITLED_DEADLINE};
    use crate::source::MemorySource;

    fn march() -> Window {
        Window::parse("2025-03").unwrap()
    }

    fn personal(id: &str, title: &str, date: &str, kind: DeadlineKind, priority: Priority) -> PersonalDeadline {
        PersonalDeadline {
            id: id.to_string(),
            user_id: "u1".to_string(),
            title: title.to_string(),
            kind,
            priority,
            date: date.to_string(),
            notes: None,
            completed: false,
        }
    }

    fn school(id: &str, name: &str, rounds: [Option<&str>; 5]) -> SchoolRoundRecord {
        SchoolRoundRecord {
            school_id: id.to_string(),
            school_name: name.to_string(),
            location: "Boston, MA".to_string(),
            application_fee: Some("$250".to_string()),
            rounds: rounds.map(|round| round.map(str::to_string)),
        }
    }

    fn sample() -> (Vec<PersonalDeadline>, Vec<SchoolRoundRecord>) {
        (
            vec![
                personal("p1", "GMAT", "2025-03-10", DeadlineKind::Test, Priority::High),
                personal("p2", "Recommender call", "2025-03-05", DeadlineKind::Reminder, Priority::Low),
                personal("p3", "Next month", "2025-04-02", DeadlineKind::Reminder, Priority::Low),
            ],
            vec![
                school("s1", "Acme B-School", [Some("2025-03-05"), None, Some("2025-04-15"), None, None]),
                school("s2", "Harbor", [Some("2025-03-10"), Some("2025-03-28"), None, None, None]),
            ],
        )
    }

    fn day(raw: &str) -> NaiveDate {
        parse_date(raw).unwrap()
    }

    #[test]
    fn end_to_end_month_example() {
        let personal = vec![personal("p1", "GMAT", "2025-03-10", DeadlineKind::Test, Priority::High)];
        let schools = vec![school("s1", "Acme B-School", [Some("2025-03-05"), None, None, None, None])];
        let view = aggregate_snapshots(march(), &AggregateOptions::for_user("u1"), &personal, &schools);

        let items = view.items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].category(), Category::School);
        assert_eq!(items[0].date, day("2025-03-05"));
        assert_eq!(items[0].display_title, "Acme B-School - R1");
        assert_eq!(items[0].id, "s1-R1");
        assert_eq!(items[0].colour.hex(), "#ef4444");
        assert!(items[0].is_important);
        assert_eq!(items[0].school_id(), Some("s1"));

        assert_eq!(items[1].category(), Category::Personal);
        assert_eq!(items[1].date, day("2025-03-10"));
        assert_eq!(items[1].display_title, "GMAT");
        assert_eq!(items[1].colour, Colour::Yellow);
        assert!(items[1].is_important);
    }

    #[test]
    fn items_are_sorted_and_ties_keep_source_order() {
        let (personal, schools) = sample();
        let view = aggregate_snapshots(march(), &AggregateOptions::for_user("u1"), &personal, &schools);

        assert!(view.items().windows(2).all(|pair| pair[0].date <= pair[1].date));
        let ids: Vec<_> = view.items().iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, ["p2", "s1-R1", "p1", "s2-R1", "s2-R2"]);
    }

    #[test]
    fn day_lookup_matches_flat_list() {
        let (personal, schools) = sample();
        let view = aggregate_snapshots(march(), &AggregateOptions::for_user("u1"), &personal, &schools);

        for date in MonthWindow::parse("2025-03").unwrap().days() {
            let expected: Vec<_> = view.items().iter().filter(|item| item.date == date).collect();
            let found = view.deadlines_on(date);
            assert_eq!(found.len(), expected.len());
            for (a, b) in found.iter().zip(expected.iter()) {
                assert!(std::ptr::eq(*a, *b));
            }
        }

        assert!(view.deadlines_on("2025-03-01").is_empty());
        assert!(view.deadlines_on("not a date").is_empty());
        assert_eq!(view.days().collect::<Vec<_>>(), ["2025-03-05", "2025-03-10", "2025-03-28"]);
        assert!(!view.index_by_day().contains_key("2025-03-01"));
        assert_eq!(view.index_by_day()["2025-03-10"].len(), 2);
    }

    #[test]
    fn aggregation_is_idempotent() {
        let (personal, schools) = sample();
        let options = AggregateOptions::for_user("u1");
        let first = aggregate_snapshots(march(), &options, &personal, &schools);
        let second = aggregate_snapshots(march(), &options, &personal, &schools);
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn empty_titles_render_as_untitled() {
        let personal = vec![personal("p1", "", "2025-03-10", DeadlineKind::Interview, Priority::Medium)];
        let view = aggregate_snapshots(march(), &AggregateOptions::for_user("u1"), &personal, &[]);
        assert_eq!(view.items()[0].display_title, UNTITLED_DEADLINE);
        assert_eq!(view.items()[0].colour, Colour::Green);
        assert!(!view.items()[0].is_important);
    }

    #[test]
    fn missing_rounds_are_skipped() {
        let schools = vec![school(
            "s1",
            "Acme",
            [Some("2025-03-01"), None, Some("2025-04-15"), None, None],
        )];
        let view = aggregate_snapshots(Window::All, &AggregateOptions::default(), &[], &schools);
        let rounds: Vec<_> = view.items().iter().map(|item| (item.id.as_str(), item.is_important)).collect();
        assert_eq!(rounds, [("s1-R1", true), ("s1-R3", false)]);
        assert_eq!(view.dropped(), 0);
    }

    #[test]
    fn unreadable_dates_are_dropped_and_counted() {
        let personal = vec![
            personal("p1", "Bad", "someday", DeadlineKind::Test, Priority::High),
            personal("p2", "Blank", "", DeadlineKind::Test, Priority::High),
        ];
        let schools = vec![school("s1", "Acme", [Some("TBD"), Some("  "), Some("2025-03-20"), None, None])];
        let view = aggregate_snapshots(march(), &AggregateOptions::for_user("u1"), &personal, &schools);
        assert_eq!(view.len(), 1);
        assert_eq!(view.items()[0].id, "s1-R3");
        assert_eq!(view.dropped(), 3);
    }

    #[test]
    fn anonymous_callers_get_no_personal_items() {
        let (personal, schools) = sample();
        let anonymous = AggregateOptions::default();
        let view = aggregate_snapshots(march(), &anonymous, &personal, &schools);
        assert_eq!(view.count_by_category(Category::Personal), 0);
        assert_eq!(view.count_by_category(Category::School), 3);

        let blank = AggregateOptions::for_user("  ");
        assert!(blank.personal_user().is_none());
    }

    #[test]
    fn subtitles_carry_notes_and_location() {
        let mut deadline = personal("p1", "Essay", "2025-03-03", DeadlineKind::Application, Priority::Medium);
        deadline.notes = Some("Draft two".to_string());
        let schools = vec![school("s1", "Acme", [Some("2025-03-04"), None, None, None, None])];
        let view = aggregate_snapshots(march(), &AggregateOptions::for_user("u1"), &[deadline], &schools);
        assert_eq!(view.items()[0].display_subtitle.as_deref(), Some("Draft two"));
        assert_eq!(view.items()[1].display_subtitle.as_deref(), Some("Boston, MA"));
    }

    #[tokio::test]
    async fn disabled_personal_source_is_never_called() {
        let (personal, schools) = sample();
        let source = MemorySource::with_records(personal, schools);
        let aggregator = Aggregator::new(source.clone(), source.clone());
        let options = AggregateOptions {
            include_personal: false,
            ..AggregateOptions::for_user("u1")
        };

        let aggregation = aggregator.aggregate(march(), &options).await.unwrap();
        assert_eq!(source.calls(SourceKind::Personal), 0);
        assert_eq!(source.calls(SourceKind::School), 1);
        assert_eq!(aggregation.view.count_by_category(Category::Personal), 0);
        assert!(!aggregation.is_partial());
    }

    #[tokio::test]
    async fn one_failing_source_still_yields_the_other() {
        let (personal, schools) = sample();
        let source = MemorySource::with_records(personal, schools);
        source.fail(SourceKind::School);
        let aggregator = Aggregator::new(source.clone(), source.clone());

        let aggregation = aggregator
            .aggregate(march(), &AggregateOptions::for_user("u1"))
            .await
            .unwrap();
        assert!(aggregation.is_partial());
        assert_eq!(aggregation.warnings[0].kind, SourceKind::School);
        assert_eq!(aggregation.view.count_by_category(Category::School), 0);
        assert_eq!(aggregation.view.count_by_category(Category::Personal), 2);
        assert_eq!(aggregation.deadlines_on("2025-03-10").len(), 1);
    }

    #[tokio::test]
    async fn failing_personal_source_still_yields_school_rounds() {
        let (personal, schools) = sample();
        let source = MemorySource::with_records(personal, schools);
        source.fail(SourceKind::Personal);
        let aggregator = Aggregator::new(source.clone(), source.clone());

        let aggregation = aggregator
            .aggregate(march(), &AggregateOptions::for_user("u1"))
            .await
            .unwrap();
        assert!(aggregation.is_partial());
        assert_eq!(aggregation.warnings.len(), 1);
        assert_eq!(aggregation.warnings[0].kind, SourceKind::Personal);
        assert_eq!(aggregation.view.count_by_category(Category::Personal), 0);
        assert_eq!(aggregation.view.count_by_category(Category::School), 3);
        assert_eq!(aggregation.deadlines_on("2025-03-10")[0].id, "s2-R1");
    }

    #[tokio::test]
    async fn anonymous_school_failure_is_total() {
        let (personal, schools) = sample();
        let source = MemorySource::with_records(personal, schools);
        source.fail(SourceKind::School);
        let aggregator = Aggregator::new(source.clone(), source.clone());

        let err = aggregator
            .aggregate(march(), &AggregateOptions::default())
            .await
            .unwrap_err();
        assert_eq!(source.calls(SourceKind::Personal), 0);
        let AggregateError::Unavailable { failures } = err;
        assert_eq!(failures, vec![SourceUnavailable::new(SourceKind::School, "source offline")]);
    }

    #[tokio::test]
    async fn warnings_are_part_of_the_json() {
        let source = MemorySource::new();
        source.fail(SourceKind::School);
        let aggregator = Aggregator::new(source.clone(), source);

        let aggregation = aggregator
            .aggregate(march(), &AggregateOptions::for_user("u1"))
            .await
            .unwrap();
        let json = serde_json::to_value(&aggregation).unwrap();
        let warnings = json["warnings"].as_array().unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0]["kind"], "school");
        assert!(warnings[0]["reason"].is_string());
    }

    #[tokio::test]
    async fn every_source_failing_is_an_error() {
        let source = MemorySource::new();
        source.fail(SourceKind::Personal);
        source.fail(SourceKind::School);
        let aggregator = Aggregator::new(source.clone(), source);

        let err = aggregator
            .aggregate(march(), &AggregateOptions::for_user("u1"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "failed to load calendar data");
        let AggregateError::Unavailable { failures } = err;
        assert_eq!(failures.len(), 2);
    }

    #[tokio::test]
    async fn nothing_requested_is_an_empty_view() {
        let source = MemorySource::new();
        source.fail(SourceKind::School);
        let aggregator = Aggregator::new(source.clone(), source.clone());
        let options = AggregateOptions {
            include_personal: false,
            include_school: false,
            user_id: None,
        };

        let aggregation = aggregator.aggregate(Window::All, &options).await.unwrap();
        assert!(aggregation.view.is_empty());
        assert_eq!(source.calls(SourceKind::School), 0);
    }

    #[test]
    fn month_of_wraps_the_containing_month() {
        assert_eq!(month_of(day("2025-03-17")), march());
    }
}
