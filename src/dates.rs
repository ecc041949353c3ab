//! Calendar-day arithmetic shared by the month calendar and the timeline.
//!
//! Every helper works on calendar days in the caller's local time zone: a
//! timestamp is first reduced to the local date it falls on, then compared
//! against `today`. Inputs that cannot be read as a date never raise; they
//! classify as "not overdue", "not today", "not upcoming" and are `0` days
//! away.

use std::fmt;

use chrono::{DateTime, Datelike, Days, Local, Months, NaiveDate, NaiveDateTime, TimeZone};
use serde::Serialize;

/// Deadlines due within this many days (and not today) are upcoming.
pub const UPCOMING_WINDOW_DAYS: i64 = 7;

/// Something that may name a calendar day.
pub trait CalendarDate {
    fn calendar_day(&self) -> Option<NaiveDate>;
}

impl CalendarDate for NaiveDate {
    fn calendar_day(&self) -> Option<NaiveDate> {
        Some(*self)
    }
}

impl CalendarDate for NaiveDateTime {
    fn calendar_day(&self) -> Option<NaiveDate> {
        Some(self.date())
    }
}

impl<Tz: TimeZone> CalendarDate for DateTime<Tz> {
    fn calendar_day(&self) -> Option<NaiveDate> {
        Some(self.with_timezone(&Local).date_naive())
    }
}

impl CalendarDate for str {
    fn calendar_day(&self) -> Option<NaiveDate> {
        parse_date(self)
    }
}

impl CalendarDate for String {
    fn calendar_day(&self) -> Option<NaiveDate> {
        parse_date(self)
    }
}

impl<T: CalendarDate + ?Sized> CalendarDate for &T {
    fn calendar_day(&self) -> Option<NaiveDate> {
        (**self).calendar_day()
    }
}

impl<T: CalendarDate> CalendarDate for Option<T> {
    fn calendar_day(&self) -> Option<NaiveDate> {
        self.as_ref().and_then(CalendarDate::calendar_day)
    }
}

const NAIVE_DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Reads a source date into the local calendar day it falls on.
///
/// Accepts plain `YYYY-MM-DD`, naive timestamps (taken as local time),
/// RFC 3339 timestamps and Postgres `timestamptz` text. Anything else is
/// `None`.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }

    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return timestamp.calendar_day();
    }

    if let Ok(timestamp) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return timestamp.calendar_day();
    }

    NAIVE_DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|timestamp| timestamp.date())
}

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// Index key for a calendar day, `YYYY-MM-DD`.
pub fn day_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Whole calendar days from `today` to `date`; negative when past.
pub fn days_until(date: impl CalendarDate, today: NaiveDate) -> i64 {
    date.calendar_day()
        .map(|day| (day - today).num_days())
        .unwrap_or(0)
}

pub fn is_today(date: impl CalendarDate, today: NaiveDate) -> bool {
    date.calendar_day() == Some(today)
}

/// Strictly before today's calendar day, so a deadline due today is never
/// overdue.
pub fn is_overdue(date: impl CalendarDate, today: NaiveDate) -> bool {
    match date.calendar_day() {
        Some(day) => day < today,
        None => false,
    }
}

pub fn is_upcoming(date: impl CalendarDate, today: NaiveDate) -> bool {
    (1..=UPCOMING_WINDOW_DAYS).contains(&days_until(date, today))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Overdue,
    Today,
    Upcoming,
    Later,
}

/// `None` when the date cannot be read.
pub fn classify(date: impl CalendarDate, today: NaiveDate) -> Option<Urgency> {
    let day = date.calendar_day()?;
    let urgency = if is_today(day, today) {
        Urgency::Today
    } else if is_overdue(day, today) {
        Urgency::Overdue
    } else if is_upcoming(day, today) {
        Urgency::Upcoming
    } else {
        Urgency::Later
    };
    Some(urgency)
}

/// `Mar 5, 2025` style label for detail views.
pub fn format_date(raw: Option<&str>) -> String {
    match raw.map(str::trim).filter(|value| !value.is_empty()) {
        None => "No date".to_string(),
        Some(value) => match parse_date(value) {
            Some(date) => date.format("%b %-d, %Y").to_string(),
            None => "Invalid date".to_string(),
        },
    }
}

/// First and last calendar day of one month, both inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MonthWindow {
    first: NaiveDate,
    last: NaiveDate,
}

impl MonthWindow {
    pub fn containing(date: NaiveDate) -> Self {
        let first = date - Days::new(u64::from(date.day0()));
        let last = (first + Months::new(1)) - Days::new(1);
        Self { first, last }
    }

    /// Parses `YYYY-MM`.
    pub fn parse(raw: &str) -> Option<Self> {
        NaiveDate::parse_from_str(&format!("{}-01", raw.trim()), "%Y-%m-%d")
            .ok()
            .map(Self::containing)
    }

    pub fn current() -> Self {
        Self::containing(today())
    }

    pub fn first(&self) -> NaiveDate {
        self.first
    }

    pub fn last(&self) -> NaiveDate {
        self.last
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        day >= self.first && day <= self.last
    }

    pub fn next(&self) -> Self {
        Self::containing(self.last + Days::new(1))
    }

    pub fn previous(&self) -> Self {
        Self::containing(self.first - Days::new(1))
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let last = self.last;
        self.first.iter_days().take_while(move |day| *day <= last)
    }
}

impl fmt::Display for MonthWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.first.format("%B %Y"))
    }
}

/// The span of deadlines a caller wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    Month(MonthWindow),
    All,
}

impl Window {
    /// `all` or `YYYY-MM`.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.trim().eq_ignore_ascii_case("all") {
            return Some(Self::All);
        }
        MonthWindow::parse(raw).map(Self::Month)
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        match self {
            Self::Month(month) => month.contains(day),
            Self::All => true,
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Month(month) => fmt::Display::fmt(month, f),
            Self::All => f.write_str("all dates"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveTime, Utc};

    fn day(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn parses_supported_shapes() {
        assert_eq!(parse_date("2025-03-05"), Some(day("2025-03-05")));
        assert_eq!(parse_date(" 2025-03-05 "), Some(day("2025-03-05")));
        assert_eq!(parse_date("2025-03-05T09:30:00"), Some(day("2025-03-05")));
        assert_eq!(parse_date("2025-03-05 23:55:00.123"), Some(day("2025-03-05")));
        assert_eq!(parse_date(""), None);
        assert_eq!(parse_date("not a date"), None);
        assert_eq!(parse_date("2025-02-30"), None);
    }

    #[test]
    fn offset_timestamps_land_on_local_day() {
        let instant = Utc::now();
        let raw = instant.to_rfc3339();
        assert_eq!(parse_date(&raw), Some(instant.with_timezone(&Local).date_naive()));

        let postgres = "2025-03-05 12:00:00+00";
        let expected = DateTime::parse_from_rfc3339("2025-03-05T12:00:00+00:00")
            .unwrap()
            .with_timezone(&Local)
            .date_naive();
        assert_eq!(parse_date(postgres), Some(expected));
    }

    #[test]
    fn overdue_and_today_use_calendar_days() {
        let now = today();
        assert!(is_overdue("2020-01-01", now));
        assert!(!is_overdue(day_key(now), now));
        assert!(is_today(day_key(now), now));
        assert!(!is_today("2020-01-01", now));
    }

    #[test]
    fn invalid_dates_never_classify() {
        let now = today();
        assert!(!is_overdue("garbage", now));
        assert!(!is_today("", now));
        assert!(!is_upcoming(None::<&str>, now));
        assert_eq!(days_until("garbage", now), 0);
        assert_eq!(classify("garbage", now), None);
    }

    #[test]
    fn days_until_ignores_time_of_day() {
        let now = day("2025-03-10");
        let tomorrow = now + Duration::days(1);
        let early = tomorrow.and_time(NaiveTime::from_hms_opt(0, 5, 0).unwrap());
        let late = tomorrow.and_time(NaiveTime::from_hms_opt(23, 55, 0).unwrap());
        assert_eq!(days_until(early, now), 1);
        assert_eq!(days_until(late, now), 1);
        assert_eq!(days_until("2025-03-08", now), -2);
    }

    #[test]
    fn upcoming_window_is_seven_days() {
        let now = today();
        let seven = now + Duration::days(7);
        let eight = now + Duration::days(8);
        assert_eq!(days_until(seven, now), 7);
        assert!(is_upcoming(seven, now));
        assert!(!is_upcoming(eight, now));
        assert!(!is_upcoming(now, now));
    }

    #[test]
    fn classification_orders_today_first() {
        let now = day("2025-03-10");
        assert_eq!(classify(now, now), Some(Urgency::Today));
        assert_eq!(classify("2025-03-09", now), Some(Urgency::Overdue));
        assert_eq!(classify("2025-03-17", now), Some(Urgency::Upcoming));
        assert_eq!(classify("2025-03-18", now), Some(Urgency::Later));
    }

    #[test]
    fn month_window_bounds() {
        let march = MonthWindow::containing(day("2025-03-17"));
        assert_eq!(march.first(), day("2025-03-01"));
        assert_eq!(march.last(), day("2025-03-31"));
        assert!(march.contains(day("2025-03-31")));
        assert!(!march.contains(day("2025-04-01")));
        assert_eq!(march.days().count(), 31);
        assert_eq!(march.to_string(), "March 2025");

        let february = MonthWindow::parse("2024-02").unwrap();
        assert_eq!(february.last(), day("2024-02-29"));

        let december = MonthWindow::parse("2025-12").unwrap();
        assert_eq!(december.next().first(), day("2026-01-01"));
        assert_eq!(december.next().previous(), december);
        assert!(MonthWindow::parse("2025-13").is_none());
    }

    #[test]
    fn window_parses_all() {
        assert_eq!(Window::parse("ALL"), Some(Window::All));
        assert!(Window::All.contains(day("1999-01-01")));
        assert!(Window::parse("march").is_none());
    }

    #[test]
    fn formats_labels() {
        assert_eq!(format_date(Some("2025-03-05")), "Mar 5, 2025");
        assert_eq!(format_date(None), "No date");
        assert_eq!(format_date(Some("  ")), "No date");
        assert_eq!(format_date(Some("soon")), "Invalid date");
    }
}
