use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

pub const UNTITLED_DEADLINE: &str = "Untitled Deadline";

/// Kind of a personal deadline. Unrecognised kinds are kept as `Other`.
///
/// Serde goes through [`DeadlineKind::parse`], so stored rows and CSV input
/// resolve to the same kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeadlineKind {
    Application,
    Scholarship,
    Test,
    Reminder,
    Interview,
    Other(String),
}

impl DeadlineKind {
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        match value.to_ascii_lowercase().as_str() {
            "application" => Self::Application,
            "scholarship" => Self::Scholarship,
            "test" => Self::Test,
            "reminder" => Self::Reminder,
            "interview" => Self::Interview,
            _ => Self::Other(value.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Application => "application",
            Self::Scholarship => "scholarship",
            Self::Test => "test",
            Self::Reminder => "reminder",
            Self::Interview => "interview",
            Self::Other(value) => value,
        }
    }

    pub fn colour(&self) -> Colour {
        match self {
            Self::Application => Colour::Red,
            Self::Scholarship => Colour::Blue,
            Self::Test => Colour::Yellow,
            Self::Interview => Colour::Green,
            Self::Reminder => Colour::Purple,
            Self::Other(_) => Colour::Gray,
        }
    }
}

impl From<String> for DeadlineKind {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<DeadlineKind> for String {
    fn from(kind: DeadlineKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for DeadlineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    /// Sort rank used by the timeline: high first.
    pub fn rank(self) -> u8 {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }

    pub fn colour(self) -> Colour {
        match self {
            Self::High => Colour::Red,
            Self::Medium => Colour::Yellow,
            Self::Low => Colour::Green,
        }
    }
}

impl TryFrom<String> for Priority {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or(ValidationError::UnknownPriority(value))
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Colour {
    Red,
    Blue,
    Yellow,
    Green,
    Purple,
    Gray,
}

impl Colour {
    pub fn name(self) -> &'static str {
        match self {
            Self::Red => "red",
            Self::Blue => "blue",
            Self::Yellow => "yellow",
            Self::Green => "green",
            Self::Purple => "purple",
            Self::Gray => "gray",
        }
    }

    pub fn hex(self) -> &'static str {
        match self {
            Self::Red => "#ef4444",
            Self::Blue => "#3b82f6",
            Self::Yellow => "#f59e0b",
            Self::Green => "#10b981",
            Self::Purple => "#8b5cf6",
            Self::Gray => "#6b7280",
        }
    }
}

/// A reminder authored by a single user.
///
/// `date` is kept exactly as the source delivered it; parsing happens during
/// aggregation so a malformed row can be dropped instead of failing the load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonalDeadline {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub kind: DeadlineKind,
    pub priority: Priority,
    pub date: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub completed: bool,
}

impl PersonalDeadline {
    pub fn display_title(&self) -> &str {
        let title = self.title.trim();
        if title.is_empty() {
            UNTITLED_DEADLINE
        } else {
            title
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RoundLabel {
    R1,
    R2,
    R3,
    R4,
    R5,
}

impl RoundLabel {
    pub const ALL: [RoundLabel; 5] = [Self::R1, Self::R2, Self::R3, Self::R4, Self::R5];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::R1 => "R1",
            Self::R2 => "R2",
            Self::R3 => "R3",
            Self::R4 => "R4",
            Self::R5 => "R5",
        }
    }

    /// Early rounds carry most of the seats.
    pub fn is_important(self) -> bool {
        matches!(self, Self::R1 | Self::R2)
    }
}

impl fmt::Display for RoundLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A catalog school with up to five published round dates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchoolRoundRecord {
    pub school_id: String,
    pub school_name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub application_fee: Option<String>,
    pub rounds: [Option<String>; 5],
}

impl SchoolRoundRecord {
    pub fn rounds(&self) -> impl Iterator<Item = (RoundLabel, Option<&str>)> + '_ {
        RoundLabel::ALL
            .into_iter()
            .zip(self.rounds.iter())
            .map(|(label, date)| (label, date.as_deref()))
    }
}

/// One round of one school, materialised once its date parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchoolRound {
    pub school_id: String,
    pub school_name: String,
    pub round: RoundLabel,
    pub date: NaiveDate,
    pub location: String,
    pub application_fee: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Personal,
    School,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Personal => "personal",
            Self::School => "school",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "category", rename_all = "lowercase")]
pub enum DeadlineOrigin {
    Personal(PersonalDeadline),
    School(SchoolRound),
}

/// The shape both sources are normalised into for calendar rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregatedDeadline {
    pub id: String,
    pub date: NaiveDate,
    pub display_title: String,
    pub display_subtitle: Option<String>,
    pub colour: Colour,
    pub is_important: bool,
    pub origin: DeadlineOrigin,
}

impl AggregatedDeadline {
    pub fn category(&self) -> Category {
        match self.origin {
            DeadlineOrigin::Personal(_) => Category::Personal,
            DeadlineOrigin::School(_) => Category::School,
        }
    }

    /// School to open from a detail view, if this entry came from the catalog.
    pub fn school_id(&self) -> Option<&str> {
        match &self.origin {
            DeadlineOrigin::School(round) => Some(&round.school_id),
            DeadlineOrigin::Personal(_) => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        match &self.origin {
            DeadlineOrigin::Personal(deadline) => deadline.completed,
            DeadlineOrigin::School(_) => false,
        }
    }

    /// School rounds rank as medium priority on the timeline.
    pub fn priority(&self) -> Priority {
        match &self.origin {
            DeadlineOrigin::Personal(deadline) => deadline.priority,
            DeadlineOrigin::School(_) => Priority::Medium,
        }
    }
}

/// A personal deadline about to be created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDeadline {
    pub user_id: String,
    pub title: String,
    pub kind: DeadlineKind,
    pub priority: Priority,
    pub date: String,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewDeadline {
    /// Checks the fields a stored deadline cannot do without and returns the
    /// parsed date. Only strict `YYYY-MM-DD` is accepted here.
    pub fn validate(&self) -> Result<NaiveDate, ValidationError> {
        if self.user_id.trim().is_empty() {
            return Err(ValidationError::MissingUser);
        }
        if self.title.trim().is_empty() {
            return Err(ValidationError::MissingTitle);
        }

        let date = self.date.trim();
        if date.is_empty() {
            return Err(ValidationError::MissingDate);
        }
        if !is_iso_date_shape(date) {
            return Err(ValidationError::DateFormat);
        }
        NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| ValidationError::InvalidDate)
    }
}

fn is_iso_date_shape(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 10
        && bytes.iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
}
