use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use sqlx::postgres::{PgListener, PgRow};
use sqlx::{PgPool, Row};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{SourceUnavailable, ValidationError};
use crate::models::{DeadlineKind, NewDeadline, PersonalDeadline, Priority, SchoolRoundRecord};
use crate::source::{
    ChangeEvent, ChangeFeed, DeadlineSource, SchoolRoundSource, SourceKind, Subscription,
    CHANGE_BUFFER,
};

pub const DEADLINES_CHANNEL: &str = "deadline_calendar_deadlines";
pub const SCHOOLS_CHANNEL: &str = "deadline_calendar_schools";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let schools = vec![
        SchoolRoundRecord {
            school_id: "harbor-business".to_string(),
            school_name: "Harbor School of Business".to_string(),
            location: "Boston, MA".to_string(),
            application_fee: Some("$250".to_string()),
            rounds: [
                Some("2026-09-10".to_string()),
                Some("2027-01-07".to_string()),
                Some("2027-04-02".to_string()),
                None,
                None,
            ],
        },
        SchoolRoundRecord {
            school_id: "lakeshore-mba".to_string(),
            school_name: "Lakeshore MBA".to_string(),
            location: "Chicago, IL".to_string(),
            application_fee: Some("$225".to_string()),
            rounds: [
                Some("2026-10-21".to_string()),
                Some("2027-01-14".to_string()),
                None,
                None,
                None,
            ],
        },
        SchoolRoundRecord {
            school_id: "summit-graduate".to_string(),
            school_name: "Summit Graduate School".to_string(),
            location: "Denver, CO".to_string(),
            application_fee: None,
            rounds: [
                Some("2026-10-28".to_string()),
                Some("TBD".to_string()),
                Some("2027-03-03".to_string()),
                Some("2027-04-21".to_string()),
                Some("2027-05-19".to_string()),
            ],
        },
    ];

    for school in &schools {
        upsert_school(pool, school).await?;
    }

    let deadlines = vec![
        (
            "seed-001",
            NewDeadline {
                user_id: "avery.lee".to_string(),
                title: "GMAT retake".to_string(),
                kind: DeadlineKind::Test,
                priority: Priority::High,
                date: "2026-10-24".to_string(),
                notes: Some("Testing center downtown, 8am".to_string()),
            },
        ),
        (
            "seed-002",
            NewDeadline {
                user_id: "avery.lee".to_string(),
                title: "Ask recommenders".to_string(),
                kind: DeadlineKind::Reminder,
                priority: Priority::Medium,
                date: "2026-10-14".to_string(),
                notes: None,
            },
        ),
        (
            "seed-003",
            NewDeadline {
                user_id: "avery.lee".to_string(),
                title: "Forte fellowship".to_string(),
                kind: DeadlineKind::Scholarship,
                priority: Priority::Low,
                date: "2026-11-02".to_string(),
                notes: None,
            },
        ),
    ];

    for (source_key, deadline) in &deadlines {
        insert_deadline(pool, deadline, Some(*source_key)).await?;
    }

    Ok(())
}

async fn upsert_school(pool: &PgPool, school: &SchoolRoundRecord) -> anyhow::Result<bool> {
    let [r1, r2, r3, r4, r5] = &school.rounds;
    let result = sqlx::query(
        r#"
        INSERT INTO deadline_calendar.schools
        (id, business_school, location, application_fee,
         r1_deadline, r2_deadline, r3_deadline, r4_deadline, r5_deadline)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (id) DO UPDATE
        SET business_school = EXCLUDED.business_school,
            location = EXCLUDED.location,
            application_fee = EXCLUDED.application_fee,
            r1_deadline = EXCLUDED.r1_deadline,
            r2_deadline = EXCLUDED.r2_deadline,
            r3_deadline = EXCLUDED.r3_deadline,
            r4_deadline = EXCLUDED.r4_deadline,
            r5_deadline = EXCLUDED.r5_deadline,
            updated_at = now()
        "#,
    )
    .bind(&school.school_id)
    .bind(&school.school_name)
    .bind(&school.location)
    .bind(&school.application_fee)
    .bind(r1)
    .bind(r2)
    .bind(r3)
    .bind(r4)
    .bind(r5)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Inserts a validated deadline. Returns `None` when `source_key` was
/// already imported.
async fn insert_deadline(
    pool: &PgPool,
    deadline: &NewDeadline,
    source_key: Option<&str>,
) -> anyhow::Result<Option<Uuid>> {
    let date = deadline.validate()?;
    let id = Uuid::new_v4();

    let result = sqlx::query(
        r#"
        INSERT INTO deadline_calendar.deadlines
        (id, user_id, title, deadline_type, priority, deadline_date, notes, source_key)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (source_key) DO NOTHING
        "#,
    )
    .bind(id)
    .bind(deadline.user_id.trim())
    .bind(deadline.title.trim())
    .bind(deadline.kind.as_str())
    .bind(deadline.priority.as_str())
    .bind(date)
    .bind(&deadline.notes)
    .bind(source_key)
    .execute(pool)
    .await?;

    Ok((result.rows_affected() > 0).then_some(id))
}

pub async fn add_deadline(pool: &PgPool, deadline: &NewDeadline) -> anyhow::Result<Uuid> {
    insert_deadline(pool, deadline, None)
        .await?
        .context("deadline was not inserted")
}

/// Returns `false` when no deadline has that id.
pub async fn set_completed(pool: &PgPool, id: Uuid, completed: bool) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE deadline_calendar.deadlines
        SET completed = $2,
            completed_at = CASE WHEN $2 THEN now() ELSE NULL END,
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(completed)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

fn personal_from_row(row: &PgRow) -> PersonalDeadline {
    let kind: String = row.get("deadline_type");
    let priority: String = row.get("priority");
    PersonalDeadline {
        id: row.get("id"),
        user_id: row.get("user_id"),
        title: row.get("title"),
        kind: DeadlineKind::parse(&kind),
        priority: Priority::parse(&priority).unwrap_or(Priority::Medium),
        date: row.get("deadline_date"),
        notes: row.get("notes"),
        completed: row.get("completed"),
    }
}

fn school_from_row(row: &PgRow) -> SchoolRoundRecord {
    SchoolRoundRecord {
        school_id: row.get("id"),
        school_name: row.get("business_school"),
        location: row.get("location"),
        application_fee: row.get("application_fee"),
        rounds: [
            row.get("r1_deadline"),
            row.get("r2_deadline"),
            row.get("r3_deadline"),
            row.get("r4_deadline"),
            row.get("r5_deadline"),
        ],
    }
}

pub async fn fetch_personal_deadlines(
    pool: &PgPool,
    user_id: &str,
) -> Result<Vec<PersonalDeadline>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id::text AS id, user_id, title, deadline_type, priority, \
         deadline_date::text AS deadline_date, notes, completed \
         FROM deadline_calendar.deadlines \
         WHERE user_id = $1 \
         ORDER BY deadline_date, created_at",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(personal_from_row).collect())
}

pub async fn fetch_schools(pool: &PgPool) -> Result<Vec<SchoolRoundRecord>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, business_school, location, application_fee, \
         r1_deadline, r2_deadline, r3_deadline, r4_deadline, r5_deadline \
         FROM deadline_calendar.schools \
         ORDER BY business_school",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(school_from_row).collect())
}

#[derive(Debug, Deserialize)]
struct DeadlineCsvRow {
    user_id: String,
    title: String,
    deadline_type: String,
    priority: String,
    deadline_date: String,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    source_key: Option<String>,
}

impl DeadlineCsvRow {
    fn into_new_deadline(self) -> anyhow::Result<(NewDeadline, Option<String>)> {
        let priority = Priority::parse(&self.priority)
            .ok_or_else(|| ValidationError::UnknownPriority(self.priority.clone()))?;
        let deadline = NewDeadline {
            user_id: self.user_id,
            title: self.title,
            kind: DeadlineKind::parse(&self.deadline_type),
            priority,
            date: self.deadline_date,
            notes: self.notes.filter(|notes| !notes.trim().is_empty()),
        };
        deadline.validate()?;
        Ok((deadline, self.source_key.filter(|key| !key.trim().is_empty())))
    }
}

#[derive(Debug, Deserialize)]
struct SchoolCsvRow {
    school_id: String,
    business_school: String,
    #[serde(default)]
    location: String,
    #[serde(default)]
    application_fee: Option<String>,
    #[serde(default)]
    r1_deadline: Option<String>,
    #[serde(default)]
    r2_deadline: Option<String>,
    #[serde(default)]
    r3_deadline: Option<String>,
    #[serde(default)]
    r4_deadline: Option<String>,
    #[serde(default)]
    r5_deadline: Option<String>,
}

impl From<SchoolCsvRow> for SchoolRoundRecord {
    fn from(row: SchoolCsvRow) -> Self {
        let blank_to_none = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
        SchoolRoundRecord {
            school_id: row.school_id,
            school_name: row.business_school,
            location: row.location,
            application_fee: blank_to_none(row.application_fee),
            rounds: [
                blank_to_none(row.r1_deadline),
                blank_to_none(row.r2_deadline),
                blank_to_none(row.r3_deadline),
                blank_to_none(row.r4_deadline),
                blank_to_none(row.r5_deadline),
            ],
        }
    }
}

fn read_deadline_rows<R: std::io::Read>(
    reader: &mut csv::Reader<R>,
) -> anyhow::Result<Vec<(NewDeadline, String)>> {
    let mut rows = Vec::new();
    for (index, result) in reader.deserialize::<DeadlineCsvRow>().enumerate() {
        let line = index + 2;
        let (deadline, source_key) = result
            .map_err(anyhow::Error::from)
            .and_then(DeadlineCsvRow::into_new_deadline)
            .with_context(|| format!("invalid deadline on line {line}"))?;
        let source_key = source_key.unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));
        rows.push((deadline, source_key));
    }
    Ok(rows)
}

fn read_school_rows<R: std::io::Read>(
    reader: &mut csv::Reader<R>,
) -> anyhow::Result<Vec<SchoolRoundRecord>> {
    let mut schools = Vec::new();
    for (index, result) in reader.deserialize::<SchoolCsvRow>().enumerate() {
        let row = result.with_context(|| format!("invalid school on line {}", index + 2))?;
        schools.push(SchoolRoundRecord::from(row));
    }
    Ok(schools)
}

pub async fn import_deadlines_csv(pool: &PgPool, csv_path: &Path) -> anyhow::Result<usize> {
    let mut reader = csv::Reader::from_path(csv_path)?;
    let rows = read_deadline_rows(&mut reader)?;
    let mut inserted = 0usize;

    for (deadline, source_key) in &rows {
        if insert_deadline(pool, deadline, Some(source_key.as_str())).await?.is_some() {
            inserted += 1;
        }
    }

    Ok(inserted)
}

pub async fn import_schools_csv(pool: &PgPool, csv_path: &Path) -> anyhow::Result<usize> {
    let mut reader = csv::Reader::from_path(csv_path)?;
    let schools = read_school_rows(&mut reader)?;
    let mut written = 0usize;

    for school in &schools {
        if upsert_school(pool, school).await? {
            written += 1;
        }
    }

    Ok(written)
}

/// Both calendar sources backed by one Postgres pool.
#[derive(Debug, Clone)]
pub struct PgSource {
    pool: PgPool,
}

impl PgSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn unavailable(kind: SourceKind, err: sqlx::Error) -> SourceUnavailable {
    SourceUnavailable::new(kind, err.to_string())
}

impl DeadlineSource for PgSource {
    async fn list_personal_deadlines(
        &self,
        user_id: &str,
    ) -> Result<Vec<PersonalDeadline>, SourceUnavailable> {
        fetch_personal_deadlines(&self.pool, user_id)
            .await
            .map_err(|err| unavailable(SourceKind::Personal, err))
    }
}

impl SchoolRoundSource for PgSource {
    async fn list_schools_with_rounds(&self) -> Result<Vec<SchoolRoundRecord>, SourceUnavailable> {
        fetch_schools(&self.pool)
            .await
            .map_err(|err| unavailable(SourceKind::School, err))
    }
}

impl ChangeFeed for PgSource {
    /// Listens on the table's NOTIFY channel. The deadlines trigger sends the
    /// owning user id as payload; the schools trigger sends nothing.
    async fn subscribe(
        &self,
        source: SourceKind,
        user_id: Option<&str>,
    ) -> Result<Subscription, SourceUnavailable> {
        let channel = match source {
            SourceKind::Personal => DEADLINES_CHANNEL,
            SourceKind::School => SCHOOLS_CHANNEL,
        };

        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|err| unavailable(source, err))?;
        listener
            .listen(channel)
            .await
            .map_err(|err| unavailable(source, err))?;

        let (sender, receiver) = mpsc::channel(CHANGE_BUFFER);
        let wanted = user_id.map(str::to_string);
        let task = tokio::spawn(async move {
            loop {
                let event = match listener.try_recv().await {
                    Ok(Some(notification)) => {
                        let Some(event) = notification_event(source, notification.payload(), wanted.as_deref())
                        else {
                            continue;
                        };
                        debug!(%channel, user = ?event.user_id, "row change received");
                        event
                    }
                    // Notifications sent while disconnected are lost; the next
                    // try_recv reconnects.
                    Ok(None) => {
                        warn!(%channel, "change feed reconnecting, reloading");
                        reconnect_event(source, wanted.as_deref())
                    }
                    Err(err) => {
                        warn!(%channel, error = %err, "change feed closed");
                        break;
                    }
                };
                match sender.try_send(event) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
        });

        Ok(Subscription::new(source, receiver).with_task(task))
    }
}

/// Event for a NOTIFY payload, or `None` when it belongs to another user.
fn notification_event(source: SourceKind, payload: &str, wanted: Option<&str>) -> Option<ChangeEvent> {
    let payload = payload.trim();
    let changed_user = (!payload.is_empty()).then(|| payload.to_string());
    if let (Some(wanted), Some(changed)) = (wanted, changed_user.as_deref()) {
        if wanted != changed {
            return None;
        }
    }
    Some(ChangeEvent {
        source,
        user_id: changed_user,
    })
}

/// Event standing in for whatever changed while the listener was down.
fn reconnect_event(source: SourceKind, wanted: Option<&str>) -> ChangeEvent {
    ChangeEvent {
        source,
        user_id: wanted.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_rows_validate_and_keep_source_keys() {
        let data = "\
user_id,title,deadline_type,priority,deadline_date,notes,source_key
avery.lee,GMAT retake,test,high,2026-10-24,Bring ID,gmat-1
avery.lee,Essay draft,essay,Low,2026-11-01,,
";
        let mut reader = csv::Reader::from_reader(data.as_bytes());
        let rows = read_deadline_rows(&mut reader).unwrap();
        assert_eq!(rows.len(), 2);

        let (gmat, key) = &rows[0];
        assert_eq!(gmat.kind, DeadlineKind::Test);
        assert_eq!(gmat.priority, Priority::High);
        assert_eq!(gmat.notes.as_deref(), Some("Bring ID"));
        assert_eq!(key, "gmat-1");

        let (essay, key) = &rows[1];
        assert_eq!(essay.kind, DeadlineKind::Other("essay".to_string()));
        assert_eq!(essay.priority, Priority::Low);
        assert!(essay.notes.is_none());
        assert!(key.starts_with("import-"));
    }

    #[test]
    fn invalid_deadline_rows_name_their_line() {
        let data = "\
user_id,title,deadline_type,priority,deadline_date,notes,source_key
avery.lee,GMAT,test,high,2026-10-24,,
avery.lee,Broken,test,high,10/24/2026,,
";
        let mut reader = csv::Reader::from_reader(data.as_bytes());
        let err = read_deadline_rows(&mut reader).unwrap_err();
        assert_eq!(err.to_string(), "invalid deadline on line 3");

        let data = "\
user_id,title,deadline_type,priority,deadline_date,notes,source_key
avery.lee,GMAT,test,urgent,2026-10-24,,
";
        let mut reader = csv::Reader::from_reader(data.as_bytes());
        assert!(read_deadline_rows(&mut reader).is_err());
    }

    #[test]
    fn school_rows_treat_blank_rounds_as_unpublished() {
        let data = "\
school_id,business_school,location,application_fee,r1_deadline,r2_deadline,r3_deadline,r4_deadline,r5_deadline
harbor,Harbor School of Business,\"Boston, MA\",,2026-09-10,,TBD,,
";
        let mut reader = csv::Reader::from_reader(data.as_bytes());
        let schools = read_school_rows(&mut reader).unwrap();
        assert_eq!(schools.len(), 1);

        let school = &schools[0];
        assert_eq!(school.school_name, "Harbor School of Business");
        assert_eq!(school.location, "Boston, MA");
        assert!(school.application_fee.is_none());
        assert_eq!(school.rounds[0].as_deref(), Some("2026-09-10"));
        assert!(school.rounds[1].is_none());
        assert_eq!(school.rounds[2].as_deref(), Some("TBD"));
    }

    #[test]
    fn notifications_for_other_users_are_skipped() {
        let event = notification_event(SourceKind::Personal, " avery.lee ", Some("avery.lee")).unwrap();
        assert_eq!(event.user_id.as_deref(), Some("avery.lee"));
        assert!(notification_event(SourceKind::Personal, "jordan.kim", Some("avery.lee")).is_none());

        let school = notification_event(SourceKind::School, "", Some("avery.lee")).unwrap();
        assert_eq!(school.source, SourceKind::School);
        assert!(school.user_id.is_none());
    }

    #[test]
    fn lost_connection_reloads_the_watched_user() {
        let event = reconnect_event(SourceKind::Personal, Some("avery.lee"));
        assert_eq!(event.source, SourceKind::Personal);
        assert_eq!(event.user_id.as_deref(), Some("avery.lee"));
        assert!(reconnect_event(SourceKind::School, None).user_id.is_none());
    }
}
