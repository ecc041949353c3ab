use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use deadline_calendar::aggregate::{month_of, AggregateOptions, Aggregation, Aggregator};
use deadline_calendar::dates::{self, classify, parse_date, MonthWindow, Urgency, Window};
use deadline_calendar::db::{self, PgSource};
use deadline_calendar::error::{AggregateError, ValidationError};
use deadline_calendar::models::{DeadlineKind, NewDeadline, Priority};
use deadline_calendar::refresh::{CalendarState, Outcome, Request};
use deadline_calendar::report;
use deadline_calendar::source::{ChangeEvent, ChangeFeed, SourceKind, Subscription};
use deadline_calendar::timeline::{highlight, Timeline};

#[derive(Parser)]
#[command(name = "deadline-calendar")]
#[command(about = "Admissions deadline calendar: personal reminders and school rounds", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

fn parse_window(raw: &str) -> Result<Window, String> {
    if raw.trim().eq_ignore_ascii_case("current") {
        return Ok(Window::Month(MonthWindow::current()));
    }
    Window::parse(raw).ok_or_else(|| format!("expected YYYY-MM, `current` or `all`, got {raw:?}"))
}

#[derive(Args, Clone)]
struct Scope {
    /// Month to show as YYYY-MM, `current` or `all`
    #[arg(long, default_value = "current", value_parser = parse_window)]
    month: Window,
    /// Load this user's personal deadlines
    #[arg(long)]
    user_id: Option<String>,
    /// Leave personal deadlines out
    #[arg(long)]
    no_personal: bool,
    /// Leave school round deadlines out
    #[arg(long)]
    no_school: bool,
}

impl Scope {
    fn options(&self) -> AggregateOptions {
        AggregateOptions {
            include_personal: !self.no_personal,
            include_school: !self.no_school,
            user_id: self.user_id.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import personal deadlines from a CSV file
    ImportDeadlines {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Import or update school round dates from a CSV file
    ImportSchools {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Add a personal deadline
    Add {
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "application")]
        kind: String,
        #[arg(long, default_value = "medium")]
        priority: String,
        /// Due date as YYYY-MM-DD
        #[arg(long)]
        date: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Mark a personal deadline as done (or not done with --undo)
    Complete {
        #[arg(long)]
        id: Uuid,
        #[arg(long)]
        undo: bool,
    },
    /// Show the deadlines of a month, grouped by day
    Calendar {
        #[command(flatten)]
        scope: Scope,
        /// Print the aggregated view as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the deadlines falling on one day
    Day {
        /// Day as YYYY-MM-DD
        #[arg(long)]
        date: String,
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long)]
        no_personal: bool,
        #[arg(long)]
        no_school: bool,
    },
    /// List a user's deadlines in order with overdue and upcoming sections
    Timeline {
        #[arg(long)]
        user_id: String,
        /// Include school rounds alongside personal deadlines
        #[arg(long)]
        with_schools: bool,
    },
    /// Generate a markdown report
    Report {
        #[command(flatten)]
        scope: Scope,
        #[arg(long, default_value = "calendar.md")]
        out: PathBuf,
    },
    /// Keep the calendar on screen, reloading whenever deadlines change
    Watch {
        #[command(flatten)]
        scope: Scope,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let source = PgSource::new(pool.clone());
    let aggregator = Aggregator::new(source.clone(), source.clone());
    let today = dates::today();

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::ImportDeadlines { csv } => {
            let inserted = db::import_deadlines_csv(&pool, &csv).await?;
            println!("Inserted {inserted} deadlines from {}.", csv.display());
        }
        Commands::ImportSchools { csv } => {
            let written = db::import_schools_csv(&pool, &csv).await?;
            println!("Updated {written} schools from {}.", csv.display());
        }
        Commands::Add {
            user_id,
            title,
            kind,
            priority,
            date,
            notes,
        } => {
            let priority =
                Priority::parse(&priority).ok_or(ValidationError::UnknownPriority(priority))?;
            let deadline = NewDeadline {
                user_id,
                title,
                kind: DeadlineKind::parse(&kind),
                priority,
                date,
                notes,
            };
            let id = db::add_deadline(&pool, &deadline).await?;
            println!("Deadline added ({id}).");
        }
        Commands::Complete { id, undo } => {
            if !db::set_completed(&pool, id, !undo).await? {
                anyhow::bail!("no deadline with id {id}");
            }
            println!("Deadline {id} marked {}.", if undo { "open" } else { "done" });
        }
        Commands::Calendar { scope, json } => {
            let aggregation = aggregator.aggregate(scope.month, &scope.options()).await?;
            print_warnings(&aggregation);
            if json {
                println!("{}", serde_json::to_string_pretty(&aggregation)?);
            } else {
                print_calendar(&aggregation, today);
            }
        }
        Commands::Day {
            date,
            user_id,
            no_personal,
            no_school,
        } => {
            let day = parse_date(&date).with_context(|| format!("not a date: {date:?}"))?;
            let options = AggregateOptions {
                include_personal: !no_personal,
                include_school: !no_school,
                user_id,
            };
            let window = month_of(day);
            let aggregation = aggregator.aggregate(window, &options).await?;
            print_warnings(&aggregation);

            let deadlines = aggregation.deadlines_on(day);
            if deadlines.is_empty() {
                println!("No deadlines on {}.", dates::format_date(Some(date.as_str())));
                return Ok(());
            }
            println!("{}:", dates::format_date(Some(date.as_str())));
            for deadline in deadlines {
                println!(
                    "- [{}] {}{}",
                    deadline.category().as_str(),
                    deadline.display_title,
                    deadline
                        .display_subtitle
                        .as_deref()
                        .map(|subtitle| format!(" ({subtitle})"))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Timeline {
            user_id,
            with_schools,
        } => {
            let options = AggregateOptions {
                include_personal: true,
                include_school: with_schools,
                user_id: Some(user_id),
            };
            let aggregation = aggregator.aggregate(Window::All, &options).await?;
            print_warnings(&aggregation);
            print_timeline(&Timeline::build(aggregation.view.into_items(), today), today);
        }
        Commands::Report { scope, out } => {
            let aggregation = aggregator.aggregate(scope.month, &scope.options()).await?;
            let report = report::build_report(&aggregation, today);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Watch { scope } => {
            watch(source, Arc::new(aggregator), scope).await?;
        }
    }

    Ok(())
}

fn print_warnings(aggregation: &Aggregation) {
    for warning in &aggregation.warnings {
        eprintln!("Warning: {warning}; showing what could be loaded.");
    }
}

fn urgency_label(urgency: Option<Urgency>) -> &'static str {
    match urgency {
        Some(Urgency::Overdue) => " (overdue)",
        Some(Urgency::Today) => " (today)",
        Some(Urgency::Upcoming) => " (this week)",
        Some(Urgency::Later) | None => "",
    }
}

fn print_calendar(aggregation: &Aggregation, today: chrono::NaiveDate) {
    let view = &aggregation.view;
    println!("{} ({} deadlines)", aggregation.window, view.len());

    if view.is_empty() {
        println!("No deadlines in this window.");
        return;
    }

    for (day, deadlines) in view.index_by_day() {
        println!("{day}{}", urgency_label(classify(day, today)));
        for deadline in deadlines {
            println!(
                "  - [{}] {}{}",
                deadline.colour.name(),
                deadline.display_title,
                if deadline.is_important { " *" } else { "" }
            );
        }
    }
}

fn print_timeline(timeline: &Timeline, today: chrono::NaiveDate) {
    if timeline.is_empty() {
        println!("No deadlines yet.");
        return;
    }

    if !timeline.overdue.is_empty() {
        println!("Overdue ({}):", timeline.overdue.len());
        for deadline in &timeline.overdue {
            println!("- {} ({})", deadline.display_title, deadline.date);
        }
    }

    if !timeline.upcoming.is_empty() {
        println!("Upcoming (next 7 days):");
        for deadline in &timeline.upcoming {
            println!(
                "- {} in {} days",
                deadline.display_title,
                dates::days_until(deadline.date, today)
            );
        }
    }

    println!("All deadlines:");
    for deadline in &timeline.all {
        let accent = highlight(deadline, today)
            .map(|colour| format!(" [{}]", colour.name()))
            .unwrap_or_default();
        let done = if deadline.is_completed() { "✓ " } else { "" };
        println!(
            "- {done}{} {} {}/{}{accent}",
            deadline.date,
            deadline.display_title,
            deadline.priority(),
            deadline.category().as_str()
        );
    }
}

type Load = (Request, Result<Aggregation, AggregateError>);

fn spawn_load(
    inflight: &mut JoinSet<Load>,
    aggregator: &Arc<Aggregator<PgSource, PgSource>>,
    request: Request,
) {
    let aggregator = Arc::clone(aggregator);
    inflight.spawn(async move {
        let result = request.run(&aggregator).await;
        (request, result)
    });
}

async fn open_feed(
    source: &PgSource,
    kind: SourceKind,
    user_id: Option<&str>,
) -> Option<Subscription> {
    match source.subscribe(kind, user_id).await {
        Ok(subscription) => Some(subscription),
        Err(err) => {
            warn!(source = %kind, error = %err, "live updates unavailable, refresh manually");
            None
        }
    }
}

async fn next_change(feed: &mut Option<Subscription>) -> Option<ChangeEvent> {
    match feed {
        Some(subscription) => subscription.changed().await,
        None => std::future::pending().await,
    }
}

async fn watch(
    source: PgSource,
    aggregator: Arc<Aggregator<PgSource, PgSource>>,
    scope: Scope,
) -> anyhow::Result<()> {
    let options = scope.options();
    let mut personal_feed = match options.personal_user() {
        Some(user_id) => open_feed(&source, SourceKind::Personal, Some(user_id)).await,
        None => None,
    };
    let mut school_feed = if options.include_school {
        open_feed(&source, SourceKind::School, None).await
    } else {
        None
    };

    let mut state = CalendarState::new();
    let mut inflight = JoinSet::new();
    if let Some(request) = state.open(scope.month, options) {
        spawn_load(&mut inflight, &aggregator, request);
    }

    loop {
        tokio::select! {
            change = next_change(&mut personal_feed) => match change {
                Some(event) => {
                    if let Some(request) = state.on_change(&event) {
                        spawn_load(&mut inflight, &aggregator, request);
                    }
                }
                None => {
                    warn!("personal deadline feed closed");
                    personal_feed = None;
                }
            },
            change = next_change(&mut school_feed) => match change {
                Some(event) => {
                    if let Some(request) = state.on_change(&event) {
                        spawn_load(&mut inflight, &aggregator, request);
                    }
                }
                None => {
                    warn!("school deadline feed closed");
                    school_feed = None;
                }
            },
            Some(joined) = inflight.join_next() => {
                let (request, result) = joined?;
                match state.complete(request, result) {
                    Outcome::Shown => {
                        if let Some(aggregation) = state.visible() {
                            print_warnings(aggregation);
                            print_calendar(aggregation, dates::today());
                        }
                    }
                    Outcome::Stale => {}
                    Outcome::Failed(err) => eprintln!("Error: {err}; press Ctrl-C to stop or wait for the next change."),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("stopping watch");
                break;
            }
        }
    }

    Ok(())
}
