//! Caller-side bookkeeping for a live calendar screen.
//!
//! Every load gets a ticket from a [`RequestSequence`]; only the response to
//! the newest ticket may replace what is on screen. Change notifications
//! invalidate the cached views they touch and trigger a full reload of the
//! window being shown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

use crate::aggregate::{AggregateOptions, Aggregation, Aggregator};
use crate::dates::Window;
use crate::error::AggregateError;
use crate::source::{ChangeEvent, DeadlineSource, SchoolRoundSource, SourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(u64);

impl Ticket {
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Monotonically increasing request numbers.
#[derive(Debug, Default)]
pub struct RequestSequence {
    latest: AtomicU64,
}

impl RequestSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> Ticket {
        Ticket(self.latest.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn is_latest(&self, ticket: Ticket) -> bool {
        self.latest.load(Ordering::SeqCst) == ticket.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub window: Window,
    pub options: AggregateOptions,
}

impl CacheKey {
    fn reads(&self, event: &ChangeEvent) -> bool {
        match event.source {
            SourceKind::School => self.options.include_school,
            SourceKind::Personal => match (self.options.personal_user(), event.user_id.as_deref()) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(ours), Some(theirs)) => ours == theirs,
            },
        }
    }
}

/// Aggregations already computed, dropped when a relevant change arrives.
#[derive(Debug, Default)]
pub struct CalendarCache {
    entries: HashMap<CacheKey, Aggregation>,
}

impl CalendarCache {
    pub fn get(&self, key: &CacheKey) -> Option<&Aggregation> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: CacheKey, aggregation: Aggregation) {
        self.entries.insert(key, aggregation);
    }

    pub fn invalidate(&mut self) {
        self.entries.clear();
    }

    /// Removes entries built from the source `event` came from; returns how
    /// many were dropped.
    pub fn invalidate_for(&mut self, event: &ChangeEvent) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.reads(event));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One issued load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub ticket: Ticket,
    pub key: CacheKey,
}

impl Request {
    pub async fn run<P, S>(&self, aggregator: &Aggregator<P, S>) -> Result<Aggregation, AggregateError>
    where
        P: DeadlineSource,
        S: SchoolRoundSource,
    {
        aggregator
            .aggregate(self.key.window, &self.key.options)
            .await
    }
}

#[derive(Debug)]
pub enum Outcome {
    /// The response became the visible state.
    Shown,
    /// A newer request was issued meanwhile; the response was discarded.
    Stale,
    /// The newest request failed; the previous view stays on screen.
    Failed(AggregateError),
}

/// What the screen currently shows and how it got there.
#[derive(Debug, Default)]
pub struct CalendarState {
    sequence: RequestSequence,
    cache: CalendarCache,
    current: Option<CacheKey>,
    visible: Option<Aggregation>,
}

impl CalendarState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches to `window`. Serves it from cache when possible, otherwise
    /// returns the request the caller must run.
    pub fn open(&mut self, window: Window, options: AggregateOptions) -> Option<Request> {
        let key = CacheKey { window, options };
        self.current = Some(key.clone());
        let ticket = self.sequence.next();

        if let Some(cached) = self.cache.get(&key) {
            debug!(%window, "serving calendar from cache");
            self.visible = Some(cached.clone());
            return None;
        }

        Some(Request { ticket, key })
    }

    /// Accepts a response, discarding it unless it answers the newest request.
    pub fn complete(
        &mut self,
        request: Request,
        result: Result<Aggregation, AggregateError>,
    ) -> Outcome {
        if !self.sequence.is_latest(request.ticket) {
            debug!(ticket = request.ticket.value(), "discarding stale calendar response");
            return Outcome::Stale;
        }

        match result {
            Ok(aggregation) => {
                self.cache.insert(request.key, aggregation.clone());
                self.visible = Some(aggregation);
                Outcome::Shown
            }
            Err(err) => Outcome::Failed(err),
        }
    }

    /// Drops affected cache entries and, if the visible window read the
    /// changed source, issues a fresh request for it.
    pub fn on_change(&mut self, event: &ChangeEvent) -> Option<Request> {
        let dropped = self.cache.invalidate_for(event);
        let key = self.current.clone()?;
        if !key.reads(event) {
            return None;
        }
        info!(source = %event.source, dropped, window = %key.window, "reloading calendar after change");
        Some(Request {
            ticket: self.sequence.next(),
            key,
        })
    }

    /// Pull-to-refresh: forget everything and reload the current window.
    pub fn refresh(&mut self) -> Option<Request> {
        self.cache.invalidate();
        let key = self.current.clone()?;
        Some(Request {
            ticket: self.sequence.next(),
            key,
        })
    }

    pub fn visible(&self) -> Option<&Aggregation> {
        self.visible.as_ref()
    }

    pub fn cache(&self) -> &CalendarCache {
        &self.cache
    }
}

/// Opens `window` and, when not cached, loads it in place.
pub async fn show<P, S>(
    state: &mut CalendarState,
    aggregator: &Aggregator<P, S>,
    window: Window,
    options: AggregateOptions,
) -> Outcome
where
    P: DeadlineSource,
    S: SchoolRoundSource,
{
    match state.open(window, options) {
        None => Outcome::Shown,
        Some(request) => {
            let result = request.run(aggregator).await;
            state.complete(request, result)
        }
    }
}
