use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::SourceUnavailable;
use crate::models::{PersonalDeadline, SchoolRoundRecord};

/// Notifications buffered per subscriber. Overflow is dropped: one pending
/// event already forces a full refresh.
pub const CHANGE_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Personal,
    School,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Personal => "personal",
            Self::School => "school",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-user reminders.
pub trait DeadlineSource {
    fn list_personal_deadlines(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Vec<PersonalDeadline>, SourceUnavailable>> + Send;
}

/// The platform-wide school catalog; readable without signing in.
pub trait SchoolRoundSource {
    fn list_schools_with_rounds(
        &self,
    ) -> impl Future<Output = Result<Vec<SchoolRoundRecord>, SourceUnavailable>> + Send;
}

/// Row-change notifications. Sources without one are refreshed by hand.
pub trait ChangeFeed {
    /// For [`SourceKind::Personal`], `user_id` narrows events to one user.
    fn subscribe(
        &self,
        source: SourceKind,
        user_id: Option<&str>,
    ) -> impl Future<Output = Result<Subscription, SourceUnavailable>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub source: SourceKind,
    pub user_id: Option<String>,
}

/// A live subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    source: SourceKind,
    receiver: mpsc::Receiver<ChangeEvent>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(source: SourceKind, receiver: mpsc::Receiver<ChangeEvent>) -> Self {
        Self {
            source,
            receiver,
            task: None,
        }
    }

    /// Ties a forwarding task to this subscription's lifetime.
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    pub fn source(&self) -> SourceKind {
        self.source
    }

    /// Waits for the next change; `None` once the feed has closed.
    pub async fn changed(&mut self) -> Option<ChangeEvent> {
        self.receiver.recv().await
    }

    pub fn try_changed(&mut self) -> Option<ChangeEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Debug)]
struct Subscriber {
    source: SourceKind,
    user_id: Option<String>,
    sender: mpsc::Sender<ChangeEvent>,
}

impl Subscriber {
    fn wants(&self, event: &ChangeEvent) -> bool {
        if self.source != event.source {
            return false;
        }
        match (&self.user_id, &event.user_id) {
            (Some(wanted), Some(actual)) => wanted == actual,
            _ => true,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    deadlines: Vec<PersonalDeadline>,
    schools: Vec<SchoolRoundRecord>,
    failing: HashSet<SourceKind>,
    subscribers: Vec<Subscriber>,
    personal_calls: usize,
    school_calls: usize,
}

/// In-process implementation of both sources and their change feed, used
/// for fixtures and tests.
#[derive(Clone, Debug, Default)]
pub struct MemorySource {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(deadlines: Vec<PersonalDeadline>, schools: Vec<SchoolRoundRecord>) -> Self {
        let source = Self::new();
        {
            let mut state = source.lock();
            state.deadlines = deadlines;
            state.schools = schools;
        }
        source
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or replaces a deadline by id.
    pub fn put_deadline(&self, deadline: PersonalDeadline) {
        let user_id = deadline.user_id.clone();
        let mut state = self.lock();
        match state.deadlines.iter_mut().find(|d| d.id == deadline.id) {
            Some(existing) => *existing = deadline,
            None => state.deadlines.push(deadline),
        }
        notify(&mut state, SourceKind::Personal, Some(user_id));
    }

    pub fn remove_deadline(&self, id: &str) -> bool {
        let mut state = self.lock();
        let Some(position) = state.deadlines.iter().position(|d| d.id == id) else {
            return false;
        };
        let removed = state.deadlines.remove(position);
        notify(&mut state, SourceKind::Personal, Some(removed.user_id));
        true
    }

    pub fn set_completed(&self, id: &str, completed: bool) -> bool {
        let mut state = self.lock();
        let Some(deadline) = state.deadlines.iter_mut().find(|d| d.id == id) else {
            return false;
        };
        deadline.completed = completed;
        let user_id = deadline.user_id.clone();
        notify(&mut state, SourceKind::Personal, Some(user_id));
        true
    }

    /// Inserts or replaces a school by id.
    pub fn put_school(&self, school: SchoolRoundRecord) {
        let mut state = self.lock();
        match state.schools.iter_mut().find(|s| s.school_id == school.school_id) {
            Some(existing) => *existing = school,
            None => state.schools.push(school),
        }
        notify(&mut state, SourceKind::School, None);
    }

    /// Makes every later fetch from `source` fail until [`MemorySource::recover`].
    pub fn fail(&self, source: SourceKind) {
        self.lock().failing.insert(source);
    }

    pub fn recover(&self, source: SourceKind) {
        self.lock().failing.remove(&source);
    }

    /// Number of fetches issued against `source` so far.
    pub fn calls(&self, source: SourceKind) -> usize {
        let state = self.lock();
        match source {
            SourceKind::Personal => state.personal_calls,
            SourceKind::School => state.school_calls,
        }
    }
}

fn notify(state: &mut MemoryState, source: SourceKind, user_id: Option<String>) {
    let event = ChangeEvent { source, user_id };
    state.subscribers.retain(|subscriber| {
        if !subscriber.wants(&event) {
            return !subscriber.sender.is_closed();
        }
        match subscriber.sender.try_send(event.clone()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    });
}

impl DeadlineSource for MemorySource {
    async fn list_personal_deadlines(
        &self,
        user_id: &str,
    ) -> Result<Vec<PersonalDeadline>, SourceUnavailable> {
        let mut state = self.lock();
        state.personal_calls += 1;
        if state.failing.contains(&SourceKind::Personal) {
            return Err(SourceUnavailable::new(SourceKind::Personal, "source offline"));
        }
        Ok(state
            .deadlines
            .iter()
            .filter(|deadline| deadline.user_id == user_id)
            .cloned()
            .collect())
    }
}

impl SchoolRoundSource for MemorySource {
    async fn list_schools_with_rounds(&self) -> Result<Vec<SchoolRoundRecord>, SourceUnavailable> {
        let mut state = self.lock();
        state.school_calls += 1;
        if state.failing.contains(&SourceKind::School) {
            return Err(SourceUnavailable::new(SourceKind::School, "source offline"));
        }
        Ok(state.schools.clone())
    }
}

impl ChangeFeed for MemorySource {
    async fn subscribe(
        &self,
        source: SourceKind,
        user_id: Option<&str>,
    ) -> Result<Subscription, SourceUnavailable> {
        let (sender, receiver) = mpsc::channel(CHANGE_BUFFER);
        self.lock().subscribers.push(Subscriber {
            source,
            user_id: user_id.map(str::to_string),
            sender,
        });
        Ok(Subscription::new(source, receiver))
    }
}
