//! Search job lifecycle.
//!
//! The backend runs at most one job at a time. A job moves through
//!
//! ```text
//! Queued ──▶ Running ──▶ ReadyPartial ──▶ Finished
//!   │           │  └──────────────────────▲
//!   └───────────┴──────────┴──▶ Error
//! ```
//!
//! `ReadyPartial` is entered when the first query outcome is published.
//! `Finished` and `Error` are terminal; later transitions are rejected and
//! logged.
//!
//! Submitting while a job is active supersedes it: the old job is marked
//! `Error` ("superseded by job <id>") and its cancel flag is raised so the
//! workers stop before their next query. With `reject_when_busy` the
//! submission fails with [`SearchError::Busy`] instead.
//!
//! State sits behind a `RwLock`. The coordinating thread of the running job
//! is the only writer apart from the submitter; readers hold the read lock
//! just long enough to clone the `Arc`s they need.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use entropy_search_core::search::QueryOutcome;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::SearchError;
use crate::orchestrator::{self, RunSummary, SearchContext, SearchRequest, SearchSink};
use crate::progress::{NoProgress, SearchProgressEvent};

pub const IDLE_MESSAGE: &str = "Preparing to start searching";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    ReadyPartial,
    Finished,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Error)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Running, ReadyPartial)
                | (Running, Finished)
                | (ReadyPartial, Finished)
                | (Queued, Error)
                | (Running, Error)
                | (ReadyPartial, Error)
        )
    }
}

#[derive(Debug)]
pub struct JobState {
    pub id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub message: String,
    pub error_message: Option<String>,
    pub file_query: String,
    pub file_library: String,
    /// Loaded inputs, available once the run has indexed the library.
    pub context: Option<Arc<SearchContext>>,
    pub results: BTreeMap<u32, Arc<QueryOutcome>>,
    /// Queries that failed with an internal error, by scan.
    pub failures: BTreeMap<u32, String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    cancel: Arc<AtomicBool>,
}

impl JobState {
    fn new(file_query: &str, file_library: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            status: JobStatus::Queued,
            progress: 0.0,
            message: "Queued".to_string(),
            error_message: None,
            file_query: file_query.to_string(),
            file_library: file_library.to_string(),
            context: None,
            results: BTreeMap::new(),
            failures: BTreeMap::new(),
            created_at: Utc::now(),
            finished_at: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Apply a transition, rejecting it if the state machine forbids it.
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            warn!(
                job_id = %self.id,
                from = ?self.status,
                to = ?next,
                "rejected job state transition"
            );
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        true
    }

    fn fail(&mut self, message: String) -> bool {
        if !self.transition(JobStatus::Error) {
            return false;
        }
        self.message = format!("Error: {}", message);
        self.error_message = Some(message);
        self.cancel.store(true, Ordering::SeqCst);
        true
    }
}

/// Status flags as polled by the UI.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusSnapshot {
    pub status: String,
    pub is_ready: bool,
    pub is_running: bool,
    pub is_finished: bool,
    pub is_error: bool,
    pub progress: f64,
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

impl StatusSnapshot {
    fn idle() -> Self {
        Self {
            status: IDLE_MESSAGE.to_string(),
            is_ready: false,
            is_running: false,
            is_finished: false,
            is_error: false,
            progress: 0.0,
            job_id: None,
            started_at: None,
            finished_at: None,
        }
    }

    fn of(job: &JobState) -> Self {
        Self {
            status: job.message.clone(),
            is_ready: matches!(job.status, JobStatus::ReadyPartial | JobStatus::Finished),
            is_running: !job.status.is_terminal(),
            is_finished: job.status == JobStatus::Finished,
            is_error: job.status == JobStatus::Error,
            progress: job.progress,
            job_id: Some(job.id.clone()),
            started_at: Some(job.created_at.to_rfc3339()),
            finished_at: job.finished_at.map(|t| t.to_rfc3339()),
        }
    }
}

/// Owner of the single job slot.
#[derive(Clone, Default)]
pub struct JobManager {
    slot: Arc<RwLock<Option<JobState>>>,
    reject_when_busy: bool,
}

impl JobManager {
    pub fn new(reject_when_busy: bool) -> Self {
        Self {
            slot: Arc::new(RwLock::new(None)),
            reject_when_busy,
        }
    }

    fn read_slot(&self) -> RwLockReadGuard<'_, Option<JobState>> {
        self.slot.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_slot(&self) -> RwLockWriteGuard<'_, Option<JobState>> {
        self.slot.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a new queued job, superseding or rejecting an active one.
    pub fn submit(&self, file_query: &str, file_library: &str) -> Result<JobHandle, SearchError> {
        let mut slot = self.write_slot();
        let job = JobState::new(file_query, file_library);

        if let Some(previous) = slot.as_mut() {
            if !previous.status.is_terminal() {
                if self.reject_when_busy {
                    return Err(SearchError::Busy);
                }
                info!(old = %previous.id, new = %job.id, "superseding active search job");
                previous.fail(format!("superseded by job {}", job.id));
            }
        }

        let handle = JobHandle {
            manager: self.clone(),
            id: job.id.clone(),
            cancel: Arc::clone(&job.cancel),
        };
        info!(job_id = %job.id, query = %file_query, library = %file_library, "search job queued");
        *slot = Some(job);
        Ok(handle)
    }

    /// Submit and run `request` on a background thread.
    pub fn start(&self, request: SearchRequest) -> Result<JobHandle, SearchError> {
        let handle = self.submit(
            &request.file_query.display().to_string(),
            &request.file_library.display().to_string(),
        )?;
        let runner = handle.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("search-job-{}", &handle.id[..8]))
            .spawn(move || runner.guarded(|| runner.run(&request)));
        if let Err(e) = spawned {
            handle.fail(format!("failed to start search thread: {}", e));
        }
        Ok(handle)
    }

    pub fn status(&self) -> StatusSnapshot {
        match self.read_slot().as_ref() {
            Some(job) => StatusSnapshot::of(job),
            None => StatusSnapshot::idle(),
        }
    }

    /// Run `f` against the current job under the read lock.
    pub fn read<R>(&self, f: impl FnOnce(Option<&JobState>) -> R) -> R {
        f(self.read_slot().as_ref())
    }

    /// Mark the active job as failed with `reason` and stop its workers.
    pub fn cancel_active(&self, reason: &str) {
        if let Some(job) = self.write_slot().as_mut() {
            if !job.status.is_terminal() {
                info!(job_id = %job.id, "cancelling search job: {}", reason);
                job.fail(reason.to_string());
            }
        }
    }
}

/// Write access to one job. Updates are dropped once the job has been
/// superseded or reached a terminal state.
#[derive(Clone)]
pub struct JobHandle {
    manager: JobManager,
    id: String,
    cancel: Arc<AtomicBool>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn update(&self, f: impl FnOnce(&mut JobState)) -> bool {
        let mut slot = self.manager.write_slot();
        match slot.as_mut() {
            Some(job) if job.id == self.id && !job.status.is_terminal() => {
                f(job);
                true
            }
            _ => false,
        }
    }

    pub fn set_running(&self) {
        self.update(|job| {
            if job.transition(JobStatus::Running) {
                job.message = "Starting search...".to_string();
            }
        });
    }

    pub fn finish(&self, summary: &RunSummary) {
        self.update(|job| {
            if job.transition(JobStatus::Finished) {
                job.progress = 1.0;
                job.message = summary.finished_event().message();
                info!(
                    job_id = %job.id,
                    searched = summary.searched,
                    skipped = summary.skipped,
                    failed = summary.failed,
                    "search job finished"
                );
            }
        });
    }

    pub fn fail(&self, message: String) {
        self.update(|job| {
            warn!(job_id = %job.id, "search job failed: {}", message);
            job.fail(message);
        });
    }

    /// Run `body`, turning a panic into a job error so the slot never stays
    /// stuck in a running state.
    fn guarded(&self, body: impl FnOnce()) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
            self.fail(format!("search thread panicked: {}", panic_message(payload.as_ref())));
        }
    }

    fn run(&self, request: &SearchRequest) {
        self.set_running();
        match orchestrator::run(request, &NoProgress, self) {
            Ok(summary) if summary.cancelled => {
                info!(job_id = %self.id, "search job stopped after cancellation");
            }
            Ok(summary) => self.finish(&summary),
            Err(e) => self.fail(e.to_string()),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

impl SearchSink for JobHandle {
    fn on_inputs(&self, context: Arc<SearchContext>) {
        self.update(|job| job.context = Some(context));
    }

    fn on_progress(&self, event: &SearchProgressEvent) {
        self.update(|job| {
            if let SearchProgressEvent::Searching { n, total } = event {
                if *total > 0 {
                    job.progress = job.progress.max(*n as f64 / *total as f64);
                }
            }
            job.message = event.message();
        });
    }

    fn publish(&self, outcome: QueryOutcome) {
        self.update(|job| {
            job.results.insert(outcome.scan, Arc::new(outcome));
            if job.status == JobStatus::Running {
                job.transition(JobStatus::ReadyPartial);
            }
        });
    }

    fn on_failure(&self, scan: u32, error: &SearchError) {
        self.update(|job| {
            job.failures.insert(scan, error.to_string());
        });
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}
