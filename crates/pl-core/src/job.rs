//! Observable job state.
//!
//! [`JobStateWriter`] is the only way to mutate the state and is held by the job
//! runner. Any number of [`JobState`] handles can read it and subscribe to
//! changes. Observers run synchronously, after the mutation and before the
//! writing call returns.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use log::trace;
use serde::{Deserialize, Serialize};

/// Raw progress value for "started, step count not known yet".
pub const INDETERMINATE: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Progress {
    Indeterminate,
    /// Steps done. `Steps(0)` doubles as idle.
    Steps(u32),
}

impl Progress {
    pub const IDLE: Progress = Progress::Steps(0);

    pub fn as_raw(self) -> i64 {
        match self {
            Self::Indeterminate => INDETERMINATE,
            Self::Steps(steps) => i64::from(steps),
        }
    }

    fn from_raw(raw: i64) -> Self {
        u32::try_from(raw).map_or(Self::Indeterminate, Self::Steps)
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::IDLE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPhase {
    Idle,
    Running,
}

impl JobPhase {
    pub fn from_running(running: bool) -> Self {
        if running { Self::Running } else { Self::Idle }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Idle => "Ready",
            Self::Running => "Generating",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobChange {
    Progress(Progress),
    Result(Arc<[u8]>),
    Running(bool),
}

pub trait JobObserver: Send + Sync {
    fn on_change(&self, change: &JobChange);
}

impl<F> JobObserver for F
where
    F: Fn(&JobChange) + Send + Sync,
{
    fn on_change(&self, change: &JobChange) {
        self(change)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JobSnapshot {
    pub progress: Progress,
    pub result: Arc<[u8]>,
    pub running: bool,
}

struct Shared {
    progress: AtomicI64,
    running: AtomicBool,
    result: RwLock<Arc<[u8]>>,
    observers: RwLock<Vec<(SubscriptionId, Arc<dyn JobObserver>)>>,
    next_subscription: AtomicU64,
}

/// Read handle. Cheap to clone.
#[derive(Clone)]
pub struct JobState {
    shared: Arc<Shared>,
}

/// Exclusive write handle.
pub struct JobStateWriter {
    shared: Arc<Shared>,
}

impl JobState {
    /// Creates a fresh idle state and its single writer.
    pub fn new() -> (JobStateWriter, JobState) {
        let shared = Arc::new(Shared {
            progress: AtomicI64::new(Progress::IDLE.as_raw()),
            running: AtomicBool::new(false),
            result: RwLock::new(Arc::from(Vec::new())),
            observers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
        });

        (
            JobStateWriter { shared: shared.clone() },
            JobState { shared },
        )
    }

    pub fn progress(&self) -> Progress {
        Progress::from_raw(self.shared.progress.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Encoded image bytes; empty until a result arrives.
    pub fn result(&self) -> Arc<[u8]> {
        self.shared
            .result
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn phase(&self) -> JobPhase {
        JobPhase::from_running(self.is_running())
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            progress: self.progress(),
            result: self.result(),
            running: self.is_running(),
        }
    }

    pub fn subscribe(&self, observer: impl JobObserver + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.shared.next_subscription.fetch_add(1, Ordering::Relaxed));
        let observer: Arc<dyn JobObserver> = Arc::new(observer);
        self.shared
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, observer));
        id
    }

    /// Returns `false` if the subscription was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self
            .shared
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }
}

impl std::fmt::Debug for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobState")
            .field("progress", &self.progress())
            .field("result_len", &self.result().len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl JobStateWriter {
    pub fn reader(&self) -> JobState {
        JobState { shared: self.shared.clone() }
    }

    pub fn set_progress(&self, progress: Progress) {
        self.shared.progress.store(progress.as_raw(), Ordering::Release);
        self.notify(JobChange::Progress(progress));
    }

    pub fn set_result(&self, bytes: impl Into<Arc<[u8]>>) {
        let bytes = bytes.into();
        *self
            .shared
            .result
            .write()
            .unwrap_or_else(PoisonError::into_inner) = bytes.clone();
        self.notify(JobChange::Result(bytes));
    }

    pub fn set_running(&self, running: bool) {
        self.shared.running.store(running, Ordering::Release);
        self.notify(JobChange::Running(running));
    }

    fn notify(&self, change: JobChange) {
        // Snapshot the list so observers may subscribe or unsubscribe re-entrantly.
        let observers: Vec<Arc<dyn JobObserver>> = self
            .shared
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();

        trace!("Job state change {:?} -> {} observers", change, observers.len());

        for observer in observers {
            observer.on_change(&change);
        }
    }
}
