use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use pl_core::JobRequest;
use pl_core::error::{ChannelError, ProtocolViolation};
use pl_core::job::{JobState, JobStateWriter, Progress};
use pl_core::progress::{ProgressChannel, ProgressEvent};

use crate::error::JobError;
use crate::events::{JobReport, WorkerMessage, WorkerSignal};
use crate::worker::{WorkerHandle, WorkerLauncher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What to do with a malformed `PROGRESS=` / `IMAGE=` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViolationPolicy {
    /// Report it, drop the line, keep applying later lines.
    #[default]
    Skip,
    /// Report it and stop reading the job's output; the job goes idle.
    Abandon,
}

struct ActiveJob {
    id: JobId,
    request: JobRequest,
    started_at: DateTime<Utc>,
    reader: JoinHandle<()>,
}

/// Owns the lifecycle of one background job at a time.
///
/// Reader tasks never touch [`JobState`]; they send [`WorkerMessage`]s and the
/// runner applies them through its [`JobStateWriter`] when drained with
/// [`pump`](Self::pump) or [`next_report`](Self::next_report).
pub struct JobRunner {
    launcher: Arc<dyn WorkerLauncher>,
    state: JobStateWriter,
    policy: ViolationPolicy,
    tx: UnboundedSender<WorkerMessage>,
    rx: UnboundedReceiver<WorkerMessage>,
    active: Option<ActiveJob>,
    open_readers: usize,
    pending: VecDeque<JobReport>,
}

impl JobRunner {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, policy: ViolationPolicy) -> Self {
        let (state, _) = JobState::new();
        let (tx, rx) = mpsc::unbounded_channel();

        Self {
            launcher,
            state,
            policy,
            tx,
            rx,
            active: None,
            open_readers: 0,
            pending: VecDeque::new(),
        }
    }

    pub fn state(&self) -> JobState {
        self.state.reader()
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_job(&self) -> Option<JobId> {
        self.active.as_ref().map(|job| job.id)
    }

    /// Launches the worker and its reader task. Overlapping starts are rejected.
    pub fn start(&mut self, request: JobRequest) -> Result<JobId, JobError> {
        if let Some(active) = &self.active {
            warn!(job = %active.id, "Rejecting start while a job is running");
            return Err(JobError::AlreadyRunning(active.id));
        }

        let runtime = tokio::runtime::Handle::try_current()?;
        let worker = self
            .launcher
            .launch(&request)
            .inspect_err(|e| error!("Worker launch failed: {e}"))?;

        let id = JobId::new();
        info!(job = %id, prompt = %request.prompt, size = request.size, steps = request.num_steps, "Job started");

        self.state.set_running(true);
        self.state.set_progress(Progress::Indeterminate);

        // Built outside the task so `Closed` is sent even if the task is never polled.
        let guard = CloseGuard { job: id, tx: self.tx.clone() };
        let reader = runtime.spawn(read_worker(guard, worker));
        self.open_readers += 1;
        self.active = Some(ActiveJob {
            id,
            request,
            started_at: Utc::now(),
            reader,
        });

        Ok(id)
    }

    /// Applies everything already received without waiting.
    pub fn pump(&mut self) -> Vec<JobReport> {
        while let Ok(message) = self.rx.try_recv() {
            self.apply(message);
        }
        self.pending.drain(..).collect()
    }

    /// Waits for the next report. `None` once no reader is left to hear from.
    pub async fn next_report(&mut self) -> Option<JobReport> {
        loop {
            if let Some(report) = self.pending.pop_front() {
                return Some(report);
            }
            if self.open_readers == 0 && self.rx.is_empty() {
                return None;
            }
            let message = self.rx.recv().await?;
            self.apply(message);
        }
    }

    /// Drives every started job to its end, including worker exit statuses.
    pub async fn run_to_completion(&mut self) -> Vec<JobReport> {
        let mut reports = Vec::new();
        while let Some(report) = self.next_report().await {
            reports.push(report);
        }
        reports
    }

    fn apply(&mut self, message: WorkerMessage) {
        let WorkerMessage { job, signal } = message;

        if let WorkerSignal::Closed = signal {
            self.open_readers = self.open_readers.saturating_sub(1);
        }

        let is_current = self.active_job() == Some(job);

        match signal {
            WorkerSignal::Exited(status) => {
                if status.success() {
                    debug!(job = %job, "Worker exited cleanly");
                } else {
                    warn!(job = %job, %status, "Worker exited unsuccessfully");
                }
                self.report(JobReport::WorkerExited {
                    job,
                    code: status.code(),
                    success: status.success(),
                });
            }
            _ if !is_current => {
                debug!(job = %job, ?signal, "Ignoring message for finished job");
            }
            WorkerSignal::Event(ProgressEvent::Progress(steps)) => {
                let max = self.active.as_ref().map_or(0, |active| active.request.num_steps);
                if steps > max {
                    self.violation(job, ProtocolViolation::ProgressOutOfRange { value: steps, max });
                    return;
                }
                let progress = Progress::Steps(steps);
                self.state.set_progress(progress);
                self.report(JobReport::Progress { job, progress });
            }
            WorkerSignal::Event(ProgressEvent::Result(bytes)) => {
                let len = bytes.len();
                debug!(job = %job, bytes = len, "Received result image");
                self.state.set_result(bytes);
                self.report(JobReport::ImageReady { job, bytes: len });
            }
            WorkerSignal::Event(ProgressEvent::EndOfStream) => self.finish(),
            WorkerSignal::Violation(violation) => self.violation(job, violation),
            WorkerSignal::ReadFailed(error) => {
                warn!(job = %job, "Lost worker output: {error}");
                self.report(JobReport::ReadFailed { job, error });
            }
            WorkerSignal::Closed => {
                // The reader stopped without reporting end-of-stream.
                warn!(job = %job, "Reader ended early");
                self.finish()
            }
        }
    }

    fn report(&mut self, report: JobReport) {
        self.pending.push_back(report);
    }

    fn violation(&mut self, job: JobId, violation: ProtocolViolation) {
        warn!(job = %job, "Protocol violation: {violation}");
        let abandoned = self.policy == ViolationPolicy::Abandon;
        self.report(JobReport::ProtocolViolation {
            job,
            violation,
            abandoned,
        });
        if abandoned {
            if let Some(active) = &self.active {
                active.reader.abort();
            }
            self.finish();
        }
    }

    /// The only transition back to idle.
    fn finish(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        self.state.set_progress(Progress::IDLE);
        self.state.set_running(false);

        let elapsed = Utc::now() - active.started_at;
        info!(job = %active.id, elapsed_ms = elapsed.num_milliseconds(), "Job finished");
        self.report(JobReport::Finished {
            job: active.id,
            elapsed,
        });
    }
}

/// Sends `Closed` however the reader ends, including panics and aborts.
struct CloseGuard {
    job: JobId,
    tx: UnboundedSender<WorkerMessage>,
}

impl CloseGuard {
    fn send(&self, signal: WorkerSignal) {
        let _ = self.tx.send(WorkerMessage { job: self.job, signal });
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.send(WorkerSignal::Closed);
    }
}

async fn read_worker(guard: CloseGuard, worker: WorkerHandle) {
    let job = guard.job;
    let WorkerHandle { output, exit } = worker;

    let mut channel = ProgressChannel::new(output);
    while let Some(item) = channel.next_event().await {
        let signal = match item {
            Ok(event) => WorkerSignal::Event(event),
            Err(ChannelError::Protocol(violation)) => WorkerSignal::Violation(violation),
            Err(ChannelError::Read(e)) => WorkerSignal::ReadFailed(e.to_string()),
        };
        guard.send(signal);
    }
    // Close our end of the pipe before waiting on the process.
    drop(channel);

    if let Some(exit) = exit {
        match exit.await {
            Ok(status) => guard.send(WorkerSignal::Exited(status)),
            Err(e) => warn!(job = %job, "Could not collect worker exit status: {e}"),
        }
    }
}
