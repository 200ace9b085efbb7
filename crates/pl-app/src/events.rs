use std::process::ExitStatus;

use pl_core::error::ProtocolViolation;
use pl_core::job::Progress;
use pl_core::progress::ProgressEvent;

use crate::runner::JobId;

/// What a reader task tells the runner. Every reader ends with `Closed`.
#[derive(Debug)]
pub(crate) struct WorkerMessage {
    pub job: JobId,
    pub signal: WorkerSignal,
}

#[derive(Debug)]
pub(crate) enum WorkerSignal {
    Event(ProgressEvent),
    Violation(ProtocolViolation),
    ReadFailed(String),
    Exited(ExitStatus),
    Closed,
}

/// Session-boundary record of something that happened to a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobReport {
    Progress {
        job: JobId,
        progress: Progress,
    },
    ImageReady {
        job: JobId,
        bytes: usize,
    },
    ProtocolViolation {
        job: JobId,
        violation: ProtocolViolation,
        abandoned: bool,
    },
    ReadFailed {
        job: JobId,
        error: String,
    },
    Finished {
        job: JobId,
        elapsed: chrono::Duration,
    },
    /// The worker's exit status, known only after its output closed.
    WorkerExited {
        job: JobId,
        code: Option<i32>,
        success: bool,
    },
}

impl JobReport {
    pub fn job(&self) -> JobId {
        match self {
            Self::Progress { job, .. }
            | Self::ImageReady { job, .. }
            | Self::ProtocolViolation { job, .. }
            | Self::ReadFailed { job, .. }
            | Self::Finished { job, .. }
            | Self::WorkerExited { job, .. } => *job,
        }
    }

    /// Worth showing to the user, not just logging.
    pub fn is_problem(&self) -> bool {
        match self {
            Self::ProtocolViolation { .. } | Self::ReadFailed { .. } => true,
            Self::WorkerExited { success, .. } => !success,
            _ => false,
        }
    }

    pub fn notice(&self) -> Option<String> {
        match self {
            Self::ProtocolViolation { violation, abandoned: true, .. } => {
                Some(format!("Error: {violation}; stopped reading worker output"))
            }
            Self::ProtocolViolation { violation, .. } => Some(format!("Error: {violation}")),
            Self::ReadFailed { error, .. } => Some(format!("Error: {error}")),
            Self::WorkerExited { code: Some(code), success: false, .. } => {
                Some(format!("Error: worker exited with status {code}"))
            }
            Self::WorkerExited { code: None, success: false, .. } => {
                Some("Error: worker was terminated by a signal".to_string())
            }
            _ => None,
        }
    }
}
