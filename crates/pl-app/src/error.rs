use std::path::PathBuf;

use thiserror::Error;

use crate::runner::JobId;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("job {0} is still running")]
    AlreadyRunning(JobId),

    #[error("failed to start worker `{}`: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("jobs can only be started from inside a tokio runtime")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Job(#[from] JobError),

    #[error("could not decode result image: {0}")]
    Decode(#[from] image::ImageError),
}
