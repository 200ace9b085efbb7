use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use futures::future::BoxFuture;
use tokio::io::{AsyncBufRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use pl_core::JobRequest;

use crate::config::WorkerConfig;
use crate::error::JobError;

/// A started worker: its output stream and, for real processes, a way to await its exit.
pub struct WorkerHandle {
    pub output: Box<dyn AsyncBufRead + Send + Unpin>,
    pub exit: Option<BoxFuture<'static, io::Result<ExitStatus>>>,
}

impl WorkerHandle {
    /// A worker with no process behind it, e.g. replayed output.
    pub fn from_output(output: impl AsyncBufRead + Send + Unpin + 'static) -> Self {
        Self {
            output: Box::new(output),
            exit: None,
        }
    }
}

pub trait WorkerLauncher: Send + Sync {
    /// Must be called from inside a tokio runtime.
    fn launch(&self, request: &JobRequest) -> Result<WorkerHandle, JobError>;
}

/// Launches the generator as a child process and reads its stdout.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    leading_args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn command(&self, request: &JobRequest) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .args(request.worker_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            // An abandoned job drops its reader task, and the child with it.
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }

    fn spawn_error(&self, source: io::Error) -> JobError {
        JobError::Spawn {
            program: self.program.clone(),
            source,
        }
    }
}

impl From<&WorkerConfig> for ProcessLauncher {
    fn from(config: &WorkerConfig) -> Self {
        let launcher = ProcessLauncher::new(&config.program).with_args(config.args.iter().cloned());
        match &config.working_dir {
            Some(dir) => launcher.with_working_dir(dir),
            None => launcher,
        }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, request: &JobRequest) -> Result<WorkerHandle, JobError> {
        debug!(program = %self.program.display(), args = ?self.leading_args, "Spawning worker");

        let mut child = self
            .command(request)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stdout = child.stdout.take().ok_or_else(|| {
            self.spawn_error(io::Error::other("worker stdout was not captured"))
        })?;

        info!(pid = ?child.id(), "Worker started");

        Ok(WorkerHandle {
            output: Box::new(BufReader::new(stdout)),
            exit: Some(Box::pin(async move { child.wait().await })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> JobRequest {
        JobRequest {
            prompt: "A dog with a red ball.".into(),
            negative_prompt: "Cat, people".into(),
            size: 768,
            num_steps: 10,
            guidance: 7.5,
        }
    }

    #[test]
    fn test_command_line() {
        let launcher = ProcessLauncher::new("python").with_args(["generate_image.py"]);
        let command = launcher.command(&request());
        let std_command = command.as_std();

        assert_eq!(std_command.get_program(), "python");
        let args: Vec<_> = std_command
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            [
                "generate_image.py",
                "--prompt=A dog with a red ball.",
                "--negative_prompt=Cat, people",
                "--size=768",
                "--num_steps=10",
                "--guidance=7.5",
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let launcher = ProcessLauncher::new("/definitely/not/a/worker");
        match launcher.launch(&request()) {
            Err(JobError::Spawn { program, .. }) => {
                assert_eq!(program, PathBuf::from("/definitely/not/a/worker"))
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("launch should have failed"),
        }
    }
}
