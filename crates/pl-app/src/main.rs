use std::error::Error;
use std::sync::Arc;

use pl_app::config::AppConfig;
use pl_app::worker::ProcessLauncher;
use pl_app::{JobRunner, SessionController};
use pl_core::job::{JobChange, JobPhase, Progress};
use tracing::{info, warn};

const BAR_WIDTH: usize = 30;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let config = AppConfig::load()?;
    let launcher = ProcessLauncher::from(&config.worker);
    let runner = JobRunner::new(Arc::new(launcher), config.violation_policy);
    let mut session = SessionController::new(config.generation.clone(), config.prompt.clone(), runner);

    let total = config.generation.num_steps;
    session.job_state().subscribe(move |change: &JobChange| match change {
        JobChange::Progress(progress) => info!("{}", render_bar(*progress, total)),
        JobChange::Result(bytes) => info!("Received image ({} bytes)", bytes.len()),
        JobChange::Running(running) => info!("{}", JobPhase::from_running(*running).label()),
    });

    session.run()?;
    let reports = session.wait().await;
    let problems = reports.iter().filter(|report| report.is_problem()).count();
    if problems > 0 {
        warn!("{problems} problem(s) reported by the worker");
    }

    let preview = session.preview()?;
    preview.image.save(&config.output)?;
    info!(source = ?preview.source, "Wrote {}", config.output.display());

    Ok(())
}

fn render_bar(progress: Progress, total: u32) -> String {
    match progress {
        Progress::Indeterminate => format!("[{}] starting", "?".repeat(BAR_WIDTH)),
        Progress::Steps(done) => {
            let filled = if total == 0 {
                0
            } else {
                (done.min(total) as usize * BAR_WIDTH) / total as usize
            };
            format!(
                "[{}{}] {done}/{total}",
                "#".repeat(filled),
                " ".repeat(BAR_WIDTH - filled)
            )
        }
    }
}
