use image::{DynamicImage, Rgb, RgbImage};
use tracing::{debug, error, info, warn};

use pl_core::JobRequest;
use pl_core::ParamBounds;
use pl_core::job::{JobState, Progress};

use crate::error::SessionError;
use crate::events::JobReport;
use crate::runner::{JobId, JobRunner};

/// Rendering parameters, edited on the configuration tab.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSettings {
    pub resolution: u32,
    pub num_steps: u32,
}

impl GenerationSettings {
    pub const RESOLUTION_BOUNDS: ParamBounds<u32> = ParamBounds::RESOLUTION;
    pub const STEP_BOUNDS: ParamBounds<u32> = ParamBounds::STEPS;
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            resolution: 768,
            num_steps: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptSettings {
    pub prompt: String,
    pub negative_prompt: String,
    pub guidance: f32,
}

impl PromptSettings {
    pub const GUIDANCE_BOUNDS: ParamBounds<f32> = ParamBounds::GUIDANCE;
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self {
            prompt: "A dog with a red ball.".to_string(),
            negative_prompt: "Cat, people, asphalt, grey, dark, lowres".to_string(),
            guidance: 7.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressBarView {
    /// `None` while the job has started but reported no step yet.
    pub value: Option<u32>,
    pub max: u32,
}

impl ProgressBarView {
    pub fn fraction(&self) -> Option<f32> {
        let value = self.value?;
        if self.max == 0 {
            return Some(0.0);
        }
        Some((value as f32 / self.max as f32).min(1.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewSource {
    Placeholder,
    Result,
}

#[derive(Debug, Clone)]
pub struct Preview {
    pub image: DynamicImage,
    pub source: PreviewSource,
}

/// Binds the editable settings to a [`JobRunner`] and derives what the renderer shows.
pub struct SessionController {
    pub generation: GenerationSettings,
    pub prompt: PromptSettings,
    runner: JobRunner,
}

impl SessionController {
    pub fn new(generation: GenerationSettings, prompt: PromptSettings, runner: JobRunner) -> Self {
        Self {
            generation,
            prompt,
            runner,
        }
    }

    pub fn job_state(&self) -> JobState {
        self.runner.state()
    }

    pub fn is_running(&self) -> bool {
        self.runner.is_running()
    }

    /// Snapshot of the current settings as the next job's request.
    pub fn request(&self) -> JobRequest {
        JobRequest {
            prompt: self.prompt.prompt.clone(),
            negative_prompt: self.prompt.negative_prompt.clone(),
            size: self.generation.resolution,
            num_steps: self.generation.num_steps,
            guidance: self.prompt.guidance,
        }
    }

    /// The "run" action.
    pub fn run(&mut self) -> Result<JobId, SessionError> {
        let request = self.request();
        match self.runner.start(request) {
            Ok(job) => {
                info!(job = %job, "Generation requested");
                Ok(job)
            }
            Err(e) => {
                error!("Error: {e}");
                Err(e.into())
            }
        }
    }

    /// Non-blocking; call from the interactive loop.
    pub fn poll(&mut self) -> Vec<JobReport> {
        let reports = self.runner.pump();
        reports.iter().for_each(log_report);
        reports
    }

    /// Waits until every started job has ended and its worker exited.
    pub async fn wait(&mut self) -> Vec<JobReport> {
        let reports = self.runner.run_to_completion().await;
        reports.iter().for_each(log_report);
        reports
    }

    pub fn progress_bar(&self) -> ProgressBarView {
        let value = match self.runner.state().progress() {
            Progress::Indeterminate => None,
            Progress::Steps(steps) => Some(steps),
        };
        ProgressBarView {
            value,
            max: self.generation.num_steps,
        }
    }

    /// The result image, or a white placeholder of the configured size before one exists.
    pub fn preview(&self) -> Result<Preview, SessionError> {
        let bytes = self.runner.state().result();
        if bytes.is_empty() {
            let size = self.generation.resolution;
            let blank = RgbImage::from_pixel(size, size, Rgb([255, 255, 255]));
            return Ok(Preview {
                image: DynamicImage::ImageRgb8(blank),
                source: PreviewSource::Placeholder,
            });
        }

        let image = image::load_from_memory(&bytes)?;
        Ok(Preview {
            image,
            source: PreviewSource::Result,
        })
    }
}

fn log_report(report: &JobReport) {
    match report.notice() {
        Some(notice) => warn!(job = %report.job(), "{notice}"),
        None => debug!(job = %report.job(), ?report, "Job report"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Arc;

    use image::ImageFormat;

    use crate::error::JobError;
    use crate::runner::ViolationPolicy;
    use crate::worker::{WorkerHandle, WorkerLauncher};

    struct ReplayLauncher(Vec<u8>);

    impl WorkerLauncher for ReplayLauncher {
        fn launch(&self, _request: &JobRequest) -> Result<WorkerHandle, JobError> {
            Ok(WorkerHandle::from_output(Cursor::new(self.0.clone())))
        }
    }

    fn session_with_output(output: Vec<u8>) -> SessionController {
        let runner = JobRunner::new(Arc::new(ReplayLauncher(output)), ViolationPolicy::Skip);
        SessionController::new(GenerationSettings::default(), PromptSettings::default(), runner)
    }

    fn tiny_png_hex() -> String {
        let image = RgbImage::from_pixel(2, 3, Rgb([10, 20, 30]));
        let mut png = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut png, ImageFormat::Png)
            .unwrap();
        hex::encode(png.into_inner())
    }

    #[test]
    fn test_request_reflects_current_settings() {
        let mut session = session_with_output(Vec::new());
        session.prompt.prompt = "A lighthouse at dusk".into();
        session.generation.resolution = 1024;
        session.generation.num_steps = 25;

        assert_eq!(
            session.request(),
            JobRequest {
                prompt: "A lighthouse at dusk".into(),
                negative_prompt: "Cat, people, asphalt, grey, dark, lowres".into(),
                size: 1024,
                num_steps: 25,
                guidance: 7.5,
            }
        );
    }

    #[test]
    fn test_placeholder_preview() {
        let mut session = session_with_output(Vec::new());
        session.generation.resolution = 896;

        let preview = session.preview().unwrap();
        assert_eq!(preview.source, PreviewSource::Placeholder);
        let rgb = preview.image.to_rgb8();
        assert_eq!(rgb.dimensions(), (896, 896));
        assert!(rgb.pixels().all(|pixel| *pixel == Rgb([255, 255, 255])));
    }

    #[test]
    fn test_idle_progress_bar() {
        let session = session_with_output(Vec::new());
        let bar = session.progress_bar();
        assert_eq!(bar, ProgressBarView { value: Some(0), max: 10 });
        assert_eq!(bar.fraction(), Some(0.0));
    }

    #[tokio::test]
    async fn test_run_and_decode_result() {
        let output = format!("PROGRESS=5\nIMAGE={}\n\n", tiny_png_hex()).into_bytes();
        let mut session = session_with_output(output);

        session.run().unwrap();
        assert_eq!(session.progress_bar().value, None);
        assert!(session.progress_bar().fraction().is_none());

        let reports = session.wait().await;
        assert!(reports.iter().all(|report| !report.is_problem()));
        assert!(!session.is_running());

        let preview = session.preview().unwrap();
        assert_eq!(preview.source, PreviewSource::Result);
        assert_eq!(preview.image.to_rgb8().dimensions(), (2, 3));
        assert_eq!(session.progress_bar(), ProgressBarView { value: Some(0), max: 10 });
    }

    #[tokio::test]
    async fn test_poll_drains_until_idle() {
        let output = format!("PROGRESS=4\nIMAGE={}\n\n", tiny_png_hex()).into_bytes();
        let mut session = session_with_output(output);
        session.run().unwrap();

        let mut reports = Vec::new();
        while session.is_running() {
            reports.extend(session.poll());
            tokio::task::yield_now().await;
        }

        assert!(reports.iter().any(|report| matches!(
            report,
            JobReport::Progress { progress: Progress::Steps(4), .. }
        )));
        assert!(matches!(reports.last(), Some(JobReport::Finished { .. })));
        assert_eq!(session.preview().unwrap().source, PreviewSource::Result);
        assert!(session.poll().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_image_is_an_error() {
        let mut session = session_with_output(b"IMAGE=89504e470d0a1a0a\n".to_vec());
        session.run().unwrap();
        session.wait().await;

        assert!(matches!(session.preview(), Err(SessionError::Decode(_))));
    }

    #[tokio::test]
    async fn test_second_run_while_busy_is_rejected() {
        let mut session = session_with_output(b"PROGRESS=1\n".to_vec());
        let job = session.run().unwrap();

        match session.run() {
            Err(SessionError::Job(JobError::AlreadyRunning(busy))) => assert_eq!(busy, job),
            other => panic!("expected rejection, got {other:?}"),
        }
        session.wait().await;
        assert!(session.run().is_ok());
    }

    #[test]
    fn test_fraction_clamps() {
        let bar = ProgressBarView { value: Some(15), max: 10 };
        assert_eq!(bar.fraction(), Some(1.0));
        assert_eq!(ProgressBarView { value: Some(3), max: 0 }.fraction(), Some(0.0));
    }
}
