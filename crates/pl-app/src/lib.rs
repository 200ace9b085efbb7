//! Session, job runner and worker process plumbing for the promptlab front-end.
pub mod config;
pub mod error;
pub mod events;
pub mod runner;
pub mod session;
pub mod worker;

pub use events::JobReport;
pub use runner::{JobId, JobRunner, ViolationPolicy};
pub use session::{GenerationSettings, Preview, PreviewSource, ProgressBarView, PromptSettings, SessionController};
