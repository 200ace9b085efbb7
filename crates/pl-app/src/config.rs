use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, bail};

use crate::runner::ViolationPolicy;
use crate::session::{GenerationSettings, PromptSettings};

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python"),
            args: vec!["generate_image.py".to_string()],
            working_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub worker: WorkerConfig,
    pub violation_policy: ViolationPolicy,
    pub output: PathBuf,
    pub generation: GenerationSettings,
    pub prompt: PromptSettings,
}

impl AppConfig {
    /// Reads `.env` if present, then the process environment.
    pub fn load() -> anyhow::Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!("Loaded environment from {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => return Err(e).context("failed to read .env"),
        }

        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let worker_defaults = WorkerConfig::default();
        let generation_defaults = GenerationSettings::default();
        let prompt_defaults = PromptSettings::default();

        let worker = WorkerConfig {
            program: lookup("PL_WORKER_PROGRAM")
                .map(PathBuf::from)
                .unwrap_or(worker_defaults.program),
            args: lookup("PL_WORKER_ARGS")
                .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                .unwrap_or(worker_defaults.args),
            working_dir: lookup("PL_WORKER_DIR").map(PathBuf::from),
        };

        let violation_policy = match lookup("PL_VIOLATION_POLICY").as_deref() {
            None | Some("skip") => ViolationPolicy::Skip,
            Some("abandon") => ViolationPolicy::Abandon,
            Some(other) => bail!("PL_VIOLATION_POLICY must be `skip` or `abandon`, got `{other}`"),
        };

        Ok(Self {
            worker,
            violation_policy,
            output: lookup("PL_OUTPUT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("output.png")),
            generation: GenerationSettings {
                resolution: parse_or(&lookup, "PL_RESOLUTION", generation_defaults.resolution)?,
                num_steps: parse_or(&lookup, "PL_STEPS", generation_defaults.num_steps)?,
            },
            prompt: PromptSettings {
                prompt: lookup("PL_PROMPT").unwrap_or(prompt_defaults.prompt),
                negative_prompt: lookup("PL_NEGATIVE_PROMPT")
                    .unwrap_or(prompt_defaults.negative_prompt),
                guidance: parse_or(&lookup, "PL_GUIDANCE", prompt_defaults.guidance)?,
            },
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a number, got `{raw}`")),
        None => Ok(default),
    }
}
