use serde::{Deserialize, Serialize};

/// Immutable snapshot of the parameters used to launch one worker invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRequest {
    pub prompt: String,
    pub negative_prompt: String,
    /// Edge length in pixels, used for both axes.
    pub size: u32,
    pub num_steps: u32,
    pub guidance: f32,
}

impl JobRequest {
    /// Arguments handed to the worker, one discrete argument per parameter.
    pub fn worker_args(&self) -> Vec<String> {
        vec![
            format!("--prompt={}", self.prompt),
            format!("--negative_prompt={}", self.negative_prompt),
            format!("--size={}", self.size),
            format!("--num_steps={}", self.num_steps),
            // Always carries a fractional part, e.g. `25.0`.
            format!("--guidance={:?}", self.guidance),
        ]
    }
}

/// Editing bounds for a numeric parameter. Enforced by the renderer, not here.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamBounds<T> {
    pub min: T,
    pub max: T,
    pub step: T,
}

impl ParamBounds<u32> {
    pub const RESOLUTION: Self = Self { min: 768, max: 2560, step: 128 };
    pub const STEPS: Self = Self { min: 1, max: 100, step: 1 };

    pub fn contains(&self, value: u32) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

impl ParamBounds<f32> {
    pub const GUIDANCE: Self = Self { min: 0.0, max: 25.0, step: 0.1 };

    pub fn contains(&self, value: f32) -> bool {
        (self.min..=self.max).contains(&value)
    }
}
