pub mod error;
pub mod job;
pub mod progress;
mod request;

pub use request::{JobRequest, ParamBounds};
