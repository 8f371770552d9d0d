//! Pipeline pathway: per-branch QA runs in sandboxes plus the director
//! that integrates approved branches.

pub mod director;
pub mod runner;

pub use director::{Director, Manifest};
pub use runner::{PipelineRequest, PipelineRunner, PipelineSnapshot, SubmitOutcome};
