//! kiln core domain model
//!
//! This crate defines the declarative build request consumed by the kiln
//! orchestrator, the build status record flushed to the external status
//! sink, per-stage timing, and the JSON loaders used by the CLI.

pub mod error;
pub mod loader;
pub mod model;
pub mod status;
pub mod timing;

pub use error::{CoreError, CoreResult};
pub use model::{
    BuildRequest, BuildVolumeSource, EnvVar, GitSource, GitSourceInfo, ImageLabel, OutputSpec,
    PostCommitSpec, ResourceLimits, SourceSpec, StrategySpec,
};
pub use status::{BuildPhase, BuildStatus};
pub use timing::{StageStep, StageTiming};
