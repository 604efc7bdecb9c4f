//! # kiln-build
//!
//! Build orchestration for kiln: turns a declarative build request into a
//! container image. The pipeline assembles the delegate configuration,
//! ensures the builder image is available, delegates source assembly to an
//! external strategy engine, runs the engine build, optionally repackages
//! the result for confidential execution, and pushes the image with
//! attestation registration.
//!
//! The orchestrator only talks to capability traits ([`ContainerEngine`],
//! [`AssemblyStrategy`], [`ProcessRunner`], [`StatusReporter`]), so every
//! stage can be exercised without a container daemon.

pub mod assembly;
pub mod auth;
pub mod context;
pub mod engine;
pub mod error;
pub mod incremental;
pub mod introspect;
pub mod orchestrator;
pub mod push;
pub mod recipe;
pub mod repackage;
pub mod retry;
pub mod status;

pub use assembly::{
    AssemblyConfig, AssemblyResult, AssemblyStrategy, ConfigAssembler, ProcessAssemblyStrategy,
};
pub use auth::{AuthType, RegistryAuth};
pub use engine::{ContainerEngine, DockerEngine, EngineBuildRequest, ImageRecord};
pub use error::{BuildError, BuildResult};
pub use orchestrator::BuildOrchestrator;
pub use push::{AttestationClient, PushController, resolve_push_tag};
pub use repackage::{ProcessRunner, SecureRepackager, TokioProcessRunner};
pub use retry::RetryPolicy;
pub use status::{FileStatusReporter, LogReporter, StatusReporter};
