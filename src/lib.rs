//! Disposable container sandboxes in which an agent issues shell commands.
//!
//! Start a [`Sandbox`] from an [`environment::EnvironmentDescriptor`] or from
//! explicit [`SandboxOptions`], run commands on it, then `dispose` it.

pub mod cache;
pub mod config;
pub mod environment;
pub mod report;
pub mod sandbox;
pub mod shell;

pub use cache::ArtifactCache;
pub use config::Config;
pub use environment::EnvironmentDescriptor;
pub use report::ValidationReport;
pub use sandbox::{
    BackendKind, Deadline, LifecycleState, NetworkPolicy, Sandbox, SandboxError, SandboxOptions,
};
