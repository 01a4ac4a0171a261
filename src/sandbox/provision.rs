//! Image provisioning through the external build tooling.

use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::info;

use super::deadline::Deadline;
use super::error::{Result, SandboxError};
use super::process::run_captured;
use crate::config::ImagesConfig;

const MAKEFILE: &str = "Makefile";

/// Ensures sandbox images exist by delegating to a Makefile target per image.
///
/// There is no caching here; the build tooling is responsible for making a
/// rebuild of an existing image a cheap no-op.
#[derive(Debug, Clone)]
pub struct ImageProvisioner {
    containers_dir: PathBuf,
    build_tool: String,
    tag_prefix: String,
}

impl ImageProvisioner {
    /// Creates a provisioner rooted at the configured containers directory.
    pub fn new(config: &ImagesConfig) -> Self {
        Self {
            containers_dir: config.containers_dir.clone(),
            build_tool: config.build_tool.clone(),
            tag_prefix: config.tag_prefix.clone(),
        }
    }

    /// The build tool binary.
    pub fn build_tool(&self) -> &str {
        &self.build_tool
    }

    /// Directory the build runs in.
    pub fn containers_dir(&self) -> &Path {
        &self.containers_dir
    }

    /// Path of the Makefile driving the builds.
    pub fn makefile_path(&self) -> PathBuf {
        self.containers_dir.join(MAKEFILE)
    }

    /// Tag that building `target` produces.
    pub fn image_tag(&self, target: &str) -> String {
        format!("{}/{target}:latest", self.tag_prefix)
    }

    /// Fails unless the Makefile exists as a regular file.
    pub fn check_makefile(&self) -> Result<()> {
        let path = self.makefile_path();
        if path.is_file() {
            Ok(())
        } else {
            Err(SandboxError::prerequisite_missing(
                "Makefile",
                format!("not found at {}", path.display()),
            ))
        }
    }

    /// Builds `target`, returning the resulting image tag.
    pub async fn ensure_built(&self, target: &str, deadline: Deadline) -> Result<String> {
        info!(image_target = target, dir = %self.containers_dir.display(), "ensuring image is built");

        let mut cmd = Command::new(&self.build_tool);
        cmd.arg("-C").arg(&self.containers_dir).arg(target);

        let output = run_captured(&mut cmd, deadline.remaining())
            .await
            .map_err(|e| {
                let message = format!("failed to run {}: {e}", self.build_tool);
                SandboxError::build_failed(target, message, "", "")
            })?
            .ok_or_else(|| SandboxError::deadline_exceeded(format!("building image {target}")))?;

        if !output.success() {
            return Err(SandboxError::build_failed(
                target,
                format!("{} exited with {:?}", self.build_tool, output.exit_code),
                &output.stdout,
                &output.stderr,
            ));
        }

        Ok(self.image_tag(target))
    }
}
