//! Thin wrapper over the container engine.
//!
//! Lifecycle calls (create, start, stop, remove, exec, copy-in) go through the
//! Docker API. Processes that need their stdio attached as live pipes are
//! launched through the engine CLI instead, see [`ContainerEngine::command`].

use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, LogOutput, RemoveContainerOptions,
    StopContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::service::{HostConfig, PortBinding};
use bollard::Docker;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use tar::{Builder, Header};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::error::{Result, SandboxError};
use super::network::NetworkPolicy;
use super::process::CapturedOutput;

/// How to launch a detached, port-publishing service container.
#[derive(Debug, Clone)]
pub(crate) struct DetachedSpec<'a> {
    pub name: &'a str,
    pub image: &'a str,
    pub user: &'a str,
    pub workdir: &'a str,
    pub host_port: u16,
    pub service_port: u16,
}

/// How to launch a container whose main process is the shell harness.
#[derive(Debug, Clone)]
pub(crate) struct AttachedSpec<'a> {
    pub name: &'a str,
    pub image: &'a str,
    pub user: &'a str,
    pub workdir: &'a str,
    pub network: NetworkPolicy,
    pub entrypoint: &'a str,
}

/// Handle on the local container engine.
#[derive(Debug, Clone)]
pub struct ContainerEngine {
    docker: Docker,
    program: String,
}

impl ContainerEngine {
    /// Connects to the local engine and verifies the daemon answers.
    pub async fn connect(program: impl Into<String>) -> Result<Self> {
        let program = program.into();
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            SandboxError::prerequisite_missing("docker daemon", format!("cannot connect: {e}"))
        })?;
        docker.ping().await.map_err(|e| {
            SandboxError::prerequisite_missing("docker daemon", format!("cannot ping: {e}"))
        })?;
        Ok(Self { docker, program })
    }

    /// A client for an address nothing listens on; every API call fails fast.
    #[cfg(test)]
    pub(crate) fn unreachable(program: impl Into<String>) -> Self {
        let docker =
            Docker::connect_with_http("http://127.0.0.1:1", 2, bollard::API_DEFAULT_VERSION)
                .expect("building an HTTP docker client does not connect");
        Self {
            docker,
            program: program.into(),
        }
    }

    /// Name of the engine CLI binary.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// A fresh engine CLI invocation.
    pub(crate) fn command(&self) -> Command {
        Command::new(&self.program)
    }

    /// `run --rm -i` invocation that makes the harness the container's main process.
    pub(crate) fn attached_run_command(&self, spec: &AttachedSpec<'_>) -> Command {
        let mut cmd = self.command();
        cmd.args(["run", "--rm", "--name", spec.name])
            .args(["-u", spec.user, "-w", spec.workdir, "-i"]);
        if let Some(mode) = spec.network.network_mode() {
            cmd.args(["--network", mode]);
        }
        cmd.args([spec.image, spec.entrypoint]);
        cmd
    }

    /// `exec -i` invocation that attaches a second harness to a running container.
    pub(crate) fn attached_exec_command(
        &self,
        container: &str,
        user: &str,
        entrypoint: &str,
    ) -> Command {
        let mut cmd = self.command();
        cmd.args(["exec", "-i", "-u", user, container, entrypoint]);
        cmd
    }

    /// Creates and starts a detached, auto-removed container publishing one port
    /// on the loopback interface.
    pub(crate) async fn run_detached(
        &self,
        spec: &DetachedSpec<'_>,
    ) -> std::result::Result<(), bollard::errors::Error> {
        let container_port = format!("{}/tcp", spec.service_port);
        let bindings = HashMap::from([(
            container_port.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        )]);

        // Default networking stays on so the published port can bind.
        let config = ContainerConfig {
            image: Some(spec.image.to_string()),
            user: Some(spec.user.to_string()),
            working_dir: Some(spec.workdir.to_string()),
            exposed_ports: Some(HashMap::from([(container_port, HashMap::new())])),
            host_config: Some(HostConfig {
                auto_remove: Some(true),
                port_bindings: Some(bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        debug!(container = spec.name, image = spec.image, "creating container");
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.to_string(),
                    platform: None,
                }),
                config,
            )
            .await?;

        debug!(container = spec.name, "starting container");
        if let Err(e) = self.docker.start_container::<String>(spec.name, None).await {
            // Created but never started, so auto-remove will not fire.
            if let Err(cleanup) = self.remove(spec.name).await {
                warn!(container = spec.name, error = %cleanup, "cleanup after failed start");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Stops a container, relying on auto-removal to delete it.
    pub(crate) async fn stop(&self, name: &str) -> Result<()> {
        match self
            .docker
            .stop_container(name, Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_gone(&e) => {
                debug!(container = name, "container already gone");
                Ok(())
            }
            Err(e) => Err(SandboxError::engine(format!("stopping {name}"), e)),
        }
    }

    /// Forcibly removes a container, running or not.
    pub(crate) async fn remove(&self, name: &str) -> Result<()> {
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_gone(&e) => {
                debug!(container = name, "container already gone");
                Ok(())
            }
            Err(e) => Err(SandboxError::engine(format!("removing {name}"), e)),
        }
    }

    /// Runs `cmd` inside a running container and collects its output.
    pub(crate) async fn exec(
        &self,
        container: &str,
        user: &str,
        cmd: Vec<String>,
    ) -> Result<CapturedOutput> {
        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(cmd),
                    user: Some(user.to_string()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::engine(format!("creating exec in {container}"), e))?;

        let mut captured = CapturedOutput::default();
        if let StartExecResults::Attached {
            output: mut stream, ..
        } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| SandboxError::engine(format!("starting exec in {container}"), e))?
        {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        captured.stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        captured.stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Err(e) => warn!("Error reading exec output: {}", e),
                    _ => {}
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| SandboxError::engine(format!("inspecting exec in {container}"), e))?;
        captured.exit_code = inspect
            .exit_code
            .and_then(|code| i32::try_from(code).ok());
        Ok(captured)
    }

    /// Copies a host file into a container at an absolute path.
    pub(crate) async fn copy_file_in(
        &self,
        container: &str,
        host_path: &Path,
        dest: &str,
    ) -> Result<()> {
        let dest_path = Path::new(dest);
        let (Some(parent), Some(file_name)) = (dest_path.parent(), dest_path.file_name()) else {
            return Err(SandboxError::usage(format!(
                "destination {dest} does not name a file"
            )));
        };

        let contents = tokio::fs::read(host_path)
            .await
            .map_err(|e| SandboxError::io(format!("reading {}", host_path.display()), e))?;
        let archive = single_file_tar(file_name, &contents)
            .map_err(|e| SandboxError::io("building upload archive", e))?;

        self.docker
            .upload_to_container(
                container,
                Some(UploadToContainerOptions {
                    path: parent.to_string_lossy().into_owned(),
                    ..Default::default()
                }),
                Bytes::from(archive),
            )
            .await
            .map_err(|e| SandboxError::engine(format!("copying file into {container}"), e))?;

        info!(container, dest, bytes = contents.len(), "copied file into container");
        Ok(())
    }

    /// Best-effort synchronous forced removal, for use from `Drop`.
    pub(crate) fn remove_blocking(&self, name: &str) {
        let status = std::process::Command::new(&self.program)
            .args(["rm", "-f", name])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
        if let Err(e) = status {
            warn!(container = name, error = %e, "failed to remove container on drop");
        }
    }
}

fn is_gone(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404 | 304,
            ..
        }
    ) || err.to_string().contains("removal of container")
}

fn single_file_tar(name: &std::ffi::OsStr, contents: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut header = Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(
        u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default(),
    );
    header.set_cksum();

    let mut tar_buf = Vec::new();
    {
        let mut tar = Builder::new(&mut tar_buf);
        tar.append_data(&mut header, name, contents)?;
        tar.finish()?;
    }
    Ok(tar_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_single_file_tar_contains_file() {
        let archive = single_file_tar("jq-1.8.1.tar.gz".as_ref(), b"payload").unwrap();
        let mut reader = tar::Archive::new(archive.as_slice());
        let mut entries = reader.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str(), Some("jq-1.8.1.tar.gz"));
        assert_eq!(entry.header().mode().unwrap(), 0o644);
        let mut body = String::new();
        entry.read_to_string(&mut body).unwrap();
        assert_eq!(body, "payload");
        assert!(entries.next().is_none());
    }

    #[test]
    fn test_is_gone_matches_not_found() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container: x".to_string(),
        };
        assert!(is_gone(&err));

        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        };
        assert!(!is_gone(&err));
    }

    #[tokio::test]
    async fn test_remove_on_unreachable_engine_is_engine_error() {
        let engine = ContainerEngine::unreachable("docker");
        let err = engine.remove("benchbox-missing").await.unwrap_err();
        assert!(matches!(err, SandboxError::Engine { .. }), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_connect_without_docker_is_prerequisite_error() {
        // Passes either way; asserts the error classification when no daemon is reachable.
        match ContainerEngine::connect("docker").await {
            Ok(engine) => assert_eq!(engine.program(), "docker"),
            Err(e) => assert!(e.is_prerequisite_missing(), "unexpected error: {e}"),
        }
    }
}
