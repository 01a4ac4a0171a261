//! Domain-specific error types for sandbox operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings.

use std::fmt;

use super::output::truncate;

/// Result alias used throughout the sandbox layer.
pub type Result<T, E = SandboxError> = std::result::Result<T, E>;

/// The two independently locked execution channels of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// The channel serving interactive commands.
    Primary,
    /// The channel serving post-episode validation scripts.
    Validation,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Validation => write!(f, "validation"),
        }
    }
}

/// Advisory diagnosis attached to a container start failure.
///
/// Derived from pattern matching engine output, so it may be wrong on other
/// engine versions. Never branch on these for control flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartHint {
    /// The published host port is already bound.
    PortInUse {
        /// Host port that was requested.
        port: u16,
    },
    /// The image does not exist locally.
    ImageMissing {
        /// Image tag that was requested.
        image: String,
    },
    /// The engine daemon refused access.
    PermissionDenied,
    /// Another container already uses the requested name.
    NameCollision,
}

impl fmt::Display for StartHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PortInUse { port } => {
                write!(f, "HINT: Host port {port} is busy. Retry with another port.")
            }
            Self::ImageMissing { image } => write!(
                f,
                "HINT: Image {image} not found. Ensure the image build target succeeded."
            ),
            Self::PermissionDenied => write!(
                f,
                "HINT: Docker daemon permissions. Ensure your user can run docker or the daemon is running."
            ),
            Self::NameCollision => write!(
                f,
                "HINT: Container name collision. Try a different name or remove the existing container."
            ),
        }
    }
}

/// Derives start-failure hints from captured engine output.
pub fn classify_start_failure(output: &str, port: Option<u16>, image: &str) -> Vec<StartHint> {
    let lower = output.to_lowercase();
    let mut hints = Vec::new();

    if let Some(port) = port {
        if lower.contains("address already in use") || lower.contains("port is already allocated")
        {
            hints.push(StartHint::PortInUse { port });
        }
    }
    if lower.contains("no such image") || lower.contains("unable to find image") {
        hints.push(StartHint::ImageMissing {
            image: image.to_string(),
        });
    }
    if lower.contains("permission denied") {
        hints.push(StartHint::PermissionDenied);
    }
    if lower.contains("is already in use by container") {
        hints.push(StartHint::NameCollision);
    }

    hints
}

fn render_hints(hints: &[StartHint]) -> String {
    hints.iter().map(|hint| format!("\n{hint}")).collect()
}

#[allow(clippy::ref_option)]
fn render_exit_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |code| code.to_string())
}

/// Errors that can occur during sandbox operations.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// A required host tool or service is not available.
    #[error("{tool} is not available: {reason}")]
    PrerequisiteMissing { tool: String, reason: String },

    /// The image build procedure failed.
    #[error("failed to build image target {target}: {message}\nSTDOUT:\n{stdout}\nSTDERR:\n{stderr}")]
    BuildFailed {
        target: String,
        message: String,
        stdout: String,
        stderr: String,
    },

    /// The container could not be started.
    #[error("failed to start container {container}: {message}{}\nSTDOUT:\n{stdout}\nSTDERR:\n{stderr}", render_hints(.hints))]
    StartFailed {
        container: String,
        message: String,
        hints: Vec<StartHint>,
        stdout: String,
        stderr: String,
    },

    /// The in-container service never reported ready.
    #[error("{service} did not become ready within {waited_secs} seconds")]
    ReadinessTimeout { service: String, waited_secs: u64 },

    /// The harness answered with something that is not a response frame.
    #[error("malformed harness response on {channel} channel: {message} (raw: {raw})")]
    ProtocolDesync {
        channel: ChannelKind,
        message: String,
        raw: String,
    },

    /// The governing deadline expired or the stream ended mid-exchange.
    #[error("context timeout on {channel} channel: {message}")]
    ChannelTimeout {
        channel: ChannelKind,
        message: String,
    },

    /// A non-channel operation outlived the governing deadline.
    #[error("deadline exceeded while {operation}")]
    DeadlineExceeded { operation: String },

    /// An external command exited unsuccessfully.
    #[error("command failed (exit {}): {command}\nSTDOUT:\n{stdout}\nSTDERR:\n{stderr}", render_exit_code(.exit_code))]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// Fetching an artifact failed.
    #[error("download of {url} failed: {message}")]
    DownloadFailed { url: String, message: String },

    /// The caller passed something unusable.
    #[error("invalid usage: {0}")]
    Usage(String),

    /// The container engine API returned an error.
    #[error("container engine error while {operation}: {source}")]
    Engine {
        operation: String,
        #[source]
        source: bollard::errors::Error,
    },

    /// A local I/O operation failed.
    #[error("I/O error while {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

impl SandboxError {
    /// Creates a `PrerequisiteMissing` error.
    pub fn prerequisite_missing(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PrerequisiteMissing {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `BuildFailed` error, truncating captured output.
    pub fn build_failed(
        target: impl Into<String>,
        message: impl Into<String>,
        stdout: &str,
        stderr: &str,
    ) -> Self {
        Self::BuildFailed {
            target: target.into(),
            message: message.into(),
            stdout: truncate(stdout),
            stderr: truncate(stderr),
        }
    }

    /// Creates a `StartFailed` error with hints derived from the captured output.
    pub fn start_failed(
        container: impl Into<String>,
        message: impl Into<String>,
        image: &str,
        port: Option<u16>,
        stdout: &str,
        stderr: &str,
    ) -> Self {
        let message = message.into();
        let combined = format!("{message}\n{stdout}\n{stderr}");
        Self::StartFailed {
            container: container.into(),
            hints: classify_start_failure(&combined, port, image),
            message,
            stdout: truncate(stdout),
            stderr: truncate(stderr),
        }
    }

    /// Creates a `ReadinessTimeout` error.
    pub fn readiness_timeout(service: impl Into<String>, waited_secs: u64) -> Self {
        Self::ReadinessTimeout {
            service: service.into(),
            waited_secs,
        }
    }

    /// Creates a `ProtocolDesync` error carrying the offending bytes.
    pub fn protocol_desync(channel: ChannelKind, message: impl Into<String>, raw: &[u8]) -> Self {
        Self::ProtocolDesync {
            channel,
            message: message.into(),
            raw: truncate(&String::from_utf8_lossy(raw)),
        }
    }

    /// Creates a `ChannelTimeout` error.
    pub fn channel_timeout(channel: ChannelKind, message: impl Into<String>) -> Self {
        Self::ChannelTimeout {
            channel,
            message: message.into(),
        }
    }

    /// Creates a `DeadlineExceeded` error.
    pub fn deadline_exceeded(operation: impl Into<String>) -> Self {
        Self::DeadlineExceeded {
            operation: operation.into(),
        }
    }

    /// Creates a `CommandFailed` error, truncating captured output.
    pub fn command_failed(
        command: impl Into<String>,
        exit_code: Option<i32>,
        stdout: &str,
        stderr: &str,
    ) -> Self {
        Self::CommandFailed {
            command: command.into(),
            exit_code,
            stdout: truncate(stdout),
            stderr: truncate(stderr),
        }
    }

    /// Creates a `DownloadFailed` error.
    pub fn download_failed(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DownloadFailed {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates a `Usage` error.
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }

    /// Creates an `Engine` error.
    pub fn engine(operation: impl Into<String>, source: bollard::errors::Error) -> Self {
        Self::Engine {
            operation: operation.into(),
            source,
        }
    }

    /// Creates an `Io` error.
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Returns true if this error came from an expired deadline or a silent peer.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ChannelTimeout { .. }
                | Self::DeadlineExceeded { .. }
                | Self::ReadinessTimeout { .. }
        )
    }

    /// Returns true if the harness produced an unparseable frame.
    pub fn is_desync(&self) -> bool {
        matches!(self, Self::ProtocolDesync { .. })
    }

    /// Returns true if a host prerequisite is missing.
    pub fn is_prerequisite_missing(&self) -> bool {
        matches!(self, Self::PrerequisiteMissing { .. })
    }

    /// Returns true if the caller misused the API.
    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }

    /// Start hints attached to this error, if any.
    pub fn hints(&self) -> &[StartHint] {
        match self {
            Self::StartFailed { hints, .. } => hints,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prerequisite_missing_error() {
        let err = SandboxError::prerequisite_missing("docker", "not found in PATH");
        assert!(err.is_prerequisite_missing());
        assert!(!err.is_timeout());
        assert_eq!(err.to_string(), "docker is not available: not found in PATH");
    }

    #[test]
    fn test_start_failed_collects_hints() {
        let err = SandboxError::start_failed(
            "benchbox-container-abc",
            "docker run exited",
            "benchbox/ubuntu:latest",
            Some(41234),
            "",
            "Error: Bind for 127.0.0.1:41234 failed: port is already allocated\n\
             Got permission denied while trying to connect to the Docker daemon socket",
        );
        assert_eq!(
            err.hints(),
            &[
                StartHint::PortInUse { port: 41234 },
                StartHint::PermissionDenied
            ]
        );
        let text = err.to_string();
        assert!(text.contains("HINT: Host port 41234 is busy"));
        assert!(text.contains("HINT: Docker daemon permissions"));
    }

    #[test]
    fn test_classify_image_missing_and_collision() {
        let hints = classify_start_failure(
            "Unable to find image 'x:latest' locally\n\
             Conflict. The container name \"/c\" is already in use by container \"abc\"",
            None,
            "x:latest",
        );
        assert_eq!(
            hints,
            vec![
                StartHint::ImageMissing {
                    image: "x:latest".to_string()
                },
                StartHint::NameCollision
            ]
        );
    }

    #[test]
    fn test_classify_ignores_port_without_port() {
        assert!(classify_start_failure("address already in use", None, "x").is_empty());
    }

    #[test]
    fn test_channel_timeout_error() {
        let err = SandboxError::channel_timeout(ChannelKind::Validation, "stream closed");
        assert!(err.is_timeout());
        assert!(!err.is_desync());
        assert_eq!(
            err.to_string(),
            "context timeout on validation channel: stream closed"
        );
    }

    #[test]
    fn test_protocol_desync_keeps_raw_bytes() {
        let err = SandboxError::protocol_desync(ChannelKind::Primary, "expected value", b"garbage");
        assert!(err.is_desync());
        assert!(err.to_string().contains("(raw: garbage)"));
    }

    #[test]
    fn test_command_failed_renders_exit_code() {
        let err = SandboxError::command_failed("oh-run ls", Some(2), "out", "err");
        assert!(err.to_string().starts_with("command failed (exit 2): oh-run ls"));

        let killed = SandboxError::command_failed("oh-run ls", None, "", "");
        assert!(killed.to_string().starts_with("command failed (exit signal)"));
    }

    #[test]
    fn test_error_variants_are_distinct() {
        let timeout = SandboxError::deadline_exceeded("building image");
        let usage = SandboxError::usage("relative path");
        let missing = SandboxError::prerequisite_missing("make", "not found");

        assert!(timeout.is_timeout());
        assert!(!timeout.is_usage());
        assert!(usage.is_usage());
        assert!(!usage.is_timeout());
        assert!(missing.is_prerequisite_missing());
        assert!(!missing.is_usage());
    }
}
