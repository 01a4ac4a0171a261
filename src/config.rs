//! `benchbox.toml` configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "benchbox.toml";

/// Top-level configuration, loaded from `benchbox.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Image build settings
    #[serde(default)]
    pub images: ImagesConfig,
    /// Container launch settings
    #[serde(default)]
    pub container: ContainerSettings,
    /// HTTP bridge settings
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// Download cache settings
    #[serde(default)]
    pub cache: CacheConfig,
    /// Timeouts and buffer sizes
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Where and how sandbox images are built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagesConfig {
    /// Directory holding the image build Makefile.
    /// Relative paths resolve against the directory the config was loaded from.
    #[serde(default = "default_containers_dir")]
    pub containers_dir: PathBuf,

    /// Image repository prefix; images are tagged `<prefix>/<target>:latest`
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,

    /// Build tool invoked as `<tool> -C <containers_dir> <target>`
    #[serde(default = "default_build_tool")]
    pub build_tool: String,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            containers_dir: default_containers_dir(),
            tag_prefix: default_tag_prefix(),
            build_tool: default_build_tool(),
        }
    }
}

fn default_containers_dir() -> PathBuf {
    PathBuf::from("containers")
}

fn default_tag_prefix() -> String {
    "benchbox".to_string()
}

fn default_build_tool() -> String {
    "make".to_string()
}

/// How sandbox containers are launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSettings {
    /// Engine CLI binary
    #[serde(default = "default_engine")]
    pub engine: String,

    /// Container names are `<name_prefix>-<random id>`
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Non-root user commands run as
    #[serde(default = "default_user")]
    pub user: String,

    /// Working directory inside the container
    #[serde(default = "default_workdir")]
    pub workdir: String,

    /// Path of the shell harness binary inside the image
    #[serde(default = "default_harness_path")]
    pub harness_path: String,

    /// Port the in-container HTTP service listens on
    #[serde(default = "default_service_port")]
    pub service_port: u16,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            name_prefix: default_name_prefix(),
            user: default_user(),
            workdir: default_workdir(),
            harness_path: default_harness_path(),
            service_port: default_service_port(),
        }
    }
}

fn default_engine() -> String {
    "docker".to_string()
}

fn default_name_prefix() -> String {
    "benchbox-container".to_string()
}

fn default_user() -> String {
    "peter".to_string()
}

fn default_workdir() -> String {
    "/home/peter".to_string()
}

fn default_harness_path() -> String {
    "/bin/shell-harness".to_string()
}

fn default_service_port() -> u16 {
    8000
}

/// Host-side bridge program used by HTTP-backed images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Bridge executable; commands starting with this token are passed through
    #[serde(default = "default_bridge_program")]
    pub program: String,

    /// Host environment variable forwarded to the bridge as `OH_API_KEY`
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Number of `/alive` polls before giving up
    #[serde(default = "default_readiness_attempts")]
    pub readiness_attempts: u32,

    /// Delay between `/alive` polls in milliseconds
    #[serde(default = "default_readiness_interval_ms")]
    pub readiness_interval_ms: u64,

    /// Attempts of the post-readiness `echo hello` smoke test
    #[serde(default = "default_smoke_attempts")]
    pub smoke_attempts: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            program: default_bridge_program(),
            api_key_env: default_api_key_env(),
            readiness_attempts: default_readiness_attempts(),
            readiness_interval_ms: default_readiness_interval_ms(),
            smoke_attempts: default_smoke_attempts(),
        }
    }
}

impl BridgeConfig {
    /// Delay between readiness polls.
    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }
}

fn default_bridge_program() -> String {
    "oh-run".to_string()
}

fn default_api_key_env() -> String {
    "OH_API_KEY".to_string()
}

fn default_readiness_attempts() -> u32 {
    90
}

fn default_readiness_interval_ms() -> u64 {
    1000
}

fn default_smoke_attempts() -> u32 {
    10
}

/// Download cache location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache directory; defaults to `<containers_dir>/../.cache/downloads`
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// Timeouts and buffer sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Per-command timeout handed to the harness
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Extra time granted beyond the command timeout before the host gives up
    #[serde(default = "default_response_grace_secs")]
    pub response_grace_secs: u64,

    /// Upper bound on captured harness stderr
    #[serde(default = "default_stderr_capture_bytes")]
    pub stderr_capture_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
            response_grace_secs: default_response_grace_secs(),
            stderr_capture_bytes: default_stderr_capture_bytes(),
        }
    }
}

impl LimitsConfig {
    /// Per-command timeout.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Host-side grace period beyond the command timeout.
    pub fn response_grace(&self) -> Duration {
        Duration::from_secs(self.response_grace_secs)
    }
}

fn default_command_timeout_secs() -> u64 {
    60
}

fn default_response_grace_secs() -> u64 {
    30
}

fn default_stderr_capture_bytes() -> usize {
    64 * 1024
}

impl Config {
    /// Load configuration from `benchbox.toml` in `project_dir`, using defaults if not found.
    ///
    /// Relative paths in the file are resolved against `project_dir`.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(CONFIG_FILE);

        if config_path.exists() {
            return Self::from_file(&config_path);
        }

        let mut config = Self::default();
        config.resolve_paths(project_dir);
        Ok(config)
    }

    /// Resolves configuration for a CLI invocation.
    ///
    /// Order: explicit `path`, `benchbox.toml` in `project_dir`, the per-user
    /// config directory, then defaults relative to `project_dir`.
    pub fn discover(path: Option<&Path>, project_dir: &Path) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        if project_dir.join(CONFIG_FILE).exists() {
            return Self::load(project_dir);
        }
        if let Some(user_file) = user_config_file().filter(|file| file.exists()) {
            return Self::from_file(&user_file);
        }
        Self::load(project_dir)
    }

    /// Load configuration from an explicit file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        if self.images.containers_dir.is_relative() {
            self.images.containers_dir = base.join(&self.images.containers_dir);
        }
        if let Some(dir) = self.cache.dir.as_mut() {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
    }

    /// Effective download cache directory.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache.dir.clone().unwrap_or_else(|| {
            self.images
                .containers_dir
                .join("..")
                .join(".cache")
                .join("downloads")
        })
    }
}

/// `<config dir>/benchbox/benchbox.toml`, when the platform has a config dir.
pub fn user_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("benchbox").join(CONFIG_FILE))
}
