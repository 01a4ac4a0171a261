//! Built-in sandbox environments offered to agents.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::Config;
use crate::sandbox::{BackendKind, NetworkPolicy, Result, Sandbox, SandboxOptions};

const WORKDIR: &str = "/home/peter";

/// Named combination of image, network policy and backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentDescriptor {
    /// Unique environment name.
    pub name: String,
    /// Image build target; several environments may share one.
    pub container_name: String,
    /// Whether the container gets network access.
    pub is_online: bool,
    /// Instructions handed to the agent.
    pub system_prompt: String,
    /// Whether commands go through the HTTP bridge.
    #[serde(default)]
    pub use_bridge: bool,
}

struct Entry {
    name: &'static str,
    target: &'static str,
    os_label: &'static str,
    online: bool,
    bridge: bool,
}

const CATALOG: &[Entry] = &[
    Entry {
        name: "ubuntu-22.04-amd64",
        target: "ubuntu-22.04-amd64",
        os_label: "Ubuntu 22.04",
        online: true,
        bridge: false,
    },
    Entry {
        name: "ubuntu-22.04-amd64-offline",
        target: "ubuntu-22.04-amd64",
        os_label: "Ubuntu 22.04",
        online: false,
        bridge: false,
    },
    Entry {
        name: "ubuntu-22.04-amd64-cross-arm64",
        target: "ubuntu-22.04-amd64-cross-arm64",
        os_label: "Ubuntu 22.04",
        online: true,
        bridge: false,
    },
    Entry {
        name: "ubuntu-22.04-amd64-wine",
        target: "ubuntu-22.04-amd64-wine",
        os_label: "Ubuntu 22.04",
        online: true,
        bridge: false,
    },
    Entry {
        name: "alpine-3.22.1-amd64",
        target: "alpine-3.22.1-amd64",
        os_label: "Alpine Linux 3.22.1",
        online: true,
        bridge: false,
    },
    Entry {
        name: "alpine-3.22.1-amd64-offline",
        target: "alpine-3.22.1-amd64",
        os_label: "Alpine Linux 3.22.1",
        online: false,
        bridge: false,
    },
    Entry {
        name: "simple-openhands",
        target: "simple-openhands",
        os_label: "Ubuntu",
        online: true,
        bridge: true,
    },
    Entry {
        name: "simple-openhands-offline",
        target: "simple-openhands",
        os_label: "Ubuntu",
        online: false,
        bridge: true,
    },
    Entry {
        name: "simple-openhands-cross-arm64",
        target: "simple-openhands-cross-arm64",
        os_label: "Ubuntu",
        online: true,
        bridge: true,
    },
    Entry {
        name: "simple-openhands-wine",
        target: "simple-openhands-wine",
        os_label: "Ubuntu",
        online: true,
        bridge: true,
    },
];

impl Entry {
    fn descriptor(&self, bridge_program: &str) -> EnvironmentDescriptor {
        EnvironmentDescriptor {
            name: self.name.to_string(),
            container_name: self.target.to_string(),
            is_online: self.online,
            system_prompt: system_prompt(self, bridge_program),
            use_bridge: self.bridge,
        }
    }
}

fn system_prompt(entry: &Entry, bridge_program: &str) -> String {
    let apt_style = entry.os_label.starts_with("Ubuntu");
    let mut lines = vec![format!(
        "You are a package-building specialist operating a {} bash shell via one tool: run_terminal_cmd.",
        entry.os_label
    )];

    if entry.bridge {
        lines.push(
            "Commands execute in a persistent shell session where environment variables, virtual environments, and working directory persist between commands.".to_string(),
        );
        lines.push(format!("The initial working directory is {WORKDIR}."));
    } else {
        lines.push(format!(
            "The current working directory of every run_terminal_cmd is {WORKDIR}."
        ));
    }

    lines.push("Execution rules:".to_string());
    if entry.bridge {
        lines.push(format!(
            "- IMPORTANT: Always prefix your commands with '{bridge_program} ' and wrap the actual shell in double quotes (e.g., {bridge_program} \"ls -la\" or {bridge_program} \"cd /tmp && make\")."
        ));
    }
    lines.push(if apt_style {
        "- Always pass non-interactive flags for any command that could prompt (e.g., `-y`, `--yes`, `DEBIAN_FRONTEND=noninteractive`).".to_string()
    } else {
        "- Always pass non-interactive flags for any command that could prompt (e.g., `-y`, `--yes`).".to_string()
    });
    if entry.bridge {
        lines.push(
            "- One command at a time: You can only execute one bash command at a time. If you need to run multiple commands sequentially, you can use `&&` or `;` to chain them together.".to_string(),
        );
    }
    lines.push("- Don't include any newlines in the command.".to_string());
    if apt_style {
        lines.push(
            "- Do NOT use `set -e`, `set -eu`, or `set -euo pipefail`. These can cause unusable shell sessions.".to_string(),
        );
    }
    lines.push(if entry.online {
        "- You can use sudo.".to_string()
    } else {
        "- The environment is offline, assume you have all the necessary tools already installed.".to_string()
    });
    if entry.bridge {
        lines.push("Best practices:".to_string());
        lines.push(
            "- Prefer absolute paths over excessive use of `cd` to maintain clarity.".to_string(),
        );
    }
    lines.push(
        "If you encounter any errors or issues while doing the user's request, you must fix them and continue the task.".to_string(),
    );
    lines.push("At the end verify you did the user request correctly.".to_string());
    lines.join(" \n")
}

/// Every built-in environment, prompts rendered for `bridge_program`.
pub fn catalog(bridge_program: &str) -> Vec<EnvironmentDescriptor> {
    CATALOG
        .iter()
        .map(|entry| entry.descriptor(bridge_program))
        .collect()
}

/// Looks up a built-in environment by name.
pub fn find(name: &str, bridge_program: &str) -> Option<EnvironmentDescriptor> {
    CATALOG
        .iter()
        .find(|entry| entry.name == name)
        .map(|entry| entry.descriptor(bridge_program))
}

impl EnvironmentDescriptor {
    /// Network policy implied by `is_online`.
    pub fn network(&self) -> NetworkPolicy {
        NetworkPolicy::from_online(self.is_online)
    }

    /// Backend implied by `use_bridge`.
    pub fn backend(&self) -> BackendKind {
        BackendKind::from_use_bridge(self.use_bridge)
    }

    /// Sandbox options for this environment.
    pub fn options(&self, command_timeout: Duration, config: &Config) -> SandboxOptions {
        SandboxOptions {
            backend: self.backend(),
            network: self.network(),
            command_timeout,
            ..SandboxOptions::new(&self.container_name, config)
        }
    }

    /// Starts a sandbox for this environment.
    pub async fn create_sandbox(&self, command_timeout: Duration, config: &Config) -> Result<Sandbox> {
        Sandbox::start(self.options(command_timeout, config), config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_catalog_names_are_unique() {
        let envs = catalog("oh-run");
        let names: HashSet<_> = envs.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names.len(), envs.len());
        assert_eq!(envs.len(), 10);
    }

    #[test]
    fn test_offline_variant_shares_image() {
        let env = find("ubuntu-22.04-amd64-offline", "oh-run").unwrap();
        assert_eq!(env.container_name, "ubuntu-22.04-amd64");
        assert_eq!(env.network(), NetworkPolicy::Offline);
        assert_eq!(env.backend(), BackendKind::PipeHarness);
        assert!(env.system_prompt.contains("The environment is offline"));
        assert!(!env.system_prompt.contains("sudo"));
    }

    #[test]
    fn test_bridge_environment_prompt() {
        let env = find("simple-openhands", "oh-run").unwrap();
        assert!(env.use_bridge);
        assert_eq!(env.backend(), BackendKind::HttpBridge);
        assert!(env
            .system_prompt
            .contains("Always prefix your commands with 'oh-run '"));
        assert!(env.system_prompt.contains("persistent shell session"));
    }

    #[test]
    fn test_alpine_prompt_omits_apt_rules() {
        let env = find("alpine-3.22.1-amd64", "oh-run").unwrap();
        assert!(env.system_prompt.contains("Alpine Linux 3.22.1"));
        assert!(!env.system_prompt.contains("DEBIAN_FRONTEND"));
        assert!(!env.system_prompt.contains("set -e"));
    }

    #[test]
    fn test_unknown_environment() {
        assert!(find("windows-11", "oh-run").is_none());
    }

    #[test]
    fn test_descriptor_json_field_names() {
        let env = find("alpine-3.22.1-amd64", "oh-run").unwrap();
        let value = serde_json::to_value(&env).unwrap();
        for field in ["name", "container_name", "is_online", "system_prompt", "use_bridge"] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
    }

    #[test]
    fn test_options_follow_descriptor() {
        let config = Config::default();
        let env = find("simple-openhands-offline", "oh-run").unwrap();
        let options = env.options(Duration::from_secs(30), &config);
        assert_eq!(options.image_target, "simple-openhands");
        assert_eq!(options.backend, BackendKind::HttpBridge);
        assert_eq!(options.network, NetworkPolicy::Offline);
        assert_eq!(options.command_timeout, Duration::from_secs(30));
    }
}
