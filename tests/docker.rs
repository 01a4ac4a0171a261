//! End-to-end sandbox tests against a real container engine.
//!
//! Skipped unless `BENCHBOX_CONTAINERS_DIR` points at a directory with the
//! image build Makefile and `docker` is on `PATH`.

use std::path::PathBuf;
use std::time::Duration;

use benchbox::environment;
use benchbox::{Config, LifecycleState, Sandbox, SandboxError};

fn config() -> Option<Config> {
    let dir = std::env::var_os("BENCHBOX_CONTAINERS_DIR")?;
    if which::which("docker").is_err() {
        return None;
    }
    let mut config = Config::default();
    config.images.containers_dir = PathBuf::from(dir);
    Some(config)
}

async fn start(env_name: &str, config: &Config) -> Sandbox {
    let env = environment::find(env_name, &config.bridge.program).unwrap();
    env.create_sandbox(Duration::from_secs(60), config)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_echo_hello() {
    let Some(config) = config() else { return };
    let sandbox = start("ubuntu-22.04-amd64", &config).await;

    let output = sandbox.run("echo hello").await.unwrap();
    assert!(output.contains("hello"), "unexpected output: {output}");

    sandbox.dispose().await.unwrap();
}

#[tokio::test]
async fn test_offline_blocks_network_but_not_local_commands() {
    let Some(config) = config() else { return };
    let sandbox = start("ubuntu-22.04-amd64-offline", &config).await;

    let output = sandbox
        .run("curl -sS -m 5 https://example.com >/dev/null && echo NET_OK || echo NET_FAIL")
        .await
        .unwrap();
    assert!(output.contains("NET_FAIL"), "network reachable offline: {output}");

    let output = sandbox.run("echo local-ok").await.unwrap();
    assert!(output.contains("local-ok"));

    sandbox.dispose().await.unwrap();
}

#[tokio::test]
async fn test_online_reaches_network() {
    let Some(config) = config() else { return };
    let sandbox = start("ubuntu-22.04-amd64", &config).await;

    let output = sandbox
        .run("curl -sS -m 10 https://example.com >/dev/null && echo NET_OK || echo NET_FAIL")
        .await
        .unwrap();
    assert!(output.contains("NET_OK"), "network unreachable online: {output}");

    sandbox.dispose().await.unwrap();
}

#[tokio::test]
async fn test_bash_script_and_validation_channel() {
    let Some(config) = config() else { return };
    let sandbox = start("ubuntu-22.04-amd64", &config).await;

    let script = "#!/bin/bash\nname='quoted \"value\"'\necho \"$name\"\n";
    let output = sandbox.run_bash_script(script).await.unwrap();
    assert!(output.contains("quoted \"value\""));

    let output = sandbox
        .run_validation_bash_script("echo '[TASK_SUCCESS] ran'\n")
        .await
        .unwrap();
    assert!(benchbox::report::script_succeeded(&output));

    sandbox.dispose().await.unwrap();
}

#[tokio::test]
async fn test_dispose_is_idempotent_and_final() {
    let Some(config) = config() else { return };
    let sandbox = start("ubuntu-22.04-amd64", &config).await;

    sandbox.dispose().await.unwrap();
    sandbox.dispose().await.unwrap();
    assert_eq!(sandbox.state(), LifecycleState::Disposed);
    assert!(sandbox.container_name().is_none());

    let err = sandbox.run("echo hello").await.unwrap_err();
    assert!(matches!(err, SandboxError::Usage(_)));
}
