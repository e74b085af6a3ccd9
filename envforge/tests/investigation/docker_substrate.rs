//! Investigation tests for the Docker CLI substrate.
//!
//! # Prerequisites
//!
//! - `docker` in PATH with a reachable daemon
//! - `debian:bookworm-slim` pullable (or already present)
//!
//! # Running
//!
//! ```bash
//! cargo test --test investigation docker -- --ignored
//! ```

use std::time::Duration;

use envforge::core::heuristics::Heuristics;
use envforge::io::docker::{DockerSettings, DockerSubstrate, TIMEOUT_EXIT_CODE};
use envforge::io::substrate::{ContextSpec, Substrate};
use envforge::io::config::EnvforgeConfig;
use envforge::run::sandbox_settings;
use envforge::sandbox::{SandboxEngine, SandboxSettings};

const IMAGE: &str = "debian:bookworm-slim";

fn substrate(label: &str, timeout: Duration) -> DockerSubstrate {
    DockerSubstrate::new(DockerSettings {
        docker_bin: "docker".to_string(),
        command_timeout: timeout,
        output_limit_bytes: 64 * 1024,
        snapshot_repository: "envforge-investigation".to_string(),
        run_label: label.to_string(),
    })
}

fn spec() -> ContextSpec {
    ContextSpec {
        workdir: "/work".to_string(),
        mounts: Vec::new(),
    }
}

/// Verifies a snapshot carries file changes into a fresh container.
#[test]
#[ignore]
fn docker_snapshot_restores_file_state() {
    let docker = substrate("snapshot", Duration::from_secs(60));
    let ctx = docker.start(&spec(), IMAGE).expect("start");

    let write = docker
        .exec(&ctx, "mkdir -p /work && echo forged > /work/marker")
        .expect("exec");
    assert_eq!(write.exit_code, 0, "{}", write.output);

    let snapshot = docker.snapshot(&ctx, "1").expect("commit");
    println!("snapshot: {snapshot}");
    docker.destroy(&ctx).expect("rm");

    let restored = docker.start(&spec(), &snapshot).expect("start from snapshot");
    let read = docker.exec(&restored, "cat /work/marker").expect("exec");
    assert_eq!(read.output.trim(), "forged");

    docker.destroy(&restored).expect("rm restored");
    docker.remove_snapshot(&snapshot).expect("rmi");
}

/// Verifies a command past its timeout reports the timeout exit code.
#[test]
#[ignore]
fn docker_exec_timeout_reports_exit_124() {
    let docker = substrate("timeout", Duration::from_secs(2));
    let ctx = docker.start(&spec(), IMAGE).expect("start");

    let output = docker.exec(&ctx, "sleep 30").expect("exec");
    assert_eq!(output.exit_code, TIMEOUT_EXIT_CODE);
    assert!(output.output.contains("timed out"), "{}", output.output);

    docker.destroy(&ctx).expect("rm");
}

/// Verifies the engine rolls a real container back after a failing command.
#[test]
#[ignore]
fn docker_engine_rolls_back_failed_command() {
    let docker = substrate("rollback", Duration::from_secs(60));
    let settings = SandboxSettings {
        base_image: IMAGE.to_string(),
        context: spec(),
        seed: None,
    };
    let mut engine = SandboxEngine::start(docker, settings, Heuristics::default()).expect("start");

    let good = engine.execute("mkdir -p /work && touch /work/a").expect("a");
    assert!(good.success);
    let bad = engine.execute("touch /work/b && false").expect("b");
    assert!(!bad.success);

    let listing = engine.execute("ls /work").expect("ls");
    assert_eq!(listing.output.split_whitespace().collect::<Vec<_>>(), ["a"]);

    engine.close(false).expect("close");
}

/// Verifies failed writes under the workdir are erased when the checkout is
/// mounted the way `envforge run` mounts it.
#[test]
#[ignore]
fn docker_rollback_erases_workdir_changes_with_checkout_mount() {
    let checkout = tempfile::tempdir().expect("tempdir");
    std::fs::write(checkout.path().join("setup.py"), "print('setup')\n").expect("write");
    let cfg = EnvforgeConfig {
        sandbox: envforge::io::config::SandboxConfig {
            base_image: IMAGE.to_string(),
            ..EnvforgeConfig::default().sandbox
        },
        ..EnvforgeConfig::default()
    };
    let settings = sandbox_settings(&cfg, checkout.path());
    let docker = substrate("checkout", Duration::from_secs(60));
    let mut engine = SandboxEngine::start(docker, settings, Heuristics::default()).expect("start");

    let bad = engine
        .execute("mkdir widget.egg-info && rm setup.py && false")
        .expect("failing command");
    assert!(!bad.success);

    let listing = engine.execute("ls -A").expect("ls");
    assert_eq!(listing.output.split_whitespace().collect::<Vec<_>>(), ["setup.py"]);
    assert!(checkout.path().join("setup.py").is_file());
    assert!(!checkout.path().join("widget.egg-info").exists());

    engine.close(false).expect("close");
}
