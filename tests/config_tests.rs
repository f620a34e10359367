//! Configuration system tests
//!
//! Tests configuration loading, validation, and environment overrides
//! through the `config` subcommands

mod common;

use std::fs;
use std::path::PathBuf;

use predicates::prelude::*;
use tempfile::TempDir;

use common::meshbench_cmd;

/// Test fixture for configuration testing
struct ConfigFixture {
    _temp_dir: TempDir,
    config_path: PathBuf,
}

impl ConfigFixture {
    fn new(content: &str) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, content).unwrap();
        Self {
            _temp_dir: temp_dir,
            config_path,
        }
    }

    fn path(&self) -> &str {
        self.config_path.to_str().unwrap()
    }

    fn validate(&self) -> assert_cmd::assert::Assert {
        meshbench_cmd()
            .args(["config", "validate", "--config", self.path()])
            .assert()
    }

    fn show(&self) -> assert_cmd::assert::Assert {
        meshbench_cmd()
            .args(["config", "show", "--config", self.path()])
            .assert()
    }
}

// ─────────────────────────────────────────────────────────────────
// Valid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_empty_config_uses_defaults() {
    let fixture = ConfigFixture::new("");
    fixture.validate().success();
    fixture
        .show()
        .success()
        .stdout(predicate::str::contains("num_workers = 2"))
        .stdout(predicate::str::contains("coalesce_threshold = 131072"))
        .stdout(predicate::str::contains("gather = false"))
        .stdout(predicate::str::contains("backend = \"stream\""));
}

#[test]
fn test_full_config() {
    let fixture = ConfigFixture::new(
        r#"
[cluster]
num_workers = 8
endpoints = 2
monitor_port = 13337
monitor_host = "10.0.0.1"

[network]
interface = "lo"
listen_port = 0

[transport]
backend = "native"
native_mode = "am"
coalesce_threshold = 262144

[exchange]
payload_size = 4096
iterations = 10
client_sends_first = true
warmup = false

[timing]
connect_backoff_ms = 50
connect_max_wait_ms = 30000
poll_interval_ms = 20
completion_poll_interval_ms = 1
barrier = "notify"

[logging]
level = "debug"
file = "/tmp/meshbench-test.log"
max_files = 3
json_format = true
"#,
    );

    fixture.validate().success();
    fixture
        .show()
        .success()
        .stdout(predicate::str::contains("native_mode = \"am\""))
        .stdout(predicate::str::contains("barrier = \"notify\""))
        .stdout(predicate::str::contains("monitor_port = 13337"));
}

// ─────────────────────────────────────────────────────────────────
// Invalid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_zero_endpoints() {
    ConfigFixture::new("[cluster]\nendpoints = 0\n")
        .validate()
        .failure()
        .stderr(predicate::str::contains("endpoints"));
}

#[test]
fn test_zero_iterations() {
    ConfigFixture::new("[exchange]\niterations = 0\n")
        .validate()
        .failure();
}

#[test]
fn test_oversized_payload() {
    ConfigFixture::new("[exchange]\npayload_size = 4294967296\n")
        .validate()
        .failure()
        .stderr(predicate::str::contains("payload_size"));
}

#[test]
fn test_fixed_listen_port_with_many_workers() {
    ConfigFixture::new("[cluster]\nnum_workers = 4\n\n[network]\nlisten_port = 47000\n")
        .validate()
        .failure()
        .stderr(predicate::str::contains("listen_port"));

    ConfigFixture::new("[cluster]\nnum_workers = 1\n\n[network]\nlisten_port = 47000\n")
        .validate()
        .success();
}

#[test]
fn test_unknown_transport() {
    ConfigFixture::new("[transport]\nbackend = \"ucx\"\n")
        .validate()
        .failure();
}

#[test]
fn test_invalid_log_level() {
    ConfigFixture::new("[logging]\nlevel = \"chatty\"\n")
        .validate()
        .failure()
        .stderr(predicate::str::contains("log level"));
}

#[test]
fn test_malformed_toml() {
    ConfigFixture::new("[cluster\nnum_workers = 2\n")
        .validate()
        .failure()
        .stderr(predicate::str::contains("parse"));
}

// ─────────────────────────────────────────────────────────────────
// Environment Override Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_env_overrides_file() {
    let fixture = ConfigFixture::new("[cluster]\nnum_workers = 4\n");

    meshbench_cmd()
        .args(["config", "show", "--config", fixture.path()])
        .env("MESHBENCH_WORKERS", "6")
        .env("MESHBENCH_TRANSPORT", "buffered")
        .assert()
        .success()
        .stdout(predicate::str::contains("num_workers = 6"))
        .stdout(predicate::str::contains("backend = \"buffered\""));
}

#[test]
fn test_env_override_is_validated() {
    let fixture = ConfigFixture::new("");

    meshbench_cmd()
        .args(["config", "validate", "--config", fixture.path()])
        .env("MESHBENCH_ITERATIONS", "0")
        .assert()
        .failure();
}
