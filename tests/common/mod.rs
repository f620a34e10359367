//! Common test utilities and fixtures

#![allow(dead_code)]

use std::path::PathBuf;

use assert_cmd::Command;

/// Get the path to the test fixtures directory
pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

/// Get a path to a specific fixture file
pub fn fixture_path(name: &str) -> PathBuf {
    fixtures_dir().join(name)
}

/// Small, fast cluster configuration
pub fn valid_config_fixture() -> PathBuf {
    fixture_path("valid_config.toml")
}

/// Configuration that fails validation
pub fn invalid_config_fixture() -> PathBuf {
    fixture_path("invalid_config.toml")
}

/// The meshbench binary with inherited MESHBENCH_* variables cleared
pub fn meshbench_cmd() -> Command {
    let mut cmd = Command::cargo_bin("meshbench").unwrap();
    for (key, _) in std::env::vars() {
        if key.starts_with("MESHBENCH_") {
            cmd.env_remove(key);
        }
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixtures_exist() {
        assert!(fixtures_dir().exists(), "Fixtures directory should exist");
        assert!(valid_config_fixture().exists());
        assert!(invalid_config_fixture().exists());
    }
}
