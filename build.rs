//! Build script for meshbench
//!
//! Embeds the git revision, build timestamp, target and profile so that
//! benchmark reports can be traced back to the binary that produced them.

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let git_hash = git(&["rev-parse", "--short=8", "HEAD"]).unwrap_or_else(unknown);
    let git_dirty = git(&["status", "--porcelain"])
        .map(|out| (!out.is_empty()).to_string())
        .unwrap_or_else(unknown);

    let build_timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let target = env::var("TARGET").unwrap_or_else(|_| unknown());
    let profile = env::var("PROFILE").unwrap_or_else(|_| unknown());
    let rustc_version = command_output("rustc", &["--version"]).unwrap_or_else(unknown);

    println!("cargo:rustc-env=MESHBENCH_GIT_HASH={}", git_hash);
    println!("cargo:rustc-env=MESHBENCH_GIT_DIRTY={}", git_dirty);
    println!("cargo:rustc-env=MESHBENCH_BUILD_TIMESTAMP={}", build_timestamp);
    println!("cargo:rustc-env=MESHBENCH_TARGET={}", target);
    println!("cargo:rustc-env=MESHBENCH_PROFILE={}", profile);
    println!("cargo:rustc-env=MESHBENCH_RUSTC_VERSION={}", rustc_version);
}

fn unknown() -> String {
    "unknown".to_string()
}

/// Run git with the given arguments and return trimmed stdout
fn git(args: &[&str]) -> Option<String> {
    command_output("git", args)
}

fn command_output(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout)
        .ok()
        .map(|s| s.trim().to_string())
}
