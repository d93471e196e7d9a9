//! Stamps the `trackbridge` binary with where it came from
//!
//! The startup log line reports `GIT_HASH`, `BUILD_TIMESTAMP` and
//! `BUILD_PROFILE`. A hash ending in `-dirty` was built from a tree with
//! uncommitted changes.

use std::env;
use std::process::Command;

fn git(args: &[&str]) -> Option<std::process::Output> {
    Command::new("git").args(args).output().ok()
}

fn commit_id() -> Option<String> {
    let head = git(&["rev-parse", "--short=8", "HEAD"]).filter(|out| out.status.success())?;
    let hash = String::from_utf8(head.stdout).ok()?.trim().to_string();
    let dirty = git(&["diff", "--quiet", "HEAD"]).is_some_and(|out| !out.status.success());
    Some(if dirty { format!("{}-dirty", hash) } else { hash })
}

fn main() {
    let stamp = [
        ("GIT_HASH", commit_id().unwrap_or_else(|| "unknown".into())),
        ("BUILD_TIMESTAMP", chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),
        ("BUILD_PROFILE", env::var("PROFILE").unwrap_or_else(|_| "unknown".into())),
    ];
    for (key, value) in stamp {
        println!("cargo:rustc-env={}={}", key, value);
    }
}
