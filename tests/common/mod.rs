//! Shared helpers for integration tests: scratch git repositories and tool
//! detection.

#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

use tempfile::TempDir;

fn tool_works(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// True when both `git` and `python3` are on PATH.
pub fn tools_available() -> bool {
    let available = tool_works("git") && tool_works("python3");
    if !available {
        eprintln!("git or python3 not available, skipping");
    }
    available
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(["-c", "user.name=test", "-c", "user.email=test@example.com"])
        .args(args)
        .current_dir(dir)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("git should run");
    assert!(status.success(), "git {:?} failed", args);
}

/// Creates a git repository containing `files` and returns its directory.
pub fn agent_repo(files: &[(&str, &str)]) -> TempDir {
    let repo = TempDir::new().expect("temp dir");
    git(repo.path(), &["init", "--quiet"]);
    for (name, content) in files {
        let path = repo.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, content).expect("write file");
    }
    // An empty repository cannot be committed; keep a marker file.
    fs::write(repo.path().join("README.md"), "test agent\n").expect("write readme");
    git(repo.path(), &["add", "."]);
    git(repo.path(), &["commit", "--quiet", "-m", "agent"]);
    repo
}

/// Number of entries directly under `dir`.
pub fn entries(dir: &Path) -> usize {
    fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

pub const ECHO_AGENT: &str = "def run(task):\n    return task\n";
