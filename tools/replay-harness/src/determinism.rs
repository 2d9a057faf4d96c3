//! Determinism patch layer.
//!
//! Everything that would otherwise vary by machine or run is pinned to a
//! fixed constant for the duration of one test: the work directory, the
//! conversation identity, the interpreter path, and the OS description.
//! Overrides are RAII-scoped so they revert on teardown even when the test
//! body fails.

use crate::errors::HarnessError;
use std::fs;
use std::path::{Path, PathBuf};

/// Fixed conversation ID so recorded artifacts reference a stable value.
pub const FIXED_CONVERSATION_ID: &str = "00000000-0000-0000-0000-000000000001";

/// Fixed interpreter path; the real lookup varies by environment.
pub const FIXED_INTERPRETER_PATH: &str = "/opt/agent/venv/bin/python";

/// Fixed OS description; kernel versions differ between CI and local runs.
pub const FIXED_OS_DESCRIPTION: &str = "Linux (kernel 6.0.0-test)";

/// Fixed work directory path. Writable on most systems and deterministic
/// for snapshots. Tests sharing it must be serialized, or pass a unique
/// work dir through the fixture instead.
pub const DEFAULT_WORK_DIR: &str = "/tmp/replay-harness-workspace";

pub const PERSISTENCE_DIR_ENV: &str = "AGENT_PERSISTENCE_DIR";
pub const CONVERSATIONS_DIR_ENV: &str = "AGENT_CONVERSATIONS_DIR";
pub const WORK_DIR_ENV: &str = "AGENT_WORK_DIR";

pub fn default_work_dir() -> PathBuf {
    PathBuf::from(DEFAULT_WORK_DIR)
}

// ── EnvironmentProbe ──────────────────────────────────────────────────────────

/// Injectable producer of environment-dependent values.
///
/// Consumers that take a probe can be handed `FixedProbe` in tests; a
/// consumer without the hook simply never observes the override, which is
/// tolerated rather than fatal.
pub trait EnvironmentProbe: Send + Sync {
    fn interpreter_path(&self) -> Result<String, HarnessError>;
    fn os_description(&self) -> Result<String, HarnessError>;
}

/// Real implementation: queries the host the way the consumer would.
pub struct SystemProbe;

impl SystemProbe {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, HarnessError> {
        let output = std::process::Command::new(program)
            .args(args)
            .output()
            .map_err(|e| HarnessError::Probe(format!("{program}: {e}")))?;
        if !output.status.success() {
            return Err(HarnessError::Probe(format!(
                "{program} exited with {}",
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl EnvironmentProbe for SystemProbe {
    fn interpreter_path(&self) -> Result<String, HarnessError> {
        let path = self.run("sh", &["-c", "command -v python3"])?;
        if path.is_empty() {
            return Err(HarnessError::Probe("no python3 on PATH".to_string()));
        }
        Ok(path)
    }

    fn os_description(&self) -> Result<String, HarnessError> {
        self.run("uname", &["-srm"])
    }
}

/// Test implementation: returns the same constants on every call.
pub struct FixedProbe;

impl EnvironmentProbe for FixedProbe {
    fn interpreter_path(&self) -> Result<String, HarnessError> {
        Ok(FIXED_INTERPRETER_PATH.to_string())
    }

    fn os_description(&self) -> Result<String, HarnessError> {
        Ok(FIXED_OS_DESCRIPTION.to_string())
    }
}

// ── EnvVarGuard ───────────────────────────────────────────────────────────────

/// Sets process environment variables and restores the previous values
/// (or unsets) on drop, in reverse order of setting.
#[derive(Default)]
pub struct EnvVarGuard {
    saved: Vec<(String, Option<String>)>,
}

impl EnvVarGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: &str) {
        if !self.saved.iter().any(|(k, _)| k == key) {
            self.saved.push((key.to_string(), std::env::var(key).ok()));
        }
        std::env::set_var(key, value);
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        for (key, previous) in self.saved.drain(..).rev() {
            match previous {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// Set the three location variables together, before the consumer
/// initializes; the consumer may read them once at startup.
pub fn set_location_env_vars(
    guard: &mut EnvVarGuard,
    persistence_dir: &Path,
    conversations_dir: &Path,
    work_dir: &Path,
) {
    guard.set(PERSISTENCE_DIR_ENV, &persistence_dir.display().to_string());
    guard.set(
        CONVERSATIONS_DIR_ENV,
        &conversations_dir.display().to_string(),
    );
    guard.set(WORK_DIR_ENV, &work_dir.display().to_string());
}

// ── Test directories ──────────────────────────────────────────────────────────

/// Create the conversations dir under `root` and remove-then-recreate the
/// work dir, so a leftover from an earlier run never leaks into a snapshot.
pub fn setup_test_directories(root: &Path, work_dir: &Path) -> Result<PathBuf, HarnessError> {
    let conversations_dir = root.join("conversations");
    fs::create_dir_all(&conversations_dir).map_err(|e| HarnessError::Io(e.to_string()))?;
    if work_dir.exists() {
        fs::remove_dir_all(work_dir).map_err(|e| HarnessError::Io(e.to_string()))?;
    }
    fs::create_dir_all(work_dir).map_err(|e| HarnessError::Io(e.to_string()))?;
    Ok(conversations_dir)
}

/// Remove the work dir; a no-op when it is already absent.
pub fn cleanup_work_dir(work_dir: &Path) -> Result<(), HarnessError> {
    if work_dir.exists() {
        fs::remove_dir_all(work_dir).map_err(|e| HarnessError::Io(e.to_string()))?;
    }
    Ok(())
}
