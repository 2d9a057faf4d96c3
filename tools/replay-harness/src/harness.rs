//! One-call fixture for deterministic e2e snapshot tests.
//!
//! Setup: unique persistence root, conversations dir, remove-then-recreate
//! work dir, location env vars, trajectory load, mock server start, agent
//! settings file. Teardown attempts every cleanup step regardless of
//! earlier failures and reports the first error after all of them ran.

use crate::determinism::{
    cleanup_work_dir, default_work_dir, set_location_env_vars, setup_test_directories,
    EnvVarGuard, EnvironmentProbe, FixedProbe, FIXED_CONVERSATION_ID,
};
use crate::errors::HarnessError;
use crate::logging::JsonlLogger;
use crate::replay::ReplayEngine;
use crate::server::MockLlmServer;
use crate::settings::{write_agent_settings, AgentSettings};
use crate::trajectory::{default_trajectories_dir, Trajectory};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const DEFAULT_TRAJECTORY: &str = "simple_echo_hello_world";
pub const REPLAY_LOG_FILE_NAME: &str = "replay.jsonl";

// ── FixtureOptions ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FixtureOptions {
    pub trajectory_name: String,
    /// Defaults to the crate's bundled trajectories root.
    pub trajectories_dir: Option<PathBuf>,
    /// Defaults to the fixed work dir; concurrent tests should pass a
    /// unique path instead.
    pub work_dir: Option<PathBuf>,
    pub model: String,
    pub log_replay_events: bool,
}

impl FixtureOptions {
    pub fn new(trajectory_name: &str) -> Self {
        Self {
            trajectory_name: trajectory_name.to_string(),
            trajectories_dir: None,
            work_dir: None,
            model: "openai/gpt-4o".to_string(),
            log_replay_events: false,
        }
    }
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self::new(DEFAULT_TRAJECTORY)
    }
}

// ── ReplayFixture ─────────────────────────────────────────────────────────────

/// Exclusively owns the mock server handle and the determinism context for
/// one test's scope. Dropping it tears everything down best-effort.
pub struct ReplayFixture {
    // Held for its Drop: removes the unique persistence root last.
    persistence_root: TempDir,
    pub conversations_dir: PathBuf,
    pub work_dir: PathBuf,
    pub base_url: String,
    pub conversation_id: &'static str,
    pub settings_path: PathBuf,
    probe: FixedProbe,
    server: Option<MockLlmServer>,
    env_guard: Option<EnvVarGuard>,
}

impl ReplayFixture {
    pub fn setup(options: FixtureOptions) -> Result<Self, HarnessError> {
        let persistence_root =
            tempfile::tempdir().map_err(|e| HarnessError::Io(e.to_string()))?;
        let work_dir = options.work_dir.unwrap_or_else(default_work_dir);
        let conversations_dir = setup_test_directories(persistence_root.path(), &work_dir)?;

        let mut env_guard = EnvVarGuard::new();
        set_location_env_vars(
            &mut env_guard,
            persistence_root.path(),
            &conversations_dir,
            &work_dir,
        );

        let trajectories_dir = options
            .trajectories_dir
            .unwrap_or_else(default_trajectories_dir);
        let trajectory = Trajectory::load_named(&trajectories_dir, &options.trajectory_name)?;

        let mut server = MockLlmServer::new(trajectory);
        if options.log_replay_events {
            server = server.with_logger(JsonlLogger::new(
                persistence_root.path().join(REPLAY_LOG_FILE_NAME),
            ));
        }
        let base_url = server.start()?;

        let settings_path = write_agent_settings(
            persistence_root.path(),
            &AgentSettings {
                model: options.model,
                llm_base_url: Some(base_url.clone()),
                api_key: Some("test-key".to_string()),
            },
        )?;

        Ok(Self {
            persistence_root,
            conversations_dir,
            work_dir,
            base_url,
            conversation_id: FIXED_CONVERSATION_ID,
            settings_path,
            probe: FixedProbe,
            server: Some(server),
            env_guard: Some(env_guard),
        })
    }

    pub fn persistence_dir(&self) -> &Path {
        self.persistence_root.path()
    }

    /// The replay cursor owner, for post-replay assertions. `None` once the
    /// fixture has been torn down.
    pub fn engine(&self) -> Option<&ReplayEngine> {
        self.server.as_ref().map(MockLlmServer::engine)
    }

    /// Deterministic environment probe to hand to the consumer under test.
    pub fn environment_probe(&self) -> &dyn EnvironmentProbe {
        &self.probe
    }

    pub fn replay_log_path(&self) -> PathBuf {
        self.persistence_root.path().join(REPLAY_LOG_FILE_NAME)
    }

    /// Explicit teardown. Every independent step runs even when an earlier
    /// one fails; the first failure is returned after all of them ran.
    pub fn teardown(mut self) -> Result<(), HarnessError> {
        self.teardown_inner()
    }

    fn teardown_inner(&mut self) -> Result<(), HarnessError> {
        let mut first_error: Option<HarnessError> = None;
        if let Some(mut server) = self.server.take() {
            if server.is_running() {
                if let Err(e) = server.stop() {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Err(e) = cleanup_work_dir(&self.work_dir) {
            first_error.get_or_insert(e);
        }
        // Dropping the guard restores the location env vars.
        self.env_guard = None;
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

impl Drop for ReplayFixture {
    fn drop(&mut self) {
        if self.server.is_some() || self.env_guard.is_some() {
            if let Err(e) = self.teardown_inner() {
                eprintln!("replay fixture teardown: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::determinism::{
        CONVERSATIONS_DIR_ENV, PERSISTENCE_DIR_ENV, WORK_DIR_ENV,
    };
    use crate::settings::load_settings;
    use crate::trajectory::{
        RequestMatcher, StepRecord, StepResponse, TrajectoryEntry, TrajectoryHeader,
        FORMAT_VERSION, TRAJECTORY_FILE_NAME,
    };
    use serde_json::json;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    // Fixture tests mutate process-wide env vars; serialize them.
    fn env_lock() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        match LOCK.get_or_init(|| Mutex::new(())).lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_single_step_trajectory(root: &Path, name: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).expect("mkdir");
        let entries = vec![
            TrajectoryEntry::Header(TrajectoryHeader {
                name: name.to_string(),
                format_version: FORMAT_VERSION,
                recorded_at_unix_ns: 0,
            }),
            TrajectoryEntry::Step(StepRecord {
                seq: 1,
                matcher: RequestMatcher {
                    user_message: Some("say hello world".to_string()),
                    ..Default::default()
                },
                response: StepResponse {
                    status: 200,
                    body: json!({"choices": [{"message": {"content": "hello world"}}]}),
                },
            }),
        ];
        let lines = entries
            .into_iter()
            .map(|entry| serde_json::to_string(&entry).expect("serialize"))
            .collect::<Vec<_>>()
            .join("\n");
        std::fs::write(dir.join(TRAJECTORY_FILE_NAME), lines).expect("write");
    }

    fn options_in(temp: &tempfile::TempDir, name: &str) -> FixtureOptions {
        let mut options = FixtureOptions::new(name);
        options.trajectories_dir = Some(temp.path().join("trajectories"));
        options.work_dir = Some(temp.path().join("work"));
        options
    }

    #[test]
    fn setup_wires_dirs_env_vars_server_and_settings() {
        let _env = env_lock();
        let temp = tempfile::tempdir().expect("tempdir");
        write_single_step_trajectory(&temp.path().join("trajectories"), "single");

        let fixture = ReplayFixture::setup(options_in(&temp, "single")).expect("setup");
        assert!(fixture.base_url.starts_with("http://127.0.0.1:"));
        assert_eq!(fixture.conversation_id, FIXED_CONVERSATION_ID);
        assert!(fixture.conversations_dir.is_dir());
        assert!(fixture.work_dir.is_dir());
        assert_eq!(
            std::env::var(PERSISTENCE_DIR_ENV).expect("persistence var"),
            fixture.persistence_dir().display().to_string()
        );
        assert_eq!(
            std::env::var(CONVERSATIONS_DIR_ENV).expect("conversations var"),
            fixture.conversations_dir.display().to_string()
        );
        assert_eq!(
            std::env::var(WORK_DIR_ENV).expect("work var"),
            fixture.work_dir.display().to_string()
        );

        let settings = load_settings(&fixture.settings_path).expect("settings");
        assert_eq!(settings.llm_base_url.as_deref(), Some(fixture.base_url.as_str()));

        fixture.teardown().expect("teardown");
    }

    #[test]
    fn teardown_removes_work_dir_and_restores_env() {
        let _env = env_lock();
        std::env::remove_var(WORK_DIR_ENV);
        let temp = tempfile::tempdir().expect("tempdir");
        write_single_step_trajectory(&temp.path().join("trajectories"), "single");

        let fixture = ReplayFixture::setup(options_in(&temp, "single")).expect("setup");
        let work_dir = fixture.work_dir.clone();
        fixture.teardown().expect("teardown");

        assert!(!work_dir.exists());
        assert!(std::env::var(WORK_DIR_ENV).is_err());
    }

    #[test]
    fn setup_fails_fast_for_unknown_trajectory() {
        let _env = env_lock();
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path().join("trajectories")).expect("mkdir");
        let err = match ReplayFixture::setup(options_in(&temp, "missing")) {
            Ok(_) => panic!("expected setup to fail"),
            Err(err) => err,
        };
        assert!(matches!(err, HarnessError::NotFound(_)));
    }

    #[test]
    fn drop_without_explicit_teardown_still_cleans_up() {
        let _env = env_lock();
        let temp = tempfile::tempdir().expect("tempdir");
        write_single_step_trajectory(&temp.path().join("trajectories"), "single");

        let work_dir = {
            let fixture = ReplayFixture::setup(options_in(&temp, "single")).expect("setup");
            fixture.work_dir.clone()
        };
        assert!(!work_dir.exists());
    }

    #[test]
    fn replay_log_records_server_lifecycle_when_enabled() {
        let _env = env_lock();
        let temp = tempfile::tempdir().expect("tempdir");
        write_single_step_trajectory(&temp.path().join("trajectories"), "single");

        let mut options = options_in(&temp, "single");
        options.log_replay_events = true;
        let fixture = ReplayFixture::setup(options).expect("setup");
        let log_path = fixture.replay_log_path();
        let text = std::fs::read_to_string(&log_path).expect("read log");
        assert!(text.contains("\"event_type\":\"server_started\""));
        fixture.teardown().expect("teardown");
    }
}
