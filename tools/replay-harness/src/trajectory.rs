//! Serializable trajectory types and loading.
//!
//! A trajectory is a directory containing `trajectory.jsonl`: one tagged
//! JSON entry per line, a single `header` entry followed by `step` entries
//! in recorded order.

use crate::errors::HarnessError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

pub const TRAJECTORY_FILE_NAME: &str = "trajectory.jsonl";
pub const FORMAT_VERSION: u32 = 1;

// ── Excerpts ──────────────────────────────────────────────────────────────────

const LARGE_BODY_THRESHOLD: usize = 512;
const EXCERPT_CHARS: usize = 200;

/// Full text, or a prefix plus `<hash:sha256:XXXXXXXXXXXXXXXX>` when large.
pub fn render_excerpt(text: &str) -> String {
    if text.len() <= LARGE_BODY_THRESHOLD {
        return text.to_string();
    }
    use sha2::{Digest, Sha256};
    let hash = Sha256::digest(text.as_bytes());
    // First 8 bytes (16 hex chars)
    let prefix = hex_bytes(&hash[..8]);
    let head: String = text.chars().take(EXCERPT_CHARS).collect();
    format!("{head}...<hash:sha256:{prefix}>")
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ── RequestMatcher ────────────────────────────────────────────────────────────

/// The recorded subset of a request used to decide "this step applies now".
///
/// Every populated field must be satisfied; an empty matcher accepts any
/// request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMatcher {
    /// Exact match against the content of the last user-role message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
    /// Substring match against the content of the last user-role message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message_contains: Option<String>,
    /// Exact match against the request's model field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl RequestMatcher {
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(m) = &self.user_message {
            parts.push(format!("user_message={:?}", render_excerpt(m)));
        }
        if let Some(m) = &self.user_message_contains {
            parts.push(format!("user_message_contains={:?}", render_excerpt(m)));
        }
        if let Some(m) = &self.model {
            parts.push(format!("model={m:?}"));
        }
        if parts.is_empty() {
            "<any request>".to_string()
        } else {
            parts.join(" ")
        }
    }
}

// ── StepResponse ──────────────────────────────────────────────────────────────

/// The exact wire-level reply recorded for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    #[serde(default = "default_status")]
    pub status: u16,
    pub body: Value,
}

fn default_status() -> u16 {
    200
}

// ── TrajectoryEntry ───────────────────────────────────────────────────────────

/// The top-level tagged enum that is serialized as a single JSONL line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrajectoryEntry {
    Header(TrajectoryHeader),
    Step(StepRecord),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryHeader {
    pub name: String,
    pub format_version: u32,
    pub recorded_at_unix_ns: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// 1-based position in the recording; must be consecutive.
    pub seq: u64,
    pub matcher: RequestMatcher,
    pub response: StepResponse,
}

// ── Trajectory ────────────────────────────────────────────────────────────────

/// One recorded interaction unit: matcher plus recorded response.
#[derive(Debug, Clone)]
pub struct Step {
    pub matcher: RequestMatcher,
    pub response: StepResponse,
}

/// An ordered, immutable sequence of steps, loaded once per test.
#[derive(Debug, Clone)]
pub struct Trajectory {
    pub name: String,
    pub steps: Vec<Step>,
}

impl Trajectory {
    /// Load and parse `<dir>/trajectory.jsonl`.
    pub fn load(dir: &Path) -> Result<Self, HarnessError> {
        if !dir.is_dir() {
            return Err(HarnessError::NotFound(dir.display().to_string()));
        }
        let file = dir.join(TRAJECTORY_FILE_NAME);
        if !file.is_file() {
            return Err(HarnessError::NotFound(file.display().to_string()));
        }
        let raw = std::fs::read_to_string(&file).map_err(|e| HarnessError::Io(e.to_string()))?;

        let mut header: Option<TrajectoryHeader> = None;
        let mut steps: Vec<Step> = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let entry: TrajectoryEntry = serde_json::from_str(line).map_err(|e| {
                HarnessError::MalformedTrajectory(format!("line {}: {e}", idx + 1))
            })?;
            match entry {
                TrajectoryEntry::Header(h) => {
                    if header.is_some() {
                        return Err(HarnessError::MalformedTrajectory(format!(
                            "line {}: duplicate header entry",
                            idx + 1
                        )));
                    }
                    if h.format_version != FORMAT_VERSION {
                        return Err(HarnessError::MalformedTrajectory(format!(
                            "unsupported format_version {}",
                            h.format_version
                        )));
                    }
                    header = Some(h);
                }
                TrajectoryEntry::Step(record) => {
                    if header.is_none() {
                        return Err(HarnessError::MalformedTrajectory(format!(
                            "line {}: step entry before header",
                            idx + 1
                        )));
                    }
                    let expected_seq = steps.len() as u64 + 1;
                    if record.seq != expected_seq {
                        return Err(HarnessError::MalformedTrajectory(format!(
                            "line {}: step seq {} out of order (expected {})",
                            idx + 1,
                            record.seq,
                            expected_seq
                        )));
                    }
                    if !(100..=599).contains(&record.response.status) {
                        return Err(HarnessError::MalformedTrajectory(format!(
                            "line {}: step seq {} has invalid http status {}",
                            idx + 1,
                            record.seq,
                            record.response.status
                        )));
                    }
                    steps.push(Step {
                        matcher: record.matcher,
                        response: record.response,
                    });
                }
            }
        }
        let header = header
            .ok_or_else(|| HarnessError::MalformedTrajectory("no header entry".to_string()))?;
        Ok(Self {
            name: header.name,
            steps,
        })
    }

    /// Resolve `name` against a trajectories root and load it.
    pub fn load_named(root: &Path, name: &str) -> Result<Self, HarnessError> {
        Self::load(&root.join(name))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Trajectories root shipped with this crate's test fixtures.
pub fn default_trajectories_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/trajectories")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_trajectory(dir: &Path, lines: &[String]) {
        std::fs::write(dir.join(TRAJECTORY_FILE_NAME), lines.join("\n")).expect("write");
    }

    fn header_line(name: &str) -> String {
        serde_json::to_string(&TrajectoryEntry::Header(TrajectoryHeader {
            name: name.to_string(),
            format_version: FORMAT_VERSION,
            recorded_at_unix_ns: 0,
        }))
        .expect("serialize header")
    }

    fn step_line(seq: u64, user_message: &str, reply: &str) -> String {
        serde_json::to_string(&TrajectoryEntry::Step(StepRecord {
            seq,
            matcher: RequestMatcher {
                user_message: Some(user_message.to_string()),
                ..Default::default()
            },
            response: StepResponse {
                status: 200,
                body: json!({"choices": [{"message": {"content": reply}}]}),
            },
        }))
        .expect("serialize step")
    }

    #[test]
    fn load_parses_header_and_steps_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_trajectory(
            temp.path(),
            &[
                header_line("two_turns"),
                step_line(1, "first", "one"),
                step_line(2, "second", "two"),
            ],
        );
        let trajectory = Trajectory::load(temp.path()).expect("load");
        assert_eq!(trajectory.name, "two_turns");
        assert_eq!(trajectory.len(), 2);
        assert_eq!(
            trajectory.steps[0].matcher.user_message.as_deref(),
            Some("first")
        );
    }

    #[test]
    fn load_missing_directory_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = match Trajectory::load(&temp.path().join("absent")) {
            Ok(_) => panic!("expected missing trajectory to fail"),
            Err(err) => err,
        };
        assert!(matches!(err, HarnessError::NotFound(_)));
    }

    #[test]
    fn load_directory_without_file_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = match Trajectory::load(temp.path()) {
            Ok(_) => panic!("expected missing file to fail"),
            Err(err) => err,
        };
        assert!(matches!(err, HarnessError::NotFound(_)));
    }

    #[test]
    fn load_requires_header_entry() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_trajectory(temp.path(), &[step_line(1, "hello", "hi")]);
        let err = match Trajectory::load(temp.path()) {
            Ok(_) => panic!("expected header-less trajectory to fail"),
            Err(err) => err,
        };
        assert!(matches!(err, HarnessError::MalformedTrajectory(_)));
    }

    #[test]
    fn load_rejects_gapped_seq() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_trajectory(
            temp.path(),
            &[
                header_line("gapped"),
                step_line(1, "first", "one"),
                step_line(3, "third", "three"),
            ],
        );
        let err = match Trajectory::load(temp.path()) {
            Ok(_) => panic!("expected gapped seq to fail"),
            Err(err) => err,
        };
        assert_eq!(
            err.to_string(),
            "malformed trajectory: line 3: step seq 3 out of order (expected 2)"
        );
    }

    #[test]
    fn load_rejects_duplicate_seq() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_trajectory(
            temp.path(),
            &[
                header_line("dup"),
                step_line(1, "first", "one"),
                step_line(1, "again", "one"),
            ],
        );
        assert!(matches!(
            Trajectory::load(temp.path()),
            Err(HarnessError::MalformedTrajectory(_))
        ));
    }

    #[test]
    fn load_rejects_duplicate_header() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_trajectory(temp.path(), &[header_line("a"), header_line("b")]);
        assert!(matches!(
            Trajectory::load(temp.path()),
            Err(HarnessError::MalformedTrajectory(_))
        ));
    }

    #[test]
    fn load_rejects_invalid_recorded_status() {
        let temp = tempfile::tempdir().expect("tempdir");
        let bad_step = serde_json::to_string(&TrajectoryEntry::Step(StepRecord {
            seq: 1,
            matcher: RequestMatcher::default(),
            response: StepResponse {
                status: 99,
                body: json!({"ok": true}),
            },
        }))
        .expect("serialize step");
        write_trajectory(temp.path(), &[header_line("bad_status"), bad_step]);
        let err = match Trajectory::load(temp.path()) {
            Ok(_) => panic!("expected invalid status to fail"),
            Err(err) => err,
        };
        assert_eq!(
            err.to_string(),
            "malformed trajectory: line 2: step seq 1 has invalid http status 99"
        );
    }

    #[test]
    fn matcher_describe_names_populated_fields() {
        let matcher = RequestMatcher {
            user_message: Some("say hello world".to_string()),
            ..Default::default()
        };
        assert_eq!(matcher.describe(), "user_message=\"say hello world\"");
        assert_eq!(RequestMatcher::default().describe(), "<any request>");
    }

    #[test]
    fn matcher_describe_excerpts_large_values() {
        let matcher = RequestMatcher {
            user_message: Some("x".repeat(1024)),
            ..Default::default()
        };
        let described = matcher.describe();
        assert!(described.contains("<hash:sha256:"));
        assert!(described.len() < 1024);
    }

    #[test]
    fn render_excerpt_hashes_large_text() {
        let big = "x".repeat(1024);
        let rendered = render_excerpt(&big);
        assert!(rendered.contains("<hash:sha256:"));
        assert!(rendered.len() < big.len());
        assert_eq!(render_excerpt("short"), "short");
    }

    #[test]
    fn entry_round_trips_json() {
        let entry = TrajectoryEntry::Step(StepRecord {
            seq: 1,
            matcher: RequestMatcher::default(),
            response: StepResponse {
                status: 200,
                body: json!({"ok": true}),
            },
        });
        let json = serde_json::to_string(&entry).expect("serialize");
        let back: TrajectoryEntry = serde_json::from_str(&json).expect("deserialize");
        assert!(matches!(back, TrajectoryEntry::Step(_)));
    }
}
