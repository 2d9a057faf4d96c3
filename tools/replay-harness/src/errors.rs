use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io error: {0}")]
    Io(String),
    #[error("trajectory not found: {0}")]
    NotFound(String),
    #[error("malformed trajectory: {0}")]
    MalformedTrajectory(String),
    #[error("unexpected request at step {index}: expected {expected}, got {actual}")]
    UnexpectedRequest {
        index: usize,
        expected: String,
        actual: String,
    },
    #[error("trajectory exhausted: all {step_count} steps already served")]
    TrajectoryExhausted { step_count: usize },
    #[error("bind error: {0}")]
    Bind(String),
    #[error("server already started")]
    ServerAlreadyStarted,
    #[error("server not running")]
    ServerNotRunning,
    #[error("settings parse error: {0}")]
    SettingsParse(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("probe error: {0}")]
    Probe(String),
}
