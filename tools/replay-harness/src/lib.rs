pub mod determinism;
pub mod errors;
pub mod harness;
pub mod logging;
pub mod replay;
pub mod server;
pub mod settings;
pub mod trajectory;

use clap::{error::ErrorKind, Parser};
use errors::HarnessError;
use logging::JsonlLogger;
use server::MockLlmServer;
use trajectory::Trajectory;

#[derive(Debug, Clone, Parser)]
#[command(name = "replay-harness")]
#[command(about = "Deterministic trajectory replay server for agent snapshot tests")]
pub struct Cli {
    /// Trajectory name under the trajectories root.
    #[arg(long, default_value = harness::DEFAULT_TRAJECTORY)]
    pub trajectory: String,
    #[arg(long)]
    pub trajectories_dir: Option<std::path::PathBuf>,
    /// Print the parsed steps and exit without serving.
    #[arg(long, default_value_t = false)]
    pub inspect_only: bool,
    /// Append replay events to this JSONL file while serving.
    #[arg(long)]
    pub replay_log: Option<std::path::PathBuf>,
}

pub fn run() -> Result<i32, HarnessError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    run_with_args(&args)
}

pub fn run_with_args(args: &[std::ffi::OsString]) -> Result<i32, HarnessError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(HarnessError::Cli(error.to_string())),
        },
    };

    let root = cli
        .trajectories_dir
        .clone()
        .unwrap_or_else(trajectory::default_trajectories_dir);
    let loaded = Trajectory::load_named(&root, &cli.trajectory)?;

    if cli.inspect_only {
        println!("trajectory {}: {} steps", loaded.name, loaded.len());
        for (index, step) in loaded.steps.iter().enumerate() {
            println!(
                "  step {}: {} -> status {}",
                index + 1,
                step.matcher.describe(),
                step.response.status
            );
        }
        return Ok(0);
    }

    let mut server = MockLlmServer::new(loaded);
    if let Some(path) = &cli.replay_log {
        server = server.with_logger(JsonlLogger::new(path));
    }
    let base_url = server.start()?;
    println!("mock llm server listening: base_url={base_url}");
    println!("press ctrl-c to stop");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| HarnessError::Io(e.to_string()))?;
    runtime.block_on(async {
        let _ = tokio::signal::ctrl_c().await;
    });
    server.stop()?;
    Ok(0)
}
