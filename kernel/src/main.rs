//! Notebook kernel CLI.
//!
//! Opens the project at `--project`, executes one command, and prints the
//! response envelope as JSON. `run` blocks until the run finishes.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kernel::commands::{Kernel, KernelCommand};
use kernel::exit_codes;
use kernel::io::config::{CONFIG_FILE, load_config};
use kernel::logging;
use kernel::response::Response;

#[derive(Parser)]
#[command(name = "kernel", version, about = "Run notebook steps and publish their results")]
struct Cli {
    /// Project directory containing `notebook.json`.
    #[arg(long, default_value = ".")]
    project: PathBuf,
    /// Config file; defaults to `<project>/kernel.toml`.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: KernelCommand,
}

fn main() {
    logging::init();
    match run() {
        Ok(response) => {
            std::process::exit(response.exit_code());
        }
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::FAILED);
        }
    }
}

fn run() -> Result<Response> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .unwrap_or_else(|| cli.project.join(CONFIG_FILE));
    let config = load_config(&config_path)?;
    let run_timeout = Duration::from_secs(config.step_timeout_secs);
    let kernel = Kernel::new(config);

    let mut response = match cli.command {
        KernelCommand::Open { path } => kernel.dispatch(KernelCommand::Open { path }),
        command => {
            let opened = kernel.dispatch(KernelCommand::Open {
                path: cli.project.clone(),
            });
            if opened.success {
                kernel.dispatch(command)
            } else {
                opened
            }
        }
    };
    if response.data.get("running").and_then(|v| v.as_bool()) == Some(true) {
        let run_uid = response.data.get("run_uid").cloned();
        let mut finished = kernel
            .wait(run_timeout)
            .unwrap_or_else(|| Response::failure("INTERNAL_ERROR", "run did not finish in time"));
        if let Some(state) = kernel.run_state(None) {
            finished = finished.with_data("log", state.log);
        }
        if let Some(run_uid) = run_uid {
            finished.data.insert("run_uid".to_string(), run_uid);
        }
        response = finished;
    }

    let rendered = serde_json::to_string_pretty(&response).context("serialize response")?;
    println!("{rendered}");
    Ok(response)
}
