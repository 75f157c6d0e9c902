//! code-agent CLI
//!
//! Resolves one GitHub Issue: reads it, asks a model for a patch, commits it,
//! opens a pull request and iterates on CI feedback.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use code_agent::audit::RunLog;
use code_agent::ci::CiWatcher;
use code_agent::config::{AgentConfig, TuningConfig, DEFAULT_TUNING_FILE};
use code_agent::controller::{RunController, RunReport, EXIT_SETUP_FAILURE};
use code_agent::github::{CodeHost, GitHubClient};
use code_agent::model::{provider_from_config, ModelClient};
use code_agent::repo::RepoMutator;
use code_agent::Result;

#[derive(Debug, Parser)]
#[command(name = "code-agent", version, about = "Turns a GitHub Issue into a pull request")]
struct Cli {
    /// Model id to use, overrides MODEL.
    #[arg(long)]
    model: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(report) => {
            print_report(&report);
            report.exit_code()
        }
        Err(e) => {
            tracing::error!(error = %e, kind = e.kind(), "setup failed");
            eprintln!("code-agent: {}", e);
            EXIT_SETUP_FAILURE
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<RunReport> {
    let vars: HashMap<String, String> = std::env::vars().collect();
    // The agent runs inside the checkout it changes.
    let workdir = std::env::current_dir()?;
    let tuning_path = vars
        .get("CODE_AGENT_CONFIG")
        .filter(|p| !p.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| workdir.join(DEFAULT_TUNING_FILE));
    let tuning = TuningConfig::load_or_default(&tuning_path)?;

    let mut config = AgentConfig::from_vars(&vars, workdir, tuning)?;
    if let Some(model) = cli.model {
        config = config.with_model(model);
    }

    let host: Arc<dyn CodeHost> = Arc::new(GitHubClient::from_config(&config)?);
    let model = ModelClient::from_config(&config, provider_from_config(&config)?);
    let repo = RepoMutator::from_config(&config)?;
    let log = RunLog::create(&config.tuning.run.logs_dir())?;

    tracing::info!(
        repository = %config.repository,
        issue = config.issue_number,
        model = %config.model,
        run_id = %log.run_id(),
        "code agent starting"
    );

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            interrupt.cancel();
        }
    });

    let (signal_tx, signal_rx) = mpsc::channel(32);
    let ci_settings = config.tuning.ci.clone();
    let controller = RunController::new(config, host.clone(), model, repo, signal_rx)
        .with_cancellation(cancel.clone())
        .with_run_log(log);
    let watcher = CiWatcher::new(
        host,
        &ci_settings,
        controller.subscribe_head(),
        signal_tx,
        cancel,
    );
    let watcher = tokio::spawn(watcher.run());

    let report = controller.run().await;
    // The controller dropped its end of the head channel, so the watcher exits.
    if let Err(e) = watcher.await {
        tracing::warn!(error = %e, "CI watcher task failed");
    }
    Ok(report)
}

fn print_report(report: &RunReport) {
    println!("\n{}", "=".repeat(60));
    println!("Run Complete: {}", report.task_ref);
    println!("{}", "=".repeat(60));
    println!();
    println!("Status: {}", report.status);
    println!("Attempts: {}", report.attempts.len());
    if let Some(reason) = &report.reason {
        println!("Reason: {}", reason.describe());
    }
    if let Some(pr) = &report.pull_request {
        println!("PR: {}", pr.url);
    }
    if let Some(run_id) = &report.run_id {
        println!("Run ID: {}", run_id);
    }
}
