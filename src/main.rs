//! fixloop CLI entry point.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use fixloop::branch::RunBranch;
use fixloop::config::{Overrides, RunConfig, WORK_DIR};
use fixloop::control::{ControlLoop, LoopSettings, RunSummary};
use fixloop::critic::Critic;
use fixloop::diff::DiffModel;
use fixloop::git_ops;
use fixloop::oracle::{self, CommandTestOracle};
use fixloop::patch::PatchEngine;
use fixloop::proposer::{CommandProposer, ProviderKind};
use fixloop::safety::SafetyGuard;
use fixloop::telemetry::ArtifactStore;
use fixloop::util::CancelToken;
use fixloop::validate::PostApplyValidator;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

const EXIT_REJECTED: i32 = 5;

#[derive(Parser, Debug)]
#[command(
    name = "fixloop",
    about = "Propose, vet, apply and verify fixes for failing tests",
    version
)]
struct Cli {
    /// Log level when RUST_LOG is unset (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Config file to use instead of <repo>/.fixloop.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the fix loop on a repository
    Fix(FixArgs),
    /// Parse a diff and run the safety checks on it
    Check {
        /// Diff file, or `-` for stdin
        diff: PathBuf,
    },
    /// Apply a diff to a repository and validate the result
    Apply {
        repo: PathBuf,
        /// Diff file, or `-` for stdin
        diff: PathBuf,
    },
}

#[derive(Args, Debug)]
struct FixArgs {
    /// Path to the repository
    #[arg(default_value = ".")]
    repo: PathBuf,

    #[arg(long = "max-iters")]
    max_iters: Option<usize>,

    /// Wall-clock budget for the run, in seconds
    #[arg(long)]
    timeout: Option<u64>,

    #[arg(long, value_enum)]
    provider: Option<ProviderKind>,

    #[arg(long)]
    model: Option<String>,

    /// Ask the proposer command to review each diff
    #[arg(long)]
    review: bool,

    /// Test command (overrides config and project detection)
    #[arg(long = "test-cmd", num_args = 1.., allow_hyphen_values = true)]
    test_cmd: Option<Vec<String>>,

    /// Proposer command and its arguments
    #[arg(long = "proposer-cmd", num_args = 1.., allow_hyphen_values = true)]
    proposer_cmd: Option<Vec<String>>,
}

fn init_tracing(level: &str) {
    // RUST_LOG > --log-level > config > "info"
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let code = match cli.command {
        Command::Fix(args) => {
            let repo = args
                .repo
                .canonicalize()
                .with_context(|| format!("Repository not found: {}", args.repo.display()))?;
            let mut config = RunConfig::load(&repo, cli.config.as_deref())?;
            config.apply(Overrides {
                max_iterations: args.max_iters,
                timeout_secs: args.timeout,
                provider: args.provider,
                model: args.model,
                proposer_command: args.proposer_cmd,
                test_command: args.test_cmd,
                use_reviewer: args.review,
                log_level: cli.log_level,
            });
            config.validate()?;
            init_tracing(&config.log_level);
            let summary = fix(repo, config).await?;
            println!("{}", summary);
            summary.status.exit_code()
        }
        Command::Check { diff } => {
            let cwd = std::env::current_dir()?;
            let config = RunConfig::load(&cwd, cli.config.as_deref())?;
            init_tracing(cli.log_level.as_deref().unwrap_or(&config.log_level));
            check(&diff, &config)?
        }
        Command::Apply { repo, diff } => {
            let repo = repo
                .canonicalize()
                .with_context(|| format!("Repository not found: {}", repo.display()))?;
            let config = RunConfig::load(&repo, cli.config.as_deref())?;
            init_tracing(cli.log_level.as_deref().unwrap_or(&config.log_level));
            apply(&repo, &diff, &config)?
        }
    };

    std::process::exit(code);
}

async fn fix(repo: PathBuf, config: RunConfig) -> Result<RunSummary> {
    if config.proposer_command.is_empty() {
        bail!("No proposer command configured; pass --proposer-cmd or set proposer_command");
    }
    let test_command = if config.test_command.is_empty() {
        let project = oracle::detect_project_type(&repo);
        oracle::default_test_command(project).with_context(|| {
            format!(
                "Could not detect a test command for a {} project; set test_command",
                project.name()
            )
        })?
    } else {
        config.test_command.clone()
    };

    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping after the current step");
            on_signal.cancel();
        }
    });

    tokio::task::spawn_blocking(move || run_loop(&repo, &config, test_command, cancel))
        .await
        .context("Fix loop task panicked")?
}

fn run_loop(
    repo: &Path,
    config: &RunConfig,
    test_command: Vec<String>,
    cancel: CancelToken,
) -> Result<RunSummary> {
    let mut run_id = Uuid::new_v4().simple().to_string();
    run_id.truncate(12);

    git_ops::ensure_excluded(repo, &format!("/{}/", WORK_DIR))?;
    for pattern in &config.exclude_patterns {
        git_ops::ensure_excluded(repo, pattern)?;
    }

    let guard = SafetyGuard::new(&config.safety)?.with_repo_root(repo);
    let mut branch = RunBranch::start(repo, &config.branch_prefix, &run_id)?;
    let store = ArtifactStore::create(&config.artifact_root(repo), &run_id)?;
    info!("Run {} artifacts in {}", run_id, store.run_dir().display());

    let proposer = CommandProposer::new(config.proposer_command.clone(), config.provider, repo)
        .with_model(config.model.clone())
        .with_timeout(config.proposer_timeout())
        .with_cancel(cancel.clone());
    let mut critic = Critic::new(&guard);
    if config.use_reviewer {
        critic = critic.with_reviewer(Box::new(proposer.reviewer()));
    }
    let oracle = CommandTestOracle::new(test_command, repo, config.report_path(repo))
        .with_timeout(config.test_timeout())
        .with_cancel(cancel.clone());

    let settings = LoopSettings {
        max_iterations: config.max_iterations,
        timeout: config.timeout(),
    };
    let mut control = ControlLoop::new(
        run_id,
        settings,
        Box::new(proposer),
        critic,
        PatchEngine::new(&config.safety),
        PostApplyValidator::new(config.validator.clone()),
        Box::new(oracle),
    )
    .with_telemetry(Box::new(store))
    .with_cancel(cancel);

    Ok(control.run(&mut branch))
}

fn read_diff(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read diff from stdin")?;
        return Ok(text);
    }
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn check(diff_path: &Path, config: &RunConfig) -> Result<i32> {
    let text = read_diff(diff_path)?;
    let diff = DiffModel::parse(&text).context("Diff could not be parsed")?;
    let (added, removed) = diff.stats();
    println!("{} files, +{} -{}", diff.files.len(), added, removed);

    let report = SafetyGuard::new(&config.safety)?.validate(&diff);
    if report.ok {
        println!("OK");
        return Ok(0);
    }
    for violation in &report.violations {
        println!("{}", violation);
    }
    Ok(EXIT_REJECTED)
}

fn apply(repo: &Path, diff_path: &Path, config: &RunConfig) -> Result<i32> {
    let text = read_diff(diff_path)?;
    let diff = DiffModel::parse(&text).context("Diff could not be parsed")?;
    let changed = PatchEngine::new(&config.safety)
        .apply(&diff, repo)
        .context("Patch did not apply")?;
    for path in &changed {
        println!("patched {}", path.display());
    }

    let report = PostApplyValidator::new(config.validator.clone()).check(repo, &changed);
    for violation in &report.violations {
        println!("{}", violation);
    }
    if report.ok {
        Ok(0)
    } else {
        Ok(EXIT_REJECTED)
    }
}
