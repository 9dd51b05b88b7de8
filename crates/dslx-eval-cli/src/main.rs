//! dslx-eval CLI
//!
//! Main entry point for evaluating models on DSLX code generation samples.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use dslx_eval_harness::{
    Config, Environment, Evaluation, ModelClient, OpenAiClient, ReasoningEffort,
    RequirementPolicy, SampleRepository, StubChecker, StubStatus, Tutorial,
};
use dslx_eval_report::{json::JsonGenerator, MarkdownGenerator, Report};
use dslx_eval_toolchain::ProcessToolchain;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Base name of the report files written after a run.
const REPORT_BASENAME: &str = "dslx-eval-report";

/// dslx-eval - DSLX Code Generation Evaluation
///
/// Asks models to implement DSLX functions, checks each answer with the XLS
/// toolchain and feeds errors back until the answer passes or the attempt
/// budget is spent.
#[derive(Parser, Debug)]
#[command(name = "dslx-eval")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (default: dslx-eval.json in current directory)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<String>,

    /// Enable verbose output (sets log level to debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate one or more models over the samples
    Run(RunArgs),
    /// Type-check every sample against stub implementations
    CheckSamples(CheckArgs),
    /// List the available samples
    ListSamples,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Model to evaluate (repeatable)
    #[arg(short, long = "model", value_name = "MODEL", required = true)]
    models: Vec<String>,

    /// Sample to evaluate (repeatable; default: all)
    #[arg(short, long = "sample", value_name = "ID")]
    samples: Vec<String>,

    /// Attempt budget per (sample, model) pair
    #[arg(long, value_name = "N")]
    max_retries: Option<u32>,

    /// Model that judges structural requirements of passing code
    #[arg(long, value_name = "MODEL")]
    critic_model: Option<String>,

    /// Reasoning effort for reasoning models
    #[arg(long, value_name = "LEVEL", value_parser = parse_reasoning_effort)]
    reasoning_effort: Option<ReasoningEffort>,

    /// Number of pairs evaluated concurrently
    #[arg(short, long, value_name = "N")]
    jobs: Option<usize>,

    /// Output directory for reports
    #[arg(short, long, value_name = "DIR")]
    output_dir: Option<String>,

    /// Directory for per-attempt artifacts
    #[arg(long, value_name = "DIR")]
    artifacts_dir: Option<String>,
}

#[derive(Args, Debug)]
struct CheckArgs {
    /// Sample to check (repeatable; default: all)
    #[arg(short, long = "sample", value_name = "ID")]
    samples: Vec<String>,
}

fn parse_reasoning_effort(s: &str) -> Result<ReasoningEffort, String> {
    ReasoningEffort::from_str_case_insensitive(s)
        .ok_or_else(|| format!("invalid reasoning effort '{s}' (expected low, medium or high)"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::debug!(config = ?cli.config, "Config file");

    let result = match cli.command {
        Command::Run(args) => run(cli.config.as_deref(), args).await,
        Command::CheckSamples(args) => check_samples(cli.config.as_deref(), args).await,
        Command::ListSamples => list_samples(cli.config.as_deref()),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(2)
        }
    }
}

/// Runs an evaluation. Returns `true` if every pair passed.
async fn run(config_path: Option<&str>, args: RunArgs) -> anyhow::Result<bool> {
    let mut config = load_config(config_path)?;

    if let Some(max_retries) = args.max_retries {
        config.max_retries = max_retries;
    }
    if let Some(critic_model) = args.critic_model {
        config.critic.model = Some(critic_model);
    }
    if let Some(effort) = args.reasoning_effort {
        config.model.reasoning_effort = Some(effort);
    }
    if let Some(jobs) = args.jobs {
        config.concurrency = jobs;
    }
    if let Some(output_dir) = args.output_dir {
        config.output_dir = output_dir;
    }
    if let Some(artifacts_dir) = args.artifacts_dir {
        config.artifacts_dir = Some(artifacts_dir);
    }

    // Re-validate after overrides
    config.validate()?;
    config.validate_models(
        args.models
            .iter()
            .map(String::as_str)
            .chain(config.critic.model.as_deref()),
    )?;

    let environment = Environment::capture();
    let api_key = environment.require_api_key()?.to_string();
    let paths = environment.toolchain_paths()?;
    paths.validate()?;

    print_config(&config, &args.models);

    tracing::info!(tutorial = %config.tutorial, "Loading tutorial");
    let tutorial = Tutorial::load(&config.tutorial)?;
    println!("  Tutorial: {} ({} bytes)", tutorial.path.display(), tutorial.size_bytes);

    let repository = SampleRepository::new(&config.samples_dir);
    let sample_ids = select_samples(&repository, args.samples)?;
    println!("  Samples: {}", sample_ids.len());

    let mut models: Vec<Arc<dyn ModelClient>> = Vec::with_capacity(args.models.len());
    for model in &args.models {
        models.push(Arc::new(OpenAiClient::new(model, &api_key, &config.model)?));
    }
    let critic = match &config.critic.model {
        Some(model) => Some(Arc::new(OpenAiClient::new(model, &api_key, &config.model)?)),
        None => None,
    };

    let toolchain = ProcessToolchain::new(paths)
        .with_typecheck_flags(config.toolchain.typecheck_flags.clone())
        .with_interpreter_flags(config.toolchain.interpreter_flags.clone());

    let cancel = CancellationToken::new();
    spawn_cancel_triggers(&cancel, config.run_deadline_seconds);

    let output_dir = PathBuf::from(&config.output_dir);
    let policy = config.requirement_policy;

    let mut evaluation = Evaluation::new(config, &tutorial, repository, models, Arc::new(toolchain));
    if let Some(critic) = critic {
        evaluation = evaluation.with_critic(critic);
    }

    println!();
    println!("Evaluating...");
    let report = evaluation.run(&sample_ids, cancel).await?;

    print_summary(&report);
    write_reports(&report, &output_dir)?;

    Ok(match policy {
        RequirementPolicy::Advisory => report.all_passed(),
        RequirementPolicy::Strict => report.all_passed_strict(),
    })
}

/// Type-checks stubbed samples. Returns `true` if all of them type-check.
async fn check_samples(config_path: Option<&str>, args: CheckArgs) -> anyhow::Result<bool> {
    let config = load_config(config_path)?;
    let paths = Environment::capture().toolchain_paths()?;
    paths.validate()?;

    let repository = SampleRepository::new(&config.samples_dir);
    let sample_ids = select_samples(&repository, args.samples)?;
    let toolchain =
        ProcessToolchain::new(paths).with_typecheck_flags(config.toolchain.typecheck_flags.clone());

    let cancel = CancellationToken::new();
    spawn_cancel_triggers(&cancel, config.run_deadline_seconds);

    let checker = StubChecker::new(
        &repository,
        &toolchain,
        config.toolchain_timeout(),
        config.feedback.max_chars,
    );
    let checks = checker.check(&sample_ids, &cancel).await?;

    let mut all_ok = true;
    for check in &checks {
        match &check.status {
            StubStatus::Ok => println!("  ok      {}", check.sample_id),
            StubStatus::Failed { diagnostics } => {
                all_ok = false;
                println!("  FAILED  {}", check.sample_id);
                for line in diagnostics.lines() {
                    println!("          {line}");
                }
            }
            StubStatus::Malformed { message } => {
                all_ok = false;
                println!("  INVALID {}: {}", check.sample_id, first_line(message));
            }
        }
    }

    let failed = checks.iter().filter(|c| !c.is_ok()).count();
    println!();
    println!("{} samples checked, {failed} failed", checks.len());
    Ok(all_ok)
}

/// Prints the available sample ids.
fn list_samples(config_path: Option<&str>) -> anyhow::Result<bool> {
    let config = load_config(config_path)?;
    let repository = SampleRepository::new(&config.samples_dir);
    let ids = repository.list().map_err(|e| {
        anyhow::anyhow!(
            "Cannot read samples directory '{}': {e}\n\nSuggestion: Check the 'samplesDir' field in dslx-eval.json",
            repository.dir().display()
        )
    })?;

    for id in &ids {
        println!("{id}");
    }
    Ok(true)
}

/// Loads configuration from an explicit file or the current directory.
fn load_config(config_path: Option<&str>) -> anyhow::Result<Config> {
    match config_path {
        Some(path_str) => {
            let path = Path::new(path_str);
            if !path.exists() {
                anyhow::bail!(
                    "Config file not found: '{}'\n\nSuggestion: Check the path or remove the --config flag to use defaults",
                    path.display()
                );
            }
            Config::load_from_file(path).map_err(|e| anyhow::anyhow!("{e}"))
        }
        None => Config::load().map_err(|e| anyhow::anyhow!("{e}")),
    }
}

/// Resolves the requested sample ids in first-seen order, or every sample
/// when none were given.
fn select_samples(repository: &SampleRepository, requested: Vec<String>) -> anyhow::Result<Vec<String>> {
    let available = repository.list().map_err(|e| {
        anyhow::anyhow!(
            "Cannot read samples directory '{}': {e}\n\nSuggestion: Check the 'samplesDir' field in dslx-eval.json",
            repository.dir().display()
        )
    })?;

    if requested.is_empty() || requested.iter().any(|id| id == "all") {
        if available.is_empty() {
            anyhow::bail!(
                "No samples found in '{}'\n\nSuggestion: Add sample documents (*.md) or point 'samplesDir' at them",
                repository.dir().display()
            );
        }
        return Ok(available);
    }

    if let Some(missing) = requested.iter().find(|id| !available.contains(id)) {
        anyhow::bail!(
            "Sample not found: '{missing}'\n\nSuggestion: Run 'dslx-eval list-samples' to see available samples"
        );
    }

    let mut selected: Vec<String> = Vec::with_capacity(requested.len());
    for id in requested {
        if !selected.contains(&id) {
            selected.push(id);
        }
    }
    Ok(selected)
}

/// Cancels `cancel` on Ctrl+C or when the run deadline passes.
fn spawn_cancel_triggers(cancel: &CancellationToken, deadline_seconds: Option<u64>) {
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, finishing with partial results...");
            on_interrupt.cancel();
        }
    });

    if let Some(seconds) = deadline_seconds {
        let on_deadline = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(seconds)).await;
            tracing::warn!(seconds, "Run deadline reached, cancelling");
            on_deadline.cancel();
        });
    }
}

/// Prints configuration information.
fn print_config(config: &Config, models: &[String]) {
    println!("Configuration loaded:");
    println!("  Models: {}", models.join(", "));
    println!("  Samples directory: {}", config.samples_dir);
    println!("  Max retries: {}", config.max_retries);
    println!("  Concurrency: {}", config.concurrency);
    println!("  Toolchain timeout: {}s", config.toolchain.timeout_seconds);
    if let Some(critic) = &config.critic.model {
        println!("  Critic model: {critic}");
    }
    if let Some(effort) = config.model.reasoning_effort {
        println!("  Reasoning effort: {}", effort.as_str());
    }
}

/// Prints a per-model summary of the run.
fn print_summary(report: &Report) {
    println!();
    println!("=== dslx-eval Summary ===");
    for model in &report.models {
        println!(
            "{}: {}/{} passed ({:.1}%), {}/{} on first attempt",
            model.model_id,
            model.passed,
            model.samples,
            model.pass_rate * 100.0,
            model.first_attempt_passes,
            model.samples,
        );
        if let Some(mean) = model.mean_attempts_to_pass {
            println!("  Mean attempts to pass: {mean:.2}");
        }
    }

    for requirement in &report.requirements {
        println!(
            "Requirement {}: {} pass, {} fail, {} uncertain, {} unevaluated",
            requirement.requirement_id,
            requirement.passed,
            requirement.failed,
            requirement.uncertain,
            requirement.unevaluated,
        );
    }

    let failures: Vec<_> = report
        .entries
        .iter()
        .filter(|e| !e.final_outcome.is_success())
        .collect();
    if !failures.is_empty() {
        println!();
        println!("Not passed:");
        for entry in failures {
            println!(
                "  {} / {}: {}",
                entry.model_id,
                entry.sample_id,
                entry.final_outcome.description()
            );
        }
    }

    println!("Duration: {}s", report.run.duration_seconds);
}

/// Writes the Markdown and JSON reports to the output directory.
fn write_reports(report: &Report, output_dir: &Path) -> anyhow::Result<()> {
    println!();
    println!("Generating reports...");

    std::fs::create_dir_all(output_dir)?;

    let md_path = output_dir.join(format!("{REPORT_BASENAME}.md"));
    let markdown = MarkdownGenerator::new(report).generate();
    std::fs::write(&md_path, markdown)?;
    println!("  Markdown report: {}", md_path.display());

    let json_path = output_dir.join(format!("{REPORT_BASENAME}.json"));
    JsonGenerator::new(report).write_to_file(&json_path, true)?;
    println!("  JSON report: {}", json_path.display());

    Ok(())
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or(text)
}
