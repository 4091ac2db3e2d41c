//! crawl-keeper main entry point
//!
//! This is the command-line front end for the crawl-keeper engine.

use anyhow::{bail, Context, Result};
use clap::Parser;
use crawl_keeper::config::{load_config_with_hash, Config};
use crawl_keeper::output::{collect_export, print_job_list, print_report, write_export};
use crawl_keeper::storage::open_store;
use crawl_keeper::supervisor::JobReport;
use crawl_keeper::{JobId, JobRequest, JobSupervisor, SupervisorDeps};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// crawl-keeper: a checkpointed crawl orchestration engine
///
/// Runs crawl jobs across a bounded pool of browser sessions. Progress is
/// checkpointed after every page, so an interrupted run picks up where it
/// left off the next time the engine starts.
#[derive(Parser, Debug)]
#[command(name = "crawl-keeper")]
#[command(version)]
#[command(about = "A checkpointed crawl orchestration engine", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Submit a job file (.toml, .json, .txt URL list or .csv); may be given more than once
    #[arg(long, value_name = "JOB")]
    submit: Vec<PathBuf>,

    /// Extraction rule for submitted files that do not name one (default: [jobs] rule)
    #[arg(long, value_name = "RULE")]
    rule: Option<String>,

    /// Show the status of a job and exit
    #[arg(long, value_name = "ID", conflicts_with_all = ["submit", "results", "list", "dry_run"])]
    status: Option<String>,

    /// Print the records of a job as JSON lines and exit
    #[arg(long, value_name = "ID", conflicts_with_all = ["submit", "list", "dry_run"])]
    results: Option<String>,

    /// Directory to write one JSON export per finished job
    #[arg(long, value_name = "PATH")]
    export: Option<PathBuf>,

    /// List every known job and exit
    #[arg(long, conflicts_with_all = ["submit", "dry_run"])]
    list: bool,

    /// Validate config and job files without crawling
    #[arg(long)]
    dry_run: bool,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (mut config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    if let Some(rule) = &cli.rule {
        config.jobs.rule = rule.clone();
    }

    if cli.dry_run {
        handle_dry_run(&config, &cli.submit)
    } else if let Some(id) = &cli.status {
        handle_status(&config, parse_job_id(id)?)
    } else if let Some(id) = &cli.results {
        handle_results(&config, parse_job_id(id)?, cli.export.as_deref())
    } else if cli.list {
        handle_list(&config)
    } else {
        handle_run(config, &cli.submit, cli.export.as_deref()).await
    }
}

/// Sets up the tracing subscriber from the verbosity flags or `LOG_LEVEL`
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::try_from_env("LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new("crawl_keeper=info,warn")),
            1 => EnvFilter::new("crawl_keeper=debug,info"),
            2 => EnvFilter::new("crawl_keeper=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

fn parse_job_id(raw: &str) -> Result<JobId> {
    raw.parse::<JobId>().map_err(Into::into)
}

fn read_job(path: &Path) -> Result<JobRequest> {
    JobRequest::from_path(path).with_context(|| format!("invalid job file {}", path.display()))
}

/// Handles --dry-run: validates the configuration and every job file
fn handle_dry_run(config: &Config, jobs: &[PathBuf]) -> Result<()> {
    println!("=== crawl-keeper Dry Run ===\n");

    println!("Engine:");
    println!("  Max sessions: {}", config.engine.max_sessions);
    println!("  Max workers: {}", config.engine.max_workers);
    println!("  Renderer: {:?} (headless: {})", config.browser.engine, config.browser.headless);

    println!("\nCheckpoints:");
    if config.checkpoint.enabled {
        println!("  Database: {}", config.checkpoint.database_path);
    } else {
        println!("  Disabled (jobs will not survive a restart)");
    }
    println!("  Save timeout: {}ms", config.checkpoint.save_timeout_ms);

    println!("\nRules ({}):", config.rules.len());
    for rule in &config.rules {
        println!("  - {} ({:?})", rule.id, rule.kind);
    }

    let mut units = 0;
    for path in jobs {
        let spec = read_job(path)?
            .into_spec(&config.jobs)
            .with_context(|| format!("job file {} rejected", path.display()))?;
        if !config.rules.iter().any(|r| r.id == spec.rule)
            && !crawl_keeper::extract::BUILTIN_RULES.contains(&spec.rule.as_str())
        {
            bail!("job file {} names unknown rule '{}'", path.display(), spec.rule);
        }
        println!(
            "\nJob {}: rule '{}', {} seeds",
            path.display(),
            spec.rule,
            spec.seeds.len()
        );
        units += spec.seeds.len();
    }

    println!("\n✓ Configuration is valid");
    if !jobs.is_empty() {
        println!("✓ Would submit {} jobs with {} seed URLs", jobs.len(), units);
    }

    Ok(())
}

/// Handles --status: reads the job's latest checkpoint
fn handle_status(config: &Config, job_id: JobId) -> Result<()> {
    let store = open_store(&config.checkpoint)?;
    let export = collect_export(store.as_ref(), job_id)?;
    print_report(&export.job);
    Ok(())
}

/// Handles --results: prints records as JSON lines, optionally exporting them
fn handle_results(config: &Config, job_id: JobId, export_dir: Option<&Path>) -> Result<()> {
    let store = open_store(&config.checkpoint)?;
    let export = collect_export(store.as_ref(), job_id)?;

    for record in &export.records {
        println!("{}", serde_json::to_string(record)?);
    }
    if let Some(dir) = export_dir {
        write_export(&export, &dir.join(format!("{}.json", job_id)))?;
    }
    Ok(())
}

/// Handles --list: every job in the checkpoint store
fn handle_list(config: &Config) -> Result<()> {
    let store = open_store(&config.checkpoint)?;
    let reports: Vec<JobReport> = store
        .list_jobs()?
        .iter()
        .map(JobReport::from_checkpoint)
        .collect();
    print_job_list(&reports);
    Ok(())
}

/// Resumes incomplete jobs, submits new ones and waits for all of them
async fn handle_run(config: Config, jobs: &[PathBuf], export_dir: Option<&Path>) -> Result<()> {
    let requests = jobs
        .iter()
        .map(|path| read_job(path))
        .collect::<Result<Vec<_>>>()?;

    let deps = SupervisorDeps::from_config(config)?;
    let store = Arc::clone(&deps.store);
    let supervisor = JobSupervisor::start(deps).await?;

    for request in requests {
        let job_id = supervisor.submit(request).await?;
        println!("Submitted job {}", job_id);
    }

    let pending: Vec<JobId> = supervisor
        .list()
        .await?
        .into_iter()
        .filter(|r| !r.is_terminal())
        .map(|r| r.job_id)
        .collect();
    if pending.is_empty() {
        tracing::info!("No jobs to run");
    }

    let wait_all = async {
        let mut finished = Vec::new();
        for job_id in &pending {
            finished.push(supervisor.wait_for_terminal(*job_id).await?);
        }
        Ok::<_, crawl_keeper::CrawlError>(finished)
    };

    let finished = tokio::select! {
        result = wait_all => Some(result?),
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted; unfinished jobs resume on the next start");
            None
        }
    };

    supervisor.shutdown().await;

    for report in finished.unwrap_or_default() {
        print_report(&report);
        if let Some(dir) = export_dir {
            let export = collect_export(store.as_ref(), report.job_id)?;
            write_export(&export, &dir.join(format!("{}.json", report.job_id)))?;
        }
    }

    Ok(())
}
