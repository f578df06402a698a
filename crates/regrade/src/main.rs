//! regrade - Gradescope regrade request statistics

mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use regrade_core::cache::{RegradeCache, CACHE_FILE};
use regrade_core::config::ClassifierBackend;
use regrade_core::models::AssignmentId;
use regrade_core::{Credentials, Metric, Pipeline, RegradeConfig};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "regrade",
    version,
    about = "Gradescope regrade request statistics",
    long_about = "Fetches every regrade request thread of a Gradescope assignment, caches\n\
                  them locally and infers whether each request was accepted.\n\
                  \n\
                  Examples:\n\
                    regrade --url https://www.gradescope.com/courses/1/assignments/2\n\
                    regrade --url ... --min-requests 3 --metric total\n\
                    regrade --url ... --no-classify --json > requests.json\n\
                    regrade --url ... --classifier keyword\n\
                    regrade clear-cache\n\
                  \n\
                  Environment Variables:\n\
                    REGRADE_URL                      # Assignment URL\n\
                    GRADESCOPE_EMAIL                 # Login email\n\
                    GRADESCOPE_PASSWORD              # Login password\n\
                    REGRADE_LOG                      # Log filter (default: warn)"
)]
struct Cli {
    #[command(subcommand)]
    mode: Option<Mode>,

    /// Assignment URL (any page under /courses/<id>/assignments/<id>)
    #[arg(long, env = "REGRADE_URL")]
    url: Option<String>,

    /// Config file (default: <config_dir>/regrade/config.toml)
    #[arg(long, env = "REGRADE_CONFIG")]
    config: Option<PathBuf>,

    /// Cache directory
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Saved session cookie file
    #[arg(long)]
    cookies: Option<PathBuf>,

    /// Ignore cached threads and fetch everything again
    #[arg(long)]
    refresh_cache: bool,

    /// Concurrent thread fetches
    #[arg(long, short = 'p')]
    parallel: Option<usize>,

    /// Skip outcome classification
    #[arg(long)]
    no_classify: bool,

    /// Entailment model: inference server or local cue words
    #[arg(long, value_parser = ["http", "keyword"])]
    classifier: Option<String>,

    /// Only show (and fetch) students with at least this many requests
    #[arg(long)]
    min_requests: Option<usize>,

    /// Count used for the cutoff and sorting
    #[arg(long, value_parser = ["unique", "total"])]
    metric: Option<String>,

    #[arg(long, env = "GRADESCOPE_EMAIL")]
    email: Option<String>,

    #[arg(long, env = "GRADESCOPE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Output as JSON
    #[arg(long)]
    json: bool,

    /// Disable ANSI colors in tables
    #[arg(long, env = "REGRADE_NO_COLOR")]
    no_color: bool,

    /// Debug logging
    #[arg(long, short = 'v')]
    verbose: bool,
}

#[derive(Subcommand)]
enum Mode {
    /// Delete cached threads and exit
    ClearCache {
        /// Only drop threads of this assignment
        #[arg(long)]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("REGRADE_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(&cli)?;
    if let Some(dir) = &cli.cache_dir {
        config.cache_dir = dir.clone();
    }

    if let Some(Mode::ClearCache { url }) = &cli.mode {
        return run_clear_cache(&config.cache_dir, url.as_deref());
    }
    run_pipeline(cli, config).await
}

fn load_config(cli: &Cli) -> Result<RegradeConfig> {
    let path = cli.config.clone().or_else(RegradeConfig::default_path);
    let config = match path {
        Some(path) => RegradeConfig::load(&path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => RegradeConfig::default(),
    };
    Ok(config)
}

fn apply_overrides(cli: &Cli, config: &mut RegradeConfig) -> Result<()> {
    if let Some(cookies) = &cli.cookies {
        config.cookie_file = cookies.clone();
    }
    if cli.refresh_cache {
        config.refresh_cache = true;
    }
    if let Some(parallel) = cli.parallel {
        config.parallelism = parallel;
    }
    if cli.no_classify {
        config.classifier.enabled = false;
    }
    if let Some(backend) = &cli.classifier {
        config.classifier.backend = backend.parse::<ClassifierBackend>()?;
    }
    if let Some(min) = cli.min_requests {
        config.min_requests = min;
    }
    if let Some(metric) = &cli.metric {
        config.metric = metric.parse::<Metric>()?;
    }
    config.validate()?;
    Ok(())
}

async fn run_pipeline(cli: Cli, mut config: RegradeConfig) -> Result<()> {
    use indicatif::{ProgressBar, ProgressStyle};
    use std::time::Instant;

    let url = cli
        .url
        .clone()
        .context("No assignment URL given (use --url or REGRADE_URL)")?;
    apply_overrides(&cli, &mut config)?;

    let credentials = match (&cli.email, &cli.password) {
        (Some(email), Some(password)) => Some(Credentials::new(email, password)),
        _ => None,
    };

    info!(%url, parallelism = config.parallelism, "Starting run");
    let start = Instant::now();
    let spinner = if cli.json {
        ProgressBar::hidden()
    } else {
        ProgressBar::new_spinner()
    };
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .context("Invalid spinner template")?
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
    );
    spinner.enable_steady_tick(std::time::Duration::from_millis(80));

    spinner.set_message("Connecting classifier backend...");
    let pipeline = Pipeline::from_config(config).await?;

    spinner.set_message("Fetching regrade requests...");
    let result = pipeline.run(&url, credentials.as_ref()).await;
    spinner.finish_and_clear();
    let output = result?;

    let config = pipeline.config();
    let students = output.student_stats(config.min_requests, config.metric);
    let staff = output.staff_stats();

    if cli.json {
        println!("{}", output::to_json(&output, &students, &staff)?);
        return Ok(());
    }

    println!("Regrade requests for {}", output.assignment);
    println!();
    println!("{}", output::format_students(&students, config.metric, cli.no_color));
    println!();
    println!("{}", output::format_staff(&staff, cli.no_color));
    println!();
    println!("{}", output::format_classifier(pipeline.classifier()));
    println!("{}", output::format_summary(&output.report));
    println!("Finished in {:.1}s", start.elapsed().as_secs_f64());

    Ok(())
}

fn run_clear_cache(cache_dir: &Path, url: Option<&str>) -> Result<()> {
    let cache_path = cache_dir.join(CACHE_FILE);

    if !cache_path.exists() {
        println!("Cache not found at: {}", cache_path.display());
        println!("   Nothing to clear.");
        return Ok(());
    }

    if let Some(url) = url {
        let assignment = AssignmentId::from_url(url)?;
        let cache = RegradeCache::open(cache_dir)?;
        let records = cache.assignment_records(&assignment)?;
        for record in &records {
            cache.invalidate(&record.cache_key())?;
        }
        cache.vacuum()?;
        println!("Dropped {} cached threads of {}", records.len(), assignment);
        return Ok(());
    }

    let size_bytes = std::fs::metadata(&cache_path)
        .with_context(|| format!("Failed to read cache metadata: {}", cache_path.display()))?
        .len();

    std::fs::remove_file(&cache_path)
        .with_context(|| format!("Failed to delete cache: {}", cache_path.display()))?;

    for suffix in ["-wal", "-shm"] {
        let side = cache_dir.join(format!("{}{}", CACHE_FILE, suffix));
        if side.exists() {
            if let Err(e) = std::fs::remove_file(&side) {
                warn!(path = %side.display(), error = %e, "Failed to remove cache side file");
            }
        }
    }

    println!("Cache cleared");
    println!("   Location: {}", cache_path.display());
    println!("   Freed: {}", format_size(size_bytes));

    Ok(())
}

fn format_size(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1}MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1_024 {
        format!("{:.1}KB", bytes as f64 / 1_024.0)
    } else {
        format!("{}B", bytes)
    }
}
