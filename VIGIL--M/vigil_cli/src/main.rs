use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use shared_event_bus::FileEventPublisher;
use shared_logging::MemoryLogSink;
use tokio::runtime::Runtime;
use vigil_threat_engine::{
    cache::FileCacheBackend, AnalysisRequest, EngineTelemetry, ResourceKind, ResultCache,
    ThreatOrchestrator, VigilConfig,
};

#[derive(Parser, Debug)]
#[command(name = "vigil", version, about = "Multi-engine threat analysis")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// TOML configuration file. Defaults plus environment keys when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Persist verdicts in this JSON file across runs.
    #[arg(long, global = true)]
    cache_file: Option<PathBuf>,
    /// Append JSON log records to this file.
    #[arg(long, global = true)]
    log: Option<PathBuf>,
    /// Append `analysis.completed` events to this file.
    #[arg(long, global = true)]
    events: Option<PathBuf>,
    /// Cache lifetime of new verdicts, in hours.
    #[arg(long, global = true)]
    ttl_hours: Option<u64>,
    /// Dump the analysis log records to stderr.
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Analyzes a link or a file.
    #[command(subcommand)]
    Analyze(AnalyzeTarget),
    /// Inspects the verdict cache.
    #[command(subcommand)]
    Cache(CacheCommand),
    /// Configuration helpers.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug)]
enum AnalyzeTarget {
    /// A URL.
    Url { url: String },
    /// A local file, hashed and checked by content.
    File { path: PathBuf },
    /// A SHA-256 hash of a file not available locally.
    Hash {
        sha256: String,
        /// Original file name, used by the heuristic checks.
        #[arg(long)]
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    /// Prints the cache entry of a resource without counting a hit.
    Show { kind: KindArg, identifier: String },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Loads and validates the configuration.
    Check,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Url,
    File,
}

impl From<KindArg> for ResourceKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Url => Self::Url,
            KindArg::File => Self::File,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.global)?;
    match cli.command {
        Commands::Analyze(target) => handle_analyze(&cli.global, &config, target),
        Commands::Cache(CacheCommand::Show { kind, identifier }) => {
            handle_cache_show(&config, kind.into(), &identifier)
        }
        Commands::Config(ConfigCommand::Check) => {
            println!("{}", serde_json::to_string_pretty(&config_summary(&config))?);
            Ok(())
        }
    }
}

fn load_config(global: &GlobalArgs) -> Result<VigilConfig> {
    let mut config = match &global.config {
        Some(path) => VigilConfig::load(path)?,
        None => VigilConfig::from_env()?,
    };
    if let Some(path) = &global.cache_file {
        config.orchestrator.cache_file = Some(path.clone());
    }
    if let Some(hours) = global.ttl_hours {
        config.orchestrator.cache_ttl_secs = hours.saturating_mul(3600);
    }
    config.validate()?;
    Ok(config)
}

fn build_request(target: AnalyzeTarget) -> Result<AnalysisRequest> {
    Ok(match target {
        AnalyzeTarget::Url { url } => AnalysisRequest::url(url),
        AnalyzeTarget::File { path } => {
            let content =
                fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            AnalysisRequest::file(display_name(&path), content)
        }
        AnalyzeTarget::Hash { sha256, name } => {
            let sha256 = sha256.trim().to_ascii_lowercase();
            if sha256.len() != 64 || !sha256.chars().all(|c| c.is_ascii_hexdigit()) {
                bail!("expected a 64 character SHA-256 hex digest, got '{sha256}'");
            }
            AnalysisRequest::file_hash(name, sha256)
        }
    })
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().into_owned())
}

fn handle_analyze(global: &GlobalArgs, config: &VigilConfig, target: AnalyzeTarget) -> Result<()> {
    let request = build_request(target)?;
    let runtime = Runtime::new()?;
    let memory = Arc::new(MemoryLogSink::new());
    let mut telemetry = EngineTelemetry::builder("vigil");
    if let Some(path) = &global.log {
        telemetry = telemetry.log_path(path);
    }
    if global.verbose {
        telemetry = telemetry.log_sink(memory.clone());
    }
    if let Some(path) = &global.events {
        telemetry = telemetry.event_publisher(Arc::new(FileEventPublisher::new(path)?));
    }
    let orchestrator = ThreatOrchestrator::from_config(config, telemetry.build()?)?;
    let outcome = runtime.block_on(orchestrator.analyze_traced(&request));
    if global.verbose {
        for record in memory.snapshot() {
            eprintln!("{}", serde_json::to_string(&record)?);
        }
    }
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn handle_cache_show(config: &VigilConfig, kind: ResourceKind, identifier: &str) -> Result<()> {
    let Some(path) = &config.orchestrator.cache_file else {
        bail!("no cache file configured; pass --cache-file or set orchestrator.cache_file");
    };
    let cache = ResultCache::new(Arc::new(FileCacheBackend::open(path)?));
    match cache.entry(kind, identifier.trim())? {
        Some(entry) => println!("{}", serde_json::to_string_pretty(&entry)?),
        None => println!("no cache entry for {kind} {identifier}"),
    }
    Ok(())
}

fn config_summary(config: &VigilConfig) -> serde_json::Value {
    let source = |enabled: bool, key: Option<&String>, base_url: &str| {
        json!({
            "enabled": enabled,
            "api_key": key.is_some_and(|key| !key.is_empty()),
            "base_url": base_url,
        })
    };
    json!({
        "status": "ok",
        "reputation": source(
            config.reputation.enabled,
            config.reputation.api_key.as_ref(),
            &config.reputation.base_url,
        ),
        "multiscan": source(
            config.multiscan.enabled,
            config.multiscan.api_key.as_ref(),
            &config.multiscan.base_url,
        ),
        "blocklist": source(
            config.blocklist.enabled,
            config.blocklist.api_key.as_ref(),
            &config.blocklist.base_url,
        ),
        "explainer": {
            "enabled": config.explainer.enabled,
            "endpoint": config.explainer.endpoint,
        },
        "ceiling_timeout_ms": config.orchestrator.ceiling_timeout_ms,
        "engine_timeout_ms": config.orchestrator.engine_timeout_ms,
        "cache_ttl_secs": config.orchestrator.cache_ttl_secs,
        "cache_file": config.orchestrator.cache_file,
    })
}
