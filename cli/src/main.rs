//! ccdindex CLI: inspect Concordium project manifests.
//!
//! # Commands
//! ```
//! ccdindex validate   <project.yaml> [--chain-id <id>] [--endpoint <url>]
//! ccdindex deployment <project.yaml>
//! ccdindex dictionary <project.yaml>
//! ccdindex info       [--config <indexer.yaml>]
//! ccdindex version
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

use ccdindex_concordium::manifest::Datasource;
use ccdindex_concordium::{
    build_dictionary_query_entries, DsProcessorRegistry, LocalReader, NetworkOverrides, Project,
    ProjectManifest, Reader,
};
use ccdindex_core::{init_tracing, IndexerConfig, LogConfig};

#[derive(Parser)]
#[command(
    name = "ccdindex",
    about = "Concordium block indexer: manifest and pipeline tooling",
    version
)]
struct Cli {
    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ManifestArgs {
    /// Path to the project manifest (YAML or JSON)
    manifest: PathBuf,
    /// Override the network chain id
    #[arg(long)]
    chain_id: Option<String>,
    /// Override the network genesis hash
    #[arg(long)]
    genesis_hash: Option<String>,
    /// Override the network endpoints
    #[arg(long, num_args = 1..)]
    endpoint: Option<Vec<String>>,
    /// Override the dictionary endpoint
    #[arg(long)]
    dictionary: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and resolve a manifest, then print its datasources and handlers
    Validate(ManifestArgs),

    /// Print the deployment projection of a manifest as YAML
    Deployment(ManifestArgs),

    /// Print the dictionary query entries for a manifest as JSON
    Dictionary(ManifestArgs),

    /// Show indexer configuration (defaults or from a YAML file)
    Info {
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print version
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&LogConfig {
        level: cli.log_level.clone(),
        json: cli.json_logs,
        ..Default::default()
    })?;

    match cli.command {
        Commands::Validate(args) => cmd_validate(&args).await,
        Commands::Deployment(args) => cmd_deployment(&args).await,
        Commands::Dictionary(args) => cmd_dictionary(&args).await,
        Commands::Info { config } => cmd_info(config.as_deref()),
        Commands::Version => {
            println!("ccdindex {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

// ─── Command implementations ─────────────────────────────────────────────────

async fn load_project(args: &ManifestArgs) -> Result<Project> {
    let root = args
        .manifest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file = args
        .manifest
        .file_name()
        .and_then(|f| f.to_str())
        .with_context(|| format!("invalid manifest path {}", args.manifest.display()))?;

    let reader = LocalReader::new(root);
    let raw = reader
        .get_file(file)
        .await
        .with_context(|| format!("reading {}", args.manifest.display()))?;
    let manifest = ProjectManifest::from_yaml(&raw)?;

    let overrides = NetworkOverrides {
        endpoint: args.endpoint.clone(),
        dictionary: args.dictionary.clone(),
        chain_id: args.chain_id.clone(),
        genesis_hash: args.genesis_hash.clone(),
    };
    let project = Project::load(manifest, &reader, file, overrides).await?;
    Ok(project)
}

async fn cmd_validate(args: &ManifestArgs) -> Result<()> {
    let project = load_project(args).await?;

    println!("Project {} is valid", args.manifest.display());
    println!("  Chain id:   {}", project.network.chain_id);
    println!("  Endpoints:  {}", project.network.endpoints.join(", "));
    if let Some(dictionary) = &project.network.dictionary {
        println!("  Dictionary: {dictionary}");
    }
    println!("  Runner:     {} {}", project.runner.node.name, project.runner.node.version);

    println!("\nDatasources ({}):", project.data_sources.len());
    for ds in &project.data_sources {
        print_datasource("-", &ds.ds);
    }
    if !project.templates.is_empty() {
        println!("\nTemplates ({}):", project.templates.len());
        for template in &project.templates {
            print_datasource(&format!("- {}", template.name), &template.ds.ds);
        }
    }
    Ok(())
}

fn print_datasource(label: &str, ds: &Datasource) {
    let start = ds
        .start_block()
        .map(|h| h.to_string())
        .unwrap_or_else(|| "1".into());
    println!("  {label} {} (start block {start})", ds.kind());
    match ds {
        Datasource::Runtime(rt) => {
            for handler in &rt.mapping.handlers {
                let filtered = if handler.has_filter() { " [filtered]" } else { "" };
                println!("      {} -> {}{filtered}", handler.kind(), handler.handler());
            }
        }
        Datasource::Custom(custom) => {
            for handler in &custom.mapping.handlers {
                let filtered = if handler.filter.is_some() { " [filtered]" } else { "" };
                println!("      {} -> {}{filtered}", handler.kind, handler.handler);
            }
        }
    }
}

async fn cmd_deployment(args: &ManifestArgs) -> Result<()> {
    let project = load_project(args).await?;
    print!("{}", project.deployment()?);
    Ok(())
}

async fn cmd_dictionary(args: &ManifestArgs) -> Result<()> {
    let project = load_project(args).await?;
    let entries = build_dictionary_query_entries(&project.data_sources, &DsProcessorRegistry::new());
    if entries.is_empty() {
        tracing::warn!("Some handlers cannot be narrowed; the dictionary will not be used");
    }
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}

fn cmd_info(config: Option<&Path>) -> Result<()> {
    let cfg = match config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let cfg = IndexerConfig::from_yaml(&raw)?;
            cfg.validate()?;
            cfg
        }
        None => IndexerConfig::default(),
    };

    println!("ccdindex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Indexer id:             {}", cfg.id);
    println!("  Batch size:             {} blocks/fetch", cfg.batch_size);
    println!("  Parallel batches:       {}", cfg.parallel_batches);
    println!("  Max queue size:         {} blocks", cfg.max_queue_size);
    println!("  Block confirmations:    {}", cfg.block_confirmations);
    println!("  Unfinalized blocks:     {}", cfg.unfinalized_blocks);
    println!("  Checkpoint interval:    every {} blocks", cfg.checkpoint_interval);
    println!("  Poll interval:          {:?}", cfg.poll_interval());
    println!("  Dictionary query size:  {} blocks", cfg.dictionary_query_size);
    println!("  Workers:                {}", cfg.workers);
    println!("  Storage backends:       memory");
    Ok(())
}
