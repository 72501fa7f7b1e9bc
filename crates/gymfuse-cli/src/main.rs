use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gymfuse_extract::{page_text, FieldExtractor};
use gymfuse_merge::{EngineConfig, SimilarityScorer, UnifiedMerger};
use gymfuse_storage::{read_json_value, write_json_atomic};
use tracing::info;

mod logger;

#[derive(Debug, Parser)]
#[command(name = "gymfuse")]
#[command(about = "Gym record fusion: match, cross-validate and merge crawled records into a registry")]
struct Cli {
    /// Debug-level logging for the gymfuse crates.
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One fusion run over the workspace configured by GYMFUSE_* variables.
    Sync,
    /// Merge two JSON record arrays and print (or write) the result.
    Merge {
        #[arg(long)]
        authoritative: PathBuf,
        #[arg(long)]
        crawled: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
        /// YAML engine config; defaults come from the environment.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run field extraction over text or a cached page.
    Extract {
        text: Option<String>,
        #[arg(long, conflicts_with = "text")]
        file: Option<PathBuf>,
    },
}

fn engine_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => Ok(EngineConfig::from_yaml_file(path)?),
        None => {
            let config = EngineConfig::from_env();
            config.validate()?;
            Ok(config)
        }
    }
}

async fn merge_files(
    authoritative: PathBuf,
    crawled: PathBuf,
    out: Option<PathBuf>,
    config: Option<PathBuf>,
) -> Result<()> {
    let engine = engine_config(config.as_ref())?;
    let merger = UnifiedMerger::new(FieldExtractor::new()?, SimilarityScorer::new(), &engine);

    let authoritative = read_json_value(&authoritative).await?;
    let crawled = read_json_value(&crawled).await?;
    let output = merger.merge_values(&authoritative, &crawled)?;
    info!(
        merged = output.merged.len(),
        conflicts = output.conflicts.len(),
        quality = output.statistics.quality_score,
        "merge finished"
    );

    match out {
        Some(path) => {
            write_json_atomic(&path, &output).await?;
            println!("wrote {} records to {}", output.merged.len(), path.display());
        }
        None => println!("{}", serde_json::to_string_pretty(&output.to_json()?)?),
    }
    Ok(())
}

fn extract(text: Option<String>, file: Option<PathBuf>) -> Result<()> {
    let raw = match (text, file) {
        (Some(text), None) => text,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?,
        _ => bail!("pass TEXT or --file"),
    };
    let result = FieldExtractor::new()?.extract(&page_text(&raw));
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logger::init_logger(cli.verbose, cli.json_logs);

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = gymfuse_merge::run_once_from_env().await?;
            println!(
                "sync complete: run_id={} anchors={} candidates={} merged={} conflicts={} reports={}",
                summary.run_id,
                summary.anchors,
                summary.candidates,
                summary.merged_records,
                summary.conflicts,
                summary.reports_dir
            );
        }
        Commands::Merge {
            authoritative,
            crawled,
            out,
            config,
        } => merge_files(authoritative, crawled, out, config).await?,
        Commands::Extract { text, file } => extract(text, file)?,
    }

    Ok(())
}
