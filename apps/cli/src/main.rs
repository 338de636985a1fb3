//! Inspector command-line tool.

use anyhow::{Context, Result};
use clap::Parser;
use inspector::{AnalyzeResponse, Analyzer, AnalyzerConfig, SniffEngineFactory, parse_formats};
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

/// Inspect a remote media file without downloading all of it
#[derive(Parser)]
#[command(name = "inspector")]
#[command(version, about, long_about = None)]
struct Cli {
    /// URL of the media file or share link
    url: String,

    /// Comma-separated output formats: json, text, xml, html or all
    #[arg(short, long, default_value = "all")]
    formats: String,

    /// Print only this format's result instead of the JSON envelope
    #[arg(long)]
    raw: Option<String>,

    /// CPU budget for analysis in milliseconds
    #[arg(long)]
    cpu_budget_ms: Option<u64>,

    /// Byte-range ceiling in bytes
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Allow loopback and private-network targets
    #[arg(long)]
    allow_private: bool,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = AnalyzerConfig::from_env();
    if let Some(ms) = cli.cpu_budget_ms {
        config.cpu_budget = inspector::pipeline::config::clamp_cpu_budget(Duration::from_millis(ms));
    }
    if let Some(bytes) = cli.chunk_size {
        config.chunk_size = bytes;
    }
    config.allow_private_targets = cli.allow_private;

    let analyzer = Analyzer::new(config, Arc::new(SniffEngineFactory)).context("Failed to create analyzer")?;
    let formats = parse_formats(&cli.formats);
    let response = analyzer.analyze(&cli.url, &formats).await;

    match (&cli.raw, &response) {
        (Some(format), AnalyzeResponse::Success(success)) => {
            let key = inspector::OutputFormat::from_key(format)
                .map(|f| f.key())
                .with_context(|| format!("Unknown format '{}'", format))?;
            let text = success
                .results
                .get(key)
                .with_context(|| format!("Format '{}' was not generated", key))?;
            println!("{}", text);
        }
        _ => println!("{}", response.to_json()?),
    }

    if !response.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
