mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use academy_core::{ArtifactLoader, ImageSource, ModelManager, Preprocessor, Recognizer};
use config::Config;

#[derive(Parser)]
#[command(name = "face-academy", about = "Face Academy recognition CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decide whether a probe image matches a set of reference photos
    Recognize {
        /// Probe image: data URI, base64, http(s) URL or @path
        #[arg(short, long)]
        probe: String,
        /// Reference image (repeatable)
        #[arg(short, long = "reference")]
        references: Vec<String>,
        /// File with one reference source per line
        #[arg(long)]
        references_file: Option<PathBuf>,
        /// Override the number of references compared
        #[arg(long)]
        max_compared: Option<usize>,
        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the similarity of two images
    Score { a: String, b: String },
    /// Load the model and describe it
    Info {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load()?;
    if let Commands::Recognize {
        max_compared: Some(n),
        ..
    } = &cli.command
    {
        config.max_compared = *n;
    }

    let loader = ArtifactLoader::new(&config.model_path).with_seed(config.fallback_seed);
    let models = Arc::new(ModelManager::new(Arc::new(loader)));
    let recognizer = Recognizer::new(
        Arc::clone(&models),
        Preprocessor::new(config.fetch_timeout())?,
    )
    .with_policy(config.decision)
    .with_max_compared(config.max_compared);

    let result = run(cli.command, &recognizer, &config).await;
    models.dispose().await;
    result
}

async fn run(command: Commands, recognizer: &Recognizer, config: &Config) -> Result<()> {
    match command {
        Commands::Recognize {
            probe,
            references,
            references_file,
            json,
            ..
        } => {
            let probe = read_source(&probe)?;
            let mut sources = Vec::new();
            for raw in &references {
                sources.push(read_source(raw)?);
            }
            if let Some(path) = references_file {
                sources.extend(read_reference_list(&path)?);
            }

            let report = recognize_within(recognizer, &probe, &sources, config).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "{:?}: recognized={} confidence={:.3} threshold={:.2} consistent={}",
                    report.verdict,
                    report.outcome.is_recognized,
                    report.outcome.confidence,
                    report.outcome.threshold,
                    report.outcome.consistent,
                );
                if let Some(stats) = &report.stats {
                    println!(
                        "  scored {} (skipped {}): avg={:.3} max={:.3} min={:.3}",
                        stats.scores.len(),
                        stats.skipped.len(),
                        stats.average,
                        stats.maximum,
                        stats.minimum,
                    );
                }
                if let Some(failure) = &report.failure {
                    println!("  {failure}");
                }
            }
        }
        Commands::Score { a, b } => {
            let score = recognizer
                .score_pair(&read_source(&a)?, &read_source(&b)?)
                .await?;
            println!("{score:.4}");
        }
        Commands::Info { json } => {
            let info = recognizer.info().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("state:      {:?}", info.state);
                println!("variant:    {:?}", info.model.variant);
                println!("inputs:     {:?}", info.model.input_shapes);
                println!("output:     {:?}", info.model.output_shape);
                if let Some(layers) = info.model.layers {
                    println!("layers:     {layers}");
                }
                if let Some(parameters) = info.model.parameters {
                    println!("parameters: {parameters}");
                }
                println!("tensors:    {} live", info.memory.live_tensors);
            }
        }
    }

    Ok(())
}

async fn recognize_within(
    recognizer: &Recognizer,
    probe: &ImageSource,
    references: &[ImageSource],
    config: &Config,
) -> Result<academy_core::RecognitionReport> {
    tokio::time::timeout(
        config.recognize_timeout(),
        recognizer.recognize(probe, references),
    )
    .await
    .with_context(|| {
        format!(
            "recognition did not finish within {}s",
            config.recognize_timeout_secs
        )
    })
}

/// `@path` reads a local file as encoded image bytes; anything else is parsed
/// as an inline or remote source.
fn read_source(raw: &str) -> Result<ImageSource> {
    match raw.strip_prefix('@') {
        Some(path) => {
            let bytes =
                std::fs::read(path).with_context(|| format!("reading image file {path}"))?;
            Ok(ImageSource::Encoded(bytes))
        }
        None => Ok(ImageSource::parse(raw)),
    }
}

fn read_reference_list(path: &Path) -> Result<Vec<ImageSource>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading reference list {}", path.display()))?;
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(read_source)
        .collect()
}
