use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facebank_core::onnx::{OnnxEmbedder, OnnxProposalNet, OnnxStageNet};
use facebank_core::{
    BoundingBox, FaceDetector, FaceRecognizer, FeatureBank, FeatureExtractor, Identification,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

mod config;
mod dataset;

use config::Config;

const REFINEMENT_INPUT_SIZE: u32 = 24;
const OUTPUT_INPUT_SIZE: u32 = 48;

#[derive(Parser)]
#[command(name = "facebank", about = "Enroll labelled faces and identify them in new images")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a labelled dataset, then identify image paths read from stdin
    Run {
        /// Dataset root laid out as <dir>/<label>/<image>
        #[arg(short, long)]
        dataset: PathBuf,
    },
    /// Identify faces in the given images against a labelled dataset
    Identify {
        /// Dataset root laid out as <dir>/<label>/<image>
        #[arg(short, long)]
        dataset: PathBuf,
        /// Images to query
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Print detected face boxes as JSON
    Detect {
        /// Image to scan
        image: PathBuf,
    },
}

#[derive(Serialize)]
struct DetectReport {
    source: String,
    faces: Vec<BoundingBox>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    if config.threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .build_global()
            .context("configuring worker pool")?;
    }

    match cli.command {
        Commands::Run { dataset } => {
            let (recognizer, bank) = prepare(&config, dataset).await?;
            interactive(recognizer, bank).await?;
        }
        Commands::Identify { dataset, images } => {
            let (recognizer, bank) = prepare(&config, dataset).await?;
            for path in images {
                match identify(recognizer.clone(), bank.clone(), path.clone()).await {
                    Ok(found) => report(&path, &found),
                    Err(e) => tracing::error!(path = %path.display(), error = %format!("{e:#}"), "query failed"),
                }
            }
        }
        Commands::Detect { image } => {
            let detector = load_detector(&config)?;
            let report = tokio::task::spawn_blocking(move || -> Result<DetectReport> {
                let rgb = dataset::load_image(&image)?;
                let faces = detector
                    .detect(&rgb)
                    .with_context(|| format!("detecting faces in {}", image.display()))?;
                Ok(DetectReport {
                    source: image.display().to_string(),
                    faces,
                })
            })
            .await??;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

fn load_detector(config: &Config) -> Result<FaceDetector> {
    let proposal = OnnxProposalNet::load(&config.proposal_model_path())
        .context("loading proposal model")?;
    let refinement = OnnxStageNet::load(&config.refinement_model_path(), REFINEMENT_INPUT_SIZE)
        .context("loading refinement model")?;
    let output = OnnxStageNet::load(&config.output_model_path(), OUTPUT_INPUT_SIZE)
        .context("loading output model")?;

    let detector = FaceDetector::new(
        Box::new(proposal),
        Box::new(refinement),
        Box::new(output),
        config.detector.clone(),
    )?;
    Ok(detector)
}

fn load_recognizer(config: &Config) -> Result<FaceRecognizer> {
    let detector = load_detector(config)?;
    let embedder = OnnxEmbedder::load(
        &config.embedding_model_path(),
        config.embedding_input_size,
        config.embedding_dimension,
    )
    .context("loading embedding model")?;

    let extractor = FeatureExtractor::new(Arc::new(embedder)).with_model_version("facenet");
    let recognizer = FaceRecognizer::new(detector, extractor);
    Ok(match &config.debug_dir {
        Some(dir) => recognizer.with_debug_dir(dir),
        None => recognizer,
    })
}

/// Load the models and enroll every sample of `dataset`.
async fn prepare(
    config: &Config,
    dataset: PathBuf,
) -> Result<(Arc<FaceRecognizer>, Arc<FeatureBank>)> {
    let recognizer = Arc::new(load_recognizer(config)?);
    let bank = Arc::new(
        FeatureBank::new(recognizer.extractor().dimension())?
            .with_threshold(config.similarity_threshold),
    );

    let samples =
        tokio::task::spawn_blocking(move || dataset::load_samples(&dataset)).await??;

    let outcomes = {
        let recognizer = recognizer.clone();
        let bank = bank.clone();
        tokio::task::spawn_blocking(move || recognizer.enroll_batch(&bank, &samples)).await?
    };

    let skipped = outcomes.iter().filter(|o| o.result.is_err()).count();
    tracing::info!(
        samples = outcomes.len(),
        skipped,
        faces = bank.len(),
        labels = bank.labels().len(),
        "enrollment complete"
    );
    if bank.is_empty() {
        tracing::warn!("no faces enrolled; every query will report no match");
    }

    Ok((recognizer, bank))
}

async fn identify(
    recognizer: Arc<FaceRecognizer>,
    bank: Arc<FeatureBank>,
    path: PathBuf,
) -> Result<Vec<Identification>> {
    tokio::task::spawn_blocking(move || {
        let image = dataset::load_image(&path)?;
        let source = path.display().to_string();
        recognizer
            .identify(&bank, &source, &image)
            .with_context(|| format!("identifying {source}"))
    })
    .await?
}

/// Read image paths from stdin until `exit`, EOF or ctrl-c.
async fn interactive(recognizer: Arc<FaceRecognizer>, bank: Arc<FeatureBank>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        println!("Image path to identify (or 'exit'):");
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        };
        let Some(line) = line else { break };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("exit") {
            break;
        }

        let path = PathBuf::from(input);
        match identify(recognizer.clone(), bank.clone(), path.clone()).await {
            Ok(found) => report(&path, &found),
            Err(e) => tracing::error!(path = input, error = %format!("{e:#}"), "query failed"),
        }
    }

    Ok(())
}

fn report(path: &Path, found: &[Identification]) {
    if found.is_empty() {
        println!("{}: no face found", path.display());
        return;
    }
    for (i, id) in found.iter().enumerate() {
        let b = &id.bbox;
        let area = format!("[{:.0}, {:.0}, {:.0}, {:.0}]", b.x1, b.y1, b.x2, b.y2);
        match &id.matched {
            Some(m) => println!(
                "{}: face {i} {area} -> {} ({:.3})",
                path.display(),
                m.label,
                m.similarity
            ),
            None => println!("{}: face {i} {area} -> no match", path.display()),
        }
    }
}
