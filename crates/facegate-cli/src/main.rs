use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::{Parser, Subcommand};
use facegate_core::FaceComparator;
use std::path::{Path, PathBuf};

const DEFAULT_SERVER: &str = "http://127.0.0.1:5000";

#[derive(Parser)]
#[command(name = "facegate", about = "Facegate voter face verification CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare two image files locally with the ONNX models
    Compare {
        /// Registered (reference) image
        reference: PathBuf,
        /// Captured image
        capture: PathBuf,
        /// Directory holding det_10g.onnx and the recognition models
        #[arg(long)]
        model_dir: Option<PathBuf>,
        /// Similarity threshold, informational only
        #[arg(long, default_value_t = 0.4)]
        threshold: f32,
    },
    /// Send an image to a running facegated for verification
    Verify {
        #[arg(long)]
        voter_id: String,
        /// Captured image file
        #[arg(long)]
        image: PathBuf,
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Show facegated health
    Health {
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Compare {
            reference,
            capture,
            model_dir,
            threshold,
        } => {
            let model_dir = model_dir.unwrap_or_else(facegate_core::default_model_dir);
            let mut comparator = FaceComparator::load_default(&model_dir)
                .with_context(|| format!("cannot load models from {}", model_dir.display()))?;
            tracing::info!(verifiers = ?comparator.verifier_names(), "models loaded");

            let outcome = comparator.compare(&reference, &capture, threshold);
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Verify {
            voter_id,
            image,
            server,
        } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("cannot read {}", image.display()))?;
            let body = serde_json::json!({
                "voter_id": voter_id,
                "image": data_url(&image, &bytes),
            });

            let response: serde_json::Value = reqwest::Client::new()
                .post(endpoint(&server, "verify"))
                .json(&body)
                .send()
                .await
                .context("verify request failed")?
                .json()
                .await
                .context("invalid verify response")?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Health { server } => {
            let response: serde_json::Value = reqwest::get(endpoint(&server, "health"))
                .await
                .context("health request failed")?
                .error_for_status()?
                .json()
                .await
                .context("invalid health response")?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }

    Ok(())
}

fn endpoint(server: &str, route: &str) -> String {
    format!("{}/{route}", server.trim_end_matches('/'))
}

/// Encode `bytes` as a data URL, typed by the file extension (JPEG if unknown).
fn data_url(path: &Path, bytes: &[u8]) -> String {
    let mime = image::ImageFormat::from_path(path)
        .map(|f| f.to_mime_type())
        .unwrap_or("image/jpeg");
    format!("data:{mime};base64,{}", STANDARD.encode(bytes))
}
