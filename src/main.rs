use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod error;
mod gallery;
mod io;
mod manifest;
mod naming;
mod params;
mod saver;
mod ui;

use params::{GenerationSource, SourceImage};
use saver::MetadataSaver;

#[derive(Parser)]
#[command(name = "image-metadata-saver", about = "Save generated images with JSON metadata and browse the history")]
struct Cli {
    /// YAML settings file
    #[arg(long, env = "IMS_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API and UI panels
    Serve,
    /// Create the store directories and an empty history
    Init,
    /// Save a PNG from disk with its metadata
    Save {
        image: PathBuf,
        /// Generation parameters as JSON ({kind, params} or any object)
        #[arg(long)]
        params: Option<PathBuf>,
        /// Embedded image info as a JSON object
        #[arg(long)]
        info: Option<PathBuf>,
    },
    /// Print the history, newest first
    List,
    /// Print one record's metadata
    Show { name: String },
    /// Delete a saved image, its sidecar and its history row
    Delete { name: String },
}

fn read_json(path: &Path) -> Result<Value> {
    let txt = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&txt).with_context(|| format!("{} is not valid JSON", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve => api::serve(cfg).await,
        Command::Init => {
            let saver = MetadataSaver::open(&cfg.store).await?;
            println!("Images:   {}", saver.store().images_dir().display());
            println!("Metadata: {}", saver.store().metadata_dir().display());
            println!("History:  {}", cfg.store.history_file.display());
            Ok(())
        }
        Command::Save { image, params, info } => {
            let saver = MetadataSaver::open(&cfg.store).await?;
            let pixels = image::open(&image)
                .with_context(|| format!("Failed to open image {}", image.display()))?;
            let mut source_image = SourceImage::new(pixels);
            if let Some(path) = info {
                match read_json(&path)? {
                    Value::Object(map) => source_image = source_image.with_info(map),
                    _ => anyhow::bail!("{} must contain a JSON object", path.display()),
                }
            }
            let generation = match params {
                Some(path) => GenerationSource::from_json(read_json(&path)?),
                None => GenerationSource::Absent,
            };
            let paths = saver.save(&source_image, &generation).await?;
            println!("{}", paths.image_path.display());
            println!("{}", paths.metadata_path.display());
            Ok(())
        }
        Command::List => {
            let saver = MetadataSaver::open(&cfg.store).await?;
            let mut entries = saver.list().await;
            entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            for e in entries {
                println!("{}  {}  {}", e.timestamp.format("%Y-%m-%d %H:%M:%S"), e.filename, e.preview);
            }
            Ok(())
        }
        Command::Show { name } => {
            let saver = MetadataSaver::open(&cfg.store).await?;
            let record = saver.get(&name).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Command::Delete { name } => {
            let saver = MetadataSaver::open(&cfg.store).await?;
            saver.delete(&name).await?;
            println!("deleted {name}");
            Ok(())
        }
    }
}
