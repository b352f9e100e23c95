//! The single entry point used by the HTTP routes, the UI and the CLI.

use chrono::{DateTime, FixedOffset, Local};
use serde::Serialize;
use std::path::PathBuf;

use crate::config::StoreConfig;
use crate::error::{SaverError, SaverResult};
use crate::io::RecordStore;
use crate::manifest::{preview, HistoryEntry, HistoryIndex};
use crate::naming::{self, HISTORY_STEM};
use crate::params::{self, GenerationSource, MetadataRecord, SourceImage};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SavedPaths {
    pub image_path: PathBuf,
    pub metadata_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct MetadataSaver {
    store: RecordStore,
    history: HistoryIndex,
}

impl MetadataSaver {
    /// Creates the store directories and the history file if absent.
    pub async fn open(cfg: &StoreConfig) -> SaverResult<Self> {
        tokio::fs::create_dir_all(&cfg.images_dir).await?;
        tokio::fs::create_dir_all(&cfg.metadata_dir).await?;
        let history = HistoryIndex::open(cfg.history_file.clone()).await?;
        Ok(Self { store: RecordStore::new(cfg), history })
    }

    pub fn store(&self) -> &RecordStore { &self.store }

    pub async fn save(&self, image: &SourceImage, source: &GenerationSource) -> SaverResult<SavedPaths> {
        self.save_at(image, source, Local::now().fixed_offset()).await
    }

    /// Extract, name, write image, write sidecar, append history. Not
    /// transactional: a failure after the image write leaves the image behind.
    pub async fn save_at(
        &self,
        image: &SourceImage,
        source: &GenerationSource,
        now: DateTime<FixedOffset>,
    ) -> SaverResult<SavedPaths> {
        let mut record = params::extract_at(image, source, now);
        let name = naming::base_name(&record);
        if record.parameters.is_empty() {
            tracing::debug!(name = %name, "no generation parameters available");
        }

        let image_path = self.store.write_image(&image.pixels, &name).await?;
        record.filename = naming::image_filename(&name);
        record.image_path = Some(image_path.clone());

        let metadata_path = self.store.write_sidecar(&record, &name).await?;

        self.history
            .append(HistoryEntry {
                timestamp: record.timestamp,
                filename: record.filename.clone(),
                preview: preview(record.parameters.prompt().unwrap_or_default()),
                metadata_file: metadata_path.clone(),
            })
            .await?;

        tracing::info!(filename = %record.filename, "saved image with metadata");
        Ok(SavedPaths { image_path, metadata_path })
    }

    /// History rows in insertion order; callers sort and filter for display.
    pub async fn list(&self) -> Vec<HistoryEntry> {
        self.history.all().await
    }

    pub async fn get(&self, name: &str) -> SaverResult<MetadataRecord> {
        let stem = naming::record_stem(name)?;
        if stem == HISTORY_STEM {
            return Err(SaverError::NotFound(name.to_string()));
        }
        self.store.read_sidecar(stem).await
    }

    /// Removes image, sidecar and history row. Already-missing pieces are fine.
    pub async fn delete(&self, name: &str) -> SaverResult<()> {
        let stem = naming::record_stem(name)?;
        if stem == HISTORY_STEM {
            return Err(SaverError::InvalidName(name.to_string()));
        }
        self.store.delete(stem).await?;
        let removed = self.history.remove(&naming::image_filename(stem)).await?;
        tracing::info!(name = %stem, history_rows = removed, "deleted saved image");
        Ok(())
    }

    /// Saved image bytes for display; same filename rules as `get`.
    pub async fn image_bytes(&self, filename: &str) -> SaverResult<Vec<u8>> {
        naming::validate_name(filename)?;
        self.store.read_image(filename).await
    }
}
