use image::{DynamicImage, ImageFormat};
use std::{
    io::{Cursor, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{fs, io::AsyncWriteExt};

use crate::config::StoreConfig;
use crate::error::{SaverError, SaverResult};
use crate::params::MetadataRecord;

/// One PNG and one JSON sidecar per record, both named after the record.
///
/// Names arriving here are trusted; request filenames are validated by the
/// façade before they reach the store.
#[derive(Debug, Clone)]
pub struct RecordStore {
    images_dir: PathBuf,
    metadata_dir: PathBuf,
}

impl RecordStore {
    pub fn new(cfg: &StoreConfig) -> Self {
        Self { images_dir: cfg.images_dir.clone(), metadata_dir: cfg.metadata_dir.clone() }
    }

    pub fn images_dir(&self) -> &Path { &self.images_dir }
    pub fn metadata_dir(&self) -> &Path { &self.metadata_dir }

    pub fn image_path(&self, name: &str) -> PathBuf {
        self.images_dir.join(format!("{name}.png"))
    }

    pub fn sidecar_path(&self, name: &str) -> PathBuf {
        self.metadata_dir.join(format!("{name}.json"))
    }

    /// Encode `image` as PNG at `{images_dir}/{name}.png`.
    pub async fn write_image(&self, image: &DynamicImage, name: &str) -> SaverResult<PathBuf> {
        fs::create_dir_all(&self.images_dir).await?;

        let mut png_bytes: Vec<u8> = Vec::new();
        image.write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)?;

        let png = self.image_path(name);
        write_atomic(&png, &png_bytes).await?;
        Ok(fs::canonicalize(&png).await.unwrap_or(png))
    }

    /// Pretty-printed UTF-8 JSON at `{metadata_dir}/{name}.json`.
    pub async fn write_sidecar(&self, record: &MetadataRecord, name: &str) -> SaverResult<PathBuf> {
        if record.filename.is_empty() {
            return Err(SaverError::Validation("sidecar written before the image".to_string()));
        }
        fs::create_dir_all(&self.metadata_dir).await?;

        let sidecar_bytes = serde_json::to_vec_pretty(record)?;
        let json = self.sidecar_path(name);
        write_atomic(&json, &sidecar_bytes).await?;
        Ok(json)
    }

    /// An absent or unparsable sidecar both read as not found.
    pub async fn read_sidecar(&self, name: &str) -> SaverResult<MetadataRecord> {
        let path = self.sidecar_path(name);
        let bytes = match fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SaverError::NotFound(format!("{name}.json")));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|e| {
            tracing::warn!(path = %path.display(), error = %e, "unreadable sidecar");
            SaverError::NotFound(format!("{name}.json"))
        })
    }

    pub async fn read_image(&self, filename: &str) -> SaverResult<Vec<u8>> {
        match fs::read(self.images_dir.join(filename)).await {
            Ok(b) => Ok(b),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(SaverError::NotFound(filename.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn image_exists(&self, filename: &str) -> bool {
        fs::try_exists(self.images_dir.join(filename)).await.unwrap_or(false)
    }

    /// Remove image and sidecar. Files that are already gone are skipped.
    pub async fn delete(&self, name: &str) -> SaverResult<()> {
        remove_if_present(&self.image_path(name)).await?;
        remove_if_present(&self.sidecar_path(name)).await?;
        Ok(())
    }
}

/// Write through a `.tmp` sibling and rename into place.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    {
        let mut f = fs::File::create(&tmp).await?;
        f.write_all(bytes).await?;
        let _ = f.sync_all().await; // best-effort
    }
    fs::rename(&tmp, path).await
}

async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
