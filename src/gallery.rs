//! The host's output galleries, seen through a narrow read-only capability.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    routing::post,
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{str::FromStr, sync::Arc};

use crate::api::ApiErr;
use crate::error::SaverError;
use crate::params::{GenerationSource, SourceImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GalleryId {
    Txt2Img,
    Img2Img,
}

impl FromStr for GalleryId {
    type Err = SaverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "txt2img_gallery" => Ok(GalleryId::Txt2Img),
            "img2img_gallery" => Ok(GalleryId::Img2Img),
            other => Err(SaverError::Validation(format!("unknown gallery: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GalleryItem {
    pub image: SourceImage,
    pub generation: GenerationSource,
}

/// Read access to whatever the host most recently generated.
pub trait ImageSource: Send + Sync {
    fn len(&self, gallery: GalleryId) -> usize;
    fn get(&self, gallery: GalleryId, index: usize) -> Option<GalleryItem>;

    fn is_empty(&self, gallery: GalleryId) -> bool {
        self.len(gallery) == 0
    }
}

/// Host-side galleries kept in memory; each publish replaces the contents.
#[derive(Debug, Default)]
pub struct InMemoryGalleries {
    txt2img: RwLock<Vec<GalleryItem>>,
    img2img: RwLock<Vec<GalleryItem>>,
}

impl InMemoryGalleries {
    fn slot(&self, gallery: GalleryId) -> &RwLock<Vec<GalleryItem>> {
        match gallery {
            GalleryId::Txt2Img => &self.txt2img,
            GalleryId::Img2Img => &self.img2img,
        }
    }

    pub fn replace(&self, gallery: GalleryId, items: Vec<GalleryItem>) {
        *self.slot(gallery).write() = items;
    }
}

impl ImageSource for InMemoryGalleries {
    fn len(&self, gallery: GalleryId) -> usize {
        self.slot(gallery).read().len()
    }

    fn get(&self, gallery: GalleryId, index: usize) -> Option<GalleryItem> {
        self.slot(gallery).read().get(index).cloned()
    }
}

#[derive(Deserialize)]
struct PublishedImage {
    /// Base64 PNG, optionally as a `data:` URI.
    image: String,
    #[serde(default)]
    info: Option<Map<String, Value>>,
    #[serde(default)]
    generation: Option<Value>,
}

#[derive(Deserialize)]
struct PublishReq {
    images: Vec<PublishedImage>,
}

#[derive(Serialize)]
struct PublishResp {
    success: bool,
    count: usize,
}

fn decode_image(encoded: &str) -> Result<image::DynamicImage, ApiErr> {
    let payload = match encoded.split_once(";base64,") {
        Some((_, data)) => data,
        None => encoded,
    };
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| ApiErr::bad_request(format!("image is not valid base64: {e}")))?;
    image::load_from_memory(&bytes).map_err(|e| ApiErr::bad_request(format!("image could not be decoded: {e}")))
}

async fn publish(
    State(galleries): State<Arc<InMemoryGalleries>>,
    Path(gallery_id): Path<String>,
    payload: Result<Json<PublishReq>, JsonRejection>,
) -> Result<Json<PublishResp>, ApiErr> {
    let Json(req) = payload?;
    let gallery: GalleryId = gallery_id.parse()?;
    let mut items = Vec::with_capacity(req.images.len());
    for published in req.images {
        let mut image = SourceImage::new(decode_image(&published.image)?);
        image.info = published.info;
        items.push(GalleryItem {
            image,
            generation: published.generation.map(GenerationSource::from_json).unwrap_or_default(),
        });
    }
    let count = items.len();
    galleries.replace(gallery, items);
    tracing::info!(gallery = %gallery_id, count, "gallery published");
    Ok(Json(PublishResp { success: true, count }))
}

/// Route the host uses to hand over freshly generated images.
pub fn router(galleries: Arc<InMemoryGalleries>) -> Router {
    Router::new()
        .route("/api/image_metadata_saver/galleries/{gallery_id}", post(publish))
        .with_state(galleries)
}
