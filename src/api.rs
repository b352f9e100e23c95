use std::sync::Arc;
use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{Html, IntoResponse},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    config::SaverCfg,
    error::SaverError,
    gallery::{self, GalleryId, ImageSource, InMemoryGalleries},
    manifest::HistoryEntry,
    params::MetadataRecord,
    saver::MetadataSaver,
    ui,
};

#[derive(Clone)]
pub struct AppState {
    pub saver: Arc<MetadataSaver>,
    pub source: Arc<dyn ImageSource>,
    pub settings: Arc<SaverCfg>,
}

pub async fn serve(cfg: SaverCfg) -> Result<()> {
    let saver = MetadataSaver::open(&cfg.store)
        .await
        .with_context(|| format!("Failed to prepare store under {}", cfg.root.display()))?;
    let galleries = Arc::new(InMemoryGalleries::default());
    let bind = cfg.server.bind.clone();

    let state = AppState {
        saver: Arc::new(saver),
        source: galleries.clone(),
        settings: Arc::new(cfg),
    };

    let app = router(state)
        .merge(gallery::router(galleries))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    tracing::info!("image metadata saver listening on http://{bind}");
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/image_metadata_saver/save", post(save_image))
        .route("/api/image_metadata_saver/history", get(get_history))
        .route("/api/image_metadata_saver/metadata/{filename}", get(get_metadata))
        .route("/api/image_metadata_saver/delete/{filename}", delete(delete_image))
        .route("/api/image_metadata_saver/settings", get(get_settings))
        .route("/image_metadata_saver", get(history_panel))
        .route("/image_metadata_saver/settings", get(settings_panel))
        .route("/image_metadata_saver/images/{filename}", get(get_image))
        .with_state(state)
}

#[derive(Deserialize)]
struct SaveReq {
    #[serde(default, alias = "galleryId")]
    gallery_id: Option<String>,
    #[serde(default, alias = "imageIndex")]
    image_index: Option<usize>,
}

#[derive(Serialize)]
struct SaveResp {
    success: bool,
    image_path: String,
    metadata_path: String,
}

async fn save_image(
    State(st): State<AppState>,
    payload: Result<Json<SaveReq>, JsonRejection>,
) -> Result<Json<SaveResp>, ApiErr> {
    let Json(req) = payload?;
    let gallery_id = req
        .gallery_id
        .filter(|g| !g.is_empty())
        .ok_or_else(|| ApiErr::bad_request("gallery_id is required"))?;
    let gallery: GalleryId = gallery_id.parse()?;
    let index = req.image_index.unwrap_or(0);

    if st.source.is_empty(gallery) {
        return Err(ApiErr::not_found(format!("gallery {gallery_id} is empty")));
    }
    let item = st
        .source
        .get(gallery, index)
        .ok_or_else(|| ApiErr::not_found(format!("no image at index {index} in {gallery_id}")))?;

    let paths = st.saver.save(&item.image, &item.generation).await?;
    Ok(Json(SaveResp {
        success: true,
        image_path: paths.image_path.display().to_string(),
        metadata_path: paths.metadata_path.display().to_string(),
    }))
}

#[derive(Serialize)]
struct DataResp<T> {
    success: bool,
    data: T,
}

async fn get_history(State(st): State<AppState>) -> Json<DataResp<Vec<HistoryEntry>>> {
    Json(DataResp { success: true, data: st.saver.list().await })
}

async fn get_metadata(
    State(st): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Json<DataResp<MetadataRecord>>, ApiErr> {
    let record = st.saver.get(&filename).await?;
    Ok(Json(DataResp { success: true, data: record }))
}

#[derive(Serialize)]
struct OkResp {
    success: bool,
}

async fn delete_image(State(st): State<AppState>, Path(filename): Path<String>) -> Result<Json<OkResp>, ApiErr> {
    st.saver.delete(&filename).await?;
    Ok(Json(OkResp { success: true }))
}

#[derive(Serialize)]
struct SettingsView {
    images_dir: String,
    metadata_dir: String,
    auto_save: bool,
}

async fn get_settings(State(st): State<AppState>) -> Json<DataResp<SettingsView>> {
    let store = &st.settings.store;
    Json(DataResp {
        success: true,
        data: SettingsView {
            images_dir: store.images_dir.display().to_string(),
            metadata_dir: store.metadata_dir.display().to_string(),
            auto_save: st.settings.auto_save,
        },
    })
}

async fn history_panel(State(st): State<AppState>) -> Html<String> {
    Html(ui::history_page(&st.saver).await.into_string())
}

async fn settings_panel(State(st): State<AppState>) -> Html<String> {
    Html(ui::settings_page(&st.settings).into_string())
}

async fn get_image(State(st): State<AppState>, Path(filename): Path<String>) -> Result<impl IntoResponse, ApiErr> {
    let bytes = st.saver.image_bytes(&filename).await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, HeaderValue::from_static("image/png"))],
        bytes,
    ))
}

/// Handler failure. Validation and lookup misses keep their 4xx status;
/// everything else is a handled failure reported with HTTP 200.
#[derive(Debug)]
pub struct ApiErr {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiErr {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, code: "bad_request", message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, code: "not_found", message: message.into() }
    }

    fn failed(e: impl std::fmt::Display) -> Self {
        tracing::error!(error = %e, "request failed");
        Self { status: StatusCode::OK, code: "operation_failed", message: e.to_string() }
    }
}

impl From<SaverError> for ApiErr {
    fn from(e: SaverError) -> Self {
        match e {
            SaverError::InvalidName(_) => Self {
                status: StatusCode::BAD_REQUEST,
                code: "invalid_filename",
                message: e.to_string(),
            },
            SaverError::Validation(msg) => Self::bad_request(msg),
            SaverError::NotFound(_) => Self::not_found(e.to_string()),
            other => Self::failed(other),
        }
    }
}

impl From<JsonRejection> for ApiErr {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiErr {
    fn into_response(self) -> axum::response::Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            success: bool,
            error: String,
            code: &'static str,
        }
        (
            self.status,
            Json(ErrorResponse { success: false, error: self.message, code: self.code }),
        )
            .into_response()
    }
}
