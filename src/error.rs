use std::io;

/// Failures surfaced by the store and the façade.
///
/// Parse failures of `history.json` or a sidecar never show up here on the
/// read path: the history degrades to empty and an unreadable sidecar is
/// reported as [`SaverError::NotFound`].
#[derive(Debug, thiserror::Error)]
pub enum SaverError {
    /// A request filename that could escape the store directories.
    #[error("invalid filename: {0}")]
    InvalidName(String),

    /// A missing or malformed request field.
    #[error("{0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("json serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

pub type SaverResult<T> = Result<T, SaverError>;
