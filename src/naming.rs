use serde_json::Value;
use std::path::{Component, Path};

use crate::error::{SaverError, SaverResult};
use crate::params::MetadataRecord;

/// Stem reserved for the history index inside the metadata directory.
pub const HISTORY_STEM: &str = "history";

/// `image_{yyyyMMdd_HHmmss}_{seed}`. Same second plus same seed yields the
/// same name; the later save overwrites the earlier one.
pub fn base_name(record: &MetadataRecord) -> String {
    format!(
        "image_{}_{}",
        record.timestamp.format("%Y%m%d_%H%M%S"),
        seed_segment(record.parameters.seed().as_ref())
    )
}

/// Integers go in verbatim, strings are slugified, anything else is "unknown".
pub fn seed_segment(seed: Option<&Value>) -> String {
    let segment = match seed {
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => n.to_string(),
        Some(Value::Number(n)) => slug::slugify(n.to_string()),
        Some(Value::String(s)) => match s.trim().parse::<i64>() {
            Ok(v) => v.to_string(),
            Err(_) => slug::slugify(s),
        },
        _ => String::new(),
    };
    if segment.is_empty() { "unknown".to_string() } else { segment }
}

/// Reject anything but a single plain filename before it gets near the disk.
pub fn validate_name(name: &str) -> SaverResult<()> {
    if name.is_empty() || name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(SaverError::InvalidName(name.to_string()));
    }
    let mut comps = Path::new(name).components();
    match (comps.next(), comps.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(SaverError::InvalidName(name.to_string())),
    }
}

/// Record name for a request filename: `x.png`, `x.json` and `x` all map to `x`.
pub fn record_stem(name: &str) -> SaverResult<&str> {
    validate_name(name)?;
    let stem = match name.rsplit_once('.') {
        Some((stem, ext)) if ext.eq_ignore_ascii_case("png") || ext.eq_ignore_ascii_case("json") => stem,
        _ => name,
    };
    if stem.is_empty() {
        return Err(SaverError::InvalidName(name.to_string()));
    }
    Ok(stem)
}

pub fn image_filename(stem: &str) -> String {
    format!("{stem}.png")
}
