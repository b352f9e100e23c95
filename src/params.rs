//! Generation inputs as the host hands them over, and the metadata record
//! that gets persisted for every save.

use chrono::{DateTime, FixedOffset};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{path::PathBuf, sync::Arc};

const UNKNOWN: &str = "unknown";

/// Checkpoint the host had loaded when the image was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRef {
    pub name: String,
    pub hash: String,
}

/// Processing settings of a txt2img or img2img run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingParams {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default)]
    pub steps: u32,
    #[serde(default)]
    pub sampler_name: String,
    #[serde(default)]
    pub cfg_scale: f64,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub model: Option<ModelRef>,
}

/// What the host knows about how an image was generated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "params")]
pub enum GenerationSource {
    #[serde(rename = "txt2img")]
    Txt2Img(ProcessingParams),
    #[serde(rename = "img2img")]
    Img2Img(ProcessingParams),
    /// Anything else the host exposes; dumped field by field when it is an object.
    #[serde(rename = "unstructured")]
    Unstructured(Value),
    #[default]
    #[serde(rename = "absent")]
    Absent,
}

impl GenerationSource {
    /// Interpret an arbitrary JSON document: a `{kind, params}` object is
    /// taken as-is, everything else becomes [`GenerationSource::Unstructured`].
    pub fn from_json(value: Value) -> Self {
        match serde_json::from_value::<GenerationSource>(value.clone()) {
            Ok(src) => src,
            Err(_) => GenerationSource::Unstructured(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationKind {
    Txt2img,
    Img2img,
    Unknown,
}

/// Structured parameters extracted from a recognised processing object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerationParameters {
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: u32,
    pub sampler: String,
    pub cfg_scale: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    pub size: String,
    pub model: String,
    pub model_hash: String,
    pub batch_size: u32,
    #[serde(rename = "type")]
    pub kind: GenerationKind,
}

/// The `parameters` block of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Parameters {
    Structured(GenerationParameters),
    Raw(Map<String, Value>),
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters::Raw(Map::new())
    }
}

impl Parameters {
    pub fn prompt(&self) -> Option<&str> {
        match self {
            Parameters::Structured(p) => Some(&p.prompt),
            Parameters::Raw(m) => m.get("prompt").and_then(Value::as_str),
        }
    }

    /// Seed as a JSON value, whatever shape the source gave it.
    pub fn seed(&self) -> Option<Value> {
        match self {
            Parameters::Structured(p) => p.seed.map(Value::from),
            Parameters::Raw(m) => m.get("seed").cloned(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Parameters::Raw(m) if m.is_empty())
    }
}

/// An image as produced by the host, plus whatever text metadata its codec
/// attached (the PNG "info" mapping).
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub pixels: Arc<DynamicImage>,
    pub info: Option<Map<String, Value>>,
}

impl SourceImage {
    pub fn new(pixels: DynamicImage) -> Self {
        Self { pixels: Arc::new(pixels), info: None }
    }

    pub fn with_info(mut self, info: Map<String, Value>) -> Self {
        self.info = Some(info);
        self
    }
}

/// Record timestamps are written as RFC 3339. On read, an ISO-8601 value
/// without an offset (as older history files hold) is taken as local time.
pub mod timestamp {
    use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone};
    use serde::{de::Error as _, Deserialize, Deserializer};

    pub fn parse(text: &str) -> Option<DateTime<FixedOffset>> {
        if let Ok(t) = DateTime::parse_from_rfc3339(text) {
            return Some(t);
        }
        let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
        Some(match Local.from_local_datetime(&naive).earliest() {
            Some(t) => t.fixed_offset(),
            // Skipped by a DST jump; UTC is as good a guess as any.
            None => naive.and_utc().fixed_offset(),
        })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<FixedOffset>, D::Error> {
        let text = String::deserialize(d)?;
        parse(&text).ok_or_else(|| D::Error::custom(format!("not an ISO-8601 timestamp: {text}")))
    }
}

/// Everything persisted in a sidecar file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub timestamp: DateTime<FixedOffset>,
    /// Empty until the image has been written.
    pub filename: String,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_info: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed_parameters: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<PathBuf>,
}

/// Build the record for one generation event. Never fails: unrecognised
/// sources degrade to a field dump or to empty parameters.
pub fn extract_at(image: &SourceImage, source: &GenerationSource, now: DateTime<FixedOffset>) -> MetadataRecord {
    let parameters = match source {
        GenerationSource::Txt2Img(p) => Parameters::Structured(structured(p, GenerationKind::Txt2img)),
        GenerationSource::Img2Img(p) => Parameters::Structured(structured(p, GenerationKind::Img2img)),
        GenerationSource::Unstructured(Value::Object(fields)) => Parameters::Raw(fields.clone()),
        GenerationSource::Unstructured(_) | GenerationSource::Absent => Parameters::default(),
    };

    let image_info = image.info.clone().filter(|info| !info.is_empty());
    let parsed_parameters = image_info
        .as_ref()
        .and_then(|info| info.get("parameters"))
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(str::to_string);

    MetadataRecord {
        timestamp: now,
        filename: String::new(),
        parameters,
        image_info,
        parsed_parameters,
        image_path: None,
    }
}

fn structured(p: &ProcessingParams, kind: GenerationKind) -> GenerationParameters {
    let (model, model_hash) = match &p.model {
        Some(m) => (m.name.clone(), m.hash.clone()),
        None => (UNKNOWN.to_string(), UNKNOWN.to_string()),
    };
    GenerationParameters {
        prompt: p.prompt.clone(),
        negative_prompt: p.negative_prompt.clone(),
        steps: p.steps,
        sampler: p.sampler_name.clone(),
        cfg_scale: p.cfg_scale,
        seed: p.seed,
        size: format!("{}x{}", p.width, p.height),
        model,
        model_hash,
        batch_size: p.batch_size.unwrap_or(1).max(1),
        kind,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    pub(crate) fn fixed_time() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 9, 14, 5, 7)
            .unwrap()
    }

    pub(crate) fn txt2img(prompt: &str, seed: Option<i64>) -> GenerationSource {
        GenerationSource::Txt2Img(ProcessingParams {
            prompt: prompt.to_string(),
            negative_prompt: "blurry".to_string(),
            steps: 20,
            sampler_name: "Euler a".to_string(),
            cfg_scale: 7.0,
            seed,
            width: 512,
            height: 768,
            batch_size: None,
            model: Some(ModelRef { name: "sd15".to_string(), hash: "abc123".to_string() }),
        })
    }

    pub(crate) fn tiny_image() -> SourceImage {
        SourceImage::new(DynamicImage::new_rgba8(4, 4))
    }

    #[test]
    fn txt2img_becomes_structured() {
        let rec = extract_at(&tiny_image(), &txt2img("a cat", Some(42)), fixed_time());
        assert_eq!(rec.filename, "");
        assert_eq!(rec.timestamp, fixed_time());
        let Parameters::Structured(p) = &rec.parameters else { panic!("expected structured") };
        assert_eq!(p.size, "512x768");
        assert_eq!(p.sampler, "Euler a");
        assert_eq!(p.batch_size, 1);
        assert_eq!(p.kind, GenerationKind::Txt2img);
        assert_eq!(p.model, "sd15");
        assert_eq!(rec.parameters.seed(), Some(json!(42)));
    }

    #[test]
    fn missing_model_reads_unknown() {
        let src = GenerationSource::Img2Img(ProcessingParams {
            prompt: "x".into(),
            negative_prompt: String::new(),
            steps: 1,
            sampler_name: "DDIM".into(),
            cfg_scale: 1.5,
            seed: None,
            width: 8,
            height: 8,
            batch_size: Some(4),
            model: None,
        });
        let rec = extract_at(&tiny_image(), &src, fixed_time());
        let Parameters::Structured(p) = rec.parameters else { panic!("expected structured") };
        assert_eq!(p.model, "unknown");
        assert_eq!(p.model_hash, "unknown");
        assert_eq!(p.kind, GenerationKind::Img2img);
        assert_eq!(p.batch_size, 4);
        assert_eq!(p.seed, None);
    }

    #[test]
    fn unstructured_object_is_dumped() {
        let src = GenerationSource::Unstructured(json!({"prompt": "p", "seed": "abc", "extra": [1, 2]}));
        let rec = extract_at(&tiny_image(), &src, fixed_time());
        assert_eq!(rec.parameters.prompt(), Some("p"));
        assert_eq!(rec.parameters.seed(), Some(json!("abc")));
    }

    #[test]
    fn unstructured_scalar_and_absent_are_empty() {
        for src in [GenerationSource::Unstructured(json!(17)), GenerationSource::Absent] {
            let rec = extract_at(&tiny_image(), &src, fixed_time());
            assert!(rec.parameters.is_empty());
        }
    }

    #[test]
    fn image_info_and_parameters_text_are_copied() {
        let mut info = Map::new();
        info.insert("parameters".into(), json!("a cat\nSteps: 20, Seed: 42"));
        info.insert("dpi".into(), json!([72, 72]));
        let img = tiny_image().with_info(info.clone());

        let rec = extract_at(&img, &GenerationSource::Absent, fixed_time());
        assert_eq!(rec.image_info, Some(info));
        assert_eq!(rec.parsed_parameters.as_deref(), Some("a cat\nSteps: 20, Seed: 42"));
    }

    #[test]
    fn empty_parameters_text_is_not_copied() {
        let mut info = Map::new();
        info.insert("parameters".into(), json!(""));
        let rec = extract_at(&tiny_image().with_info(info), &GenerationSource::Absent, fixed_time());
        assert!(rec.image_info.is_some());
        assert_eq!(rec.parsed_parameters, None);
    }

    #[test]
    fn from_json_recognises_tagged_sources() {
        let src = GenerationSource::from_json(json!({"kind": "txt2img", "params": {"prompt": "hi", "seed": 7}}));
        let GenerationSource::Txt2Img(p) = src else { panic!("expected txt2img") };
        assert_eq!(p.prompt, "hi");
        assert_eq!(p.seed, Some(7));

        let raw = json!({"prompt": "free form"});
        assert_eq!(GenerationSource::from_json(raw.clone()), GenerationSource::Unstructured(raw));
    }

    #[test]
    fn timestamps_without_offset_read_as_local_time() {
        let with_offset = timestamp::parse("2024-03-09T14:05:07+01:00").unwrap();
        assert_eq!(with_offset, fixed_time());

        let naive = timestamp::parse("2024-03-01T10:00:00.123456").unwrap();
        assert_eq!(naive.naive_local().to_string(), "2024-03-01 10:00:00.123456");
        assert!(timestamp::parse("2024-03-01T10:00:00").is_some());
        assert!(timestamp::parse("yesterday").is_none());

        let rec: MetadataRecord = serde_json::from_value(json!({
            "timestamp": "2024-03-01T10:00:00.123456",
            "filename": "image_20240301_100000_5.png",
            "parameters": {"prompt": "old", "seed": 5}
        }))
        .unwrap();
        assert_eq!(rec.parameters.prompt(), Some("old"));
        assert_eq!(rec.timestamp.naive_local().to_string(), "2024-03-01 10:00:00.123456");
    }

    #[test]
    fn record_json_round_trips() {
        let mut info = Map::new();
        info.insert("parameters".into(), json!("ñandú ☃"));
        let rec = extract_at(&tiny_image().with_info(info), &txt2img("ñandú", Some(-1)), fixed_time());
        let text = serde_json::to_string_pretty(&rec).unwrap();
        assert!(text.contains("ñandú"));
        let back: MetadataRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back, rec);

        let raw = extract_at(&tiny_image(), &GenerationSource::Unstructured(json!({"prompt": "p"})), fixed_time());
        let back: MetadataRecord = serde_json::from_str(&serde_json::to_string(&raw).unwrap()).unwrap();
        assert_eq!(back, raw);
    }
}
