use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_BIND: &str = "127.0.0.1:7861";

/// Where records live on disk. Passed explicitly into the record store and
/// the history index; nothing else holds paths.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub images_dir: PathBuf,
    pub metadata_dir: PathBuf,
    pub history_file: PathBuf,
}

impl StoreConfig {
    /// Standard layout: `saved_images/`, `metadata/` and `metadata/history.json`.
    pub fn under(root: &Path) -> Self {
        let metadata_dir = root.join("metadata");
        Self {
            images_dir: root.join("saved_images"),
            history_file: metadata_dir.join("history.json"),
            metadata_dir,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerCfg {
    pub bind: String,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self { bind: DEFAULT_BIND.to_string() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaverCfg {
    pub root: PathBuf,
    pub store: StoreConfig,
    pub server: ServerCfg,
    // Shown in the settings panel only; no save path reads it.
    pub auto_save: bool,
}

/// On-disk YAML shape. Every field is optional and falls back to the layout
/// derived from `root`.
#[derive(Debug, Default, Deserialize)]
struct FileCfg {
    root: Option<PathBuf>,
    images_dir: Option<PathBuf>,
    metadata_dir: Option<PathBuf>,
    history_file: Option<PathBuf>,
    #[serde(default)]
    server: Option<ServerCfg>,
    #[serde(default)]
    auto_save: bool,
}

impl SaverCfg {
    pub fn rooted_at(root: PathBuf) -> Self {
        Self {
            store: StoreConfig::under(&root),
            root,
            server: ServerCfg::default(),
            auto_save: false,
        }
    }

    fn from_file_cfg(file: FileCfg, root_override: Option<PathBuf>, bind_override: Option<String>) -> Self {
        let root = root_override
            .or(file.root)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut cfg = Self::rooted_at(root);
        let store = &mut cfg.store;
        if let Some(dir) = file.images_dir { store.images_dir = dir; }
        if let Some(dir) = file.metadata_dir {
            store.history_file = dir.join("history.json");
            store.metadata_dir = dir;
        }
        if let Some(f) = file.history_file { store.history_file = f; }

        if let Some(server) = file.server { cfg.server = server; }
        if let Some(bind) = bind_override { cfg.server.bind = bind; }
        cfg.auto_save = file.auto_save;
        cfg
    }
}

/// Load settings from an optional YAML file, then apply `IMS_ROOT` and
/// `IMS_BIND` from the environment.
pub fn load(path: Option<&Path>) -> anyhow::Result<SaverCfg> {
    let file = match path {
        Some(p) => {
            let txt = std::fs::read_to_string(p)
                .with_context(|| format!("Failed to read config file: {}", p.display()))?;
            parse_yaml(&txt)?
        }
        None => FileCfg::default(),
    };
    let root = std::env::var("IMS_ROOT").ok().map(PathBuf::from);
    let bind = std::env::var("IMS_BIND").ok();
    Ok(SaverCfg::from_file_cfg(file, root, bind))
}

fn parse_yaml(txt: &str) -> anyhow::Result<FileCfg> {
    // An empty file is a valid "all defaults" config.
    if txt.trim().is_empty() {
        return Ok(FileCfg::default());
    }
    serde_yaml::from_str(txt).context("Failed to parse config YAML")
}
