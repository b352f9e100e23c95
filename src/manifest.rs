use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{io::ErrorKind, path::PathBuf, sync::Arc};
use tokio::{fs, sync::Mutex};

use crate::error::SaverResult;
use crate::io::write_atomic;

const PREVIEW_CHARS: usize = 100;

/// One summary row of `history.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(deserialize_with = "crate::params::timestamp::deserialize")]
    pub timestamp: DateTime<FixedOffset>,
    pub filename: String,
    pub preview: String,
    pub metadata_file: PathBuf,
}

/// First 100 characters of the prompt, with "..." when it was cut.
pub fn preview(prompt: &str) -> String {
    match prompt.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &prompt[..cut]),
        None => prompt.to_string(),
    }
}

/// A row as found on disk. Rows that don't fit [`HistoryEntry`] are kept
/// verbatim so a rewrite never drops them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum Row {
    Entry(HistoryEntry),
    Other(Value),
}

impl Row {
    fn filename(&self) -> Option<&str> {
        match self {
            Row::Entry(e) => Some(&e.filename),
            Row::Other(v) => v.get("filename").and_then(Value::as_str),
        }
    }
}

/// The history file: a single JSON array rewritten whole on every change.
///
/// Mutations are serialized through a process-local lock so two concurrent
/// read-modify-write cycles can't drop each other's rows.
#[derive(Debug, Clone)]
pub struct HistoryIndex {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl HistoryIndex {
    /// Creates the parent directory and an empty `[]` file if needed.
    pub async fn open(path: PathBuf) -> SaverResult<Self> {
        if let Some(parent) = path.parent() { fs::create_dir_all(parent).await?; }
        if !fs::try_exists(&path).await.unwrap_or(false) {
            fs::write(&path, b"[]").await?;
        }
        Ok(Self { path, write_lock: Arc::new(Mutex::new(())) })
    }

    /// Adds `entry` at the end. A row with the same filename is replaced,
    /// since its files were just overwritten.
    pub async fn append(&self, entry: HistoryEntry) -> SaverResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut rows = self.load().await;
        rows.retain(|r| r.filename() != Some(entry.filename.as_str()));
        rows.push(Row::Entry(entry));
        self.store(&rows).await
    }

    /// Insertion order. Unreadable or missing history is empty; rows that
    /// don't parse are skipped.
    pub async fn all(&self) -> Vec<HistoryEntry> {
        self.load()
            .await
            .into_iter()
            .filter_map(|r| match r {
                Row::Entry(e) => Some(e),
                Row::Other(_) => None,
            })
            .collect()
    }

    /// Drops every row for `filename`; returns how many went.
    pub async fn remove(&self, filename: &str) -> SaverResult<usize> {
        let _guard = self.write_lock.lock().await;
        let mut rows = self.load().await;
        let before = rows.len();
        rows.retain(|r| r.filename() != Some(filename));
        self.store(&rows).await?;
        Ok(before - rows.len())
    }

    async fn load(&self) -> Vec<Row> {
        let bytes = match fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "history unreadable, treating as empty");
                return Vec::new();
            }
        };
        let rows: Vec<Row> = serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            tracing::warn!(path = %self.path.display(), error = %e, "history corrupt, treating as empty");
            Vec::new()
        });
        let skipped = rows.iter().filter(|r| matches!(r, Row::Other(_))).count();
        if skipped > 0 {
            tracing::warn!(path = %self.path.display(), skipped, "history rows not understood, keeping them as-is");
        }
        rows
    }

    async fn store(&self, rows: &[Row]) -> SaverResult<()> {
        let bytes = serde_json::to_vec_pretty(rows)?;
        write_atomic(&self.path, &bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::tests::fixed_time;
    use tempfile::TempDir;

    fn entry(filename: &str, preview_text: &str) -> HistoryEntry {
        HistoryEntry {
            timestamp: fixed_time(),
            filename: filename.to_string(),
            preview: preview_text.to_string(),
            metadata_file: PathBuf::from(format!("/m/{filename}.json")),
        }
    }

    fn history_path(tmp: &TempDir) -> PathBuf {
        tmp.path().join("metadata").join("history.json")
    }

    async fn open(tmp: &TempDir) -> HistoryIndex {
        HistoryIndex::open(history_path(tmp)).await.unwrap()
    }

    #[test]
    fn preview_truncates_at_100_chars() {
        assert_eq!(preview("short"), "short");
        let exact = "x".repeat(100);
        assert_eq!(preview(&exact), exact);
        let long = "é".repeat(150);
        assert_eq!(preview(&long), format!("{}...", "é".repeat(100)));
    }

    #[tokio::test]
    async fn open_initializes_empty_array() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        assert_eq!(std::fs::read_to_string(history_path(&tmp)).unwrap(), "[]");
        assert!(index.all().await.is_empty());
    }

    #[tokio::test]
    async fn append_keeps_insertion_order() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        index.append(entry("b.png", "second")).await.unwrap();
        index.append(entry("a.png", "first")).await.unwrap();
        let names: Vec<_> = index.all().await.into_iter().map(|e| e.filename).collect();
        assert_eq!(names, ["b.png", "a.png"]);
    }

    #[tokio::test]
    async fn append_replaces_same_filename() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        index.append(entry("a.png", "old")).await.unwrap();
        index.append(entry("b.png", "other")).await.unwrap();
        index.append(entry("a.png", "new")).await.unwrap();
        let all = index.all().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].preview, "new");
    }

    #[tokio::test]
    async fn remove_filters_and_tolerates_no_match() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        index.append(entry("a.png", "a")).await.unwrap();
        index.append(entry("b.png", "b")).await.unwrap();
        assert_eq!(index.remove("a.png").await.unwrap(), 1);
        assert_eq!(index.remove("zzz.png").await.unwrap(), 0);
        let all = index.all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].filename, "b.png");
    }

    #[tokio::test]
    async fn corrupt_history_reads_empty_and_recovers_on_write() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        std::fs::write(history_path(&tmp), "this is not json").unwrap();
        assert!(index.all().await.is_empty());

        index.append(entry("a.png", "a")).await.unwrap();
        assert_eq!(index.all().await.len(), 1);
    }

    #[tokio::test]
    async fn older_rows_survive_a_rewrite() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        std::fs::write(
            history_path(&tmp),
            r#"[
                {"timestamp": "2024-03-01T10:00:00.123456", "filename": "old_1.png",
                 "preview": "first", "metadata_file": "/m/old_1.json"},
                {"timestamp": "2024-03-01T11:00:00.5", "filename": "old_2.png",
                 "preview": "second", "metadata_file": "/m/old_2.json"},
                {"filename": "odd.png", "note": "no timestamp"}
            ]"#,
        )
        .unwrap();

        let names: Vec<_> = index.all().await.into_iter().map(|e| e.filename).collect();
        assert_eq!(names, ["old_1.png", "old_2.png"]);

        index.append(entry("new.png", "third")).await.unwrap();
        let names: Vec<_> = index.all().await.into_iter().map(|e| e.filename).collect();
        assert_eq!(names, ["old_1.png", "old_2.png", "new.png"]);

        let on_disk: Vec<Value> = serde_json::from_slice(&std::fs::read(history_path(&tmp)).unwrap()).unwrap();
        assert_eq!(on_disk.len(), 4);
        assert_eq!(on_disk[2]["note"], "no timestamp");

        assert_eq!(index.remove("odd.png").await.unwrap(), 1);
        assert_eq!(index.all().await.len(), 3);
    }

    #[tokio::test]
    async fn concurrent_appends_are_not_lost() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        let mut tasks = Vec::new();
        for i in 0..16 {
            let index = index.clone();
            tasks.push(tokio::spawn(async move {
                index.append(entry(&format!("{i}.png"), "p")).await.unwrap();
            }));
        }
        for t in tasks { t.await.unwrap(); }
        assert_eq!(index.all().await.len(), 16);
    }
}
