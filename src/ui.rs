//! HTML panels for the host UI: saved-image history and settings.

use maud::{html, Markup, DOCTYPE};
use serde_json::Value;

use crate::config::SaverCfg;
use crate::manifest::{preview, HistoryEntry};
use crate::naming::validate_name;
use crate::saver::MetadataSaver;

const CSS: &str = r#"
.history-container { display: flex; flex-wrap: wrap; gap: 20px; }
.history-item { border: 1px solid #ddd; border-radius: 8px; padding: 10px; width: 300px; box-shadow: 0 2px 4px rgba(0,0,0,0.1); }
.history-image img { width: 100%; height: auto; border-radius: 4px; }
.history-details { margin-top: 10px; }
.view-details { background-color: #4a6cf7; color: white; padding: 5px 10px; border-radius: 4px; text-decoration: none; }
.history-empty { padding: 20px; text-align: center; color: #666; }
"#;

/// What one history card shows.
#[derive(Debug, Clone, PartialEq)]
pub struct Card {
    pub entry: HistoryEntry,
    pub prompt: String,
    pub seed: String,
}

fn page(title: &str, content: Markup) -> Markup {
    html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="UTF-8";
                title { (title) }
                style { (maud::PreEscaped(CSS)) }
            }
            body { (content) }
        }
    }
}

fn stem(filename: &str) -> &str {
    filename.strip_suffix(".png").unwrap_or(filename)
}

/// Newest first; entries whose image file is gone are skipped, not removed.
pub async fn history_cards(saver: &MetadataSaver) -> Vec<Card> {
    let mut entries = saver.list().await;
    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let mut cards = Vec::with_capacity(entries.len());
    for entry in entries {
        if let Err(e) = validate_name(&entry.filename) {
            tracing::debug!(filename = %entry.filename, error = %e, "history row has an unusable filename");
            continue;
        }
        if !saver.store().image_exists(&entry.filename).await {
            continue;
        }
        let (prompt, seed) = match saver.get(&entry.filename).await {
            Ok(record) => (
                record.parameters.prompt().map(preview).unwrap_or_else(|| "Not available".to_string()),
                match record.parameters.seed() {
                    Some(Value::String(s)) => s,
                    Some(v) if !v.is_null() => v.to_string(),
                    _ => "Not available".to_string(),
                },
            ),
            Err(e) => {
                tracing::debug!(filename = %entry.filename, error = %e, "sidecar unavailable for history card");
                ("Metadata not available".to_string(), "Not available".to_string())
            }
        };
        cards.push(Card { entry, prompt, seed });
    }
    cards
}

fn encoded(name: &str) -> String {
    urlencoding::encode(name).into_owned()
}

pub fn render_history(cards: &[Card]) -> Markup {
    html! {
        a.refresh href="/image_metadata_saver" { "Refresh history" }
        @if cards.is_empty() {
            div.history-empty { "No saved images in the history yet." }
        } @else {
            div.history-container {
                @for card in cards {
                    div.history-item {
                        div.history-image {
                            img src={ "/image_metadata_saver/images/" (encoded(&card.entry.filename)) } alt=(card.entry.filename);
                        }
                        div.history-details {
                            h4 { (card.entry.filename) }
                            p { strong { "Date: " } (card.entry.timestamp.format("%d/%m/%Y %H:%M:%S").to_string()) }
                            p { strong { "Prompt: " } (card.prompt) }
                            p { strong { "Seed: " } (card.seed) }
                            a.view-details href={ "/api/image_metadata_saver/metadata/" (encoded(stem(&card.entry.filename))) ".json" } {
                                "View details"
                            }
                        }
                    }
                }
            }
        }
    }
}

pub async fn history_page(saver: &MetadataSaver) -> Markup {
    page("Saved images", render_history(&history_cards(saver).await))
}

pub fn settings_page(cfg: &SaverCfg) -> Markup {
    page(
        "Image Metadata Saver settings",
        html! {
            h1 { "Image Metadata Saver settings" }
            label { "Saved images directory" input type="text" readonly value=(cfg.store.images_dir.display().to_string()); }
            label { "Metadata directory" input type="text" readonly value=(cfg.store.metadata_dir.display().to_string()); }
            // Not wired to anything yet.
            label { input type="checkbox" disabled checked[cfg.auto_save]; "Save every generated image automatically" }
        },
    )
}
