use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::storage::KeyValueStorage;
use crate::variation::WallpaperVariation;

pub const HISTORY_KEY: &str = "vibepaper_history";
pub const HISTORY_CAP: usize = 50;
pub const HISTORY_SCHEMA_VERSION: u64 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryEnvelope {
    schema_version: u64,
    items: Vec<Value>,
}

/// Most-recent-first, size-bounded record of past variations, persisted as a
/// single blob under [`HISTORY_KEY`].
#[derive(Debug)]
pub struct HistoryStore<S: KeyValueStorage> {
    storage: S,
    items: Vec<WallpaperVariation>,
    cap: usize,
}

impl<S: KeyValueStorage> HistoryStore<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            items: Vec::new(),
            cap: HISTORY_CAP,
        }
    }

    /// Builds the store and reads whatever is persisted.
    pub fn open(storage: S) -> Self {
        let mut store = Self::new(storage);
        store.load();
        store
    }

    pub fn with_cap(mut self, cap: usize) -> Self {
        self.cap = cap.max(1);
        self.items.truncate(self.cap);
        self
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn items(&self) -> &[WallpaperVariation] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn find(&self, id: &str) -> Option<&WallpaperVariation> {
        self.items.iter().find(|item| item.id == id)
    }

    /// Replaces the in-memory sequence with the persisted one. Missing or
    /// unreadable data yields an empty history; this never fails.
    pub fn load(&mut self) -> Vec<WallpaperVariation> {
        self.items = match self.storage.get(HISTORY_KEY) {
            Some(raw) => decode_history(&raw, self.cap),
            None => Vec::new(),
        };
        self.items.clone()
    }

    /// Prepends `new_items` in their given order, truncates to the cap and
    /// writes the whole sequence back. The in-memory sequence is updated even
    /// when the write fails.
    pub fn merge(&mut self, new_items: &[WallpaperVariation]) -> anyhow::Result<()> {
        let mut merged = Vec::with_capacity(new_items.len() + self.items.len());
        merged.extend(new_items.iter().cloned());
        merged.append(&mut self.items);
        self.items = dedupe_and_cap(merged, self.cap);
        self.persist()
    }

    pub fn clear(&mut self) -> anyhow::Result<()> {
        self.items.clear();
        self.storage.remove(HISTORY_KEY)
    }

    fn persist(&self) -> anyhow::Result<()> {
        let envelope = HistoryEnvelope {
            schema_version: HISTORY_SCHEMA_VERSION,
            items: self
                .items
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<Vec<Value>, _>>()?,
        };
        self.storage
            .set(HISTORY_KEY, &serde_json::to_string(&envelope)?)?;
        debug!(count = self.items.len(), "history persisted");
        Ok(())
    }
}

fn decode_history(raw: &str, cap: usize) -> Vec<WallpaperVariation> {
    let parsed: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "persisted history is not valid JSON; starting empty");
            return Vec::new();
        }
    };

    let entries = match parsed {
        // Bare arrays predate the versioned envelope.
        Value::Array(entries) => entries,
        Value::Object(_) => match serde_json::from_value::<HistoryEnvelope>(parsed) {
            Ok(envelope) if envelope.schema_version == HISTORY_SCHEMA_VERSION => envelope.items,
            Ok(envelope) => {
                warn!(
                    schema_version = envelope.schema_version,
                    "unsupported history schema version; starting empty"
                );
                return Vec::new();
            }
            Err(err) => {
                warn!(error = %err, "persisted history has an unknown shape; starting empty");
                return Vec::new();
            }
        },
        _ => {
            warn!("persisted history has an unknown shape; starting empty");
            return Vec::new();
        }
    };

    let total = entries.len();
    let items: Vec<WallpaperVariation> = entries
        .into_iter()
        .filter_map(|entry| serde_json::from_value(entry).ok())
        .collect();
    if items.len() != total {
        warn!(
            skipped = total - items.len(),
            "dropped unreadable history entries"
        );
    }
    dedupe_and_cap(items, cap)
}

fn dedupe_and_cap(items: Vec<WallpaperVariation>, cap: usize) -> Vec<WallpaperVariation> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.id.clone()))
        .take(cap)
        .collect()
}

/// What a presentation layer shows: the latest batch, then history minus
/// anything already in that batch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GalleryView {
    pub current: Vec<WallpaperVariation>,
    pub history: Vec<WallpaperVariation>,
}

pub fn gallery_view(current: &[WallpaperVariation], history: &[WallpaperVariation]) -> GalleryView {
    let current_ids: HashSet<&str> = current.iter().map(|item| item.id.as_str()).collect();
    GalleryView {
        current: current.to_vec(),
        history: history
            .iter()
            .filter(|item| !current_ids.contains(item.id.as_str()))
            .cloned()
            .collect(),
    }
}
