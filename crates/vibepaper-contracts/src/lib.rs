pub mod events;
pub mod history;
pub mod models;
pub mod settings;
pub mod storage;
pub mod variation;

pub use events::{EventWriter, SessionEvent};
pub use history::{gallery_view, GalleryView, HistoryStore, HISTORY_CAP, HISTORY_KEY};
pub use settings::{AspectRatio, OutputSettings, Quality};
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage};
pub use variation::{GenerationRequest, ReferenceImage, WallpaperVariation};
