mod registry;
mod selectors;

pub use registry::{ModelRegistry, ModelSpec, CAPABILITY_IMAGE, CAPABILITY_REMIX};
pub use selectors::{Fallback, ModelSelection, ModelSelector};
