pub mod capability;
pub mod config;
pub mod credential;
pub mod error;
pub mod export;
pub mod orchestrator;
pub mod session;

pub use capability::{
    default_capability_registry, Capability, CapabilityRegistry, DryrunCapability,
    GeminiCapability, DEFAULT_GEMINI_IMAGE_MODEL,
};
pub use config::EngineConfig;
pub use credential::{
    default_auth_predicate, is_entity_not_found, AuthErrorPredicate, CredentialGate,
    StaticCredentialGate,
};
pub use error::{BatchError, CapabilityError, RequestError};
pub use export::export_variation;
pub use orchestrator::{BatchOutcome, BatchSpec, BatchStatus, Orchestrator, BATCH_SIZE};
pub use session::{new_session_id, Session};
