use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

/// Signal the generation service returns when the configured key or project
/// reference no longer resolves.
pub const ENTITY_NOT_FOUND_SIGNAL: &str = "Requested entity was not found";

/// Decides whether a raw capability error message means the credential is gone.
pub type AuthErrorPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

pub fn default_auth_predicate() -> AuthErrorPredicate {
    Arc::new(is_entity_not_found)
}

pub fn is_entity_not_found(raw_message: &str) -> bool {
    raw_message.contains(ENTITY_NOT_FOUND_SIGNAL)
}

/// Gate in front of the credential the capability uses.
pub trait CredentialGate: Send + Sync {
    fn has_valid_credential(&self) -> bool;
    fn api_key(&self) -> Option<String>;
    /// Asks the outer surface to pick a credential. Callers assume success.
    fn request_credential_selection(&self) -> anyhow::Result<()>;
    /// Clears the valid-credential flag; the next batch must re-select first.
    fn invalidate(&self);
}

#[derive(Debug, Default)]
pub struct StaticCredentialGate {
    key: Mutex<Option<String>>,
    valid: AtomicBool,
}

impl StaticCredentialGate {
    pub fn new(key: Option<String>) -> Self {
        let key = key
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let valid = AtomicBool::new(key.is_some());
        Self {
            key: Mutex::new(key),
            valid,
        }
    }

    /// Seeds from `GEMINI_API_KEY`, then `GOOGLE_API_KEY`.
    pub fn from_env() -> Self {
        let key = ["GEMINI_API_KEY", "GOOGLE_API_KEY"]
            .into_iter()
            .filter_map(|name| env::var(name).ok())
            .map(|value| value.trim().to_string())
            .find(|value| !value.is_empty());
        Self::new(key)
    }

    pub fn select_key(&self, key: &str) -> bool {
        let trimmed = key.trim();
        if trimmed.is_empty() {
            return false;
        }
        match self.key.lock() {
            Ok(mut slot) => *slot = Some(trimmed.to_string()),
            Err(poisoned) => *poisoned.into_inner() = Some(trimmed.to_string()),
        }
        self.valid.store(true, Ordering::SeqCst);
        info!("credential selected");
        true
    }
}

impl CredentialGate for StaticCredentialGate {
    fn has_valid_credential(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn api_key(&self) -> Option<String> {
        if !self.has_valid_credential() {
            return None;
        }
        self.key.lock().ok().and_then(|slot| slot.clone())
    }

    /// Nothing to prompt here: only a key passed to [`select_key`] since the
    /// last invalidation makes the gate valid again.
    ///
    /// [`select_key`]: StaticCredentialGate::select_key
    fn request_credential_selection(&self) -> anyhow::Result<()> {
        let has_key = self
            .key
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false);
        self.valid.store(has_key, Ordering::SeqCst);
        Ok(())
    }

    /// Drops the held key along with the flag; a rejected key is never reused.
    fn invalidate(&self) {
        match self.key.lock() {
            Ok(mut slot) => *slot = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
        if self.valid.swap(false, Ordering::SeqCst) {
            warn!("credential invalidated; re-selection required");
        }
    }
}
