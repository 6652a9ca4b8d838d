use std::sync::Arc;

use anyhow::anyhow;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use vibepaper_contracts::{
    gallery_view, AspectRatio, EventWriter, GalleryView, HistoryStore, KeyValueStorage,
    OutputSettings, Quality, SessionEvent, WallpaperVariation,
};

use crate::error::BatchError;
use crate::orchestrator::{BatchOutcome, BatchStatus, Orchestrator};

/// State of one interactive session: prompt, settings, latest batch, remix
/// source, last error and the persisted history.
pub struct Session<S: KeyValueStorage> {
    orchestrator: Arc<Orchestrator>,
    history: HistoryStore<S>,
    events: Option<EventWriter>,
    prompt: String,
    settings: OutputSettings,
    results: Vec<WallpaperVariation>,
    reference: Option<WallpaperVariation>,
    last_error: Option<BatchError>,
}

impl<S: KeyValueStorage> Session<S> {
    pub fn open(
        orchestrator: Arc<Orchestrator>,
        mut history: HistoryStore<S>,
        events: Option<EventWriter>,
    ) -> Self {
        history.load();
        let session = Self {
            orchestrator,
            history,
            events,
            prompt: String::new(),
            settings: OutputSettings::default(),
            results: Vec::new(),
            reference: None,
            last_error: None,
        };
        session.emit(SessionEvent::SessionStarted {
            capability: session.orchestrator.capability_name().to_string(),
            history_count: session.history.len(),
        });
        session
    }

    pub fn status(&self) -> BatchStatus {
        self.orchestrator.status()
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn set_prompt(&mut self, prompt: impl Into<String>) {
        self.prompt = prompt.into();
    }

    pub fn settings(&self) -> OutputSettings {
        self.settings
    }

    pub fn set_aspect_ratio(&mut self, aspect_ratio: AspectRatio) {
        self.settings.aspect_ratio = aspect_ratio;
    }

    pub fn set_quality(&mut self, quality: Quality) {
        self.settings.quality = quality;
    }

    pub fn results(&self) -> &[WallpaperVariation] {
        &self.results
    }

    pub fn history(&self) -> &[WallpaperVariation] {
        self.history.items()
    }

    pub fn reference(&self) -> Option<&WallpaperVariation> {
        self.reference.as_ref()
    }

    pub fn last_error(&self) -> Option<&BatchError> {
        self.last_error.as_ref()
    }

    pub fn last_error_message(&self) -> Option<&'static str> {
        self.last_error.as_ref().map(BatchError::user_message)
    }

    pub fn gallery(&self) -> GalleryView {
        gallery_view(&self.results, self.history.items())
    }

    pub fn find(&self, id: &str) -> Option<&WallpaperVariation> {
        self.results
            .iter()
            .find(|item| item.id == id)
            .or_else(|| self.history.find(id))
    }

    /// Runs one batch with the current prompt, settings and remix source.
    ///
    /// On success the batch replaces the current results and is merged into
    /// history. On failure current results are emptied and the error kept for
    /// display; the status is idle again either way. A batch refused before
    /// any call is logged as `batch_refused`, never as `batch_started`.
    pub fn generate(&mut self) -> Result<BatchOutcome, BatchError> {
        if self.prompt.trim().is_empty() {
            return Ok(BatchOutcome::SkippedEmptyPrompt);
        }
        if self.orchestrator.needs_credential() {
            return Err(self.refuse_without_credential());
        }
        if self.orchestrator.status() == BatchStatus::Generating {
            self.emit(SessionEvent::BatchRefused {
                reason: "a batch is already generating".to_string(),
            });
            return Ok(BatchOutcome::RejectedBusy);
        }
        self.last_error = None;
        let reference = self.reference.as_ref().map(WallpaperVariation::as_reference);
        self.emit(SessionEvent::BatchStarted {
            prompt: self.prompt.trim().to_string(),
            aspect_ratio: self.settings.aspect_ratio,
            quality: self.settings.quality,
            remix_of: self.reference.as_ref().map(|item| item.id.clone()),
        });

        match self
            .orchestrator
            .generate_batch(&self.prompt, self.settings, reference)
        {
            Ok(BatchOutcome::Completed(items)) => {
                self.results = items.clone();
                if let Err(err) = self.history.merge(&items) {
                    warn!(error = %format!("{err:#}"), "history write failed; keeping results in memory");
                }
                self.emit(SessionEvent::BatchCompleted {
                    ids: items.iter().map(|item| item.id.clone()).collect(),
                    history_count: self.history.len(),
                });
                Ok(BatchOutcome::Completed(items))
            }
            Ok(BatchOutcome::RejectedBusy) => {
                self.emit(SessionEvent::BatchRefused {
                    reason: "a batch is already generating".to_string(),
                });
                Ok(BatchOutcome::RejectedBusy)
            }
            Ok(other) => Ok(other),
            Err(BatchError::CredentialRequired) => Err(self.refuse_without_credential()),
            Err(err) => {
                self.results.clear();
                self.emit(SessionEvent::BatchFailed {
                    error: err.to_string(),
                    auth_lost: err.is_auth_lost(),
                });
                self.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    fn refuse_without_credential(&mut self) -> BatchError {
        let err = BatchError::CredentialRequired;
        self.emit(SessionEvent::BatchRefused {
            reason: err.to_string(),
        });
        self.last_error = Some(err.clone());
        err
    }

    /// Makes `id` the remix source and carries its prompt into the prompt box.
    pub fn remix(&mut self, id: &str) -> anyhow::Result<&WallpaperVariation> {
        let source = self
            .find(id)
            .cloned()
            .ok_or_else(|| anyhow!("no wallpaper with id '{id}' in results or history"))?;
        info!(id = %source.id, "remix source selected");
        self.emit(SessionEvent::RemixSelected {
            id: source.id.clone(),
        });
        self.prompt = source.prompt.clone();
        Ok(&*self.reference.insert(source))
    }

    pub fn clear_reference(&mut self) {
        self.reference = None;
    }

    pub fn clear_history(&mut self) -> anyhow::Result<()> {
        let removed = self.history.len();
        self.history.clear()?;
        self.emit(SessionEvent::HistoryCleared { removed });
        Ok(())
    }

    fn emit(&self, event: SessionEvent) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        if let Err(err) = events.record(&event) {
            warn!(error = %format!("{err:#}"), "event log write failed");
        }
    }
}

pub fn new_session_id() -> String {
    let mut hasher = Sha256::new();
    hasher.update(chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
    hasher.update(std::process::id().to_be_bytes());
    format!("session-{}", hex::encode(&hasher.finalize()[..4]))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::Value;
    use vibepaper_contracts::{
        AspectRatio, EventWriter, GenerationRequest, HistoryStore, KeyValueStorage,
        MemoryStorage, Quality, WallpaperVariation, HISTORY_KEY,
    };

    use super::{new_session_id, Session};
    use crate::capability::{Capability, DryrunCapability};
    use crate::credential::{CredentialGate, StaticCredentialGate};
    use crate::error::{BatchError, CapabilityError};
    use crate::orchestrator::{BatchOutcome, BatchStatus, Orchestrator};

    /// Dryrun output, or a scripted failure while `fail` is set.
    struct SwitchableCapability {
        inner: DryrunCapability,
        fail: AtomicBool,
        failure: CapabilityError,
        calls: AtomicUsize,
        last_request: std::sync::Mutex<Option<GenerationRequest>>,
    }

    impl SwitchableCapability {
        fn new(failure: CapabilityError) -> Self {
            Self {
                inner: DryrunCapability::new(),
                fail: AtomicBool::new(false),
                failure,
                calls: AtomicUsize::new(0),
                last_request: std::sync::Mutex::new(None),
            }
        }
    }

    impl Capability for SwitchableCapability {
        fn name(&self) -> &str {
            "switchable"
        }

        fn generate_one(
            &self,
            request: &GenerationRequest,
        ) -> Result<WallpaperVariation, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut last) = self.last_request.lock() {
                *last = Some(request.clone());
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(self.failure.clone());
            }
            self.inner.generate_one(request)
        }
    }

    struct Fixture {
        capability: Arc<SwitchableCapability>,
        gate: Arc<StaticCredentialGate>,
        storage: Arc<MemoryStorage>,
        session: Session<Arc<MemoryStorage>>,
    }

    fn fixture(failure: CapabilityError) -> Fixture {
        let capability = Arc::new(SwitchableCapability::new(failure));
        let gate = Arc::new(StaticCredentialGate::new(Some("key".to_string())));
        let storage = Arc::new(MemoryStorage::new());
        let orchestrator = Arc::new(Orchestrator::new(capability.clone(), gate.clone()));
        let session = Session::open(orchestrator, HistoryStore::new(storage.clone()), None);
        Fixture {
            capability,
            gate,
            storage,
            session,
        }
    }

    fn completed(outcome: BatchOutcome) -> anyhow::Result<Vec<WallpaperVariation>> {
        match outcome {
            BatchOutcome::Completed(items) => Ok(items),
            other => anyhow::bail!("expected completed batch, got {other:?}"),
        }
    }

    #[test]
    fn generate_sets_results_and_persists_history() -> anyhow::Result<()> {
        let mut fx = fixture(CapabilityError::NoImageReturned);
        fx.session.set_prompt("vaporwave sunset");
        fx.session.set_aspect_ratio(AspectRatio::Square);
        fx.session.set_quality(Quality::Draft);

        let items = completed(fx.session.generate()?)?;
        assert_eq!(items.len(), 4);
        assert_eq!(fx.session.results(), items.as_slice());
        assert_eq!(fx.session.history(), items.as_slice());
        assert_eq!(fx.session.status(), BatchStatus::Idle);
        assert!(items.iter().all(|item| item.aspect_ratio == AspectRatio::Square));

        let reopened = HistoryStore::open(fx.storage.clone());
        assert_eq!(reopened.items(), items.as_slice());

        let second = completed(fx.session.generate()?)?;
        assert_eq!(&fx.session.history()[..4], second.as_slice());
        assert_eq!(fx.session.history().len(), 8);
        Ok(())
    }

    #[test]
    fn failed_batch_clears_results_and_keeps_history() -> anyhow::Result<()> {
        let mut fx = fixture(CapabilityError::Transport("connection reset".to_string()));
        fx.session.set_prompt("ink wash mountains");
        let first = completed(fx.session.generate()?)?;

        fx.capability.fail.store(true, Ordering::SeqCst);
        let err = fx.session.generate().err();
        assert!(matches!(err, Some(BatchError::GenerationFailed { failed: 4, .. })));
        assert!(fx.session.results().is_empty());
        assert_eq!(fx.session.history(), first.as_slice());
        assert_eq!(
            fx.session.last_error_message(),
            Some("Generation failed. Please try again.")
        );
        assert!(fx.gate.has_valid_credential());

        fx.capability.fail.store(false, Ordering::SeqCst);
        completed(fx.session.generate()?)?;
        assert!(fx.session.last_error().is_none());
        Ok(())
    }

    #[test]
    fn auth_loss_clears_credential_and_reports_reselect() {
        let mut fx = fixture(CapabilityError::Remote {
            status: Some(404),
            message: "Requested entity was not found.".to_string(),
        });
        fx.capability.fail.store(true, Ordering::SeqCst);
        fx.session.set_prompt("brutalist tower");

        let err = fx.session.generate().err();
        assert!(matches!(err, Some(BatchError::AuthLost { .. })));
        assert!(!fx.gate.has_valid_credential());
        assert_eq!(
            fx.session.last_error_message(),
            Some("API Key configuration lost. Please re-select your key.")
        );
        assert!(fx.session.history().is_empty());
    }

    #[test]
    fn empty_prompt_is_a_no_op() -> anyhow::Result<()> {
        let mut fx = fixture(CapabilityError::NoImageReturned);
        fx.session.set_prompt("first");
        let items = completed(fx.session.generate()?)?;

        fx.session.set_prompt("   ");
        assert_eq!(fx.session.generate()?, BatchOutcome::SkippedEmptyPrompt);
        assert_eq!(fx.session.results(), items.as_slice());
        assert_eq!(fx.capability.calls.load(Ordering::SeqCst), 4);
        Ok(())
    }

    #[test]
    fn remix_carries_prompt_and_reference_into_next_batch() -> anyhow::Result<()> {
        let mut fx = fixture(CapabilityError::NoImageReturned);
        fx.session.set_prompt("neon jellyfish");
        let items = completed(fx.session.generate()?)?;
        fx.session.set_prompt("something else");

        let source_id = items[2].id.clone();
        let source = fx.session.remix(&source_id)?.clone();
        assert_eq!(source.id, source_id);
        assert_eq!(fx.session.prompt(), "neon jellyfish");
        assert_eq!(fx.session.reference().map(|item| item.id.as_str()), Some(source_id.as_str()));

        completed(fx.session.generate()?)?;
        let sent = fx
            .capability
            .last_request
            .lock()
            .ok()
            .and_then(|last| last.clone())
            .ok_or_else(|| anyhow::anyhow!("no request recorded"))?;
        assert_eq!(sent.reference_image, Some(source.as_reference()));
        assert_eq!(sent.prompt, "neon jellyfish");

        fx.session.clear_reference();
        assert!(fx.session.reference().is_none());
        assert!(fx.session.remix("missing").is_err());
        Ok(())
    }

    #[test]
    fn gallery_and_clear_history() -> anyhow::Result<()> {
        let mut fx = fixture(CapabilityError::NoImageReturned);
        fx.session.set_prompt("pixel art harbor");
        let older = completed(fx.session.generate()?)?;
        let current = completed(fx.session.generate()?)?;

        let view = fx.session.gallery();
        assert_eq!(view.current, current);
        assert_eq!(view.history, older);
        assert_eq!(fx.session.find(&older[0].id), Some(&older[0]));

        fx.session.clear_history()?;
        assert!(fx.session.history().is_empty());
        assert_eq!(fx.storage.get(HISTORY_KEY), None);
        assert_eq!(fx.session.results(), current.as_slice());
        Ok(())
    }

    #[test]
    fn session_events_are_logged() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let gate: Arc<dyn CredentialGate> = Arc::new(StaticCredentialGate::new(None));
        let orchestrator = Arc::new(Orchestrator::new(Arc::new(DryrunCapability::new()), gate));
        let mut session = Session::open(
            orchestrator,
            HistoryStore::new(MemoryStorage::new()),
            Some(EventWriter::new(&events_path, new_session_id())),
        );
        session.set_prompt("foggy pier");
        completed(session.generate()?)?;
        session.clear_history()?;

        let raw = std::fs::read_to_string(events_path)?;
        let types: Vec<String> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert_eq!(
            types,
            vec![
                "session_started",
                "batch_started",
                "batch_completed",
                "history_cleared"
            ]
        );
        Ok(())
    }

    #[test]
    fn missing_key_refuses_without_logging_a_start() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let capability = Arc::new(SwitchableCapability::new(CapabilityError::NoImageReturned));
        let gate = Arc::new(StaticCredentialGate::new(None));
        let orchestrator = Arc::new(Orchestrator::new(capability.clone(), gate.clone()));
        let mut session = Session::open(
            orchestrator,
            HistoryStore::new(MemoryStorage::new()),
            Some(EventWriter::new(&events_path, new_session_id())),
        );
        session.set_prompt("lighthouse at dusk");

        assert_eq!(session.generate(), Err(BatchError::CredentialRequired));
        assert_eq!(capability.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            session.last_error_message(),
            Some("Select an API key to start generating.")
        );

        let rows: Vec<Value> = std::fs::read_to_string(&events_path)?
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .collect();
        let types: Vec<&str> = rows
            .iter()
            .filter_map(|row| row.get("type").and_then(Value::as_str))
            .collect();
        assert_eq!(types, vec!["session_started", "batch_refused"]);
        assert_eq!(rows[1]["reason"], "no valid API key selected");

        assert!(gate.select_key("key"));
        completed(session.generate()?)?;
        assert!(session.last_error().is_none());
        Ok(())
    }

    #[test]
    fn session_ids_are_prefixed_hex() {
        let id = new_session_id();
        assert!(id.starts_with("session-"));
        assert_eq!(id.len(), "session-".len() + 8);
    }
}
