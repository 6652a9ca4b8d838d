use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};
use vibepaper_contracts::{GenerationRequest, OutputSettings, ReferenceImage, WallpaperVariation};

use crate::capability::Capability;
use crate::credential::{default_auth_predicate, AuthErrorPredicate, CredentialGate};
use crate::error::{BatchError, CapabilityError};

/// Variations requested per user action.
pub const BATCH_SIZE: usize = 4;

/// [`BATCH_SIZE`] identical calls of `request`, aggregated all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSpec {
    count: usize,
    pub request: GenerationRequest,
}

impl BatchSpec {
    pub fn new(request: GenerationRequest) -> Self {
        Self {
            count: BATCH_SIZE,
            request,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Idle,
    Generating,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every call succeeded; results are in issuance order.
    Completed(Vec<WallpaperVariation>),
    /// Blank prompt: nothing issued, status untouched.
    SkippedEmptyPrompt,
    /// Another batch was in flight: nothing issued, status untouched.
    RejectedBusy,
}

/// Resets the status flag to idle however the batch ends.
struct GeneratingGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for GeneratingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

pub struct Orchestrator {
    capability: Arc<dyn Capability>,
    credentials: Arc<dyn CredentialGate>,
    is_auth_error: AuthErrorPredicate,
    generating: AtomicBool,
}

impl Orchestrator {
    pub fn new(capability: Arc<dyn Capability>, credentials: Arc<dyn CredentialGate>) -> Self {
        Self {
            capability,
            credentials,
            is_auth_error: default_auth_predicate(),
            generating: AtomicBool::new(false),
        }
    }

    pub fn with_auth_predicate(mut self, predicate: AuthErrorPredicate) -> Self {
        self.is_auth_error = predicate;
        self
    }

    pub fn capability_name(&self) -> &str {
        self.capability.name()
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialGate> {
        &self.credentials
    }

    pub fn status(&self) -> BatchStatus {
        if self.generating.load(Ordering::SeqCst) {
            BatchStatus::Generating
        } else {
            BatchStatus::Idle
        }
    }

    /// True when the capability wants a credential and the gate has none.
    pub fn needs_credential(&self) -> bool {
        self.capability.requires_credential() && !self.credentials.has_valid_credential()
    }

    pub fn generate_batch(
        &self,
        base_prompt: &str,
        settings: OutputSettings,
        reference_image: Option<ReferenceImage>,
    ) -> Result<BatchOutcome, BatchError> {
        let request = GenerationRequest::new(base_prompt.trim(), settings)
            .with_reference(reference_image);
        self.run_batch(&BatchSpec::new(request))
    }

    /// Fans `spec.count` calls out on scoped worker threads and waits for all
    /// of them to settle before aggregating.
    pub fn run_batch(&self, spec: &BatchSpec) -> Result<BatchOutcome, BatchError> {
        if spec.request.prompt.trim().is_empty() {
            debug!("empty prompt; batch skipped");
            return Ok(BatchOutcome::SkippedEmptyPrompt);
        }
        if spec.count != BATCH_SIZE {
            return Err(BatchError::InvalidBatchSize {
                count: spec.count,
                expected: BATCH_SIZE,
            });
        }
        if self.needs_credential() {
            return Err(BatchError::CredentialRequired);
        }
        if self
            .generating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("batch rejected: another batch is in flight");
            return Ok(BatchOutcome::RejectedBusy);
        }
        let _guard = GeneratingGuard {
            flag: &self.generating,
        };

        info!(
            capability = self.capability.name(),
            count = spec.count,
            remix = spec.request.is_remix(),
            "batch started"
        );
        let settled = self.fan_out(spec);
        self.aggregate(settled)
    }

    fn fan_out(&self, spec: &BatchSpec) -> Vec<Result<WallpaperVariation, CapabilityError>> {
        let capability = self.capability.as_ref();
        let request = &spec.request;
        thread::scope(|scope| {
            let handles: Vec<_> = (0..spec.count)
                .map(|slot| {
                    thread::Builder::new()
                        .name(format!("vibepaper-batch-{slot}"))
                        .spawn_scoped(scope, move || capability.generate_one(request))
                })
                .collect();
            // Joined in issuance order, whatever order the calls finish in.
            handles
                .into_iter()
                .map(|handle| match handle {
                    Ok(handle) => handle.join().unwrap_or_else(|_| {
                        Err(CapabilityError::Transport(
                            "capability worker panicked".to_string(),
                        ))
                    }),
                    Err(err) => Err(CapabilityError::Transport(format!(
                        "capability worker spawn failed: {err}"
                    ))),
                })
                .collect()
        })
    }

    fn aggregate(
        &self,
        settled: Vec<Result<WallpaperVariation, CapabilityError>>,
    ) -> Result<BatchOutcome, BatchError> {
        let total = settled.len();
        let mut variations = Vec::with_capacity(total);
        let mut failures = Vec::new();
        for result in settled {
            match result {
                Ok(variation) => variations.push(variation),
                Err(err) => failures.push(err),
            }
        }

        if failures.is_empty() {
            info!(count = variations.len(), "batch completed");
            return Ok(BatchOutcome::Completed(variations));
        }

        for err in &failures {
            warn!(error = %err, "generation call failed");
        }
        if let Some(auth_err) = failures
            .iter()
            .find(|err| (self.is_auth_error)(err.raw_message().as_str()))
        {
            self.credentials.invalidate();
            return Err(BatchError::AuthLost {
                message: auth_err.raw_message(),
            });
        }
        let failed = failures.len();
        let source = failures.swap_remove(0);
        Err(BatchError::GenerationFailed {
            failed,
            total,
            source,
        })
    }
}
