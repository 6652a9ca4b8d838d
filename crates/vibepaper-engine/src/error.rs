use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("prompt is empty")]
    EmptyPrompt,
    #[error("reference image is not usable: {0}")]
    InvalidReference(String),
}

/// Failure of a single capability call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("No image data returned from model")]
    NoImageReturned,
    #[error("{message}")]
    Remote { status: Option<u16>, message: String },
    #[error("{0}")]
    Transport(String),
    #[error("no API key available for {capability}")]
    MissingCredential { capability: String },
    #[error(transparent)]
    InvalidRequest(#[from] RequestError),
}

impl CapabilityError {
    /// The message as reported by the service, used for credential-loss detection.
    pub fn raw_message(&self) -> String {
        match self {
            CapabilityError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Aggregated failure of one batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("API key configuration lost: {message}")]
    AuthLost { message: String },
    #[error("{failed} of {total} generation calls failed: {source}")]
    GenerationFailed {
        failed: usize,
        total: usize,
        #[source]
        source: CapabilityError,
    },
    #[error("no valid API key selected")]
    CredentialRequired,
    #[error("a batch is {expected} calls, not {count}")]
    InvalidBatchSize { count: usize, expected: usize },
}

impl BatchError {
    pub fn user_message(&self) -> &'static str {
        match self {
            BatchError::AuthLost { .. } => "API Key configuration lost. Please re-select your key.",
            BatchError::GenerationFailed { .. } | BatchError::InvalidBatchSize { .. } => {
                "Generation failed. Please try again."
            }
            BatchError::CredentialRequired => "Select an API key to start generating.",
        }
    }

    pub fn is_auth_lost(&self) -> bool {
        matches!(self, BatchError::AuthLost { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::{BatchError, CapabilityError, RequestError};

    #[test]
    fn raw_message_prefers_service_text() {
        let remote = CapabilityError::Remote {
            status: Some(404),
            message: "Requested entity was not found.".to_string(),
        };
        assert_eq!(remote.raw_message(), "Requested entity was not found.");
        assert_eq!(
            CapabilityError::NoImageReturned.raw_message(),
            "No image data returned from model"
        );
        assert_eq!(
            CapabilityError::from(RequestError::EmptyPrompt).to_string(),
            "prompt is empty"
        );
    }

    #[test]
    fn batch_errors_map_to_user_messages() {
        let failed = BatchError::GenerationFailed {
            failed: 1,
            total: 4,
            source: CapabilityError::NoImageReturned,
        };
        assert_eq!(failed.user_message(), "Generation failed. Please try again.");
        assert_eq!(
            failed.to_string(),
            "1 of 4 generation calls failed: No image data returned from model"
        );
        let lost = BatchError::AuthLost {
            message: "Requested entity was not found.".to_string(),
        };
        assert!(lost.is_auth_lost());
        assert_eq!(
            lost.user_message(),
            "API Key configuration lost. Please re-select your key."
        );
    }
}
