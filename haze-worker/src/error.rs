use haze_core::PromptTooLong;
use serde::Serialize;
use thiserror::Error;

/// Failure classification carried in every error reply, so callers can
/// tell caller mistakes from capacity problems from pipeline faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    ResourceExhausted,
    InferenceFailure,
}

serde_plain::derive_display_from_serialize!(ErrorKind);

#[derive(Debug, Clone, Error, Serialize)]
#[error("{kind}: {message}")]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorPayload {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            message: message.into(),
        }
    }

    pub fn inference_failure(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::InferenceFailure,
            message: message.into(),
        }
    }

    /// Classify a pipeline error. The message keeps the full context chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        let kind = if err.downcast_ref::<PromptTooLong>().is_some() {
            ErrorKind::InvalidInput
        } else if is_out_of_memory(err) {
            ErrorKind::ResourceExhausted
        } else {
            ErrorKind::InferenceFailure
        };
        Self {
            kind,
            message: format!("{err:#}"),
        }
    }
}

fn is_out_of_memory(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        let text = cause.to_string().to_lowercase();
        text.contains("out of memory") || text.contains("out_of_memory")
    })
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;

    #[test]
    fn kinds_serialize_in_snake_case() {
        assert_eq!(ErrorKind::InvalidInput.to_string(), "invalid_input");
        assert_eq!(ErrorKind::ResourceExhausted.to_string(), "resource_exhausted");
        assert_eq!(ErrorKind::InferenceFailure.to_string(), "inference_failure");
    }

    #[test]
    fn cuda_allocation_failures_classify_as_resource_exhausted() {
        let err = anyhow!("CUDA_ERROR_OUT_OF_MEMORY").context("failed to allocate latents");
        assert_eq!(
            ErrorPayload::from_error(&err).kind,
            ErrorKind::ResourceExhausted
        );

        let err = anyhow!("cudaMalloc failed: out of memory");
        assert_eq!(
            ErrorPayload::from_error(&err).kind,
            ErrorKind::ResourceExhausted
        );
    }

    #[test]
    fn oversized_prompts_classify_as_invalid_input() {
        let err = anyhow::Error::new(PromptTooLong { len: 120, max: 77 });
        let payload = ErrorPayload::from_error(&err);
        assert_eq!(payload.kind, ErrorKind::InvalidInput);
        assert!(payload.message.contains("77"));
    }

    #[test]
    fn other_pipeline_errors_classify_as_inference_failure() {
        let err = anyhow!("shape mismatch in broadcast");
        assert_eq!(
            ErrorPayload::from_error(&err).kind,
            ErrorKind::InferenceFailure
        );
    }

    #[test]
    fn classification_keeps_the_context_chain_in_the_message() {
        let err = anyhow!("underlying cause").context("failed to decode latents");
        let payload = ErrorPayload::from_error(&err);
        assert!(payload.message.contains("failed to decode latents"));
        assert!(payload.message.contains("underlying cause"));
    }
}
