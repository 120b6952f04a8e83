use thiserror::Error;

/// Terminal pipeline failures. Non-critical steps (attribute analysis,
/// identity lock) degrade to warnings and never appear here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    InputValidation(String),
    #[error("garment extraction failed after retry: {0}")]
    ExtractionFailure(String),
    #[error("image synthesis failed: {0}")]
    SynthesisFailure(String),
    #[error("verification capability unavailable: {0}")]
    VerificationUnavailable(String),
    #[error("retry budget exhausted after {attempts} attempts with no acceptable candidate")]
    BudgetExhausted { attempts: u32 },
    #[error("request cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Stable reason code surfaced to callers and written into traces.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InputValidation(_) => "input_validation",
            Self::ExtractionFailure(_) => "extraction_failure",
            Self::SynthesisFailure(_) => "synthesis_failure",
            Self::VerificationUnavailable(_) => "verification_unavailable",
            Self::BudgetExhausted { .. } => "budget_exhausted",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PipelineError;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            PipelineError::ExtractionFailure("x".to_string()).code(),
            "extraction_failure"
        );
        assert_eq!(
            PipelineError::BudgetExhausted { attempts: 3 }.code(),
            "budget_exhausted"
        );
        assert_eq!(PipelineError::Cancelled.code(), "cancelled");
    }

    #[test]
    fn budget_exhausted_message_includes_attempts() {
        let err = PipelineError::BudgetExhausted { attempts: 4 };
        assert!(err.to_string().contains("4 attempts"));
    }
}
