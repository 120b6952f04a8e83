use tryon_contracts::verification::{FailureClass, GenerationAttempt, VerificationResult};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const MIN_ATTEMPTS: u32 = 1;
pub const MAX_ATTEMPTS: u32 = 5;

/// Retry-loop states, recorded in traces so a run can be replayed from its
/// JSONL alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Init,
    Attempting,
    Verifying,
    Retrying,
    Succeeded,
    Failed,
}

impl OrchestratorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Attempting => "attempting",
            Self::Verifying => "verifying",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    Accept,
    Retry(FailureClass),
    GiveUp,
}

pub fn clamp_attempt_budget(requested: Option<u32>) -> u32 {
    requested
        .unwrap_or(DEFAULT_MAX_ATTEMPTS)
        .clamp(MIN_ATTEMPTS, MAX_ATTEMPTS)
}

/// Pure decision function mapping one verified attempt to the next move.
/// Free of logging and side effects so the loop is testable without any
/// capability mocks. `attempt_index` is 1-based.
pub fn next_action(
    attempt_index: u32,
    max_attempts: u32,
    verification: &VerificationResult,
) -> NextAction {
    if verification.is_accepted() {
        return NextAction::Accept;
    }
    if attempt_index >= max_attempts {
        return NextAction::GiveUp;
    }
    match verification.classify_failure() {
        Some(class) => NextAction::Retry(class),
        // Rejected but unclassifiable; retry with unchanged emphasis.
        None => NextAction::Retry(FailureClass::VisibleArtifact),
    }
}

/// Best attempt to ship when the budget runs out: the highest-scoring one
/// among those that ever reached minimal acceptability. Ties go to the
/// earliest attempt.
pub fn select_best(attempts: &[GenerationAttempt]) -> Option<&GenerationAttempt> {
    attempts
        .iter()
        .filter(|attempt| attempt.verification.minimally_acceptable())
        .max_by(|a, b| {
            a.score
                .cmp(&b.score)
                .then(b.attempt_index.cmp(&a.attempt_index))
        })
}
