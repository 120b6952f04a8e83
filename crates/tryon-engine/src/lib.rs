//! Try-on generation engine: garment resolution, prompt assembly, synthesis,
//! identity lock, verification, and the retry loop that ties them together.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use tryon_contracts::diagnostics::{
    AttemptSummary, Diagnostics, StageRecord, StageStatus, TracePayload, TraceWriter,
};
use tryon_contracts::error::PipelineError;
use tryon_contracts::presets::PresetRegistry;
use tryon_contracts::prompt::{assemble_prompt, emphasis_clause, AssembledPrompt};
use tryon_contracts::store::GarmentStore;
use tryon_contracts::verification::{FailureClass, GenerationAttempt};

pub mod blobstore;
pub mod capability;
pub mod identity_lock;
pub mod orchestrator;
pub mod resolver;
#[cfg(test)]
pub(crate) mod testkit;
pub mod verifier;

use blobstore::BlobStore;
use capability::{
    CancelToken, HttpSynthesisClient, HttpVisionClient, ImageData, ImageSynthesis,
    SynthesisRequest, SynthesisTier, VisionAnalysis,
};
use identity_lock::{apply_identity_lock, LockMode};
use orchestrator::{clamp_attempt_budget, next_action, select_best, NextAction, OrchestratorState};
use resolver::GarmentResolver;
use verifier::run_verification;

/// One try-on generation request. The person and garment references are
/// mandatory; everything else has a conservative default.
pub struct TryOnRequest {
    pub person: ImageData,
    pub garment: ImageData,
    pub preset_id: Option<String>,
    pub instruction: Option<String>,
    /// Extra photos of the same person, forwarded to synthesis.
    pub identity_refs: Vec<ImageData>,
    /// Accessory product shots to place alongside the garment.
    pub accessory_refs: Vec<ImageData>,
    pub aspect_ratio: Option<String>,
    pub tier: SynthesisTier,
    pub lock_mode: LockMode,
    pub max_attempts: Option<u32>,
    pub cancel: CancelToken,
}

#[derive(Debug)]
pub struct TryOnOutcome {
    pub request_id: String,
    /// 1-based index of the attempt that produced the returned image.
    pub attempt_index: u32,
    /// True when the returned image passed full verification; false when the
    /// retry budget ran out and the best rejected attempt was returned.
    pub accepted: bool,
    pub image_path: PathBuf,
    pub image_bytes: Vec<u8>,
    pub diagnostics: Diagnostics,
}

/// One synthesis candidate after identity lock and verification, carried
/// through ranking when a tier returns several candidates per attempt.
struct CandidateEvaluation {
    lock: identity_lock::LockOutcome,
    verdict: verifier::VerifierOutcome,
    score: u32,
    accepted: bool,
    lock_ms: u64,
    verify_ms: u64,
}

/// The engine owns the run directory (attempt images, trace, garment cache)
/// and the two external capabilities.
pub struct TryOnEngine {
    run_dir: PathBuf,
    trace_path: PathBuf,
    resolver: GarmentResolver,
    presets: PresetRegistry,
    vision: Arc<dyn VisionAnalysis>,
    synthesis: Arc<dyn ImageSynthesis>,
}

impl TryOnEngine {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self::with_capabilities(
            run_dir,
            Arc::new(HttpVisionClient::new()),
            Arc::new(HttpSynthesisClient::new()),
        )
    }

    pub fn with_capabilities(
        run_dir: impl Into<PathBuf>,
        vision: Arc<dyn VisionAnalysis>,
        synthesis: Arc<dyn ImageSynthesis>,
    ) -> Self {
        let run_dir = run_dir.into();
        let resolver = GarmentResolver::new(
            GarmentStore::new(run_dir.join("garments.json")),
            BlobStore::new(run_dir.join("blobs")),
        );
        Self {
            trace_path: run_dir.join("trace.jsonl"),
            run_dir,
            resolver,
            presets: PresetRegistry::default(),
            vision,
            synthesis,
        }
    }

    /// Redirect the trace away from the default `<run_dir>/trace.jsonl`.
    pub fn with_trace_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.trace_path = path.into();
        self
    }

    pub fn presets(&self) -> &PresetRegistry {
        &self.presets
    }

    pub fn garment_store(&self) -> &GarmentStore {
        self.resolver.store()
    }

    pub fn generate_try_on(&self, request: &TryOnRequest) -> Result<TryOnOutcome> {
        let request_id = Uuid::new_v4().to_string();
        let trace = TraceWriter::new(&self.trace_path, &request_id);

        match self.run(request, &trace) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let code = err
                    .downcast_ref::<PipelineError>()
                    .map(PipelineError::code)
                    .unwrap_or("internal");
                let _ = emit_state(&trace, OrchestratorState::Failed);
                let mut payload = TracePayload::new();
                payload.insert("code".to_string(), json!(code));
                payload.insert("error".to_string(), json!(format!("{err:#}")));
                let _ = trace.emit("request_failed", payload);
                Err(err)
            }
        }
    }

    fn run(&self, request: &TryOnRequest, trace: &TraceWriter) -> Result<TryOnOutcome> {
        let run_started = Instant::now();
        fs::create_dir_all(&self.run_dir)
            .with_context(|| format!("create run dir {}", self.run_dir.display()))?;

        let mut diagnostics = Diagnostics::default();
        let mut stage_counter: u32 = 1;
        let budget = clamp_attempt_budget(request.max_attempts);

        let mut start_payload = TracePayload::new();
        start_payload.insert("tier".to_string(), json!(request.tier.as_str()));
        start_payload.insert("lock_mode".to_string(), json!(request.lock_mode.as_str()));
        start_payload.insert("max_attempts".to_string(), json!(budget));
        trace.emit("request_started", start_payload)?;
        emit_state(trace, OrchestratorState::Init)?;

        // Reject undecodable inputs before any external call happens.
        let started = Instant::now();
        request.cancel.ensure_active()?;
        let (person_width, person_height, _) = resolver::decode_pixels(&request.person.bytes)
            .context("person reference image")?;
        push_stage(
            trace,
            &mut diagnostics,
            &mut stage_counter,
            "Input Validation",
            StageStatus::Pass,
            started.elapsed().as_millis() as u64,
            map_of(json!({ "person_width": person_width, "person_height": person_height })),
        )?;

        let preset = match request.preset_id.as_deref() {
            Some(id) => Some(self.presets.get(id).ok_or_else(|| {
                PipelineError::InputValidation(format!("unknown scene preset '{id}'"))
            })?),
            None => None,
        };

        let started = Instant::now();
        let resolved = self.resolver.resolve(
            self.vision.as_ref(),
            self.synthesis.as_ref(),
            &request.garment,
            &request.cancel,
        )?;
        for warning in &resolved.warnings {
            diagnostics.push_warning(warning.clone());
        }
        push_stage(
            trace,
            &mut diagnostics,
            &mut stage_counter,
            "Garment Resolution",
            StageStatus::Pass,
            started.elapsed().as_millis() as u64,
            map_of(json!({
                "content_hash": resolved.asset.content_hash,
                "cache_hit": resolved.cache_hit,
                "extraction_performed": resolved.extraction_performed,
                "verified": resolved.asset.verified,
                "garment": resolved.asset.attributes.short_description(),
            })),
        )?;

        let mut emphasis: Vec<String> = Vec::new();
        let mut assembled = self.assemble(
            preset,
            request.instruction.as_deref(),
            &emphasis,
            &mut diagnostics,
        );
        let started = Instant::now();
        push_stage(
            trace,
            &mut diagnostics,
            &mut stage_counter,
            "Prompt Assembly",
            StageStatus::Pass,
            started.elapsed().as_millis() as u64,
            map_of(json!({
                "preset": assembled.preset_id,
                "deviation": assembled.deviation,
                "preset_blocked": assembled.report.preset_blocked,
            })),
        )?;

        // Person first so "the first reference photo" in the identity clause
        // always points at it, then the clean garment and extra references.
        let mut references = vec![request.person.clone(), resolved.clean_image.clone()];
        references.extend(request.identity_refs.iter().cloned());
        references.extend(request.accessory_refs.iter().cloned());

        let mut attempts: Vec<GenerationAttempt> = Vec::new();
        let mut attempt_images: Vec<(Vec<u8>, bool)> = Vec::new();
        let mut accepted_index: Option<usize> = None;
        let mut last_synthesis_error: Option<String> = None;

        for attempt_index in 1..=budget {
            request.cancel.ensure_active()?;
            emit_state(trace, OrchestratorState::Attempting)?;
            let started = Instant::now();
            let synth_request = SynthesisRequest {
                images: references.clone(),
                prompt: assembled.text.clone(),
                aspect_ratio: request.aspect_ratio.clone(),
                tier: request.tier,
                candidates: request.tier.max_candidates(),
            };
            let response = match self.synthesis.synthesize(&synth_request) {
                Ok(response) => response,
                Err(err) => {
                    let message = format!("{err:#}");
                    push_stage(
                        trace,
                        &mut diagnostics,
                        &mut stage_counter,
                        "Synthesis",
                        StageStatus::Fail,
                        started.elapsed().as_millis() as u64,
                        map_of(json!({ "attempt": attempt_index, "error": message })),
                    )?;
                    diagnostics
                        .push_warning(format!("Synthesis attempt {attempt_index} failed."));
                    last_synthesis_error = Some(message);
                    continue;
                }
            };
            for warning in &response.warnings {
                diagnostics.push_warning(warning.clone());
            }
            let mut provider_request = Value::Object(response.provider_request.clone());
            let mut provider_response = Value::Object(response.provider_response.clone());
            sanitize_payload(&mut provider_request);
            sanitize_payload(&mut provider_response);
            trace.emit(
                "synthesis",
                map_of(json!({
                    "attempt": attempt_index,
                    "provider": self.synthesis.name(),
                    "request": provider_request.clone(),
                    "response": provider_response.clone(),
                })),
            )?;
            if response.candidates.is_empty() {
                push_stage(
                    trace,
                    &mut diagnostics,
                    &mut stage_counter,
                    "Synthesis",
                    StageStatus::Fail,
                    started.elapsed().as_millis() as u64,
                    map_of(json!({ "attempt": attempt_index, "error": "no candidate image" })),
                )?;
                last_synthesis_error = Some("synthesis returned no candidate image".to_string());
                continue;
            }
            let candidate_count = response.candidates.len();
            push_stage(
                trace,
                &mut diagnostics,
                &mut stage_counter,
                "Synthesis",
                StageStatus::Pass,
                started.elapsed().as_millis() as u64,
                map_of(json!({
                    "attempt": attempt_index,
                    "model": request.tier.model_name(),
                    "candidates": candidate_count,
                })),
            )?;

            // Lock and verify every returned candidate and keep the best:
            // an accepted candidate wins outright, otherwise the highest
            // verification score does. The fast tier returns one candidate,
            // the high tier up to its candidate limit.
            let limit = request.tier.max_candidates() as usize;
            let mut best: Option<CandidateEvaluation> = None;
            for candidate in response.candidates.into_iter().take(limit) {
                request.cancel.ensure_active()?;
                let lock_started = Instant::now();
                let lock = apply_identity_lock(
                    self.vision.as_ref(),
                    &request.person,
                    &candidate,
                    request.lock_mode,
                )?;
                let lock_ms = lock_started.elapsed().as_millis() as u64;

                emit_state(trace, OrchestratorState::Verifying)?;
                let verify_started = Instant::now();
                let verdict = run_verification(
                    self.vision.as_ref(),
                    &lock.image,
                    &request.person,
                    &resolved.clean_image,
                )?;
                let evaluation = CandidateEvaluation {
                    score: verdict.result.score(),
                    accepted: verdict.result.is_accepted(),
                    lock,
                    verdict,
                    lock_ms,
                    verify_ms: verify_started.elapsed().as_millis() as u64,
                };
                let accepted = evaluation.accepted;
                let better = match &best {
                    None => true,
                    Some(current) => {
                        (evaluation.accepted, evaluation.score) > (current.accepted, current.score)
                    }
                };
                if better {
                    best = Some(evaluation);
                }
                if accepted {
                    break;
                }
            }
            let Some(evaluation) = best else {
                last_synthesis_error = Some("synthesis returned no usable candidate".to_string());
                continue;
            };
            let lock = evaluation.lock;
            let verdict = evaluation.verdict;
            for warning in &lock.warnings {
                diagnostics.push_warning(warning.clone());
            }
            push_stage(
                trace,
                &mut diagnostics,
                &mut stage_counter,
                "Identity Lock",
                if lock.applied {
                    StageStatus::Pass
                } else {
                    StageStatus::Skip
                },
                evaluation.lock_ms,
                map_of(json!({
                    "attempt": attempt_index,
                    "mode": request.lock_mode.as_str(),
                    "applied": lock.applied,
                })),
            )?;

            let candidate_path = self.run_dir.join(format!("attempt-{attempt_index}.png"));
            fs::write(&candidate_path, &lock.image.bytes)
                .with_context(|| format!("write {}", candidate_path.display()))?;

            if let Some(warning) = &verdict.parse_warning {
                diagnostics.push_warning(warning.clone());
            }

            let attempt = GenerationAttempt {
                attempt_index,
                prompt_used: assembled.text.clone(),
                candidate_path: candidate_path.display().to_string(),
                failure_class: verdict.result.classify_failure(),
                score: verdict.result.score(),
                verification: verdict.result,
            };
            push_stage(
                trace,
                &mut diagnostics,
                &mut stage_counter,
                "Verification",
                if attempt.verification.is_accepted() {
                    StageStatus::Pass
                } else {
                    StageStatus::Fail
                },
                evaluation.verify_ms,
                map_of(json!({
                    "attempt": attempt_index,
                    "score": attempt.score,
                    "failure_class": attempt.failure_class.map(failure_class_name),
                })),
            )?;

            let receipt = json!({
                "request_id": trace.request_id(),
                "attempt": attempt_index,
                "provider": self.synthesis.name(),
                "prompt": attempt.prompt_used,
                "synthesis_request": provider_request,
                "synthesis_response": provider_response,
                "identity_lock_applied": lock.applied,
                "verification": attempt.verification,
                "score": attempt.score,
            });
            let receipt_path = self
                .run_dir
                .join(format!("attempt-{attempt_index}-receipt.json"));
            fs::write(&receipt_path, serde_json::to_string_pretty(&receipt)?)
                .with_context(|| format!("write {}", receipt_path.display()))?;

            let action = next_action(attempt_index, budget, &attempt.verification);
            attempts.push(attempt);
            attempt_images.push((lock.image.bytes, lock.applied));

            match action {
                NextAction::Accept => {
                    accepted_index = Some(attempts.len() - 1);
                    break;
                }
                NextAction::Retry(class) => {
                    emit_state(trace, OrchestratorState::Retrying)?;
                    let clause = emphasis_clause(class).to_string();
                    if !emphasis.contains(&clause) {
                        emphasis.push(clause);
                    }
                    assembled = self.assemble(
                        preset,
                        request.instruction.as_deref(),
                        &emphasis,
                        &mut diagnostics,
                    );
                    trace.emit(
                        "retry",
                        map_of(json!({
                            "after_attempt": attempt_index,
                            "failure_class": failure_class_name(class),
                        })),
                    )?;
                }
                NextAction::GiveUp => break,
            }
        }

        let chosen = match accepted_index {
            Some(index) => Some((index, true)),
            None => select_best(&attempts).and_then(|best| {
                attempts
                    .iter()
                    .position(|attempt| attempt.attempt_index == best.attempt_index)
                    .map(|index| (index, false))
            }),
        };

        let Some((index, accepted)) = chosen else {
            if attempts.is_empty() {
                return Err(PipelineError::SynthesisFailure(
                    last_synthesis_error
                        .unwrap_or_else(|| "no candidate image was ever produced".to_string()),
                )
                .into());
            }
            return Err(PipelineError::BudgetExhausted { attempts: budget }.into());
        };

        let chosen_attempt = &attempts[index];
        let (image_bytes, lock_applied) = attempt_images[index].clone();
        if !accepted {
            diagnostics.push_warning(format!(
                "Retry budget exhausted; returning the best rejected attempt \
                 (attempt {}, score {}).",
                chosen_attempt.attempt_index, chosen_attempt.score
            ));
        }

        let image_path = self.run_dir.join("output.png");
        fs::write(&image_path, &image_bytes)
            .with_context(|| format!("write {}", image_path.display()))?;

        diagnostics.prompt_used = chosen_attempt.prompt_used.clone();
        diagnostics.identity_lock_applied = lock_applied;
        diagnostics.attempts = attempts
            .iter()
            .map(|attempt| AttemptSummary {
                attempt_index: attempt.attempt_index,
                accepted: attempt.verification.is_accepted(),
                score: attempt.score,
                failure_class: attempt.failure_class.map(failure_class_name),
                candidate_path: attempt.candidate_path.clone(),
            })
            .collect();
        diagnostics.total_time_ms = run_started.elapsed().as_millis() as u64;

        emit_state(trace, OrchestratorState::Succeeded)?;
        trace.emit(
            "request_completed",
            map_of(json!({
                "accepted": accepted,
                "attempt_index": chosen_attempt.attempt_index,
                "attempts_used": attempts.len(),
                "output": image_path.display().to_string(),
                "total_time_ms": diagnostics.total_time_ms,
            })),
        )?;

        Ok(TryOnOutcome {
            request_id: trace.request_id().to_string(),
            attempt_index: chosen_attempt.attempt_index,
            accepted,
            image_path,
            image_bytes,
            diagnostics,
        })
    }

    fn assemble(
        &self,
        preset: Option<&tryon_contracts::presets::ScenePreset>,
        instruction: Option<&str>,
        emphasis: &[String],
        diagnostics: &mut Diagnostics,
    ) -> AssembledPrompt {
        let assembled = assemble_prompt(preset, instruction, emphasis);
        for warning in &assembled.report.warnings {
            diagnostics.push_warning(warning.clone());
        }
        assembled
    }
}

fn emit_state(trace: &TraceWriter, state: OrchestratorState) -> Result<()> {
    trace.emit("state", map_of(json!({ "state": state.as_str() })))?;
    Ok(())
}

fn push_stage(
    trace: &TraceWriter,
    diagnostics: &mut Diagnostics,
    counter: &mut u32,
    name: &str,
    status: StageStatus,
    time_ms: u64,
    data: Map<String, Value>,
) -> Result<()> {
    let record = StageRecord {
        stage: *counter,
        name: name.to_string(),
        status,
        time_ms,
        data,
    };
    *counter += 1;
    trace.emit_stage(&record)?;
    diagnostics.stages.push(record);
    Ok(())
}

fn failure_class_name(class: FailureClass) -> String {
    match serde_json::to_value(class) {
        Ok(Value::String(name)) => name,
        _ => format!("{class:?}"),
    }
}

const REDACTED: &str = "[redacted]";

/// Strip inline image payloads and oversized strings before anything lands
/// in the trace. Traces stay greppable and never leak picture data.
pub(crate) fn sanitize_payload(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                let lowered = key.to_ascii_lowercase();
                if lowered.contains("data") || lowered.contains("bytes") || lowered.contains("base64")
                {
                    *item = Value::String(REDACTED.to_string());
                } else {
                    sanitize_payload(item);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                sanitize_payload(item);
            }
        }
        Value::String(text) => {
            if text.len() > 2048 {
                *text = REDACTED.to_string();
            }
        }
        _ => {}
    }
}

fn map_of(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
