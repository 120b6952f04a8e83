use serde::{Deserialize, Serialize};

use crate::presets::ScenePreset;
use crate::verification::FailureClass;

/// Verbs that could instruct the generator to alter the person. Any match in
/// preset text is replaced; a severe match discards the whole preset.
const FORBIDDEN_VERBS: &[&str] = &[
    "reshape", "resculpt", "slim", "enlarge", "shrink", "elongate", "widen",
    "narrow", "morph", "alter", "modify", "transform", "retouch", "smooth",
];

/// Subset whose presence poisons a preset entirely: these imply reshaping a
/// body part rather than a wording slip.
const SEVERE_VERBS: &[&str] = &[
    "reshape", "resculpt", "enlarge", "shrink", "elongate", "morph",
];

const IDENTITY_NOUNS: &[&str] = &[
    "face", "body", "pose", "hair", "skin", "head", "eyes", "figure",
];

/// Window (in words) within which a forbidden verb counts as adjacent to an
/// identity noun during the final sweep.
const ADJACENCY_WINDOW: usize = 2;

const PRESERVE_DIRECTIVE: &str = "PRESERVE IDENTITY EXACTLY.";

const IDENTITY_CLAUSE: &str = "The person in the output must be exactly the same person as in \
     the first reference photo. Preserve the face, body proportions, hair, and skin tone \
     exactly as they appear there.";

const GARMENT_CLAUSE: &str = "Apply the referenced garment from the garment image onto the \
     person. Keep the garment's cut, color, fabric, and pattern exactly as shown; do not \
     redesign or restyle it.";

const SAFETY_CLAUSE: &str = "Render one single photorealistic person. No collage, no split \
     panels, no duplicated or extra limbs, no additional people, no visible AI artifacts.";

/// Ordered clauses of an assembled prompt. The identity clause is always
/// first and always present, including under sanitization failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptBundle {
    pub identity: String,
    pub scene: String,
    pub garment: String,
    pub lighting_camera: String,
    pub safety: String,
}

impl PromptBundle {
    pub fn render(&self) -> String {
        [
            self.identity.as_str(),
            self.scene.as_str(),
            self.garment.as_str(),
            self.lighting_camera.as_str(),
            self.safety.as_str(),
        ]
        .iter()
        .filter(|clause| !clause.trim().is_empty())
        .cloned()
        .collect::<Vec<&str>>()
        .join(" ")
    }
}

/// What sanitization did to the preset. `preset_blocked` propagates to the
/// caller as a warning, never as a silent failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SanitizeReport {
    pub warnings: Vec<String>,
    pub preset_blocked: bool,
    pub replaced_verbs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembledPrompt {
    pub text: String,
    pub bundle: PromptBundle,
    pub report: SanitizeReport,
    pub preset_id: String,
    /// Advisory only; logged, never sent to the generator.
    pub deviation: f64,
}

/// Extra emphasis appended on retries, keyed by the previous attempt's
/// dominant failure.
pub fn emphasis_clause(class: FailureClass) -> &'static str {
    match class {
        FailureClass::IdentityDrift => {
            "CRITICAL: the face and identity must match the first reference photo exactly, \
             feature for feature."
        }
        FailureClass::GarmentMismatch => {
            "CRITICAL: reproduce the referenced garment faithfully with identical cut, color, \
             pattern, and fabric texture."
        }
        FailureClass::PoseChange => {
            "CRITICAL: keep the person's pose, stance, and framing identical to the first \
             reference photo."
        }
        FailureClass::VisibleArtifact => {
            "CRITICAL: the output must look like a real photograph with clean edges and \
             natural skin texture; remove all synthetic artifacts."
        }
        FailureClass::ImplausibleScene => {
            "CRITICAL: the person must be grounded naturally in the scene with consistent \
             perspective, shadows, and lighting."
        }
    }
}

/// Build the final sanitized prompt from an optional preset, optional user
/// instruction, and retry emphasis clauses.
pub fn assemble_prompt(
    preset: Option<&ScenePreset>,
    user_instruction: Option<&str>,
    emphasis: &[String],
) -> AssembledPrompt {
    let mut report = SanitizeReport::default();
    let neutral = ScenePreset::neutral_default();

    let effective = match preset {
        Some(preset) if preset_has_severe_verb(preset) => {
            report.preset_blocked = true;
            report.warnings.push(format!(
                "Scene preset '{}' contains identity-altering language and was discarded; \
                 using the neutral default.",
                preset.id
            ));
            &neutral
        }
        Some(preset) => preset,
        None => &neutral,
    };

    let scene = {
        let mut parts = vec![sanitize_text(&effective.scene_text, &mut report)];
        if let Some(pose) = effective.pose_guidance.as_deref() {
            parts.push(sanitize_text(pose, &mut report));
        }
        for clause in &effective.positive_clauses {
            parts.push(sanitize_text(clause, &mut report));
        }
        if !effective.negative_clauses.is_empty() {
            parts.push(format!(
                "Avoid: {}.",
                effective
                    .negative_clauses
                    .iter()
                    .map(|clause| sanitize_text(clause, &mut report))
                    .collect::<Vec<String>>()
                    .join("; ")
            ));
        }
        parts.retain(|part| !part.trim().is_empty());
        parts.join(" ")
    };

    let lighting_camera = {
        let mut parts = vec![
            sanitize_text(&effective.lighting_text, &mut report),
            sanitize_text(&effective.camera_text, &mut report),
        ];
        parts.retain(|part| !part.trim().is_empty());
        parts.join(" ")
    };

    let mut safety_parts = vec![SAFETY_CLAUSE.to_string()];
    for clause in emphasis {
        safety_parts.push(clause.clone());
    }
    if let Some(instruction) = user_instruction.map(str::trim).filter(|text| !text.is_empty()) {
        safety_parts.push(sanitize_text(instruction, &mut report));
    }

    let bundle = PromptBundle {
        identity: IDENTITY_CLAUSE.to_string(),
        scene,
        garment: GARMENT_CLAUSE.to_string(),
        lighting_camera,
        safety: safety_parts.join(" "),
    };

    let mut text = bundle.render();
    let swept = sweep_identity_adjacent(&text, &mut report);
    text = swept;

    if report.preset_blocked || !contains_preservation_language(&text) {
        text = format!("{PRESERVE_DIRECTIVE} {text}");
    }

    AssembledPrompt {
        text,
        bundle,
        report,
        preset_id: effective.id.clone(),
        deviation: effective.clamped_deviation(),
    }
}

fn preset_has_severe_verb(preset: &ScenePreset) -> bool {
    let mut texts: Vec<&str> = vec![
        &preset.scene_text,
        &preset.lighting_text,
        &preset.camera_text,
    ];
    if let Some(pose) = preset.pose_guidance.as_deref() {
        texts.push(pose);
    }
    texts.extend(preset.positive_clauses.iter().map(String::as_str));
    texts.extend(preset.negative_clauses.iter().map(String::as_str));
    texts
        .iter()
        .any(|text| words_of(text).iter().any(|word| SEVERE_VERBS.contains(&word.as_str())))
}

/// Replace every forbidden verb with a preservation verb, logging each hit.
fn sanitize_text(text: &str, report: &mut SanitizeReport) -> String {
    let mut out: Vec<String> = Vec::new();
    for raw in text.split_whitespace() {
        let word = normalize_word(raw);
        if FORBIDDEN_VERBS.contains(&word.as_str()) {
            if !report.replaced_verbs.contains(&word) {
                report.replaced_verbs.push(word.clone());
            }
            push_unique_warning(
                &mut report.warnings,
                format!("Replaced identity-altering verb '{word}' with 'preserve'."),
            );
            out.push(carry_punctuation(raw, "preserve"));
        } else {
            out.push(raw.to_string());
        }
    }
    out.join(" ")
}

/// Final global pass: a forbidden verb within the adjacency window of an
/// identity noun is replaced even if it slipped past clause sanitization
/// (e.g. arrived via raw user text).
fn sweep_identity_adjacent(text: &str, report: &mut SanitizeReport) -> String {
    let raw_words: Vec<&str> = text.split_whitespace().collect();
    let normalized: Vec<String> = raw_words.iter().map(|word| normalize_word(word)).collect();

    let mut out: Vec<String> = Vec::with_capacity(raw_words.len());
    for (idx, raw) in raw_words.iter().enumerate() {
        let word = &normalized[idx];
        let forbidden = FORBIDDEN_VERBS.contains(&word.as_str());
        let near_identity_noun = forbidden
            && normalized
                .iter()
                .enumerate()
                .any(|(other, candidate)| {
                    other.abs_diff(idx) <= ADJACENCY_WINDOW
                        && IDENTITY_NOUNS.contains(&candidate.as_str())
                });
        if near_identity_noun {
            push_unique_warning(
                &mut report.warnings,
                format!("Swept identity-adjacent verb '{word}' from the final prompt."),
            );
            out.push(carry_punctuation(raw, "preserve"));
        } else {
            out.push((*raw).to_string());
        }
    }
    out.join(" ")
}

fn words_of(text: &str) -> Vec<String> {
    text.split_whitespace().map(normalize_word).collect()
}

fn contains_preservation_language(text: &str) -> bool {
    let lowered = text.to_ascii_lowercase();
    lowered.contains("preserve") || lowered.contains("keep the")
}

fn normalize_word(raw: &str) -> String {
    raw.trim_matches(|ch: char| !ch.is_ascii_alphabetic())
        .to_ascii_lowercase()
}

fn carry_punctuation(raw: &str, replacement: &str) -> String {
    let trailing: String = raw
        .chars()
        .rev()
        .take_while(|ch| !ch.is_ascii_alphabetic())
        .collect::<String>()
        .chars()
        .rev()
        .collect();
    format!("{replacement}{trailing}")
}

fn push_unique_warning(warnings: &mut Vec<String>, message: String) {
    if message.trim().is_empty() {
        return;
    }
    if warnings.iter().any(|existing| existing == &message) {
        return;
    }
    warnings.push(message);
}
