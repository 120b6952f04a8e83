use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaceGeometry {
    Exact,
    Close,
    Different,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fidelity {
    High,
    Medium,
    Low,
}

/// Dominant cause of a rejected attempt, fed back into prompt emphasis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    IdentityDrift,
    GarmentMismatch,
    PoseChange,
    VisibleArtifact,
    ImplausibleScene,
}

/// Structured answer from the verification rubric. The pipeline owns the
/// accept decision; no `ok` field from the analysis capability is trusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub exactly_one_subject: bool,
    pub is_collage: bool,
    pub face_geometry: FaceGeometry,
    pub pose_preserved: bool,
    pub garment_applied: bool,
    pub garment_fidelity: Fidelity,
    pub identity_fidelity: Fidelity,
    pub original_outfit_present: bool,
    pub looks_synthetic: bool,
    pub scene_plausible: bool,
    pub lighting_consistent: bool,
}

impl VerificationResult {
    /// The acceptance boundary from the rubric. Kept here, not in the
    /// analysis prompt, so it can be tuned without touching the capability.
    pub fn is_accepted(&self) -> bool {
        self.exactly_one_subject
            && !self.is_collage
            && self.face_geometry == FaceGeometry::Exact
            && self.pose_preserved
            && self.garment_applied
            && self.garment_fidelity == Fidelity::High
            && self.identity_fidelity == Fidelity::High
            && !self.original_outfit_present
            && !self.looks_synthetic
            && self.scene_plausible
            && self.lighting_consistent
    }

    /// Floor for "worth returning at all" when the retry budget runs out.
    /// A candidate below this floor never ships, even as a best effort.
    pub fn minimally_acceptable(&self) -> bool {
        self.exactly_one_subject
            && !self.is_collage
            && self.garment_applied
            && self.face_geometry != FaceGeometry::Different
            && self.identity_fidelity != Fidelity::Low
    }

    /// Ranking score for best-attempt selection on budget exhaustion.
    pub fn score(&self) -> u32 {
        let fidelity_points = |fidelity: Fidelity| match fidelity {
            Fidelity::High => 3,
            Fidelity::Medium => 1,
            Fidelity::Low => 0,
        };
        let geometry_points = match self.face_geometry {
            FaceGeometry::Exact => 3,
            FaceGeometry::Close => 1,
            FaceGeometry::Different => 0,
        };
        let mut score = geometry_points
            + fidelity_points(self.identity_fidelity) * 2
            + fidelity_points(self.garment_fidelity);
        for flag in [
            self.exactly_one_subject,
            !self.is_collage,
            self.pose_preserved,
            self.garment_applied,
            !self.original_outfit_present,
            !self.looks_synthetic,
            self.scene_plausible,
            self.lighting_consistent,
        ] {
            if flag {
                score += 1;
            }
        }
        score
    }

    /// Classify the dominant failure of a rejected result. Identity problems
    /// outrank garment problems, which outrank composition problems.
    pub fn classify_failure(&self) -> Option<FailureClass> {
        if self.is_accepted() {
            return None;
        }
        if self.face_geometry != FaceGeometry::Exact || self.identity_fidelity != Fidelity::High {
            return Some(FailureClass::IdentityDrift);
        }
        if !self.garment_applied
            || self.garment_fidelity != Fidelity::High
            || self.original_outfit_present
        {
            return Some(FailureClass::GarmentMismatch);
        }
        if !self.pose_preserved {
            return Some(FailureClass::PoseChange);
        }
        if self.looks_synthetic || self.is_collage || !self.exactly_one_subject {
            return Some(FailureClass::VisibleArtifact);
        }
        Some(FailureClass::ImplausibleScene)
    }

    /// Conservative result used when the analysis output cannot be parsed:
    /// rejected, but not so poor it could never ship as a best effort.
    pub fn unparseable() -> Self {
        Self {
            exactly_one_subject: true,
            is_collage: false,
            face_geometry: FaceGeometry::Close,
            pose_preserved: false,
            garment_applied: true,
            garment_fidelity: Fidelity::Medium,
            identity_fidelity: Fidelity::Medium,
            original_outfit_present: false,
            looks_synthetic: true,
            scene_plausible: false,
            lighting_consistent: false,
        }
    }

    pub fn passing() -> Self {
        Self {
            exactly_one_subject: true,
            is_collage: false,
            face_geometry: FaceGeometry::Exact,
            pose_preserved: true,
            garment_applied: true,
            garment_fidelity: Fidelity::High,
            identity_fidelity: Fidelity::High,
            original_outfit_present: false,
            looks_synthetic: false,
            scene_plausible: true,
            lighting_consistent: true,
        }
    }
}

/// Per-iteration record kept by the orchestrator. The set of attempts for a
/// request is ordered and bounded by the attempt budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationAttempt {
    pub attempt_index: u32,
    pub prompt_used: String,
    pub candidate_path: String,
    pub verification: VerificationResult,
    pub failure_class: Option<FailureClass>,
    pub score: u32,
}

#[cfg(test)]
mod tests {
    use super::{FaceGeometry, FailureClass, Fidelity, VerificationResult};

    #[test]
    fn passing_result_is_accepted() {
        assert!(VerificationResult::passing().is_accepted());
        assert!(VerificationResult::passing().classify_failure().is_none());
    }

    #[test]
    fn close_geometry_is_rejected_but_minimally_acceptable() {
        let mut result = VerificationResult::passing();
        result.face_geometry = FaceGeometry::Close;
        assert!(!result.is_accepted());
        assert!(result.minimally_acceptable());
        assert_eq!(result.classify_failure(), Some(FailureClass::IdentityDrift));
    }

    #[test]
    fn different_face_is_never_minimally_acceptable() {
        let mut result = VerificationResult::passing();
        result.face_geometry = FaceGeometry::Different;
        assert!(!result.minimally_acceptable());
    }

    #[test]
    fn garment_problems_classify_as_garment_mismatch() {
        let mut result = VerificationResult::passing();
        result.garment_fidelity = Fidelity::Medium;
        assert_eq!(result.classify_failure(), Some(FailureClass::GarmentMismatch));

        let mut result = VerificationResult::passing();
        result.original_outfit_present = true;
        assert_eq!(result.classify_failure(), Some(FailureClass::GarmentMismatch));
    }

    #[test]
    fn identity_outranks_garment_in_classification() {
        let mut result = VerificationResult::passing();
        result.identity_fidelity = Fidelity::Low;
        result.garment_fidelity = Fidelity::Low;
        assert_eq!(result.classify_failure(), Some(FailureClass::IdentityDrift));
    }

    #[test]
    fn pose_and_artifact_and_scene_classes() {
        let mut result = VerificationResult::passing();
        result.pose_preserved = false;
        assert_eq!(result.classify_failure(), Some(FailureClass::PoseChange));

        let mut result = VerificationResult::passing();
        result.looks_synthetic = true;
        assert_eq!(result.classify_failure(), Some(FailureClass::VisibleArtifact));

        let mut result = VerificationResult::passing();
        result.scene_plausible = false;
        assert_eq!(result.classify_failure(), Some(FailureClass::ImplausibleScene));
    }

    #[test]
    fn score_orders_better_results_higher() {
        let passing = VerificationResult::passing();
        let mut medium = VerificationResult::passing();
        medium.identity_fidelity = Fidelity::Medium;
        medium.face_geometry = FaceGeometry::Close;
        let unparseable = VerificationResult::unparseable();

        assert!(passing.score() > medium.score());
        assert!(medium.score() > unparseable.score());
    }

    #[test]
    fn unparseable_result_is_rejected() {
        let result = VerificationResult::unparseable();
        assert!(!result.is_accepted());
        assert!(result.minimally_acceptable());
    }

    #[test]
    fn rubric_enums_parse_from_lowercase_json() -> anyhow::Result<()> {
        let raw = r#"{
            "exactly_one_subject": true,
            "is_collage": false,
            "face_geometry": "exact",
            "pose_preserved": true,
            "garment_applied": true,
            "garment_fidelity": "high",
            "identity_fidelity": "medium",
            "original_outfit_present": false,
            "looks_synthetic": false,
            "scene_plausible": true,
            "lighting_consistent": true
        }"#;
        let parsed: VerificationResult = serde_json::from_str(raw)?;
        assert_eq!(parsed.identity_fidelity, Fidelity::Medium);
        assert!(!parsed.is_accepted());
        Ok(())
    }
}
