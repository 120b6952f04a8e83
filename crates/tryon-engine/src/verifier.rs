use anyhow::{Context, Result};
use serde_json::Value;

use tryon_contracts::error::PipelineError;
use tryon_contracts::verification::VerificationResult;

use crate::capability::{ImageData, VisionAnalysis};

pub(crate) const VERIFICATION_RUBRIC: &str = "You are auditing a virtual try-on result. Image 1 is the generated candidate, image 2 \
     is the original person photo, image 3 is the garment reference. Judge the candidate \
     strictly and reply with strict JSON only, using exactly these keys: \
     {\"exactly_one_subject\": boolean, \"is_collage\": boolean, \"face_geometry\": \
     \"exact\"|\"close\"|\"different\", \"pose_preserved\": boolean, \"garment_applied\": \
     boolean, \"garment_fidelity\": \"high\"|\"medium\"|\"low\", \"identity_fidelity\": \
     \"high\"|\"medium\"|\"low\", \"original_outfit_present\": boolean, \
     \"looks_synthetic\": boolean, \"scene_plausible\": boolean, \"lighting_consistent\": \
     boolean}. face_geometry compares facial structure between images 1 and 2; \
     original_outfit_present is true when the person's outfit from image 2 is still \
     visible instead of the garment from image 3.";

#[derive(Debug, Clone)]
pub struct VerifierOutcome {
    pub result: VerificationResult,
    pub parse_warning: Option<String>,
    pub raw: Value,
}

/// Submit the locked candidate plus both references to the analysis
/// capability and parse its structured answer. The accept decision itself is
/// `VerificationResult::is_accepted`, computed by the pipeline; nothing the
/// analysis says is trusted verbatim. A transport failure is terminal (an
/// unaudited image never ships); an unparseable answer degrades to a
/// conservative rejected result.
pub fn run_verification(
    vision: &dyn VisionAnalysis,
    candidate: &ImageData,
    person: &ImageData,
    garment: &ImageData,
) -> Result<VerifierOutcome> {
    let images = [candidate.clone(), person.clone(), garment.clone()];
    let raw = vision
        .analyze(&images, VERIFICATION_RUBRIC)
        .map_err(|err| PipelineError::VerificationUnavailable(format!("{err:#}")))
        .context("verification analysis call failed")?;

    match serde_json::from_value::<VerificationResult>(raw.clone()) {
        Ok(result) => Ok(VerifierOutcome {
            result,
            parse_warning: None,
            raw,
        }),
        Err(err) => Ok(VerifierOutcome {
            result: VerificationResult::unparseable(),
            parse_warning: Some(format!(
                "Verification answer malformed; treating the attempt as rejected ({err})."
            )),
            raw,
        }),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{run_verification, VERIFICATION_RUBRIC};
    use crate::capability::ImageData;
    use crate::testkit::{solid_png, ScriptedVision};
    use tryon_contracts::verification::{FaceGeometry, VerificationResult};

    fn images() -> (ImageData, ImageData, ImageData) {
        (
            ImageData::png(solid_png(8, 8, [1, 2, 3])),
            ImageData::png(solid_png(8, 8, [4, 5, 6])),
            ImageData::png(solid_png(8, 8, [7, 8, 9])),
        )
    }

    #[test]
    fn acceptance_is_rederived_not_trusted() -> anyhow::Result<()> {
        // The analysis claims "ok" but reports a close (not exact) face
        // geometry; the pipeline must reject.
        let vision = ScriptedVision::new(|_, _| {
            let mut payload = serde_json::to_value(VerificationResult::passing())?;
            payload["face_geometry"] = json!("close");
            payload["ok"] = json!(true);
            Ok(payload)
        });
        let (candidate, person, garment) = images();

        let outcome = run_verification(&vision, &candidate, &person, &garment)?;
        assert_eq!(outcome.result.face_geometry, FaceGeometry::Close);
        assert!(!outcome.result.is_accepted());
        Ok(())
    }

    #[test]
    fn passing_rubric_is_accepted() -> anyhow::Result<()> {
        let vision = ScriptedVision::new(|_, _| {
            Ok(serde_json::to_value(VerificationResult::passing())?)
        });
        let (candidate, person, garment) = images();

        let outcome = run_verification(&vision, &candidate, &person, &garment)?;
        assert!(outcome.result.is_accepted());
        assert!(outcome.parse_warning.is_none());
        Ok(())
    }

    #[test]
    fn malformed_answer_degrades_to_conservative_reject() -> anyhow::Result<()> {
        let vision = ScriptedVision::new(|_, _| Ok(json!({ "verdict": "looks fine" })));
        let (candidate, person, garment) = images();

        let outcome = run_verification(&vision, &candidate, &person, &garment)?;
        assert!(!outcome.result.is_accepted());
        assert!(outcome.parse_warning.is_some());
        Ok(())
    }

    #[test]
    fn transport_failure_is_terminal() {
        let vision = ScriptedVision::new(|_, _| anyhow::bail!("analysis endpoint down"));
        let (candidate, person, garment) = images();

        let err = run_verification(&vision, &candidate, &person, &garment).unwrap_err();
        let pipeline_err = err.downcast_ref::<tryon_contracts::error::PipelineError>();
        assert!(matches!(
            pipeline_err,
            Some(tryon_contracts::error::PipelineError::VerificationUnavailable(_))
        ));
    }

    #[test]
    fn rubric_sends_all_three_images() -> anyhow::Result<()> {
        let vision = ScriptedVision::new(|images, instruction| {
            assert_eq!(images.len(), 3);
            assert_eq!(instruction, VERIFICATION_RUBRIC);
            Ok(serde_json::to_value(VerificationResult::passing())?)
        });
        let (candidate, person, garment) = images();
        run_verification(&vision, &candidate, &person, &garment)?;
        Ok(())
    }
}
