use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;

use tryon_contracts::error::PipelineError;
use tryon_contracts::garment::{content_hash, GarmentAsset, GarmentAttributes};
use tryon_contracts::store::GarmentStore;

use crate::blobstore::BlobStore;
use crate::capability::{
    CancelToken, ImageData, ImageSynthesis, SynthesisRequest, SynthesisTier, VisionAnalysis,
};

/// Minimum detector confidence treated as "a person is present". The
/// detector reports a confidence float; the resolver owns the cut.
pub const HUMAN_CONFIDENCE_THRESHOLD: f64 = 0.5;

/// One retry after the first failed extraction, then fatal.
const EXTRACTION_ATTEMPTS: u32 = 2;

const RESERVATION_POLL_MS: u64 = 25;

pub(crate) const ATTRIBUTE_INSTRUCTION: &str = "Describe the main garment in this image. Reply with strict JSON only, using exactly \
     these keys: {\"garment_type\": string, \"color\": string, \"fabric\": string, \
     \"neckline\": string, \"sleeve\": string, \"pattern\": string, \"summary\": string}. \
     The summary is one sentence covering construction details.";

pub(crate) const HUMAN_DETECTION_INSTRUCTION: &str = "Does this image contain any part of a human being (face, body, limbs, skin)? Reply \
     with strict JSON only: {\"person_detected\": boolean, \"confidence\": number between 0 \
     and 1}.";

const EXTRACTION_PROMPT: &str = "Extract the garment from this photo as a product image. Remove all human anatomy \
     (face, body, limbs, skin, hair) completely. Show only the garment, laid out naturally \
     on a plain neutral light-gray background, keeping its exact color, pattern, and \
     construction.";

#[derive(Debug, Clone)]
pub struct ResolvedGarment {
    pub asset: GarmentAsset,
    pub clean_image: ImageData,
    pub cache_hit: bool,
    pub extraction_performed: bool,
    pub warnings: Vec<String>,
}

/// Content-addresses a garment reference, extracts a person-free garment
/// asset when needed, and caches the result. At most one extraction runs per
/// distinct garment content.
pub struct GarmentResolver {
    store: GarmentStore,
    blobs: BlobStore,
}

impl GarmentResolver {
    pub fn new(store: GarmentStore, blobs: BlobStore) -> Self {
        Self { store, blobs }
    }

    pub fn store(&self) -> &GarmentStore {
        &self.store
    }

    pub fn resolve(
        &self,
        vision: &dyn VisionAnalysis,
        synthesis: &dyn ImageSynthesis,
        garment: &ImageData,
        cancel: &CancelToken,
    ) -> Result<ResolvedGarment> {
        cancel.ensure_active()?;
        let (width, height, pixels) = decode_pixels(&garment.bytes)?;
        let hash = content_hash(width, height, &pixels);

        if let Some(asset) = self.store.get(&hash) {
            return self.cached(asset);
        }

        // Serialize extraction per content hash: the loser of the race waits
        // for the winner's record instead of extracting again.
        let _slot = loop {
            if let Some(asset) = self.store.get(&hash) {
                return self.cached(asset);
            }
            if let Some(slot) = self.store.reserve_extraction(&hash) {
                break slot;
            }
            thread::sleep(Duration::from_millis(RESERVATION_POLL_MS));
        };
        if let Some(asset) = self.store.get(&hash) {
            return self.cached(asset);
        }

        let mut warnings = Vec::new();

        cancel.ensure_active()?;
        let attributes = match vision.analyze(std::slice::from_ref(garment), ATTRIBUTE_INSTRUCTION)
        {
            Ok(payload) => parse_attributes(&payload, &mut warnings),
            Err(err) => {
                warnings.push(format!(
                    "Garment attribute analysis unavailable; using generic description ({err:#})."
                ));
                GarmentAttributes::default()
            }
        };

        cancel.ensure_active()?;
        let person_present = match detect_person(vision, garment) {
            Ok(confidence) => confidence >= HUMAN_CONFIDENCE_THRESHOLD,
            Err(err) => {
                warnings.push(format!(
                    "Human detection unavailable on the garment reference; assuming a person is \
                     present ({err:#})."
                ));
                true
            }
        };

        let (clean_image, verified, extraction_performed) = if person_present {
            let (clean, verified) =
                self.extract_garment(vision, synthesis, garment, cancel, &mut warnings)?;
            (clean, verified, true)
        } else {
            (garment.clone(), true, false)
        };

        let source_ref = self.blobs.put(&garment.bytes, "source", ext_for(&garment.mime_type))?;
        let clean_ref = self
            .blobs
            .put(&clean_image.bytes, "clean", ext_for(&clean_image.mime_type))?;

        let asset = GarmentAsset::new(hash, clean_ref, source_ref, attributes, verified);
        let outcome = self.store.insert_if_absent(asset)?;
        if !outcome.was_inserted() {
            // A concurrent writer in another process won; adopt its record.
            let winner = outcome.asset().clone();
            let clean_bytes = self.blobs.get(&winner.clean_image_ref)?;
            return Ok(ResolvedGarment {
                clean_image: ImageData::png(clean_bytes),
                asset: winner,
                cache_hit: true,
                extraction_performed,
                warnings,
            });
        }

        Ok(ResolvedGarment {
            asset: outcome.asset().clone(),
            clean_image,
            cache_hit: false,
            extraction_performed,
            warnings,
        })
    }

    fn cached(&self, asset: GarmentAsset) -> Result<ResolvedGarment> {
        let clean_bytes = self.blobs.get(&asset.clean_image_ref)?;
        Ok(ResolvedGarment {
            clean_image: ImageData::png(clean_bytes),
            asset,
            cache_hit: true,
            extraction_performed: false,
            warnings: Vec::new(),
        })
    }

    fn extract_garment(
        &self,
        vision: &dyn VisionAnalysis,
        synthesis: &dyn ImageSynthesis,
        garment: &ImageData,
        cancel: &CancelToken,
        warnings: &mut Vec<String>,
    ) -> Result<(ImageData, bool)> {
        let mut last_error: Option<String> = None;

        for attempt in 1..=EXTRACTION_ATTEMPTS {
            cancel.ensure_active()?;
            let request = SynthesisRequest {
                images: vec![garment.clone()],
                prompt: EXTRACTION_PROMPT.to_string(),
                aspect_ratio: None,
                tier: SynthesisTier::Fast,
                candidates: 1,
            };
            let response = match synthesis.synthesize(&request) {
                Ok(response) => response,
                Err(err) => {
                    last_error = Some(format!("{err:#}"));
                    continue;
                }
            };
            let Some(candidate) = response.candidates.into_iter().next() else {
                last_error = Some("extractor returned no image".to_string());
                continue;
            };

            // Validate the output: anatomy must be gone.
            match detect_person(vision, &candidate) {
                Ok(confidence) if confidence >= HUMAN_CONFIDENCE_THRESHOLD => {
                    last_error = Some(format!(
                        "extraction attempt {attempt} still contains a person \
                         (confidence {confidence:.2})"
                    ));
                    continue;
                }
                Ok(_) => return Ok((candidate, true)),
                Err(err) => {
                    warnings.push(format!(
                        "Could not validate the extracted garment; storing it unverified \
                         ({err:#})."
                    ));
                    return Ok((candidate, false));
                }
            }
        }

        Err(PipelineError::ExtractionFailure(
            last_error.unwrap_or_else(|| "unknown extraction error".to_string()),
        )
        .into())
    }
}

fn detect_person(vision: &dyn VisionAnalysis, image: &ImageData) -> Result<f64> {
    let payload = vision.analyze(std::slice::from_ref(image), HUMAN_DETECTION_INSTRUCTION)?;
    let detected = payload
        .get("person_detected")
        .and_then(Value::as_bool)
        .context("human detection payload missing person_detected")?;
    if !detected {
        return Ok(0.0);
    }
    Ok(payload
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(1.0)
        .clamp(0.0, 1.0))
}

fn parse_attributes(payload: &Value, warnings: &mut Vec<String>) -> GarmentAttributes {
    match serde_json::from_value::<GarmentAttributes>(payload.clone()) {
        Ok(attributes) => attributes,
        Err(err) => {
            warnings.push(format!(
                "Garment attribute payload malformed; using generic description ({err})."
            ));
            GarmentAttributes::default()
        }
    }
}

/// Decode to RGB8 for hashing. Undecodable input is rejected before any
/// external call is made.
pub(crate) fn decode_pixels(bytes: &[u8]) -> Result<(u32, u32, Vec<u8>)> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|err| PipelineError::InputValidation(format!("undecodable image: {err}")))?;
    let rgb = decoded.to_rgb8();
    Ok((rgb.width(), rgb.height(), rgb.into_raw()))
}

fn ext_for(mime: &str) -> &'static str {
    let lowered = mime.to_ascii_lowercase();
    if lowered.contains("jpeg") || lowered.contains("jpg") {
        return "jpg";
    }
    if lowered.contains("webp") {
        return "webp";
    }
    "png"
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use serde_json::json;

    use super::{GarmentResolver, HUMAN_DETECTION_INSTRUCTION};
    use crate::blobstore::BlobStore;
    use crate::capability::{CancelToken, ImageData};
    use crate::testkit::{solid_png, ScriptedSynthesis, ScriptedVision};
    use tryon_contracts::store::GarmentStore;

    fn resolver(dir: &std::path::Path) -> GarmentResolver {
        GarmentResolver::new(
            GarmentStore::new(dir.join("garments.json")),
            BlobStore::new(dir.join("blobs")),
        )
    }

    fn garment_on_person() -> ImageData {
        ImageData::png(solid_png(32, 32, [180, 40, 40]))
    }

    /// Vision that reports a person on the original reference and none on
    /// extractor output (which the scripted extractor renders green).
    fn extraction_vision() -> ScriptedVision {
        ScriptedVision::new(|images, instruction| {
            if instruction.contains("person_detected") {
                let is_reference = images[0].bytes != solid_png(32, 32, [40, 180, 40]);
                return Ok(json!({ "person_detected": is_reference, "confidence": 0.95 }));
            }
            Ok(json!({
                "garment_type": "blouse", "color": "red", "fabric": "silk",
                "neckline": "v-neck", "sleeve": "long", "pattern": "solid",
                "summary": "red silk blouse with covered buttons"
            }))
        })
    }

    fn clean_extractor() -> ScriptedSynthesis {
        ScriptedSynthesis::returning_image(solid_png(32, 32, [40, 180, 40]))
    }

    #[test]
    fn person_reference_yields_clean_asset_on_first_attempt() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let resolver = resolver(temp.path());
        let vision = extraction_vision();
        let synthesis = clean_extractor();

        let resolved = resolver.resolve(&vision, &synthesis, &garment_on_person(), &CancelToken::new())?;

        assert!(!resolved.cache_hit);
        assert!(resolved.extraction_performed);
        assert!(resolved.asset.verified);
        assert_eq!(synthesis.calls(), 1);
        assert_eq!(resolved.asset.attributes.color, "red");
        assert_eq!(resolved.clean_image.bytes, solid_png(32, 32, [40, 180, 40]));
        Ok(())
    }

    #[test]
    fn second_identical_request_is_a_cache_hit() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let resolver = resolver(temp.path());
        let vision = extraction_vision();
        let synthesis = clean_extractor();
        let garment = garment_on_person();

        let first = resolver.resolve(&vision, &synthesis, &garment, &CancelToken::new())?;
        let second = resolver.resolve(&vision, &synthesis, &garment, &CancelToken::new())?;

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(synthesis.calls(), 1);
        assert_eq!(second.asset, first.asset);
        Ok(())
    }

    #[test]
    fn concurrent_identical_requests_extract_once() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let resolver = Arc::new(resolver(temp.path()));
        let vision = Arc::new(extraction_vision());
        let synthesis = Arc::new(clean_extractor());
        let garment = garment_on_person();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let resolver = Arc::clone(&resolver);
            let vision = Arc::clone(&vision);
            let synthesis = Arc::clone(&synthesis);
            let garment = garment.clone();
            handles.push(thread::spawn(move || {
                resolver.resolve(vision.as_ref(), synthesis.as_ref(), &garment, &CancelToken::new())
            }));
        }

        let mut hashes = Vec::new();
        for handle in handles {
            let resolved = handle.join().expect("thread panicked")?;
            hashes.push(resolved.asset.content_hash.clone());
        }

        assert_eq!(synthesis.calls(), 1, "extraction must run exactly once");
        assert!(hashes.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(resolver.store().len(), 1);
        Ok(())
    }

    #[test]
    fn person_free_reference_skips_extraction() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let resolver = resolver(temp.path());
        let vision = ScriptedVision::new(|_, instruction| {
            if instruction.contains("person_detected") {
                return Ok(json!({ "person_detected": false, "confidence": 0.1 }));
            }
            Ok(json!({
                "garment_type": "dress", "color": "blue", "fabric": "cotton",
                "neckline": "round", "sleeve": "short", "pattern": "floral",
                "summary": "blue floral sundress"
            }))
        });
        let synthesis = clean_extractor();
        let garment = garment_on_person();

        let resolved = resolver.resolve(&vision, &synthesis, &garment, &CancelToken::new())?;

        assert!(!resolved.extraction_performed);
        assert_eq!(synthesis.calls(), 0);
        assert_eq!(resolved.clean_image.bytes, garment.bytes);
        Ok(())
    }

    #[test]
    fn extraction_retries_once_then_fails() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let resolver = resolver(temp.path());
        // Person detected on the reference and on every extractor output.
        let vision = ScriptedVision::new(|_, instruction| {
            if instruction.contains("person_detected") {
                return Ok(json!({ "person_detected": true, "confidence": 0.9 }));
            }
            Ok(json!({}))
        });
        let synthesis = clean_extractor();

        let err = resolver
            .resolve(&vision, &synthesis, &garment_on_person(), &CancelToken::new())
            .unwrap_err();

        assert_eq!(synthesis.calls(), 2, "exactly one retry");
        let pipeline_err = err.downcast_ref::<tryon_contracts::error::PipelineError>();
        assert!(matches!(
            pipeline_err,
            Some(tryon_contracts::error::PipelineError::ExtractionFailure(_))
        ));
        Ok(())
    }

    #[test]
    fn attribute_failure_degrades_to_generic_description() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let resolver = resolver(temp.path());
        let vision = ScriptedVision::new(|images, instruction| {
            if instruction.contains("person_detected") {
                let is_reference = images[0].bytes != solid_png(32, 32, [40, 180, 40]);
                return Ok(json!({ "person_detected": is_reference, "confidence": 0.95 }));
            }
            anyhow::bail!("attribute analysis offline")
        });
        let synthesis = clean_extractor();

        let resolved = resolver.resolve(&vision, &synthesis, &garment_on_person(), &CancelToken::new())?;

        assert_eq!(resolved.asset.attributes.garment_type, "garment");
        assert!(resolved
            .warnings
            .iter()
            .any(|warning| warning.contains("generic description")));
        Ok(())
    }

    #[test]
    fn undecodable_input_is_rejected_before_any_call() {
        let temp = tempfile::tempdir().expect("tempdir");
        let resolver = resolver(temp.path());
        let vision = ScriptedVision::new(|_, _| panic!("must not be called"));
        let synthesis = ScriptedSynthesis::returning_image(Vec::new());

        let err = resolver
            .resolve(
                &vision,
                &synthesis,
                &ImageData::png(b"not an image".to_vec()),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("invalid input"));
    }

    #[test]
    fn cancelled_request_stops_before_external_calls() {
        let temp = tempfile::tempdir().expect("tempdir");
        let resolver = resolver(temp.path());
        let vision = ScriptedVision::new(|_, _| panic!("must not be called"));
        let synthesis = ScriptedSynthesis::returning_image(Vec::new());
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = resolver
            .resolve(&vision, &synthesis, &garment_on_person(), &cancel)
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[test]
    fn detection_instruction_requests_strict_json() {
        assert!(HUMAN_DETECTION_INSTRUCTION.contains("strict JSON"));
    }
}
