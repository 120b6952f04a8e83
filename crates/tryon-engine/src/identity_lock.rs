use std::io::Cursor;

use anyhow::Result;
use image::{ImageFormat, Rgba, RgbaImage};
use serde_json::Value;

use tryon_contracts::geometry::{
    constrained_face_target, FaceBox, NECK_BLEND_OPACITY, NECK_FEATHER_RADIUS_PX,
};

use crate::capability::{ImageData, VisionAnalysis};

pub(crate) const FACE_DETECTION_INSTRUCTION: &str = "Locate the single most prominent human face in this image. Reply with strict JSON \
     only: {\"face_found\": boolean, \"confidence\": number, \"box\": {\"x\": number, \
     \"y\": number, \"width\": number, \"height\": number}} where the box uses normalized \
     coordinates between 0 and 1 relative to the full image.";

/// How much of the original face is written over the candidate. Some
/// synthesis models get full-face pixel correction disabled; those fall back
/// to the eyes-only band, or skip correction entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    FullFace,
    EyesOnly,
    Disabled,
}

impl LockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullFace => "full-face",
            Self::EyesOnly => "eyes-only",
            Self::Disabled => "disabled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "full-face" | "full_face" | "full" => Some(Self::FullFace),
            "eyes-only" | "eyes_only" | "eyes" => Some(Self::EyesOnly),
            "disabled" | "off" => Some(Self::Disabled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockOutcome {
    /// PNG bytes of the locked (or, on fallback, unmodified) candidate.
    pub image: ImageData,
    pub applied: bool,
    pub source_box: Option<FaceBox>,
    pub target_box: Option<FaceBox>,
    pub warnings: Vec<String>,
}

/// Overwrite the candidate's face region with the original person's face
/// pixels. The final face pixels always originate from the source photo,
/// never from the generator. On detection failure the unmodified candidate
/// is returned with a warning: a possibly-drifted image beats a corrupted
/// composite.
pub fn apply_identity_lock(
    vision: &dyn VisionAnalysis,
    person: &ImageData,
    candidate: &ImageData,
    mode: LockMode,
) -> Result<LockOutcome> {
    let mut warnings = Vec::new();

    if mode == LockMode::Disabled {
        return Ok(LockOutcome {
            image: candidate.clone(),
            applied: false,
            source_box: None,
            target_box: None,
            warnings,
        });
    }

    let source_img = match decode_rgba(&person.bytes) {
        Ok(img) => img,
        Err(err) => {
            warnings.push(format!("Identity lock skipped: person image undecodable ({err})."));
            return Ok(unlocked(candidate, warnings));
        }
    };
    let mut candidate_img = match decode_rgba(&candidate.bytes) {
        Ok(img) => img,
        Err(err) => {
            warnings.push(format!("Identity lock skipped: candidate undecodable ({err})."));
            return Ok(unlocked(candidate, warnings));
        }
    };

    let source_box = match locate_face(vision, person, source_img.width(), source_img.height()) {
        Ok(FaceLocation::Detected(face)) => face,
        Ok(FaceLocation::Estimated(face)) => {
            warnings.push(
                "No face detected on the person photo; using anatomical estimate.".to_string(),
            );
            face
        }
        Err(err) => {
            warnings.push(format!(
                "Identity lock skipped: face detection failed on the person photo ({err:#})."
            ));
            return Ok(unlocked(candidate, warnings));
        }
    };
    let target_face = match locate_face(
        vision,
        candidate,
        candidate_img.width(),
        candidate_img.height(),
    ) {
        Ok(FaceLocation::Detected(face)) => face,
        Ok(FaceLocation::Estimated(face)) => {
            warnings.push(
                "No face detected on the candidate; using anatomical estimate.".to_string(),
            );
            face
        }
        Err(err) => {
            warnings.push(format!(
                "Identity lock skipped: face detection failed on the candidate ({err:#})."
            ));
            return Ok(unlocked(candidate, warnings));
        }
    };

    let Some(target_box) = constrained_face_target(
        &source_box,
        &target_face,
        candidate_img.width(),
        candidate_img.height(),
    ) else {
        warnings.push(
            "Identity lock skipped: constrained placement fell outside the candidate."
                .to_string(),
        );
        return Ok(unlocked(candidate, warnings));
    };

    match mode {
        LockMode::FullFace => {
            copy_region(&source_img, &mut candidate_img, &source_box, &target_box);
            feather_neck_seam(&source_img, &mut candidate_img, &source_box, &target_box);
        }
        LockMode::EyesOnly => {
            let source_band = source_box.eye_band();
            let band_offset_y = source_band.y - source_box.y;
            let target_band = FaceBox {
                x: target_box.x,
                y: target_box.y + band_offset_y,
                width: source_band.width,
                height: source_band.height,
            };
            copy_region(&source_img, &mut candidate_img, &source_band, &target_band);
        }
        LockMode::Disabled => unreachable!("handled above"),
    }

    let bytes = encode_png(&candidate_img)?;
    Ok(LockOutcome {
        image: ImageData::png(bytes),
        applied: true,
        source_box: Some(source_box),
        target_box: Some(target_box),
        warnings,
    })
}

enum FaceLocation {
    Detected(FaceBox),
    Estimated(FaceBox),
}

fn locate_face(
    vision: &dyn VisionAnalysis,
    image: &ImageData,
    width: u32,
    height: u32,
) -> Result<FaceLocation> {
    let payload = vision.analyze(std::slice::from_ref(image), FACE_DETECTION_INSTRUCTION)?;
    if let Some(face) = parse_face_box(&payload, width, height) {
        return Ok(FaceLocation::Detected(face));
    }
    Ok(FaceLocation::Estimated(FaceBox::anatomical_estimate(
        width, height,
    )))
}

fn parse_face_box(payload: &Value, width: u32, height: u32) -> Option<FaceBox> {
    if !payload.get("face_found").and_then(Value::as_bool)? {
        return None;
    }
    let raw = payload.get("box")?.as_object()?;
    let field = |key: &str| raw.get(key).and_then(Value::as_f64);
    FaceBox::from_normalized(
        field("x")?,
        field("y")?,
        field("width")?,
        field("height")?,
        width,
        height,
    )
}

fn unlocked(candidate: &ImageData, warnings: Vec<String>) -> LockOutcome {
    LockOutcome {
        image: candidate.clone(),
        applied: false,
        source_box: None,
        target_box: None,
        warnings,
    }
}

/// Exact pixel copy, no scaling. Pixels inside the pasted region are
/// bit-identical to the source region; the feather pass only touches rows
/// below it.
fn copy_region(source: &RgbaImage, candidate: &mut RgbaImage, from: &FaceBox, to: &FaceBox) {
    let height = from.height.min(to.height);
    let width = from.width.min(to.width);
    for dy in 0..height {
        for dx in 0..width {
            let sx = from.x + dx;
            let sy = from.y + dy;
            let tx = to.x + dx;
            let ty = to.y + dy;
            if sx < source.width() && sy < source.height() && tx < candidate.width() && ty < candidate.height()
            {
                candidate.put_pixel(tx, ty, *source.get_pixel(sx, sy));
            }
        }
    }
}

/// Blend a feathered strip of the original neck below the pasted box so skin
/// tone transitions into the candidate's shoulders without a hard cut line.
fn feather_neck_seam(source: &RgbaImage, candidate: &mut RgbaImage, from: &FaceBox, to: &FaceBox) {
    for row in 0..NECK_FEATHER_RADIUS_PX {
        let alpha =
            NECK_BLEND_OPACITY * (1.0 - row as f64 / NECK_FEATHER_RADIUS_PX as f64);
        let sy = from.bottom() + row;
        let ty = to.bottom() + row;
        if sy >= source.height() || ty >= candidate.height() {
            break;
        }
        for dx in 0..from.width.min(to.width) {
            let sx = from.x + dx;
            let tx = to.x + dx;
            if sx >= source.width() || tx >= candidate.width() {
                continue;
            }
            let src = *source.get_pixel(sx, sy);
            let dst = *candidate.get_pixel(tx, ty);
            candidate.put_pixel(tx, ty, blend(src, dst, alpha));
        }
    }
}

fn blend(src: Rgba<u8>, dst: Rgba<u8>, alpha: f64) -> Rgba<u8> {
    let mut out = [0u8; 4];
    for channel in 0..4 {
        let blended =
            src.0[channel] as f64 * alpha + dst.0[channel] as f64 * (1.0 - alpha);
        out[channel] = blended.round().clamp(0.0, 255.0) as u8;
    }
    Rgba(out)
}

fn decode_rgba(bytes: &[u8]) -> Result<RgbaImage, image::ImageError> {
    Ok(image::load_from_memory(bytes)?.to_rgba8())
}

fn encode_png(img: &RgbaImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}
