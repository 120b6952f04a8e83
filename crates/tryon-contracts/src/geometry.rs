use serde::{Deserialize, Serialize};

/// Anatomical estimation ratios. Shoulder landmarks are derived from a face
/// box alone so the compositor needs no external landmark model.
pub const SHOULDER_WIDTH_RATIO: f64 = 2.0;
/// Shoulder line sits this many face heights below the face center.
pub const SHOULDER_LINE_DROP_RATIO: f64 = 1.4;
/// The neck anchor sits above the shoulder midpoint by this fraction of the
/// shoulder width.
pub const NECK_RISE_RATIO: f64 = 0.15;
/// Allowed vertical drift of the transplanted chin, as a fraction of face
/// height, relative to the position implied by the neck anchor.
pub const CHIN_DRIFT_TOLERANCE: f64 = 0.035;
/// Feather radius of the neck blend strip, in pixels.
pub const NECK_FEATHER_RADIUS_PX: u32 = 13;
/// Opacity of the neck blend strip.
pub const NECK_BLEND_OPACITY: f64 = 0.6;

/// Fraction of face height where the eye band starts, and its height, for
/// the eyes-only lock mode.
pub const EYE_BAND_TOP_RATIO: f64 = 0.20;
pub const EYE_BAND_HEIGHT_RATIO: f64 = 0.35;

/// Axis-aligned face rectangle in the pixel space of one specific image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceBox {
    /// Build from normalized `[0, 1]` coordinates, as returned by the vision
    /// capability, clamped into the image bounds.
    pub fn from_normalized(
        nx: f64,
        ny: f64,
        nw: f64,
        nh: f64,
        image_width: u32,
        image_height: u32,
    ) -> Option<Self> {
        if !(0.0..=1.0).contains(&nx)
            || !(0.0..=1.0).contains(&ny)
            || nw <= 0.0
            || nh <= 0.0
            || nw > 1.0
            || nh > 1.0
        {
            return None;
        }
        let unclamped = Self {
            x: (nx * image_width as f64).round() as u32,
            y: (ny * image_height as f64).round() as u32,
            width: (nw * image_width as f64).round().max(1.0) as u32,
            height: (nh * image_height as f64).round().max(1.0) as u32,
        };
        unclamped.clamp_to(image_width, image_height)
    }

    /// Fallback estimate used when detection fails: a centered box covering
    /// the region a head-and-shoulders portrait usually occupies.
    pub fn anatomical_estimate(image_width: u32, image_height: u32) -> Self {
        let width = (image_width as f64 * 0.28).round().max(1.0) as u32;
        let height = (image_height as f64 * 0.24).round().max(1.0) as u32;
        Self {
            x: (image_width.saturating_sub(width)) / 2,
            y: (image_height as f64 * 0.10).round() as u32,
            width,
            height,
        }
    }

    pub fn clamp_to(self, image_width: u32, image_height: u32) -> Option<Self> {
        if image_width == 0 || image_height == 0 {
            return None;
        }
        let x = self.x.min(image_width.saturating_sub(1));
        let y = self.y.min(image_height.saturating_sub(1));
        let width = self.width.min(image_width - x);
        let height = self.height.min(image_height - y);
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self { x, y, width, height })
    }

    pub fn center_x(&self) -> f64 {
        self.x as f64 + self.width as f64 / 2.0
    }

    pub fn center_y(&self) -> f64 {
        self.y as f64 + self.height as f64 / 2.0
    }

    /// Bottom edge of the box, the expected chin line.
    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    /// Horizontal band covering the eyes, for the eyes-only lock mode.
    pub fn eye_band(&self) -> Self {
        let band_y = self.y + (self.height as f64 * EYE_BAND_TOP_RATIO).round() as u32;
        let band_height = (self.height as f64 * EYE_BAND_HEIGHT_RATIO).round().max(1.0) as u32;
        Self {
            x: self.x,
            y: band_y,
            width: self.width,
            height: band_height,
        }
    }
}

/// Derived geometric reference used to constrain face placement relative to
/// the estimated shoulder position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NeckAnchor {
    pub x: f64,
    pub y: f64,
    pub shoulder_width: f64,
    pub neck_base: f64,
}

impl NeckAnchor {
    pub fn from_face_box(face: &FaceBox) -> Self {
        let shoulder_width = face.width as f64 * SHOULDER_WIDTH_RATIO;
        let neck_base = face.center_y() + face.height as f64 * SHOULDER_LINE_DROP_RATIO;
        Self {
            x: face.center_x(),
            y: neck_base - shoulder_width * NECK_RISE_RATIO,
            shoulder_width,
            neck_base,
        }
    }
}

/// Compute the target rectangle for the transplanted source face on the
/// candidate image. The box keeps the source dimensions (pixels are copied,
/// never scaled) and is centered on the candidate's face. Its chin line is
/// clamped within the drift tolerance of the chin position the candidate's
/// own neck anchor implies, so a candidate whose face matches its anatomy
/// passes through with zero displacement and only scale or pose outliers
/// are pulled back toward the anchor.
pub fn constrained_face_target(
    source: &FaceBox,
    candidate: &FaceBox,
    image_width: u32,
    image_height: u32,
) -> Option<FaceBox> {
    let anchor = NeckAnchor::from_face_box(candidate);
    // Invert the anchor model: recover the face height it was built from and
    // walk back up from the shoulder line to the chin.
    let anchored_face_height = anchor.shoulder_width / SHOULDER_WIDTH_RATIO;
    let implied_chin =
        anchor.neck_base - anchored_face_height * (SHOULDER_LINE_DROP_RATIO - 0.5);
    let tolerance = candidate.height as f64 * CHIN_DRIFT_TOLERANCE;

    let desired_bottom = candidate.center_y() + source.height as f64 / 2.0;
    let constrained_bottom = desired_bottom.clamp(implied_chin - tolerance, implied_chin + tolerance);

    let x = (candidate.center_x() - source.width as f64 / 2.0).round().max(0.0) as u32;
    let y = (constrained_bottom - source.height as f64).round().max(0.0) as u32;

    FaceBox {
        x,
        y,
        width: source.width,
        height: source.height,
    }
    .clamp_to(image_width, image_height)
}
