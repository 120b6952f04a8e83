use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::{json, Map, Value};

use crate::capability::{
    ImageData, ImageSynthesis, SynthesisRequest, SynthesisResponse, VisionAnalysis,
};

type VisionHandler = Box<dyn Fn(&[ImageData], &str) -> Result<Value> + Send + Sync>;
type SynthesisHandler = Box<dyn Fn(&SynthesisRequest) -> Result<SynthesisResponse> + Send + Sync>;

/// Vision capability driven by a closure, so tests script structured answers
/// without any network.
pub(crate) struct ScriptedVision {
    handler: VisionHandler,
}

impl ScriptedVision {
    pub(crate) fn new<F>(handler: F) -> Self
    where
        F: Fn(&[ImageData], &str) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
        }
    }
}

impl VisionAnalysis for ScriptedVision {
    fn name(&self) -> &str {
        "scripted-vision"
    }

    fn analyze(&self, images: &[ImageData], instruction: &str) -> Result<Value> {
        (self.handler)(images, instruction)
    }
}

/// Synthesis capability driven by a closure; counts invocations so tests can
/// assert how many generations actually ran.
pub(crate) struct ScriptedSynthesis {
    handler: SynthesisHandler,
    calls: AtomicUsize,
}

impl ScriptedSynthesis {
    pub(crate) fn new<F>(handler: F) -> Self
    where
        F: Fn(&SynthesisRequest) -> Result<SynthesisResponse> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: AtomicUsize::new(0),
        }
    }

    /// Always answer with one fixed image.
    pub(crate) fn returning_image(bytes: Vec<u8>) -> Self {
        Self::new(move |_| {
            Ok(SynthesisResponse {
                candidates: vec![ImageData::png(bytes.clone())],
                warnings: Vec::new(),
                provider_request: Map::new(),
                provider_response: Map::new(),
            })
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ImageSynthesis for ScriptedSynthesis {
    fn name(&self) -> &str {
        "scripted-synthesis"
    }

    fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.handler)(request)
    }
}

/// Deterministic solid-color PNG, small enough to keep tests fast.
pub(crate) fn solid_png(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let mut img = RgbImage::new(width, height);
    for pixel in img.pixels_mut() {
        *pixel = Rgb(rgb);
    }
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)
        .expect("png encode");
    out.into_inner()
}

/// Face-detection payload in the shape the identity lock requests.
pub(crate) fn face_box_json(nx: f64, ny: f64, nw: f64, nh: f64) -> Value {
    json!({
        "face_found": true,
        "confidence": 0.97,
        "box": { "x": nx, "y": ny, "width": nw, "height": nh },
    })
}

pub(crate) fn no_face_json() -> Value {
    json!({ "face_found": false, "confidence": 0.0 })
}
