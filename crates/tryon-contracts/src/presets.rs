use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub const DEVIATION_MIN: f64 = 0.1;
pub const DEVIATION_MAX: f64 = 0.5;

/// Named bundle of background/lighting/camera/pose text used to steer the
/// generator's output style. Deviation is advisory metadata: it is clamped,
/// logged, and never sent to the synthesis capability as a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenePreset {
    pub id: String,
    pub category: String,
    pub scene_text: String,
    #[serde(default)]
    pub lighting_text: String,
    #[serde(default)]
    pub camera_text: String,
    pub pose_guidance: Option<String>,
    #[serde(default)]
    pub positive_clauses: Vec<String>,
    #[serde(default)]
    pub negative_clauses: Vec<String>,
    #[serde(default = "default_deviation")]
    pub deviation: f64,
}

fn default_deviation() -> f64 {
    0.2
}

impl ScenePreset {
    pub fn clamped_deviation(&self) -> f64 {
        self.deviation.clamp(DEVIATION_MIN, DEVIATION_MAX)
    }

    /// Conservative fallback used when no preset is selected or a preset is
    /// blocked by sanitization: keep the original background, lighting and
    /// framing untouched.
    pub fn neutral_default() -> Self {
        Self {
            id: "neutral".to_string(),
            category: "default".to_string(),
            scene_text: "Keep the original background and environment from the person photo \
                         unchanged."
                .to_string(),
            lighting_text: "Keep the original lighting from the person photo.".to_string(),
            camera_text: "Keep the original framing and camera angle.".to_string(),
            pose_guidance: None,
            positive_clauses: Vec::new(),
            negative_clauses: vec!["no background replacement".to_string()],
            deviation: DEVIATION_MIN,
        }
    }
}

/// Built-in scene presets, insertion-ordered so listings are stable.
#[derive(Debug, Clone)]
pub struct PresetRegistry {
    presets: IndexMap<String, ScenePreset>,
}

impl PresetRegistry {
    pub fn new(presets: Option<IndexMap<String, ScenePreset>>) -> Self {
        Self {
            presets: presets.unwrap_or_else(default_presets),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ScenePreset> {
        self.presets.get(id)
    }

    pub fn list(&self) -> impl Iterator<Item = &ScenePreset> {
        self.presets.values()
    }

    pub fn by_category(&self, category: &str) -> Vec<ScenePreset> {
        self.presets
            .values()
            .filter(|preset| preset.category == category)
            .cloned()
            .collect()
    }
}

impl Default for PresetRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

fn default_presets() -> IndexMap<String, ScenePreset> {
    let mut map = IndexMap::new();

    let mut insert = |id: &str,
                      category: &str,
                      scene: &str,
                      lighting: &str,
                      camera: &str,
                      pose: Option<&str>,
                      positive: &[&str],
                      negative: &[&str],
                      deviation: f64| {
        map.insert(
            id.to_string(),
            ScenePreset {
                id: id.to_string(),
                category: category.to_string(),
                scene_text: scene.to_string(),
                lighting_text: lighting.to_string(),
                camera_text: camera.to_string(),
                pose_guidance: pose.map(str::to_string),
                positive_clauses: positive.iter().map(|item| (*item).to_string()).collect(),
                negative_clauses: negative.iter().map(|item| (*item).to_string()).collect(),
                deviation,
            },
        );
    };

    insert(
        "studio",
        "indoor",
        "Clean professional photo studio with a seamless light gray backdrop.",
        "Soft diffused key light from the front left, gentle fill, no harsh shadows.",
        "Full-body shot at eye level, 50mm equivalent, subject centered.",
        Some("Keep the person's pose exactly as in the reference photo."),
        &["editorial catalog quality", "true-to-life fabric drape"],
        &["no props", "no visible lighting equipment"],
        0.15,
    );
    insert(
        "city-street",
        "outdoor",
        "Quiet European city street with blurred storefronts in the background.",
        "Late afternoon golden-hour sunlight from camera right.",
        "Three-quarter shot, shallow depth of field, background softly out of focus.",
        Some("Keep the person's pose exactly as in the reference photo."),
        &["natural candid street-style look"],
        &["no other people in frame", "no vehicles close to the subject"],
        0.3,
    );
    insert(
        "beach",
        "outdoor",
        "Sandy beach at midday with calm sea and clear sky behind the subject.",
        "Bright natural sunlight, mild haze near the horizon.",
        "Full-body shot, horizon level at the subject's shoulders.",
        None,
        &["relaxed vacation mood"],
        &["no other people in frame"],
        0.35,
    );
    insert(
        "evening-event",
        "indoor",
        "Elegant event hall with warm bokeh lights in the background.",
        "Warm tungsten ambience with a soft frontal key light.",
        "Waist-up shot, 85mm equivalent, creamy background blur.",
        Some("Keep the person's pose exactly as in the reference photo."),
        &["refined formal atmosphere"],
        &["no lens flare across the face"],
        0.25,
    );

    map
}
