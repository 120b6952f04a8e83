use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Structured description of a garment, produced by attribute analysis.
/// `Default` doubles as the degraded generic description used when the
/// analysis capability is unavailable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GarmentAttributes {
    pub garment_type: String,
    pub color: String,
    pub fabric: String,
    pub neckline: String,
    pub sleeve: String,
    pub pattern: String,
    pub summary: String,
}

impl Default for GarmentAttributes {
    fn default() -> Self {
        Self {
            garment_type: "garment".to_string(),
            color: "unspecified".to_string(),
            fabric: "unspecified".to_string(),
            neckline: "unspecified".to_string(),
            sleeve: "unspecified".to_string(),
            pattern: "unspecified".to_string(),
            summary: "clothing item from the reference image".to_string(),
        }
    }
}

impl GarmentAttributes {
    /// One-line description used in logging and receipts, never in the
    /// garment clause of a prompt (the prompt always says "the referenced
    /// garment" instead of re-describing it).
    pub fn short_description(&self) -> String {
        format!("{} {} ({})", self.color, self.garment_type, self.summary)
    }
}

/// Cached, person-free representation of a garment. Immutable once created;
/// keyed by the content hash of the reference image pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GarmentAsset {
    pub content_hash: String,
    pub clean_image_ref: String,
    pub source_image_ref: String,
    pub attributes: GarmentAttributes,
    pub verified: bool,
    pub created_at: String,
}

impl GarmentAsset {
    pub fn new(
        content_hash: impl Into<String>,
        clean_image_ref: impl Into<String>,
        source_image_ref: impl Into<String>,
        attributes: GarmentAttributes,
        verified: bool,
    ) -> Self {
        Self {
            content_hash: content_hash.into(),
            clean_image_ref: clean_image_ref.into(),
            source_image_ref: source_image_ref.into(),
            attributes,
            verified,
            created_at: chrono::Utc::now()
                .to_rfc3339_opts(chrono::SecondsFormat::Micros, false),
        }
    }
}

/// Deterministic digest over a decoded pixel buffer plus dimensions.
/// Hashing decoded pixels rather than container bytes means a re-encoded
/// but pixel-identical reference dedupes to the same asset.
pub fn content_hash(width: u32, height: u32, pixels: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(width.to_be_bytes());
    hasher.update(height.to_be_bytes());
    hasher.update(pixels);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::{content_hash, GarmentAsset, GarmentAttributes};

    #[test]
    fn content_hash_is_deterministic() {
        let a = content_hash(2, 2, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
        let b = content_hash(2, 2, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn content_hash_separates_dimensions_from_pixels() {
        // Same byte stream, different shape, must not collide.
        let wide = content_hash(4, 1, &[0u8; 12]);
        let tall = content_hash(1, 4, &[0u8; 12]);
        assert_ne!(wide, tall);
    }

    #[test]
    fn default_attributes_are_generic() {
        let attrs = GarmentAttributes::default();
        assert_eq!(attrs.garment_type, "garment");
        assert!(attrs.short_description().contains("clothing item"));
    }

    #[test]
    fn asset_round_trips_through_json() -> anyhow::Result<()> {
        let asset = GarmentAsset::new(
            "abc123",
            "blobs/abc123-clean.png",
            "blobs/abc123-source.png",
            GarmentAttributes::default(),
            true,
        );
        let raw = serde_json::to_string(&asset)?;
        let parsed: GarmentAsset = serde_json::from_str(&raw)?;
        assert_eq!(parsed, asset);
        Ok(())
    }
}
