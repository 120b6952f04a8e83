use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};

use tryon_contracts::error::PipelineError;

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_VISION_MODEL: &str = "gemini-3-pro-preview";
const DEFAULT_TIMEOUT_S: f64 = 90.0;
const TRANSPORT_RETRIES: usize = 2;
const RETRY_BACKOFF_S: f64 = 1.2;

/// Cooperative cancellation for one request. Checked immediately before each
/// external call; blocking HTTP calls additionally carry hard timeouts so a
/// cancelled request is abandoned within one timeout window.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn ensure_active(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(PipelineError::Cancelled.into());
        }
        Ok(())
    }
}

/// Raw image bytes plus their mime type, as passed over the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageData {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl ImageData {
    pub fn png(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            mime_type: "image/png".to_string(),
        }
    }

    pub fn jpeg(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            mime_type: "image/jpeg".to_string(),
        }
    }

    fn inline_part(&self) -> Value {
        json!({
            "inlineData": {
                "mimeType": self.mime_type,
                "data": BASE64.encode(&self.bytes),
            }
        })
    }
}

/// Synthesis cost/quality tiers. The high tier accepts more identity
/// reference images and may return multiple ranked candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisTier {
    Fast,
    High,
}

impl SynthesisTier {
    pub fn model_name(&self) -> &'static str {
        match self {
            Self::Fast => "gemini-2.5-flash-image",
            Self::High => "gemini-3-pro-image-preview",
        }
    }

    pub fn max_reference_images(&self) -> usize {
        match self {
            Self::Fast => 2,
            Self::High => 6,
        }
    }

    pub fn max_candidates(&self) -> u32 {
        match self {
            Self::Fast => 1,
            Self::High => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::High => "high",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fast" | "low" => Some(Self::Fast),
            "high" | "hd" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub images: Vec<ImageData>,
    pub prompt: String,
    pub aspect_ratio: Option<String>,
    pub tier: SynthesisTier,
    pub candidates: u32,
}

#[derive(Debug, Clone)]
pub struct SynthesisResponse {
    pub candidates: Vec<ImageData>,
    pub warnings: Vec<String>,
    pub provider_request: Map<String, Value>,
    pub provider_response: Map<String, Value>,
}

/// Vision-analysis capability: one or more images plus an instruction in,
/// structured JSON out. Implementations must request low-randomness output
/// so repeated calls over the same inputs are reproducible.
pub trait VisionAnalysis: Send + Sync {
    fn name(&self) -> &str;
    fn analyze(&self, images: &[ImageData], instruction: &str) -> Result<Value>;
}

/// Image-synthesis capability. No semantic retries happen here; the retry
/// orchestrator owns re-attempts so prompt adjustments can be applied
/// between them. Only transient transport failures are retried.
pub trait ImageSynthesis: Send + Sync {
    fn name(&self) -> &str;
    fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisResponse>;
}

pub struct HttpVisionClient {
    api_base: String,
    model: String,
    http: HttpClient,
}

impl HttpVisionClient {
    pub fn new() -> Self {
        Self {
            api_base: resolve_api_base(),
            model: env::var("TRYON_VISION_MODEL")
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_VISION_MODEL.to_string()),
            http: HttpClient::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.api_base, self.model)
    }
}

impl Default for HttpVisionClient {
    fn default() -> Self {
        Self::new()
    }
}

impl VisionAnalysis for HttpVisionClient {
    fn name(&self) -> &str {
        "http-vision"
    }

    fn analyze(&self, images: &[ImageData], instruction: &str) -> Result<Value> {
        let Some(api_key) = api_key() else {
            bail!("GEMINI_API_KEY not set");
        };
        let mut parts: Vec<Value> = images.iter().map(ImageData::inline_part).collect();
        parts.push(json!({ "text": instruction }));
        let payload = json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": {
                "temperature": 0.0,
                "topK": 1,
                "responseMimeType": "application/json",
            },
        });

        let mut warnings = Vec::new();
        let response = post_with_transport_retries(
            &self.http,
            &self.endpoint(),
            &api_key,
            &payload,
            DEFAULT_TIMEOUT_S,
            TRANSPORT_RETRIES,
            RETRY_BACKOFF_S,
            &mut warnings,
        )?;
        let body = response_json_or_error("vision analysis", response)?;
        let text = extract_text(&body)
            .ok_or_else(|| anyhow::anyhow!("vision analysis returned no text part"))?;
        extract_json_block(&text)
            .ok_or_else(|| anyhow::anyhow!("vision analysis returned non-JSON text"))
    }
}

pub struct HttpSynthesisClient {
    api_base: String,
    http: HttpClient,
}

impl HttpSynthesisClient {
    pub fn new() -> Self {
        Self {
            api_base: resolve_api_base(),
            http: HttpClient::new(),
        }
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/models/{}:generateContent", self.api_base, model)
    }
}

impl Default for HttpSynthesisClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageSynthesis for HttpSynthesisClient {
    fn name(&self) -> &str {
        "http-synthesis"
    }

    fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisResponse> {
        let Some(api_key) = api_key() else {
            bail!("GEMINI_API_KEY not set");
        };
        let mut warnings = Vec::new();

        let mut images = request.images.clone();
        let limit = request.tier.max_reference_images() + 2;
        if images.len() > limit {
            warnings.push(format!(
                "Dropped {} reference image(s) beyond the {} tier limit.",
                images.len() - limit,
                request.tier.as_str()
            ));
            images.truncate(limit);
        }

        let mut parts: Vec<Value> = images.iter().map(ImageData::inline_part).collect();
        parts.push(json!({ "text": request.prompt }));

        let mut generation_config = Map::new();
        generation_config.insert(
            "responseModalities".to_string(),
            json!(["IMAGE"]),
        );
        generation_config.insert(
            "candidateCount".to_string(),
            json!(request.candidates.clamp(1, request.tier.max_candidates())),
        );
        if let Some(ratio) = request
            .aspect_ratio
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            generation_config.insert(
                "imageConfig".to_string(),
                json!({ "aspectRatio": ratio }),
            );
        }

        let payload = json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": generation_config,
        });

        let endpoint = self.endpoint(request.tier.model_name());
        let response = post_with_transport_retries(
            &self.http,
            &endpoint,
            &api_key,
            &payload,
            DEFAULT_TIMEOUT_S,
            TRANSPORT_RETRIES,
            RETRY_BACKOFF_S,
            &mut warnings,
        )?;
        let body = response_json_or_error("image synthesis", response)?;
        let candidates = extract_image_items(&body)?;
        if candidates.is_empty() {
            bail!("image synthesis returned no image data");
        }

        Ok(SynthesisResponse {
            candidates,
            warnings,
            provider_request: map_object(json!({
                "endpoint": endpoint,
                "model": request.tier.model_name(),
                "images": request.images.len(),
                "prompt": request.prompt,
            })),
            provider_response: map_object(json!({
                "candidate_count": body
                    .get("candidates")
                    .and_then(Value::as_array)
                    .map(Vec::len)
                    .unwrap_or(0),
            })),
        })
    }
}

fn resolve_api_base() -> String {
    env::var("TRYON_API_BASE")
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
}

fn api_key() -> Option<String> {
    non_empty_env("TRYON_API_KEY").or_else(|| non_empty_env("GEMINI_API_KEY"))
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[allow(clippy::too_many_arguments)]
fn post_with_transport_retries(
    http: &HttpClient,
    endpoint: &str,
    api_key: &str,
    payload: &Value,
    timeout_s: f64,
    max_retries: usize,
    retry_backoff_s: f64,
    warnings: &mut Vec<String>,
) -> Result<HttpResponse> {
    for attempt in 0..=max_retries {
        let response = http
            .post(endpoint)
            .query(&[("key", api_key)])
            .timeout(Duration::from_secs_f64(timeout_s))
            .json(payload)
            .send();

        match response {
            Ok(ok) => return Ok(ok),
            Err(raw) => {
                let err =
                    anyhow::Error::new(raw).context(format!("request failed ({endpoint})"));
                if !is_retryable_transport_error(&err) || attempt >= max_retries {
                    return Err(err);
                }
                warnings.push(format!(
                    "transport retry {}/{} after transient request failure",
                    attempt + 1,
                    max_retries
                ));
                let delay_s = retry_backoff_s * (attempt as f64 + 1.0);
                thread::sleep(Duration::from_secs_f64(delay_s));
            }
        }
    }

    unreachable!("transport retry loop always returns a response or error")
}

fn is_retryable_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| {
                reqwest_err.is_timeout() || reqwest_err.is_connect() || reqwest_err.is_request()
            })
            .unwrap_or(false)
    })
}

fn response_json_or_error(label: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{label} response body read failed"))?;
    if !status.is_success() {
        bail!("{label} request failed ({code}): {}", truncate_text(&body, 512));
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{label} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn extract_text(response_payload: &Value) -> Option<String> {
    let candidates = response_payload.get("candidates")?.as_array()?;
    for candidate in candidates {
        let parts = candidate
            .get("content")
            .and_then(Value::as_object)
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)?;
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if !text.trim().is_empty() {
                    return Some(text.to_string());
                }
            }
        }
    }
    None
}

pub(crate) fn extract_image_items(response_payload: &Value) -> Result<Vec<ImageData>> {
    let candidates = response_payload
        .get("candidates")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut out = Vec::new();

    for candidate in candidates {
        let parts = candidate
            .get("content")
            .and_then(Value::as_object)
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for part in parts {
            let inline = part
                .get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let data = inline
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            let bytes = BASE64
                .decode(data.as_bytes())
                .context("synthesis image base64 decode failed")?;
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .unwrap_or("image/png")
                .to_string();
            out.push(ImageData { bytes, mime_type });
        }
    }

    Ok(out)
}

/// Pull the first top-level JSON object out of a text reply, tolerating
/// markdown code fences around it.
pub(crate) fn extract_json_block(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
        return Some(parsed);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        extract_image_items, extract_json_block, CancelToken, SynthesisTier,
    };
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;

    #[test]
    fn cancel_token_trips_once_cancelled() {
        let token = CancelToken::new();
        assert!(token.ensure_active().is_ok());
        token.cancel();
        assert!(token.is_cancelled());
        let err = token.ensure_active().unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[test]
    fn tier_parsing_and_limits() {
        assert_eq!(SynthesisTier::parse("fast"), Some(SynthesisTier::Fast));
        assert_eq!(SynthesisTier::parse("HIGH"), Some(SynthesisTier::High));
        assert_eq!(SynthesisTier::parse("ultra"), None);
        assert!(SynthesisTier::High.max_reference_images() > SynthesisTier::Fast.max_reference_images());
        assert!(SynthesisTier::High.max_candidates() > SynthesisTier::Fast.max_candidates());
    }

    #[test]
    fn json_block_extraction_tolerates_code_fences() {
        let fenced = "```json\n{\"person_detected\": true, \"confidence\": 0.9}\n```";
        let parsed = extract_json_block(fenced).unwrap();
        assert_eq!(parsed["person_detected"], json!(true));

        assert!(extract_json_block("no json here").is_none());
    }

    #[test]
    fn image_items_decode_inline_data() -> anyhow::Result<()> {
        let payload = json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "text": "here is your image" },
                        { "inlineData": { "mimeType": "image/png", "data": BASE64.encode(b"fakepng") } }
                    ]
                }
            }]
        });
        let items = extract_image_items(&payload)?;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].bytes, b"fakepng");
        assert_eq!(items[0].mime_type, "image/png");
        Ok(())
    }

    #[test]
    fn image_items_skip_empty_parts() -> anyhow::Result<()> {
        let payload = json!({
            "candidates": [{ "content": { "parts": [{ "text": "nothing" }] } }]
        });
        assert!(extract_image_items(&payload)?.is_empty());
        Ok(())
    }
}
