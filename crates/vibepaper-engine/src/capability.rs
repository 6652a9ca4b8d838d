use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;
use vibepaper_contracts::{GenerationRequest, ReferenceImage, WallpaperVariation};

use crate::config::EngineConfig;
use crate::credential::CredentialGate;
use crate::error::{CapabilityError, RequestError};

pub const DEFAULT_GEMINI_IMAGE_MODEL: &str = "gemini-3-pro-image-preview";

/// One call against an image-generation backend. Stateless per call; no retries.
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    fn requires_credential(&self) -> bool {
        true
    }

    fn generate_one(
        &self,
        request: &GenerationRequest,
    ) -> Result<WallpaperVariation, CapabilityError>;
}

#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: BTreeMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C: Capability + 'static>(&mut self, capability: C) {
        self.capabilities
            .insert(capability.name().to_string(), Arc::new(capability));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.capabilities.keys().cloned().collect()
    }
}

pub fn default_capability_registry(
    config: &EngineConfig,
    model: &str,
    credentials: Arc<dyn CredentialGate>,
) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    registry.register(DryrunCapability::new());
    registry.register(GeminiCapability::new(config, model, credentials));
    registry
}

/// Checks the inputs a capability call depends on before any network work.
pub fn validate_request(request: &GenerationRequest) -> Result<(), RequestError> {
    if request.prompt.trim().is_empty() {
        return Err(RequestError::EmptyPrompt);
    }
    if let Some(reference) = request.reference_image.as_ref() {
        let bytes = BASE64
            .decode(reference.data.trim().as_bytes())
            .map_err(|err| RequestError::InvalidReference(format!("base64 decode failed: {err}")))?;
        image::guess_format(&bytes)
            .map_err(|_| RequestError::InvalidReference("unrecognised image format".to_string()))?;
    }
    Ok(())
}

/// Text sent alongside a reference image: the image steers style, composition
/// and mood while the prompt stays the content driver.
pub fn remix_instruction(prompt: &str) -> String {
    format!(
        "Using the provided image as a strong visual reference for style, composition, and mood, generate a new variation that matches this vibe: {prompt}"
    )
}

pub struct GeminiCapability {
    api_base: String,
    model: String,
    timeout: Duration,
    http: HttpClient,
    credentials: Arc<dyn CredentialGate>,
}

impl GeminiCapability {
    pub fn new(config: &EngineConfig, model: &str, credentials: Arc<dyn CredentialGate>) -> Self {
        let model = model.trim();
        Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model: if model.is_empty() {
                DEFAULT_GEMINI_IMAGE_MODEL.to_string()
            } else {
                model.to_string()
            },
            timeout: config.request_timeout,
            http: HttpClient::new(),
            credentials,
        }
    }

    pub fn with_http_client(mut self, http: HttpClient) -> Self {
        self.http = http;
        self
    }

    fn endpoint(&self) -> String {
        let model_path = if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn build_payload(request: &GenerationRequest) -> Value {
        let prompt = request.prompt.trim();
        let mut parts = Vec::new();
        if let Some(reference) = request.reference_image.as_ref() {
            parts.push(inline_image_part(reference));
            parts.push(json!({ "text": remix_instruction(prompt) }));
        } else {
            parts.push(json!({ "text": prompt }));
        }
        json!({
            "contents": [{
                "role": "user",
                "parts": parts,
            }],
            "generationConfig": {
                "responseModalities": ["IMAGE"],
                "imageConfig": {
                    "aspectRatio": request.aspect_ratio.tag(),
                    "imageSize": request.quality.image_size(),
                }
            }
        })
    }

    /// First inline image of the first candidate, with its mime type if given.
    fn extract_inline_image(response_payload: &Value) -> Option<(String, Option<String>)> {
        let parts = response_payload
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first())
            .and_then(|candidate| candidate.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)?;
        parts.iter().find_map(|part| {
            let inline = part
                .get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(Value::as_object)?;
            let data = inline
                .get("data")
                .and_then(Value::as_str)
                .filter(|data| !data.is_empty())?;
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .map(str::to_string);
            Some((data.to_string(), mime_type))
        })
    }

    fn remote_error_message(body: &str) -> String {
        serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|payload| {
                payload
                    .get("error")
                    .and_then(|error| error.get("message"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .filter(|message| !message.trim().is_empty())
            .unwrap_or_else(|| truncate_text(body.trim(), 512))
    }
}

impl Capability for GeminiCapability {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate_one(
        &self,
        request: &GenerationRequest,
    ) -> Result<WallpaperVariation, CapabilityError> {
        validate_request(request)?;
        // Read per call so a re-selected key takes effect on the next batch.
        let Some(api_key) = self.credentials.api_key() else {
            return Err(CapabilityError::MissingCredential {
                capability: self.name().to_string(),
            });
        };
        let endpoint = self.endpoint();
        let payload = Self::build_payload(request);
        debug!(
            model = %self.model,
            aspect_ratio = %request.aspect_ratio,
            image_size = request.quality.image_size(),
            remix = request.is_remix(),
            "gemini generateContent"
        );

        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key.as_str())])
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .map_err(|err| {
                CapabilityError::Transport(format!("Gemini request failed: {}", err.without_url()))
            })?;
        let status = response.status();
        let body = response.text().map_err(|err| {
            CapabilityError::Transport(format!(
                "Gemini response body read failed: {}",
                err.without_url()
            ))
        })?;
        if !status.is_success() {
            return Err(CapabilityError::Remote {
                status: Some(status.as_u16()),
                message: Self::remote_error_message(&body),
            });
        }
        let parsed: Value = serde_json::from_str(&body).map_err(|err| CapabilityError::Remote {
            status: Some(status.as_u16()),
            message: format!("Gemini returned invalid JSON payload: {err}"),
        })?;
        let (data, mime_type) =
            Self::extract_inline_image(&parsed).ok_or(CapabilityError::NoImageReturned)?;
        Ok(WallpaperVariation::new(request, data, mime_type))
    }
}

/// Offline capability: a small solid-colour PNG shaped like the requested ratio.
#[derive(Debug, Default)]
pub struct DryrunCapability {
    calls: AtomicU64,
}

impl DryrunCapability {
    const LONG_EDGE: u32 = 96;

    pub fn new() -> Self {
        Self::default()
    }

    fn render_png(request: &GenerationRequest, salt: u64) -> Result<Vec<u8>, CapabilityError> {
        let (ratio_w, ratio_h) = request.aspect_ratio.parts();
        let longest = ratio_w.max(ratio_h).max(1);
        let width = (Self::LONG_EDGE * ratio_w / longest).max(1);
        let height = (Self::LONG_EDGE * ratio_h / longest).max(1);
        let (r, g, b) = color_from_prompt(&request.prompt, salt);
        let mut image = RgbImage::new(width, height);
        for pixel in image.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|err| CapabilityError::Transport(format!("dryrun encode failed: {err}")))?;
        Ok(bytes)
    }
}

impl Capability for DryrunCapability {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn requires_credential(&self) -> bool {
        false
    }

    fn generate_one(
        &self,
        request: &GenerationRequest,
    ) -> Result<WallpaperVariation, CapabilityError> {
        validate_request(request)?;
        let salt = self.calls.fetch_add(1, Ordering::SeqCst);
        let bytes = Self::render_png(request, salt)?;
        Ok(WallpaperVariation::new(
            request,
            BASE64.encode(bytes),
            Some("image/png".to_string()),
        ))
    }
}

fn inline_image_part(reference: &ReferenceImage) -> Value {
    json!({
        "inlineData": {
            "data": reference.data,
            "mimeType": reference.mime_type,
        }
    })
}

fn color_from_prompt(prompt: &str, salt: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(salt.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
