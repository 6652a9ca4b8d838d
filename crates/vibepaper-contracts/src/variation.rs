use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::settings::{AspectRatio, OutputSettings, Quality};

pub const DEFAULT_IMAGE_MIME: &str = "image/png";

/// Encoded image supplied as the style/composition source of a remix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceImage {
    pub data: String,
    pub mime_type: String,
}

impl ReferenceImage {
    pub fn new(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub aspect_ratio: AspectRatio,
    pub quality: Quality,
    pub reference_image: Option<ReferenceImage>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, settings: OutputSettings) -> Self {
        Self {
            prompt: prompt.into(),
            aspect_ratio: settings.aspect_ratio,
            quality: settings.quality,
            reference_image: None,
        }
    }

    pub fn with_reference(mut self, reference: Option<ReferenceImage>) -> Self {
        self.reference_image = reference;
        self
    }

    pub fn is_remix(&self) -> bool {
        self.reference_image.is_some()
    }
}

/// One generated wallpaper plus the parameters that produced it.
///
/// Never mutated after construction: history and result lists swap whole
/// entries in and out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WallpaperVariation {
    pub id: String,
    #[serde(alias = "base64")]
    pub encoded_image: String,
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
    pub prompt: String,
    pub aspect_ratio: AspectRatio,
    #[serde(alias = "size")]
    pub quality: Quality,
    #[serde(alias = "timestamp")]
    pub created_at: i64,
}

impl WallpaperVariation {
    pub fn new(
        request: &GenerationRequest,
        encoded_image: impl Into<String>,
        mime_type: Option<String>,
    ) -> Self {
        Self {
            id: new_variation_id(),
            encoded_image: encoded_image.into(),
            mime_type: mime_type
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(default_mime_type),
            prompt: request.prompt.clone(),
            aspect_ratio: request.aspect_ratio,
            quality: request.quality,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.encoded_image)
    }

    pub fn decode_image(&self) -> anyhow::Result<Vec<u8>> {
        Ok(BASE64.decode(self.encoded_image.as_bytes())?)
    }

    pub fn as_reference(&self) -> ReferenceImage {
        ReferenceImage::new(self.encoded_image.clone(), self.mime_type.clone())
    }

    pub fn settings(&self) -> OutputSettings {
        OutputSettings {
            aspect_ratio: self.aspect_ratio,
            quality: self.quality,
        }
    }

    pub fn download_file_name(&self) -> String {
        format!("vibepaper-{}.{}", self.id, extension_for_mime(&self.mime_type))
    }
}

/// Short random id; unique enough within one session, not a security token.
pub fn new_variation_id() -> String {
    Uuid::new_v4().simple().to_string()[..10].to_string()
}

pub fn extension_for_mime(mime_type: &str) -> &'static str {
    let lowered = mime_type.to_ascii_lowercase();
    if lowered.contains("jpeg") || lowered.contains("jpg") {
        return "jpg";
    }
    if lowered.contains("webp") {
        return "webp";
    }
    "png"
}

fn default_mime_type() -> String {
    DEFAULT_IMAGE_MIME.to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde_json::json;

    use crate::settings::{AspectRatio, OutputSettings, Quality};

    use super::{new_variation_id, GenerationRequest, WallpaperVariation};

    fn request() -> GenerationRequest {
        GenerationRequest::new(
            "rainy cyberpunk street",
            OutputSettings {
                aspect_ratio: AspectRatio::Landscape16x9,
                quality: Quality::High,
            },
        )
    }

    #[test]
    fn variation_carries_request_provenance() {
        let variation = WallpaperVariation::new(&request(), "aGVsbG8=", None);
        assert_eq!(variation.prompt, "rainy cyberpunk street");
        assert_eq!(variation.aspect_ratio, AspectRatio::Landscape16x9);
        assert_eq!(variation.quality, Quality::High);
        assert_eq!(variation.mime_type, "image/png");
        assert_eq!(variation.data_url(), "data:image/png;base64,aGVsbG8=");
        assert!(variation.created_at > 0);
        assert_eq!(variation.id.len(), 10);
    }

    #[test]
    fn variation_decodes_payload_and_names_download() -> anyhow::Result<()> {
        let variation = WallpaperVariation::new(&request(), "aGVsbG8=", Some("image/jpeg".into()));
        assert_eq!(variation.decode_image()?, b"hello".to_vec());
        assert_eq!(
            variation.download_file_name(),
            format!("vibepaper-{}.jpg", variation.id)
        );
        Ok(())
    }

    #[test]
    fn ids_do_not_collide_within_a_session() {
        let ids: HashSet<String> = (0..500).map(|_| new_variation_id()).collect();
        assert_eq!(ids.len(), 500);
    }

    #[test]
    fn legacy_shape_deserializes() -> anyhow::Result<()> {
        let legacy = json!({
            "id": "k3j9x",
            "url": "data:image/png;base64,aGVsbG8=",
            "base64": "aGVsbG8=",
            "prompt": "misty forest",
            "aspectRatio": "9:16",
            "size": "4K",
            "timestamp": 1_735_000_000_000_i64,
        });
        let parsed: WallpaperVariation = serde_json::from_value(legacy)?;
        assert_eq!(parsed.encoded_image, "aGVsbG8=");
        assert_eq!(parsed.quality, Quality::High);
        assert_eq!(parsed.created_at, 1_735_000_000_000);
        assert_eq!(parsed.mime_type, "image/png");
        Ok(())
    }

    #[test]
    fn current_shape_uses_camel_case_keys() -> anyhow::Result<()> {
        let variation = WallpaperVariation::new(&request(), "aGVsbG8=", None);
        let value = serde_json::to_value(&variation)?;
        assert_eq!(value["encodedImage"], json!("aGVsbG8="));
        assert_eq!(value["aspectRatio"], json!("16:9"));
        assert_eq!(value["quality"], json!("High"));
        assert!(value.get("createdAt").is_some());
        Ok(())
    }
}
