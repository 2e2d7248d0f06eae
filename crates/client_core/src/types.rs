use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use shared::domain::{DesignMode, DocumentId};

use crate::error::StudioError;

pub const MAX_REFERENCE_IMAGE_BYTES: usize = 10 * 1024 * 1024;
const FALLBACK_IMAGE_MIME: &str = "image/png";

/// A sketch or photo to steer image-to-image generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceImage {
    pub mime_type: String,
    pub data_b64: String,
}

impl ReferenceImage {
    pub fn from_bytes(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            mime_type: mime_type.into(),
            data_b64: STANDARD.encode(bytes),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, StudioError> {
        let bytes = std::fs::read(path).map_err(|source| StudioError::Io {
            path: path.display().to_string(),
            source,
        })?;
        if bytes.is_empty() {
            return Err(StudioError::Validation(format!(
                "reference image {} is empty",
                path.display()
            )));
        }
        if bytes.len() > MAX_REFERENCE_IMAGE_BYTES {
            return Err(StudioError::Validation(format!(
                "reference image exceeds {MAX_REFERENCE_IMAGE_BYTES} bytes"
            )));
        }
        let mime_type = mime_guess::from_path(path)
            .first()
            .filter(|mime| mime.type_() == mime_guess::mime::IMAGE)
            .map(|mime| mime.essence_str().to_string())
            .unwrap_or_else(|| FALLBACK_IMAGE_MIME.to_string());
        Ok(Self::from_bytes(mime_type, &bytes))
    }
}

/// A render as a self-contained `data:` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub data_uri: String,
}

impl GeneratedImage {
    pub fn from_base64(mime_type: Option<&str>, data_b64: &str) -> Self {
        let mime_type = mime_type
            .map(str::trim)
            .filter(|mime| !mime.is_empty())
            .unwrap_or(FALLBACK_IMAGE_MIME);
        Self {
            data_uri: format!("data:{mime_type};base64,{data_b64}"),
        }
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.data_uri
            .strip_prefix("data:")?
            .split_once(";base64,")
            .map(|(mime, _)| mime)
    }

    pub fn decode_bytes(&self) -> Result<Vec<u8>, StudioError> {
        let (_, payload) = self
            .data_uri
            .split_once(";base64,")
            .ok_or_else(|| StudioError::Validation("image is not a base64 data uri".into()))?;
        STANDARD
            .decode(payload)
            .map_err(|err| StudioError::Validation(format!("invalid image payload: {err}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt_text: String,
    pub reference_image: Option<ReferenceImage>,
    pub mode: DesignMode,
    pub style: String,
}

/// Read-only view of one approved design as delivered by the sync adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovedDesign {
    pub id: DocumentId,
    pub prompt: String,
    pub style: String,
    pub mode: DesignMode,
    pub image_url: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_uri_round_trips_bytes() {
        let image = GeneratedImage::from_base64(Some("image/jpeg"), &STANDARD.encode(b"jpeg"));
        assert_eq!(image.mime_type(), Some("image/jpeg"));
        assert_eq!(image.decode_bytes().expect("bytes"), b"jpeg");
    }

    #[test]
    fn missing_mime_defaults_to_png() {
        let image = GeneratedImage::from_base64(None, "AAAA");
        assert_eq!(image.data_uri, "data:image/png;base64,AAAA");
    }

    #[test]
    fn reference_image_guesses_mime_from_extension() {
        let suffix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("design_studio_sketch_{suffix}.jpg"));
        std::fs::write(&path, b"sketch").expect("write");

        let reference = ReferenceImage::from_path(&path).expect("reference");
        assert_eq!(reference.mime_type, "image/jpeg");
        assert_eq!(reference.data_b64, STANDARD.encode(b"sketch"));

        std::fs::remove_file(path).expect("cleanup");
    }

    #[test]
    fn missing_reference_file_is_an_io_error() {
        let err = ReferenceImage::from_path(Path::new("/definitely/not/here.png"))
            .expect_err("should fail");
        assert!(matches!(err, StudioError::Io { .. }));
    }
}
