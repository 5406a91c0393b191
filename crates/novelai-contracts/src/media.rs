use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Raw image bytes plus their MIME type.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageData {
    pub bytes: Vec<u8>,
    pub mime: String,
}

impl std::fmt::Debug for ImageData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageData")
            .field("mime", &self.mime)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl ImageData {
    pub fn new(bytes: Vec<u8>, mime: impl Into<String>) -> Self {
        Self {
            bytes,
            mime: mime.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, self.base64())
    }

    /// Decodes a `data:<mime>;base64,<payload>` URL.
    pub fn from_data_url(url: &str) -> Result<Self> {
        let Some(rest) = url.trim().strip_prefix("data:") else {
            bail!("not a data URL");
        };
        let (header, payload) = rest
            .split_once(',')
            .context("data URL has no payload separator")?;
        let Some(mime) = header.strip_suffix(";base64") else {
            bail!("only base64 data URLs are supported");
        };
        let bytes = STANDARD
            .decode(payload.trim())
            .context("data URL payload is not valid base64")?;
        let mime = if mime.is_empty() {
            sniff_mime(&bytes).unwrap_or("application/octet-stream")
        } else {
            mime
        };
        Ok(Self::new(bytes, mime))
    }

    /// Accepts bare base64 or a data URL; bare payloads get `default_mime`.
    pub fn from_base64(raw: &str, default_mime: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.starts_with("data:") {
            return Self::from_data_url(trimmed);
        }
        let bytes = STANDARD
            .decode(trimmed)
            .context("image payload is not valid base64")?;
        Ok(Self::new(bytes, default_mime))
    }

    pub fn extension(&self) -> &'static str {
        match self.mime.as_str() {
            "image/jpeg" | "image/jpg" => "jpg",
            "image/webp" => "webp",
            "image/gif" => "gif",
            _ => "png",
        }
    }
}

/// Guesses an image MIME type from its magic bytes.
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if bytes.starts_with(&[0xff, 0xd8, 0xff]) {
        Some("image/jpeg")
    } else if bytes.len() >= 12 && bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else {
        None
    }
}
