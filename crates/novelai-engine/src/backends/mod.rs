//! Per-backend request building and response handling behind one enum.

pub mod comfyui;
pub mod horde;
pub mod novelai;
pub mod sd_webui;

use std::path::PathBuf;
use std::time::Duration;

use novelai_contracts::config::{BackendKind, Config, NsfwPolicy};
use novelai_contracts::media::ImageData;
use serde::Serialize;

use crate::error::GenerationError;
use crate::transport::HttpTransport;

pub use comfyui::ComfyUiRequest;
pub use horde::{HordeParams, HordeRequest};
pub use novelai::{NaifuRequest, NovelAiParameters, NovelAiRequest, NovelAiV3Parameters};
pub use sd_webui::SdWebuiRequest;

/// Stable Horde's anonymous API key.
pub const HORDE_ANONYMOUS_KEY: &str = "0000000000";
pub(crate) const NAI_DEFAULT_MODEL: &str = "nai-diffusion";

/// Everything one generation request needs, already resolved against the
/// config and the command options.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GenerationParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub seed: u64,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub scale: f64,
    pub sampler: String,
    pub scheduler: Option<String>,
    pub batch: u32,
    /// Backend-specific model id; NovelAI expects the full id.
    pub model: Option<String>,
    pub image: Option<ImageData>,
    pub strength: Option<f64>,
    pub noise: Option<f64>,
    pub hires_fix: bool,
    pub restore_faces: bool,
    pub smea: bool,
    pub smea_dyn: bool,
    pub decrisper: bool,
}

impl GenerationParams {
    pub fn is_img2img(&self) -> bool {
        self.image.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    pub image: ImageData,
    /// The prompt as the backend reports it, or the submitted one.
    pub final_prompt: String,
}

/// Request body for one backend call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BackendPayload {
    NovelAi(NovelAiRequest),
    Naifu(NaifuRequest),
    SdWebui(SdWebuiRequest),
    StableHorde(HordeRequest),
    ComfyUi(ComfyUiRequest),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Backend {
    NovelAi {
        login: bool,
    },
    Naifu,
    SdWebui,
    StableHorde {
        nsfw: NsfwPolicy,
        trusted_workers: bool,
        poll_interval: Duration,
    },
    ComfyUi {
        text_to_image: Option<PathBuf>,
        image_to_image: Option<PathBuf>,
        poll_interval: Duration,
    },
}

impl Backend {
    pub fn from_config(config: &Config) -> Self {
        match config.backend {
            BackendKind::Token => Backend::NovelAi { login: false },
            BackendKind::Login => Backend::NovelAi { login: true },
            BackendKind::Naifu => Backend::Naifu,
            BackendKind::SdWebui => Backend::SdWebui,
            BackendKind::StableHorde => Backend::StableHorde {
                nsfw: config.nsfw,
                trusted_workers: config.trusted_workers,
                poll_interval: config.poll_interval(),
            },
            BackendKind::Comfyui => Backend::ComfyUi {
                text_to_image: config.workflow_text_to_image.clone(),
                image_to_image: config.workflow_image_to_image.clone(),
                poll_interval: config.poll_interval(),
            },
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::NovelAi { login: false } => BackendKind::Token,
            Backend::NovelAi { login: true } => BackendKind::Login,
            Backend::Naifu => BackendKind::Naifu,
            Backend::SdWebui => BackendKind::SdWebui,
            Backend::StableHorde { .. } => BackendKind::StableHorde,
            Backend::ComfyUi { .. } => BackendKind::Comfyui,
        }
    }

    pub fn request_path(&self, img2img: bool) -> &'static str {
        match self {
            Backend::NovelAi { .. } => "/ai/generate-image",
            Backend::Naifu => "/generate-stream",
            Backend::SdWebui if img2img => "/sdapi/v1/img2img",
            Backend::SdWebui => "/sdapi/v1/txt2img",
            Backend::StableHorde { .. } => "/api/v2/generate/async",
            Backend::ComfyUi { .. } => "/prompt",
        }
    }

    pub fn auth_headers(&self, token: Option<&str>) -> Vec<(&'static str, String)> {
        match self {
            Backend::NovelAi { .. } | Backend::Naifu => token
                .map(|token| vec![("authorization", format!("Bearer {token}"))])
                .unwrap_or_default(),
            Backend::StableHorde { .. } => vec![(
                "apikey",
                token
                    .filter(|token| !token.is_empty())
                    .unwrap_or(HORDE_ANONYMOUS_KEY)
                    .to_string(),
            )],
            Backend::SdWebui | Backend::ComfyUi { .. } => Vec::new(),
        }
    }

    /// Builds the request body. ComfyUI needs the uploaded image name, which
    /// only exists after `comfyui::upload_image`.
    pub fn build_payload(
        &self,
        params: &GenerationParams,
        uploaded_image: Option<&str>,
    ) -> anyhow::Result<BackendPayload> {
        let payload = match self {
            Backend::NovelAi { .. } => {
                let model = params.model.as_deref().unwrap_or(NAI_DEFAULT_MODEL);
                BackendPayload::NovelAi(novelai::build_request(params, model))
            }
            Backend::Naifu => {
                let model = params.model.as_deref().unwrap_or(NAI_DEFAULT_MODEL);
                BackendPayload::Naifu(novelai::build_naifu_request(params, model))
            }
            Backend::SdWebui => BackendPayload::SdWebui(sd_webui::build_request(params)),
            Backend::StableHorde {
                nsfw,
                trusted_workers,
                ..
            } => BackendPayload::StableHorde(horde::build_request(params, *nsfw, *trusted_workers)),
            Backend::ComfyUi {
                text_to_image,
                image_to_image,
                ..
            } => {
                let img2img = params.is_img2img();
                let path = if img2img { image_to_image } else { text_to_image };
                let workflow = comfyui::load_workflow(path.as_deref(), img2img)?;
                BackendPayload::ComfyUi(comfyui::patch_workflow(workflow, params, uploaded_image)?)
            }
        };
        Ok(payload)
    }

    /// One full request cycle: upload (ComfyUI img2img), submit, poll, fetch.
    /// Callers wrap this in `with_retries`.
    pub fn generate(
        &self,
        transport: &HttpTransport,
        token: Option<&str>,
        params: &GenerationParams,
    ) -> Result<GeneratedImage, GenerationError> {
        let auth = self.auth_headers(token);
        let path = self.request_path(params.is_img2img());
        let uploaded = match (self, &params.image) {
            (Backend::ComfyUi { .. }, Some(image)) => Some(comfyui::upload_image(transport, image)?),
            _ => None,
        };
        let payload = self.build_payload(params, uploaded.as_deref())?;

        match (self, &payload) {
            (_, BackendPayload::NovelAi(body)) => novelai::generate(transport, path, body, &auth, params),
            (_, BackendPayload::Naifu(body)) => novelai::generate(transport, path, body, &auth, params),
            (_, BackendPayload::SdWebui(body)) => sd_webui::generate(transport, path, body, params),
            (Backend::StableHorde { poll_interval, .. }, BackendPayload::StableHorde(body)) => {
                horde::generate(transport, path, body, &auth, *poll_interval, params)
            }
            (Backend::ComfyUi { poll_interval, .. }, BackendPayload::ComfyUi(body)) => {
                comfyui::generate(transport, path, body, *poll_interval, params)
            }
            _ => Err(anyhow::anyhow!("payload does not match backend {}", self.kind()).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use anyhow::Context;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde_json::json;

    use super::*;
    use crate::test_server::{FakeServer, Reply};

    fn config(backend: BackendKind) -> Config {
        Config {
            backend,
            ..Config::default()
        }
    }

    #[test]
    fn paths_and_headers_per_backend() {
        let novelai = Backend::from_config(&config(BackendKind::Login));
        assert_eq!(novelai, Backend::NovelAi { login: true });
        assert_eq!(novelai.request_path(true), "/ai/generate-image");
        assert_eq!(
            novelai.auth_headers(Some("tok")),
            vec![("authorization", "Bearer tok".to_string())]
        );

        let webui = Backend::from_config(&config(BackendKind::SdWebui));
        assert_eq!(webui.request_path(false), "/sdapi/v1/txt2img");
        assert_eq!(webui.request_path(true), "/sdapi/v1/img2img");
        assert!(webui.auth_headers(Some("tok")).is_empty());

        let horde = Backend::from_config(&config(BackendKind::StableHorde));
        assert_eq!(horde.kind(), BackendKind::StableHorde);
        assert_eq!(
            horde.auth_headers(None),
            vec![("apikey", HORDE_ANONYMOUS_KEY.to_string())]
        );

        assert_eq!(Backend::Naifu.request_path(false), "/generate-stream");
        let comfy = Backend::from_config(&config(BackendKind::Comfyui));
        assert_eq!(comfy.request_path(false), "/prompt");
    }

    #[test]
    fn payload_variant_follows_backend() -> anyhow::Result<()> {
        let params = GenerationParams {
            prompt: "1girl".to_string(),
            sampler: "k_euler_a".to_string(),
            batch: 1,
            ..GenerationParams::default()
        };
        let payload = Backend::NovelAi { login: false }.build_payload(&params, None)?;
        let BackendPayload::NovelAi(request) = &payload else {
            anyhow::bail!("expected a NovelAI payload");
        };
        assert_eq!(request.model, "nai-diffusion");
        assert_eq!(serde_json::to_value(&payload)?["input"], json!("1girl"));

        let payload = Backend::from_config(&config(BackendKind::Comfyui)).build_payload(&params, None)?;
        assert!(matches!(payload, BackendPayload::ComfyUi(_)));
        Ok(())
    }

    #[test]
    fn naifu_generation_end_to_end() -> anyhow::Result<()> {
        let body = format!("event: newImage\nid: 1\ndata:{}", STANDARD.encode(b"\x89PNG"));
        let server = FakeServer::start(vec![Reply::text(200, &body)])?;
        let transport = HttpTransport::new(server.url(), &BTreeMap::new(), Duration::from_secs(5))?;
        let params = GenerationParams {
            prompt: "1girl".to_string(),
            negative_prompt: "lowres".to_string(),
            sampler: "k_euler_a".to_string(),
            batch: 1,
            ..GenerationParams::default()
        };
        let result = Backend::Naifu.generate(&transport, Some("secret"), &params)?;
        assert_eq!(result.image.bytes, b"\x89PNG");
        assert_eq!(result.final_prompt, "1girl");

        let request = server.requests().into_iter().next().context("no request")?;
        assert_eq!(request.path, "/generate-stream");
        assert_eq!(request.header("authorization"), Some("Bearer secret"));
        assert_eq!(request.json()?["uc"], json!("lowres"));
        Ok(())
    }
}
