//! NovelAI first-party API and self-hosted NAIFU servers.

use std::io::{Cursor, Read};

use anyhow::Context;
use novelai_contracts::capabilities::{sd_to_nai, NAI_V3_MODEL};
use novelai_contracts::media::ImageData;
use reqwest::header::CONTENT_DISPOSITION;
use serde::Serialize;

use super::{GeneratedImage, GenerationParams};
use crate::error::GenerationError;
use crate::transport::{content_type, read_bytes, HttpTransport};

/// Length of the `event: newImage\nid: 1\ndata:` preamble on text responses.
const STREAM_PREFIX_LEN: usize = 27;
const PARAMS_VERSION: u8 = 1;
/// "None" in NovelAI's undesired-content preset list.
const UC_PRESET_NONE: u8 = 2;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NovelAiRequest {
    pub model: String,
    pub input: String,
    pub parameters: NovelAiParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NovelAiParameters {
    pub params_version: u8,
    pub seed: u64,
    pub n_samples: u32,
    pub negative_prompt: String,
    #[serde(rename = "ucPreset")]
    pub uc_preset: u8,
    #[serde(rename = "qualityToggle")]
    pub quality_toggle: bool,
    pub scale: f64,
    pub steps: u32,
    pub width: u32,
    pub height: u32,
    pub sampler: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strength: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noise: Option<f64>,
    pub dynamic_thresholding: bool,
    #[serde(flatten)]
    pub v3: Option<NovelAiV3Parameters>,
}

/// Fields only `nai-diffusion-3` understands.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NovelAiV3Parameters {
    pub legacy: bool,
    pub legacy_v3_extend: bool,
    pub sm: bool,
    pub sm_dyn: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noise_schedule: Option<String>,
}

/// NAIFU keeps the older flat shape with `prompt` and `uc` inline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NaifuRequest {
    pub params_version: u8,
    pub prompt: String,
    pub uc: String,
    pub seed: u64,
    pub n_samples: u32,
    #[serde(rename = "ucPreset")]
    pub uc_preset: u8,
    #[serde(rename = "qualityToggle")]
    pub quality_toggle: bool,
    pub scale: f64,
    pub steps: u32,
    pub width: u32,
    pub height: u32,
    pub sampler: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strength: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noise: Option<f64>,
}

pub(crate) fn build_request(params: &GenerationParams, model: &str) -> NovelAiRequest {
    let sampler = sd_to_nai(&params.sampler, model).to_string();
    let mut scale = params.scale;
    let v3 = (model == NAI_V3_MODEL).then(|| {
        if scale > 10.0 {
            scale /= 2.0;
        }
        let mut noise_schedule = params.scheduler.clone();
        if noise_schedule.as_deref() == Some("karras")
            && matches!(sampler.as_str(), "k_euler_ancestral" | "k_dpmpp_2s_ancestral")
        {
            noise_schedule = Some("native".to_string());
        }
        let mut v3 = NovelAiV3Parameters {
            legacy: false,
            legacy_v3_extend: false,
            sm: params.smea || params.smea_dyn,
            sm_dyn: params.smea_dyn,
            noise_schedule,
        };
        if sampler == "ddim_v3" {
            v3.sm = false;
            v3.sm_dyn = false;
            v3.noise_schedule = None;
        }
        v3
    });

    NovelAiRequest {
        model: model.to_string(),
        input: params.prompt.clone(),
        parameters: NovelAiParameters {
            params_version: PARAMS_VERSION,
            seed: params.seed,
            n_samples: params.batch,
            negative_prompt: params.negative_prompt.clone(),
            uc_preset: UC_PRESET_NONE,
            quality_toggle: false,
            scale,
            steps: params.steps,
            width: params.width,
            height: params.height,
            sampler,
            image: params.image.as_ref().map(ImageData::base64),
            strength: params.strength,
            noise: params.noise,
            dynamic_thresholding: params.decrisper,
            v3,
        },
    }
}

pub(crate) fn build_naifu_request(params: &GenerationParams, model: &str) -> NaifuRequest {
    NaifuRequest {
        params_version: PARAMS_VERSION,
        prompt: params.prompt.clone(),
        uc: params.negative_prompt.clone(),
        seed: params.seed,
        n_samples: params.batch,
        uc_preset: UC_PRESET_NONE,
        quality_toggle: false,
        scale: params.scale,
        steps: params.steps,
        width: params.width,
        height: params.height,
        sampler: sd_to_nai(&params.sampler, model).to_string(),
        image: params.image.as_ref().map(ImageData::base64),
        strength: params.strength,
        noise: params.noise,
    }
}

pub(crate) fn generate<T: Serialize>(
    transport: &HttpTransport,
    path: &str,
    payload: &T,
    auth: &[(&'static str, String)],
    params: &GenerationParams,
) -> Result<GeneratedImage, GenerationError> {
    let response = transport.post_json(path, payload, auth)?;
    let mime = content_type(&response);
    let disposition = response
        .headers()
        .get(CONTENT_DISPOSITION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string());
    let (bytes, _) = read_bytes(response)?;
    let image = extract_image(&bytes, mime.as_deref(), disposition.as_deref())?;
    Ok(GeneratedImage {
        image,
        final_prompt: params.prompt.clone(),
    })
}

/// Newer API versions answer with a ZIP whose first entry is the PNG; older
/// ones (and NAIFU) stream text with a fixed preamble before the base64.
pub(crate) fn extract_image(
    body: &[u8],
    content_type: Option<&str>,
    disposition: Option<&str>,
) -> Result<ImageData, GenerationError> {
    let is_zip = content_type == Some("application/x-zip-compressed")
        || disposition.is_some_and(|value| value.contains(".zip"));
    if is_zip {
        let mut archive =
            zip::ZipArchive::new(Cursor::new(body)).context("invalid ZIP response")?;
        if archive.is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        let mut entry = archive.by_index(0).context("unreadable ZIP entry")?;
        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .context("failed reading ZIP entry")?;
        if bytes.is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        return Ok(ImageData::new(bytes, "image/png"));
    }

    let text = String::from_utf8_lossy(body);
    let payload: String = text.trim_end().chars().skip(STREAM_PREFIX_LEN).collect();
    if payload.trim().is_empty() {
        return Err(GenerationError::EmptyResponse);
    }
    let image = ImageData::from_base64(&payload, "image/png")?;
    if image.is_empty() {
        return Err(GenerationError::EmptyResponse);
    }
    Ok(image)
}
