use log::warn;
use novelai_contracts::capabilities::{lookup, SD_SAMPLERS};
use novelai_contracts::media::ImageData;
use serde::Serialize;
use serde_json::Value;

use super::{GeneratedImage, GenerationParams};
use crate::error::GenerationError;
use crate::transport::{read_json, HttpTransport};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SdWebuiRequest {
    pub sampler_index: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_images: Option<Vec<String>>,
    pub restore_faces: bool,
    pub enable_hr: bool,
    pub prompt: String,
    pub batch_size: u32,
    pub seed: u64,
    pub negative_prompt: String,
    pub cfg_scale: f64,
    pub steps: u32,
    pub width: u32,
    pub height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denoising_strength: Option<f64>,
}

pub(crate) fn build_request(params: &GenerationParams) -> SdWebuiRequest {
    // The configured sampler is unchecked; unknown keys go through as-is.
    let sampler_index = lookup(SD_SAMPLERS, &params.sampler)
        .map(str::to_string)
        .unwrap_or_else(|| params.sampler.clone());
    SdWebuiRequest {
        sampler_index,
        scheduler: params.scheduler.clone(),
        init_images: params.image.as_ref().map(|image| vec![image.data_url()]),
        restore_faces: params.restore_faces,
        enable_hr: params.hires_fix,
        prompt: params.prompt.clone(),
        batch_size: params.batch,
        seed: params.seed,
        negative_prompt: params.negative_prompt.clone(),
        cfg_scale: params.scale,
        steps: params.steps,
        width: params.width,
        height: params.height,
        denoising_strength: params.strength,
    }
}

pub(crate) fn generate(
    transport: &HttpTransport,
    path: &str,
    payload: &SdWebuiRequest,
    params: &GenerationParams,
) -> Result<GeneratedImage, GenerationError> {
    let response = read_json(transport.post_json(path, payload, &[])?)?;
    let encoded = response
        .get("images")
        .and_then(Value::as_array)
        .and_then(|images| images.first())
        .and_then(Value::as_str)
        .unwrap_or("");
    if encoded.trim().is_empty() {
        return Err(GenerationError::EmptyResponse);
    }
    let image = ImageData::from_base64(encoded, "image/png")?;
    let final_prompt = final_prompt(response.get("info")).unwrap_or_else(|| params.prompt.clone());
    Ok(GeneratedImage {
        image,
        final_prompt,
    })
}

/// `info` is an object on some WebUI versions and a JSON string on others.
fn final_prompt(info: Option<&Value>) -> Option<String> {
    match info? {
        Value::Object(info) => info.get("prompt")?.as_str().map(str::to_string),
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(parsed) => parsed.get("prompt")?.as_str().map(str::to_string),
            Err(err) => {
                warn!("could not parse SD-WebUI info: {err}");
                None
            }
        },
        _ => None,
    }
}
