//! ComfyUI: patch a workflow graph, queue it, poll history, fetch the output.

use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context};
use log::debug;
use novelai_contracts::capabilities::comfyui_sampler;
use novelai_contracts::media::ImageData;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::Url;
use serde::Serialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::{GeneratedImage, GenerationParams};
use crate::error::GenerationError;
use crate::transport::{read_bytes, read_json, HttpTransport};

const DEFAULT_TEXT_TO_IMAGE: &str = include_str!("../../resources/default-comfyui-t2i-wf.json");
const DEFAULT_IMAGE_TO_IMAGE: &str = include_str!("../../resources/default-comfyui-i2i-wf.json");

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComfyUiRequest {
    pub prompt: Value,
}

/// Reads the configured workflow file, or the embedded default for the mode.
pub(crate) fn load_workflow(path: Option<&Path>, img2img: bool) -> anyhow::Result<Value> {
    let raw = match path {
        Some(path) => {
            debug!("workflow: {}", path.display());
            fs::read_to_string(path)
                .with_context(|| format!("failed to read workflow {}", path.display()))?
        }
        None if img2img => DEFAULT_IMAGE_TO_IMAGE.to_string(),
        None => DEFAULT_TEXT_TO_IMAGE.to_string(),
    };
    let workflow: Value = serde_json::from_str(&raw).context("workflow is not valid JSON")?;
    if !workflow.is_object() {
        anyhow::bail!("workflow must be a JSON object keyed by node id");
    }
    Ok(workflow)
}

/// Node ids in graph order: numeric ids ascending, others after them.
fn node_ids(nodes: &Map<String, Value>) -> Vec<String> {
    let mut ids: Vec<String> = nodes.keys().cloned().collect();
    ids.sort_by_key(|id| (id.parse::<u64>().unwrap_or(u64::MAX), id.clone()));
    ids
}

fn first_node_of(nodes: &Map<String, Value>, class_type: &str) -> Option<String> {
    node_ids(nodes).into_iter().find(|id| {
        nodes[id].get("class_type").and_then(Value::as_str) == Some(class_type)
    })
}

fn linked_node(sampler_inputs: &Value, input: &str) -> Option<String> {
    match sampler_inputs.get(input)?.get(0)? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn set_input(nodes: &mut Map<String, Value>, id: &str, key: &str, value: Value) {
    if let Some(inputs) = nodes
        .get_mut(id)
        .and_then(|node| node.get_mut("inputs"))
        .and_then(Value::as_object_mut)
    {
        inputs.insert(key.to_string(), value);
    }
}

/// Writes the generation parameters into the first `KSampler`, the nodes it
/// links to, the first `CheckpointLoaderSimple` and the first `LoadImage`.
pub(crate) fn patch_workflow(
    mut workflow: Value,
    params: &GenerationParams,
    uploaded_image: Option<&str>,
) -> anyhow::Result<ComfyUiRequest> {
    let nodes = workflow
        .as_object_mut()
        .ok_or_else(|| anyhow!("workflow must be a JSON object keyed by node id"))?;

    if let Some(image_path) = uploaded_image {
        if let Some(id) = first_node_of(nodes, "LoadImage") {
            set_input(nodes, &id, "image", json!(image_path));
        }
    }

    if let Some(id) = first_node_of(nodes, "KSampler") {
        set_input(nodes, &id, "seed", json!(params.seed));
        set_input(nodes, &id, "steps", json!(params.steps));
        set_input(nodes, &id, "cfg", json!(params.scale));
        set_input(nodes, &id, "sampler_name", json!(comfyui_sampler(&params.sampler)));
        set_input(nodes, &id, "denoise", json!(params.strength.unwrap_or(1.0)));
        if let Some(scheduler) = &params.scheduler {
            set_input(nodes, &id, "scheduler", json!(scheduler));
        }

        let inputs = nodes[&id].get("inputs").cloned().unwrap_or(Value::Null);
        if let Some(positive) = linked_node(&inputs, "positive") {
            set_input(nodes, &positive, "text", json!(params.prompt));
        }
        if let Some(negative) = linked_node(&inputs, "negative") {
            set_input(nodes, &negative, "text", json!(params.negative_prompt));
        }
        // img2img graphs feed the sampler from a VAEEncode, which has no size.
        if let Some(latent) = linked_node(&inputs, "latent_image") {
            let has_size = nodes
                .get(&latent)
                .and_then(|node| node.get("inputs"))
                .is_some_and(|inputs| inputs.get("width").is_some());
            if has_size {
                set_input(nodes, &latent, "width", json!(params.width));
                set_input(nodes, &latent, "height", json!(params.height));
                set_input(nodes, &latent, "batch_size", json!(params.batch));
            }
        }
    }

    if let Some(model) = &params.model {
        if let Some(id) = first_node_of(nodes, "CheckpointLoaderSimple") {
            set_input(nodes, &id, "ckpt_name", json!(model));
        }
    }

    debug!("prompt: {workflow}");
    Ok(ComfyUiRequest { prompt: workflow })
}

/// Uploads the source image and returns the name a `LoadImage` node expects.
pub(crate) fn upload_image(
    transport: &HttpTransport,
    image: &ImageData,
) -> Result<String, GenerationError> {
    let name = match image.mime.as_str() {
        "image/jpeg" => format!("{}.jpg", Uuid::new_v4().simple()),
        "image/png" => format!("{}.png", Uuid::new_v4().simple()),
        _ => Uuid::new_v4().simple().to_string(),
    };
    let part = Part::bytes(image.bytes.clone())
        .file_name(name)
        .mime_str(&image.mime)
        .context("invalid image MIME type")?;
    let form = Form::new().part("image", part);
    let uploaded = read_json(transport.post_multipart("/upload/image", form)?)?;
    let name = uploaded
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("ComfyUI upload returned no file name"))?;
    match uploaded.get("subfolder").and_then(Value::as_str) {
        Some(subfolder) if !subfolder.is_empty() => Ok(format!("{subfolder}/{name}")),
        _ => Ok(name.to_string()),
    }
}

pub(crate) fn generate(
    transport: &HttpTransport,
    path: &str,
    payload: &ComfyUiRequest,
    poll_interval: Duration,
    params: &GenerationParams,
) -> Result<GeneratedImage, GenerationError> {
    let queued = read_json(transport.post_json(path, payload, &[])?)?;
    let prompt_id = queued
        .get("prompt_id")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("ComfyUI returned no prompt id"))?
        .to_string();

    let outputs = loop {
        let history = read_json(transport.get(&format!("/history/{prompt_id}"), &[])?)?;
        match history.get(&prompt_id).and_then(|entry| entry.get("outputs")) {
            Some(Value::Object(outputs)) => break outputs.clone(),
            _ => thread::sleep(poll_interval),
        }
    };

    let first = node_ids(&outputs).into_iter().find_map(|id| {
        outputs[&id]
            .get("images")
            .and_then(Value::as_array)
            .and_then(|images| images.first())
            .cloned()
    });
    let Some(first) = first else {
        return Err(GenerationError::EmptyResponse);
    };
    let field = |key: &str| {
        first
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let url = Url::parse_with_params(
        &transport.url("/view"),
        &[
            ("filename", field("filename")),
            ("subfolder", field("subfolder")),
            ("type", field("type")),
        ],
    )
    .context("invalid ComfyUI view URL")?;
    let (bytes, mime) = read_bytes(transport.get(url.as_str(), &[])?)?;
    if bytes.is_empty() {
        return Err(GenerationError::EmptyResponse);
    }
    Ok(GeneratedImage {
        image: ImageData::new(bytes, mime.unwrap_or_else(|| "image/png".to_string())),
        final_prompt: params.prompt.clone(),
    })
}
