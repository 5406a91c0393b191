use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use log::debug;
use novelai_contracts::capabilities::split_karras_suffix;
use novelai_contracts::config::NsfwPolicy;
use novelai_contracts::media::ImageData;
use serde::Serialize;
use serde_json::Value;

use super::{GeneratedImage, GenerationParams};
use crate::error::GenerationError;
use crate::transport::{read_bytes, read_json, HttpTransport};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HordeRequest {
    pub prompt: String,
    pub params: HordeParams,
    pub nsfw: bool,
    pub trusted_workers: bool,
    pub censor_nsfw: bool,
    pub models: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_processing: Option<String>,
    /// Ask for results on R2 storage instead of inline base64.
    pub r2: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HordeParams {
    pub sampler_name: String,
    pub cfg_scale: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denoising_strength: Option<f64>,
    pub seed: String,
    pub height: u32,
    pub width: u32,
    pub post_processing: Vec<String>,
    pub karras: bool,
    pub hires_fix: bool,
    pub steps: u32,
    pub n: u32,
}

pub(crate) fn build_request(
    params: &GenerationParams,
    nsfw: NsfwPolicy,
    trusted_workers: bool,
) -> HordeRequest {
    let (sampler, suffixed) = split_karras_suffix(&params.sampler);
    let karras = suffixed
        || params
            .scheduler
            .as_deref()
            .is_some_and(|scheduler| scheduler.eq_ignore_ascii_case("karras"));
    let prompt = if params.negative_prompt.is_empty() {
        params.prompt.clone()
    } else {
        format!("{} ### {}", params.prompt, params.negative_prompt)
    };
    HordeRequest {
        prompt,
        params: HordeParams {
            sampler_name: sampler.to_string(),
            cfg_scale: params.scale,
            denoising_strength: params.strength,
            seed: params.seed.to_string(),
            height: params.height,
            width: params.width,
            post_processing: Vec::new(),
            karras,
            hires_fix: params.hires_fix,
            steps: params.steps,
            n: params.batch,
        },
        nsfw: nsfw != NsfwPolicy::Disallow,
        trusted_workers,
        censor_nsfw: nsfw == NsfwPolicy::Censor,
        models: params.model.iter().cloned().collect(),
        source_image: params.image.as_ref().map(ImageData::base64),
        source_processing: params.image.as_ref().map(|_| "img2img".to_string()),
        r2: true,
    }
}

pub(crate) fn generate(
    transport: &HttpTransport,
    path: &str,
    payload: &HordeRequest,
    auth: &[(&'static str, String)],
    poll_interval: Duration,
    params: &GenerationParams,
) -> Result<GeneratedImage, GenerationError> {
    let ticket = read_json(transport.post_json(path, payload, auth)?)?;
    let id = ticket
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("Stable Horde returned no job id"))?
        .to_string();
    debug!("stable horde job {id} queued");

    loop {
        let check = read_json(transport.get(&format!("/api/v2/generate/check/{id}"), auth)?)?;
        if check.get("faulted").and_then(Value::as_bool) == Some(true) {
            return Err(anyhow!("Stable Horde job {id} faulted").into());
        }
        if check.get("done").and_then(Value::as_bool) != Some(false) {
            break;
        }
        thread::sleep(poll_interval);
    }

    let status = read_json(transport.get(&format!("/api/v2/generate/status/{id}"), auth)?)?;
    let img = status
        .get("generations")
        .and_then(Value::as_array)
        .and_then(|generations| generations.first())
        .and_then(|generation| generation.get("img"))
        .and_then(Value::as_str)
        .unwrap_or("");
    if img.trim().is_empty() {
        return Err(GenerationError::EmptyResponse);
    }

    let image = if img.starts_with("http") {
        let (bytes, mime) = read_bytes(transport.get_external(img)?)?;
        ImageData::new(bytes, mime.unwrap_or_else(|| "image/webp".to_string()))
    } else {
        ImageData::from_base64(img, "image/webp")?
    };
    if image.is_empty() {
        return Err(GenerationError::EmptyResponse);
    }
    Ok(GeneratedImage {
        image,
        final_prompt: params.prompt.clone(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::test_server::{FakeServer, Reply};

    fn params() -> GenerationParams {
        GenerationParams {
            prompt: "1girl, masterpiece".to_string(),
            negative_prompt: "lowres".to_string(),
            seed: 42,
            width: 512,
            height: 512,
            steps: 30,
            scale: 7.5,
            sampler: "k_euler_a_ka".to_string(),
            batch: 2,
            ..GenerationParams::default()
        }
    }

    #[test]
    fn karras_suffix_becomes_a_flag() -> anyhow::Result<()> {
        let request = build_request(&params(), NsfwPolicy::Censor, true);
        assert_eq!(request.params.sampler_name, "k_euler_a");
        assert!(request.params.karras);
        assert_eq!(request.prompt, "1girl, masterpiece ### lowres");

        let value = serde_json::to_value(&request)?;
        assert_eq!(value["params"]["seed"], json!("42"));
        assert_eq!(value["params"]["n"], json!(2));
        assert_eq!(value["params"]["post_processing"], json!([]));
        assert_eq!(value["nsfw"], json!(true));
        assert_eq!(value["censor_nsfw"], json!(true));
        assert_eq!(value["trusted_workers"], json!(true));
        assert_eq!(value["models"], json!([]));
        assert_eq!(value["r2"], json!(true));
        assert!(value.get("source_image").is_none());
        assert!(!value.to_string().contains("_ka"));
        Ok(())
    }

    #[test]
    fn scheduler_sets_karras_and_images_switch_to_img2img() {
        let mut params = params();
        params.sampler = "k_dpm_2".to_string();
        params.scheduler = Some("Karras".to_string());
        params.model = Some("Anything Diffusion".to_string());
        params.image = Some(ImageData::new(vec![1, 2, 3], "image/png"));
        params.strength = Some(0.5);
        let request = build_request(&params, NsfwPolicy::Disallow, false);
        assert_eq!(request.params.sampler_name, "k_dpm_2");
        assert!(request.params.karras);
        assert!(!request.nsfw);
        assert!(!request.censor_nsfw);
        assert_eq!(request.models, vec!["Anything Diffusion".to_string()]);
        assert_eq!(request.source_image.as_deref(), Some("AQID"));
        assert_eq!(request.source_processing.as_deref(), Some("img2img"));
        assert_eq!(request.params.denoising_strength, Some(0.5));
    }

    #[test]
    fn polls_until_done_then_decodes_inline_webp() -> anyhow::Result<()> {
        let server = FakeServer::start(vec![
            Reply::json(202, json!({ "id": "job-1" })),
            Reply::json(200, json!({ "done": false, "faulted": false })),
            Reply::json(200, json!({ "done": true, "faulted": false })),
            Reply::json(200, json!({ "generations": [{ "img": "UklGRg==" }] })),
        ])?;
        let transport = HttpTransport::new(server.url(), &BTreeMap::new(), Duration::from_secs(5))?;
        let params = params();
        let payload = build_request(&params, NsfwPolicy::Allow, false);
        let auth = [("apikey", "0000000000".to_string())];
        let result = generate(
            &transport,
            "/api/v2/generate/async",
            &payload,
            &auth,
            Duration::from_millis(10),
            &params,
        )?;
        assert_eq!(result.image.mime, "image/webp");
        assert_eq!(result.image.bytes, b"RIFF");

        let paths: Vec<String> = server.requests().into_iter().map(|r| r.path).collect();
        assert_eq!(
            paths,
            vec![
                "/api/v2/generate/async",
                "/api/v2/generate/check/job-1",
                "/api/v2/generate/check/job-1",
                "/api/v2/generate/status/job-1",
            ]
        );
        assert_eq!(server.requests()[0].header("apikey"), Some("0000000000"));
        Ok(())
    }

    #[test]
    fn downloads_r2_urls_and_reports_faults() -> anyhow::Result<()> {
        let storage = FakeServer::start(vec![Reply::bytes(200, "image/webp", b"RIFFwebp".to_vec())])?;
        let server = FakeServer::start(vec![
            Reply::json(202, json!({ "id": "job-2" })),
            Reply::json(200, json!({ "done": true })),
            Reply::json(
                200,
                json!({ "generations": [{ "img": format!("{}/r2/out.webp", storage.url()) }] }),
            ),
            Reply::json(202, json!({ "id": "job-3" })),
            Reply::json(200, json!({ "done": false, "faulted": true })),
        ])?;
        let mut headers = BTreeMap::new();
        headers.insert("X-Client".to_string(), "bot".to_string());
        let transport = HttpTransport::new(server.url(), &headers, Duration::from_secs(5))?;
        let params = params();
        let payload = build_request(&params, NsfwPolicy::Allow, false);

        let result = generate(&transport, "/api/v2/generate/async", &payload, &[], Duration::ZERO, &params)?;
        assert_eq!(result.image.bytes, b"RIFFwebp");
        assert_eq!(storage.requests()[0].path, "/r2/out.webp");
        assert_eq!(storage.requests()[0].header("x-client"), None);

        let faulted = generate(&transport, "/api/v2/generate/async", &payload, &[], Duration::ZERO, &params);
        assert!(matches!(faulted, Err(GenerationError::Other(_))));
        Ok(())
    }

    #[test]
    fn check_without_done_stops_polling() -> anyhow::Result<()> {
        let server = FakeServer::start(vec![
            Reply::json(202, json!({ "id": "job-4" })),
            Reply::json(200, json!({ "message": "rate limited" })),
            Reply::json(200, json!({ "generations": [] })),
        ])?;
        let transport = HttpTransport::new(server.url(), &BTreeMap::new(), Duration::from_secs(5))?;
        let params = params();
        let payload = build_request(&params, NsfwPolicy::Allow, false);

        let result = generate(&transport, "/api/v2/generate/async", &payload, &[], Duration::ZERO, &params);
        assert!(matches!(result, Err(GenerationError::EmptyResponse)));
        let paths: Vec<String> = server.requests().into_iter().map(|r| r.path).collect();
        assert_eq!(
            paths,
            vec![
                "/api/v2/generate/async",
                "/api/v2/generate/check/job-4",
                "/api/v2/generate/status/job-4",
            ]
        );
        Ok(())
    }
}
