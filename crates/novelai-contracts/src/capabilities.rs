//! Sampler, scheduler and model tables, plus the per-backend capability
//! table that decides which command flags a backend honors.

use crate::config::BackendKind;

pub type SamplerTable = &'static [(&'static str, &'static str)];

pub const NAI_SAMPLERS: SamplerTable = &[
    ("k_euler_a", "Euler ancestral"),
    ("k_euler", "Euler"),
    ("k_lms", "LMS"),
    ("ddim", "DDIM"),
    ("plms", "PLMS"),
];

pub const NAI3_SAMPLERS: SamplerTable = &[
    ("k_euler", "Euler"),
    ("k_euler_ancestral", "Euler ancestral"),
    ("k_dpmpp_2s_ancestral", "DPM++ 2S ancestral"),
    ("k_dpmpp_2m", "DPM++ 2M"),
    ("k_dpmpp_sde", "DPM++ SDE"),
    ("ddim_v3", "DDIM V3"),
];

pub const SD_SAMPLERS: SamplerTable = &[
    ("k_euler_a", "Euler a"),
    ("k_euler", "Euler"),
    ("k_lms", "LMS"),
    ("k_heun", "Heun"),
    ("k_dpm_2", "DPM2"),
    ("k_dpm_2_a", "DPM2 a"),
    ("k_dpmpp_2s_a", "DPM++ 2S a"),
    ("k_dpmpp_2m", "DPM++ 2M"),
    ("k_dpmpp_sde", "DPM++ SDE"),
    ("k_dpmpp_2m_sde", "DPM++ 2M SDE"),
    ("k_dpm_fast", "DPM fast"),
    ("k_dpm_ad", "DPM adaptive"),
    ("k_lms_ka", "LMS Karras"),
    ("k_dpm_2_ka", "DPM2 Karras"),
    ("k_dpm_2_a_ka", "DPM2 a Karras"),
    ("k_dpmpp_2s_a_ka", "DPM++ 2S a Karras"),
    ("k_dpmpp_2m_ka", "DPM++ 2M Karras"),
    ("k_dpmpp_sde_ka", "DPM++ SDE Karras"),
    ("k_dpmpp_2m_sde_ka", "DPM++ 2M SDE Karras"),
    ("ddim", "DDIM"),
    ("plms", "PLMS"),
    ("unipc", "UniPC"),
];

pub const HORDE_SAMPLERS: SamplerTable = &[
    ("k_lms", "LMS"),
    ("k_heun", "Heun"),
    ("k_euler", "Euler"),
    ("k_euler_a", "Euler a"),
    ("k_dpm_2", "DPM2"),
    ("k_dpm_2_a", "DPM2 a"),
    ("k_dpm_fast", "DPM fast"),
    ("k_dpm_adaptive", "DPM adaptive"),
    ("k_dpmpp_2m", "DPM++ 2M"),
    ("k_dpmpp_2s_a", "DPM++ 2S a"),
    ("k_dpmpp_sde", "DPM++ SDE"),
    ("DDIM", "DDIM"),
    ("k_lms_ka", "LMS Karras"),
    ("k_heun_ka", "Heun Karras"),
    ("k_euler_ka", "Euler Karras"),
    ("k_euler_a_ka", "Euler a Karras"),
    ("k_dpm_2_ka", "DPM2 Karras"),
    ("k_dpm_2_a_ka", "DPM2 a Karras"),
    ("k_dpm_fast_ka", "DPM fast Karras"),
    ("k_dpm_adaptive_ka", "DPM adaptive Karras"),
    ("k_dpmpp_2m_ka", "DPM++ 2M Karras"),
    ("k_dpmpp_2s_a_ka", "DPM++ 2S a Karras"),
    ("k_dpmpp_sde_ka", "DPM++ SDE Karras"),
    ("DDIM_ka", "DDIM Karras"),
];

pub const COMFYUI_SAMPLERS: SamplerTable = &[
    ("euler", "Euler"),
    ("euler_ancestral", "Euler ancestral"),
    ("heun", "Heun"),
    ("dpm_2", "DPM2"),
    ("dpm_2_ancestral", "DPM2 ancestral"),
    ("lms", "LMS"),
    ("dpm_fast", "DPM fast"),
    ("dpm_adaptive", "DPM adaptive"),
    ("dpmpp_2s_ancestral", "DPM++ 2S ancestral"),
    ("dpmpp_sde", "DPM++ SDE"),
    ("dpmpp_2m", "DPM++ 2M"),
    ("dpmpp_2m_sde", "DPM++ 2M SDE"),
    ("ddim", "DDIM"),
    ("uni_pc", "UniPC"),
];

pub const NAI_SCHEDULERS: &[&str] = &["native", "karras", "exponential", "polyexponential"];
pub const SD_SCHEDULERS: &[&str] = &[
    "Automatic",
    "Uniform",
    "Karras",
    "Exponential",
    "Polyexponential",
    "SGM Uniform",
];
pub const HORDE_SCHEDULERS: &[&str] = &["karras"];
pub const COMFYUI_SCHEDULERS: &[&str] = &[
    "normal",
    "karras",
    "exponential",
    "sgm_uniform",
    "simple",
    "ddim_uniform",
];

/// Short model names accepted by `-m` for NovelAI, and their API ids.
pub const NAI_MODELS: &[(&str, &str)] = &[
    ("safe", "safe-diffusion"),
    ("nai", "nai-diffusion"),
    ("furry", "nai-diffusion-furry"),
    ("nai-v3", "nai-diffusion-3"),
];

pub const NAI_V3_MODEL: &str = "nai-diffusion-3";

/// What a backend supports. Flags a backend does not support are not
/// registered for it at all.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub samplers: SamplerTable,
    pub schedulers: &'static [&'static str],
    pub model: bool,
    pub enhance: bool,
    pub noise: bool,
    pub hires_fix: bool,
    pub smea: bool,
    pub decrisper: bool,
}

const NOVELAI_CAPABILITIES: Capabilities = Capabilities {
    samplers: NAI_SAMPLERS,
    schedulers: NAI_SCHEDULERS,
    model: true,
    enhance: true,
    noise: true,
    hires_fix: false,
    smea: true,
    decrisper: true,
};

const NAIFU_CAPABILITIES: Capabilities = Capabilities {
    samplers: NAI_SAMPLERS,
    schedulers: &[],
    model: false,
    enhance: false,
    noise: false,
    hires_fix: false,
    smea: false,
    decrisper: false,
};

const SD_WEBUI_CAPABILITIES: Capabilities = Capabilities {
    samplers: SD_SAMPLERS,
    schedulers: SD_SCHEDULERS,
    model: false,
    enhance: false,
    noise: false,
    hires_fix: true,
    smea: false,
    decrisper: false,
};

const STABLE_HORDE_CAPABILITIES: Capabilities = Capabilities {
    samplers: HORDE_SAMPLERS,
    schedulers: HORDE_SCHEDULERS,
    model: true,
    enhance: false,
    noise: false,
    hires_fix: true,
    smea: false,
    decrisper: false,
};

const COMFYUI_CAPABILITIES: Capabilities = Capabilities {
    samplers: COMFYUI_SAMPLERS,
    schedulers: COMFYUI_SCHEDULERS,
    model: true,
    enhance: false,
    noise: false,
    hires_fix: false,
    smea: false,
    decrisper: false,
};

impl BackendKind {
    pub fn capabilities(self) -> &'static Capabilities {
        match self {
            BackendKind::Token | BackendKind::Login => &NOVELAI_CAPABILITIES,
            BackendKind::Naifu => &NAIFU_CAPABILITIES,
            BackendKind::SdWebui => &SD_WEBUI_CAPABILITIES,
            BackendKind::StableHorde => &STABLE_HORDE_CAPABILITIES,
            BackendKind::Comfyui => &COMFYUI_CAPABILITIES,
        }
    }
}

pub fn lookup(table: SamplerTable, key: &str) -> Option<&'static str> {
    table
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, label)| *label)
}

pub fn resolve_nai_model(short: &str) -> Option<&'static str> {
    NAI_MODELS
        .iter()
        .find(|(name, id)| *name == short || *id == short)
        .map(|(_, id)| *id)
}

/// Maps a WebUI-style sampler key onto the names NovelAI accepts.
pub fn sd_to_nai(sampler: &str, model: &str) -> &'static str {
    if sampler == "k_euler_a" {
        return "k_euler_ancestral";
    }
    if model == NAI_V3_MODEL {
        if let Some((name, _)) = NAI3_SAMPLERS.iter().find(|(name, _)| *name == sampler) {
            return name;
        }
    }
    NAI_SAMPLERS
        .iter()
        .find(|(name, _)| *name == sampler)
        .map(|(name, _)| *name)
        .unwrap_or("k_euler_ancestral")
}

/// Stable Horde expresses Karras sigmas as a flag, not as part of the
/// sampler name: `k_euler_a_ka` is sent as `k_euler_a` plus `karras`.
pub fn split_karras_suffix(sampler: &str) -> (&str, bool) {
    match sampler.strip_suffix("_ka") {
        Some(base) if !base.is_empty() => (base, true),
        _ => (sampler, false),
    }
}

/// ComfyUI sampler names drop the `k_` prefix and spell out `ancestral`.
pub fn comfyui_sampler(sampler: &str) -> String {
    if lookup(COMFYUI_SAMPLERS, sampler).is_some() {
        return sampler.to_string();
    }
    let (base, _) = split_karras_suffix(sampler);
    let base = base.strip_prefix("k_").unwrap_or(base);
    match base.strip_suffix("_a") {
        Some(stem) => format!("{stem}_ancestral"),
        None => base.to_string(),
    }
}
