use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

use crate::resolution::Size;

/// NovelAI's own undesired-content preset, appended to every negative prompt
/// unless the config replaces it.
pub const UC_PRESET: &str = "nsfw, lowres, {bad}, error, fewer, extra, missing, worst quality, \
jpeg artifacts, bad quality, watermark, unfinished, displeasing, \
chromatic aberration, signature, extra digits, artistic error, username, scan, [abstract]";

pub const DEFAULT_BASE_PROMPT: &str = "masterpiece, best quality";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    Token,
    Login,
    Naifu,
    SdWebui,
    StableHorde,
    Comfyui,
}

impl BackendKind {
    pub const ALL: [BackendKind; 6] = [
        BackendKind::Token,
        BackendKind::Login,
        BackendKind::Naifu,
        BackendKind::SdWebui,
        BackendKind::StableHorde,
        BackendKind::Comfyui,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Token => "token",
            BackendKind::Login => "login",
            BackendKind::Naifu => "naifu",
            BackendKind::SdWebui => "sd-webui",
            BackendKind::StableHorde => "stable-horde",
            BackendKind::Comfyui => "comfyui",
        }
    }

    /// Anything that is not NovelAI's first-party API.
    pub fn is_third_party(self) -> bool {
        !matches!(self, BackendKind::Token | BackendKind::Login)
    }

    /// SD-WebUI reads `()` as emphasis; every other backend reads `{}`.
    pub fn uses_paren_emphasis(self) -> bool {
        matches!(self, BackendKind::SdWebui)
    }

    pub fn default_endpoint(self) -> Option<&'static str> {
        match self {
            BackendKind::Token | BackendKind::Login => Some("https://api.novelai.net"),
            BackendKind::StableHorde => Some("https://stablehorde.net/"),
            BackendKind::Naifu | BackendKind::SdWebui | BackendKind::Comfyui => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        BackendKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown backend type '{raw}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orient {
    #[default]
    Portrait,
    Landscape,
    Square,
}

impl Orient {
    pub fn size(self) -> Size {
        match self {
            Orient::Portrait => Size::new(512, 768),
            Orient::Landscape => Size::new(768, 512),
            Orient::Square => Size::new(640, 640),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "portrait" => Some(Orient::Portrait),
            "landscape" => Some(Orient::Landscape),
            "square" => Some(Orient::Square),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResolutionSetting {
    Orient(Orient),
    Custom { width: u32, height: u32 },
}

impl Default for ResolutionSetting {
    fn default() -> Self {
        ResolutionSetting::Orient(Orient::Portrait)
    }
}

impl ResolutionSetting {
    pub fn size(self) -> Size {
        match self {
            ResolutionSetting::Orient(orient) => orient.size(),
            ResolutionSetting::Custom { width, height } => Size::new(width, height),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    Before,
    #[default]
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    Minimal,
    #[default]
    #[serde(rename = "default")]
    Standard,
    Verbose,
}

impl OutputMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "minimal" => Some(OutputMode::Minimal),
            "default" => Some(OutputMode::Standard),
            "verbose" => Some(OutputMode::Verbose),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NsfwPolicy {
    Disallow,
    Censor,
    #[default]
    Allow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// Whether NovelAI sessions may spend anlas on costly options.
    pub anlas: bool,
    pub text: bool,
    pub image: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            anlas: true,
            text: true,
            image: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    #[serde(rename = "type")]
    pub backend: BackendKind,
    pub token: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub endpoint: Option<String>,
    pub headers: BTreeMap<String, String>,

    #[serde(rename = "authLv")]
    pub auth_level: u32,
    #[serde(rename = "authLvDefault")]
    pub auth_level_default: u32,

    pub output: OutputMode,
    pub features: FeatureFlags,
    pub nsfw: NsfwPolicy,
    pub trusted_workers: bool,
    pub poll_interval: u64,

    pub model: Option<String>,
    pub sampler: String,
    pub scheduler: Option<String>,
    pub restore_faces: bool,
    pub hires_fix: bool,
    pub decrisper: bool,
    pub smea: bool,
    pub smea_dyn: bool,
    pub scale: f64,
    pub text_steps: u32,
    pub image_steps: u32,
    pub max_steps: u32,
    pub strength: f64,
    pub resolution: ResolutionSetting,
    pub max_resolution: u32,

    pub base_prompt: String,
    pub negative_prompt: String,
    pub forbidden: String,
    #[serde(rename = "defaultPromptSw")]
    pub default_prompt_enabled: bool,
    pub default_prompt: String,
    pub placement: Placement,
    pub translator: bool,
    pub latin_only: bool,
    pub lower_case: bool,
    pub max_words: usize,

    pub max_iterations: u32,
    pub max_retry_count: u32,
    pub request_timeout: u64,
    pub recall_timeout: u64,
    pub max_concurrency: usize,
    pub global_concurrency: usize,

    #[serde(rename = "workflowText2Image")]
    pub workflow_text_to_image: Option<PathBuf>,
    #[serde(rename = "workflowImage2Image")]
    pub workflow_image_to_image: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::Token,
            token: None,
            email: None,
            password: None,
            endpoint: None,
            headers: BTreeMap::new(),
            auth_level: 0,
            auth_level_default: 0,
            output: OutputMode::Standard,
            features: FeatureFlags::default(),
            nsfw: NsfwPolicy::Allow,
            trusted_workers: false,
            poll_interval: 1_000,
            model: None,
            sampler: "k_euler_a".to_string(),
            scheduler: None,
            restore_faces: false,
            hires_fix: false,
            decrisper: false,
            smea: false,
            smea_dyn: false,
            scale: 11.0,
            text_steps: 28,
            image_steps: 50,
            max_steps: 64,
            strength: 0.7,
            resolution: ResolutionSetting::default(),
            max_resolution: 1024,
            base_prompt: DEFAULT_BASE_PROMPT.to_string(),
            negative_prompt: UC_PRESET.to_string(),
            forbidden: String::new(),
            default_prompt_enabled: false,
            default_prompt: String::new(),
            placement: Placement::After,
            translator: true,
            latin_only: false,
            lower_case: true,
            max_words: 0,
            max_iterations: 1,
            max_retry_count: 3,
            request_timeout: 60_000,
            recall_timeout: 0,
            max_concurrency: 0,
            global_concurrency: 0,
            workflow_text_to_image: None,
            workflow_image_to_image: None,
        }
    }
}

impl Config {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(raw).context("invalid config JSON")?;
        Ok(config)
    }

    /// Reads a JSON config file and layers the `NOVELAI_*` environment
    /// variables on top of it.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        let mut config = Self::from_json_str(&raw)
            .with_context(|| format!("failed parsing config {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(token) = non_empty_env("NOVELAI_TOKEN") {
            self.token = Some(token);
        }
        if let Some(email) = non_empty_env("NOVELAI_EMAIL") {
            self.email = Some(email);
        }
        if let Some(password) = non_empty_env("NOVELAI_PASSWORD") {
            self.password = Some(password);
        }
        if let Some(endpoint) = non_empty_env("NOVELAI_ENDPOINT") {
            self.endpoint = Some(endpoint);
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.backend {
            BackendKind::Token if self.token.as_deref().map(str::trim).unwrap_or("").is_empty() => {
                bail!("backend 'token' requires a token")
            }
            BackendKind::Login
                if self.email.as_deref().unwrap_or("").trim().is_empty()
                    || self.password.as_deref().unwrap_or("").is_empty() =>
            {
                bail!("backend 'login' requires email and password")
            }
            BackendKind::Naifu | BackendKind::SdWebui | BackendKind::Comfyui
                if self.endpoint().is_none() =>
            {
                bail!("backend '{}' requires an endpoint", self.backend)
            }
            _ => Ok(()),
        }
    }

    /// Configured endpoint (or the backend default) without trailing slashes.
    pub fn endpoint(&self) -> Option<String> {
        self.endpoint
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .or_else(|| self.backend.default_endpoint())
            .map(|value| value.trim_end_matches('/').to_string())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout.max(1))
    }

    pub fn recall_timeout(&self) -> Option<Duration> {
        (self.recall_timeout > 0).then(|| Duration::from_millis(self.recall_timeout))
    }

    /// A NovelAI session that may not spend anlas.
    pub fn is_restricted(&self) -> bool {
        !self.backend.is_third_party() && !self.features.anlas
    }

    pub fn credentials_changed(&self, other: &Config) -> bool {
        self.backend != other.backend
            || self.token != other.token
            || self.email != other.email
            || self.password != other.password
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigChange {
    pub credentials_changed: bool,
}

/// Process-wide config that the host may swap at runtime. Readers take an
/// `Arc` snapshot at the start of a command and keep it for that command.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<SharedConfigInner>,
}

#[derive(Debug)]
struct SharedConfigInner {
    path: Option<PathBuf>,
    current: RwLock<Arc<Config>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(SharedConfigInner {
                path: None,
                current: RwLock::new(Arc::new(config)),
            }),
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = Config::load(&path)?;
        Ok(Self {
            inner: Arc::new(SharedConfigInner {
                path: Some(path),
                current: RwLock::new(Arc::new(config)),
            }),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn snapshot(&self) -> Arc<Config> {
        let guard = self
            .inner
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    pub fn replace(&self, config: Config) -> ConfigChange {
        let mut guard = self
            .inner
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let change = ConfigChange {
            credentials_changed: guard.credentials_changed(&config),
        };
        *guard = Arc::new(config);
        change
    }

    pub fn reload(&self) -> Result<ConfigChange> {
        let Some(path) = self.inner.path.as_deref() else {
            bail!("config was not loaded from a file");
        };
        let config = Config::load(path)?;
        let change = self.replace(config);
        info!(
            "reloaded config from {} (credentials changed: {})",
            path.display(),
            change.credentials_changed
        );
        Ok(change)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
