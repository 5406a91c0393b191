//! The `novelai` command: validation, parameter assembly, admission and the
//! iteration loop.

use std::time::Duration;

use log::{debug, error, info, warn};
use novelai_contracts::capabilities::resolve_nai_model;
use novelai_contracts::chat::{option_help, parse_invocation, CommandOptions};
use novelai_contracts::config::{Config, ConfigChange, SharedConfig};
use novelai_contracts::events::{EventKind, EventLog, EventPayload};
use novelai_contracts::media::ImageData;
use novelai_contracts::messages::Message;
use novelai_contracts::prompt::normalize_prompt;
use novelai_contracts::resolution::{resize_input, Size};
use serde_json::{json, Value};

use crate::auth::TokenCache;
use crate::backends::{Backend, GenerationParams, NAI_DEFAULT_MODEL};
use crate::error::GenerationError;
use crate::gate::ConcurrencyGate;
use crate::input::{download, image_size};
use crate::output::{render_result, GenerationSummary, Reply};
use crate::transport::{with_retries, HttpTransport};

/// Enhance only accepts images generated at one of the standard sizes.
const ENHANCE_SIZE_SUM: u32 = 1280;
const ENHANCE_NOISE: f64 = 0.0;
const ENHANCE_STRENGTH: f64 = 0.2;
const IMG2IMG_NOISE: f64 = 0.2;

/// Who invoked the command and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub channel_id: String,
    pub authority: u32,
}

/// The chat host. `send` returns the ids of the messages it produced so they
/// can be recalled later.
pub trait ReplySink {
    fn send(&self, reply: Reply) -> anyhow::Result<Vec<String>>;
    fn schedule_recall(&self, message_ids: Vec<String>, delay: Duration);
}

pub trait Translator: Send + Sync {
    fn translate(&self, input: &str, target_lang: &str) -> anyhow::Result<String>;
}

pub fn help_text(config: &Config) -> String {
    let mut lines = vec![Message::Help.to_string()];
    lines.extend(
        option_help(config.backend.capabilities())
            .into_iter()
            .map(|line| format!("  {line}")),
    );
    lines.join("\n")
}

pub struct GenerationService {
    config: SharedConfig,
    gate: ConcurrencyGate,
    tokens: TokenCache,
    translator: Option<Box<dyn Translator>>,
    events: Option<EventLog>,
    allow_local_images: bool,
}

impl GenerationService {
    pub fn new(config: SharedConfig) -> Self {
        Self {
            config,
            gate: ConcurrencyGate::new(),
            tokens: TokenCache::new(),
            translator: None,
            events: None,
            allow_local_images: false,
        }
    }

    pub fn with_translator(mut self, translator: Box<dyn Translator>) -> Self {
        self.translator = Some(translator);
        self
    }

    pub fn with_event_log(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    /// Lets `<img src>` name a file on this host. Leave off for chat input.
    pub fn allow_local_images(mut self, allow: bool) -> Self {
        self.allow_local_images = allow;
        self
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// Re-reads the config file; a cached token is dropped when the backend
    /// type or any credential changed.
    pub fn reload_config(&self) -> anyhow::Result<ConfigChange> {
        let change = self.config.reload()?;
        if change.credentials_changed {
            self.tokens.invalidate();
        }
        self.emit(
            EventKind::ConfigReloaded,
            json!({ "credentials_changed": change.credentials_changed }),
        );
        Ok(change)
    }

    fn emit(&self, kind: EventKind, payload: Value) {
        let Some(events) = &self.events else {
            return;
        };
        let payload: EventPayload = match payload {
            Value::Object(map) => map,
            _ => EventPayload::new(),
        };
        if let Err(err) = events.emit(kind, payload) {
            warn!("failed to write {} event: {err:#}", kind.as_str());
        }
    }

    /// Runs one `novelai` invocation. Every outcome ends in a reply; the only
    /// error returned is a sink that cannot deliver one.
    pub fn handle(
        &self,
        session: &Session,
        body: &str,
        enhance: bool,
        sink: &dyn ReplySink,
    ) -> anyhow::Result<()> {
        let config = self.config.snapshot();
        self.emit(
            EventKind::CommandReceived,
            json!({
                "user_id": session.user_id,
                "channel_id": session.channel_id,
                "backend": config.backend.as_str(),
            }),
        );
        let message = match self.run(session, &config, body, enhance, sink) {
            Ok(()) => return Ok(()),
            Err(err) if err.is_handled() => err.to_message(),
            Err(err) => {
                error!("novelai command from {} failed: {err:#}", session.user_id);
                Message::UnknownError
            }
        };
        sink.send(Reply::from(message))?;
        Ok(())
    }

    fn run(
        &self,
        session: &Session,
        config: &Config,
        body: &str,
        enhance: bool,
        sink: &dyn ReplySink,
    ) -> Result<(), GenerationError> {
        let capabilities = config.backend.capabilities();
        let invocation = parse_invocation(body, config).map_err(Message::from)?;
        let mut input = invocation.input;
        let mut images = invocation.images;
        let mut options = invocation.options;
        if enhance {
            if !capabilities.enhance {
                return Err(Message::UnknownOption("-e".to_string()).into());
            }
            options.enhance = true;
        }

        if config.default_prompt_enabled {
            if session.authority < config.auth_level_default {
                return Err(Message::LowAuthority.into());
            }
            if session.authority < config.auth_level {
                input.clear();
                images.clear();
                options = options.resolution_only();
            }
        } else if session.authority < config.auth_level {
            return Err(Message::LowAuthority.into());
        }

        let has_input = !input.trim().is_empty() || !images.is_empty();
        if !has_input && !config.default_prompt_enabled {
            sink.send(Reply::Text(help_text(config)))?;
            return Ok(());
        }

        let restricted = config.is_restricted();
        if restricted && options.resolution.is_some_and(|size| size.custom) {
            return Err(Message::CustomResolutionUnsupported.into());
        }

        let iterations = options.iterations.unwrap_or(1);
        let batch = options.batch.unwrap_or(1);
        if iterations.saturating_mul(batch) > config.max_iterations {
            return Err(Message::ExceedMaxIteration(config.max_iterations).into());
        }

        let source = select_source_image(config, restricted, has_input, &input, images, &mut options)?;

        if has_input
            && config.translator
            && !options.no_translator
            && !input.trim().is_empty()
        {
            if let Some(translator) = &self.translator {
                match translator.translate(&input, "en") {
                    Ok(translated) => input = translated,
                    Err(err) => warn!("translation failed, using the original input: {err:#}"),
                }
            }
        }

        let prompt = normalize_prompt(&input, config, options.override_defaults).map_err(Message::from)?;

        let transport = HttpTransport::from_config(config)?;
        let token = self.tokens.get(config, &transport)?;
        let backend = Backend::from_config(config);

        let mut params = build_params(config, &options, prompt.positive, prompt.negative, batch);
        let model_label = (!config.backend.is_third_party())
            .then(|| params.model.clone())
            .flatten();
        if let Some(source) = source {
            let image = download(&transport, &source, self.allow_local_images)?;
            apply_source_image(config, &options, &mut params, image)?;
        } else {
            let size = options.resolution.unwrap_or_else(|| config.resolution.size());
            params.width = size.width;
            params.height = size.height;
        }
        if params.hires_fix && params.strength.is_none() {
            params.strength = Some(config.strength);
        }

        let mut tasks = self
            .gate
            .admit(&session.channel_id, iterations as usize, config.max_concurrency)
            .map_err(|_| Message::ConcurrentJobs)?;
        let running = self.gate.global_len();
        sink.send(Reply::from(if running > 0 {
            Message::Pending(running)
        } else {
            Message::Waiting
        }))?;
        self.emit(
            EventKind::TaskAdmitted,
            json!({ "channel_id": session.channel_id, "tasks": tasks.len() }),
        );
        if tasks.enter_global(config.global_concurrency) {
            self.emit(EventKind::TaskPromoted, json!({ "channel_id": session.channel_id }));
        }

        let label = format!("{} generation", backend.kind());
        let output = options.output.unwrap_or(config.output);
        while !tasks.is_empty() {
            let result = with_retries(config.max_retry_count, &label, |_| {
                backend.generate(&transport, token.as_deref(), &params)
            });
            match result {
                Ok(generated) => {
                    debug!("{}: {}", session.user_id, generated.final_prompt);
                    let summary = GenerationSummary {
                        seed: params.seed,
                        model: model_label.clone(),
                        sampler: params.sampler.clone(),
                        steps: params.steps,
                        scale: params.scale,
                        img2img: params
                            .image
                            .as_ref()
                            .map(|_| (params.strength.unwrap_or_default(), params.noise.unwrap_or_default())),
                        prompt: generated.final_prompt,
                        negative_prompt: params.negative_prompt.clone(),
                    };
                    let message_ids = sink.send(render_result(output, &summary, generated.image))?;
                    if let Some(delay) = config.recall_timeout() {
                        if !message_ids.is_empty() {
                            sink.schedule_recall(message_ids, delay);
                        }
                    }
                    self.emit(
                        EventKind::ImageGenerated,
                        json!({ "channel_id": session.channel_id, "seed": params.seed }),
                    );
                }
                Err(err) if err.is_handled() => {
                    info!("generation for {} failed: {err}", session.user_id);
                    self.emit(
                        EventKind::GenerationFailed,
                        json!({ "channel_id": session.channel_id, "error": err.to_message().key() }),
                    );
                    sink.send(Reply::from(err.to_message()))?;
                }
                Err(err) => return Err(err),
            }
            if let Some(token) = tasks.release_next() {
                self.emit(EventKind::TaskReleased, json!({ "task": token }));
            }
            params.seed = params.seed.wrapping_add(1);
        }
        Ok(())
    }
}

fn build_params(
    config: &Config,
    options: &CommandOptions,
    prompt: String,
    negative_prompt: String,
    batch: u32,
) -> GenerationParams {
    let requested_model = options.model.clone().or_else(|| config.model.clone());
    let model = if config.backend.is_third_party() {
        requested_model
    } else {
        let model = requested_model
            .as_deref()
            .and_then(resolve_nai_model)
            .unwrap_or(NAI_DEFAULT_MODEL);
        Some(model.to_string())
    };
    GenerationParams {
        prompt,
        negative_prompt,
        seed: options
            .seed
            .unwrap_or_else(|| u64::from(rand::random::<u32>())),
        width: 0,
        height: 0,
        steps: options.steps.unwrap_or(config.text_steps),
        scale: options.scale.unwrap_or(config.scale),
        sampler: options.sampler.clone().unwrap_or_else(|| config.sampler.clone()),
        scheduler: options.scheduler.clone().or_else(|| config.scheduler.clone()),
        batch,
        model,
        image: None,
        strength: options.strength,
        noise: options.noise,
        hires_fix: options.hires_fix || config.hires_fix,
        restore_faces: config.restore_faces,
        smea: options.smea || config.smea,
        smea_dyn: options.smea_dyn || config.smea_dyn,
        decrisper: options.decrisper || config.decrisper,
    }
}

/// Applies the image rules and returns the image source to download, if any.
/// Restricted sessions and default-prompt runs lose the costly options.
fn select_source_image(
    config: &Config,
    restricted: bool,
    has_input: bool,
    input: &str,
    images: Vec<String>,
    options: &mut CommandOptions,
) -> Result<Option<String>, GenerationError> {
    let mut source = None;
    if !restricted && has_input {
        if !images.is_empty() && !config.features.image {
            return Err(Message::InvalidContent.into());
        }
        if images.len() > 1 {
            return Err(Message::TooManyImages.into());
        }
        source = images.into_iter().next();
        if options.enhance && source.is_none() {
            return Err(Message::ExpectImage.into());
        }
        if input.trim().is_empty() && config.base_prompt.trim().is_empty() {
            return Err(Message::ExpectPrompt.into());
        }
    } else {
        if !images.is_empty() {
            return Err(Message::InvalidContent.into());
        }
        options.enhance = false;
        options.steps = None;
        options.noise = None;
        options.strength = None;
        options.override_defaults = false;
    }
    if !config.features.text && source.is_none() {
        return Err(Message::ExpectImage.into());
    }
    Ok(source)
}

fn apply_source_image(
    config: &Config,
    options: &CommandOptions,
    params: &mut GenerationParams,
    image: ImageData,
) -> Result<(), GenerationError> {
    let input_size = image_size(&image)?;
    params.steps = options.steps.unwrap_or(config.image_steps);
    let size = if options.enhance {
        if input_size.width + input_size.height != ENHANCE_SIZE_SUM {
            return Err(Message::InvalidSize.into());
        }
        params.noise = Some(options.noise.unwrap_or(ENHANCE_NOISE));
        params.strength = Some(options.strength.unwrap_or(ENHANCE_STRENGTH));
        Size::new(input_size.width * 3 / 2, input_size.height * 3 / 2)
    } else {
        params.noise = Some(options.noise.unwrap_or(IMG2IMG_NOISE));
        params.strength = Some(options.strength.unwrap_or(config.strength));
        options.resolution.unwrap_or_else(|| resize_input(input_size))
    };
    params.width = size.width;
    params.height = size.height;
    params.image = Some(image);
    Ok(())
}
