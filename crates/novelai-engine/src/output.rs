use novelai_contracts::config::OutputMode;
use novelai_contracts::media::ImageData;
use novelai_contracts::messages::Message;

/// What the service hands to the chat host.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text(String),
    Image(ImageData),
    /// A grouped message (forwarded-message card on most chat platforms).
    Figure(Vec<FigurePart>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FigurePart {
    Text(String),
    Image(ImageData),
}

impl From<Message> for Reply {
    fn from(message: Message) -> Self {
        Reply::Text(message.to_string())
    }
}

/// The parameters shown next to a generated image.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSummary {
    pub seed: u64,
    /// Only first-party NovelAI sessions report their model.
    pub model: Option<String>,
    pub sampler: String,
    pub steps: u32,
    pub scale: f64,
    /// `(strength, noise)` for img2img requests.
    pub img2img: Option<(f64, f64)>,
    pub prompt: String,
    pub negative_prompt: String,
}

pub fn render_result(mode: OutputMode, summary: &GenerationSummary, image: ImageData) -> Reply {
    if mode == OutputMode::Minimal {
        return Reply::Image(image);
    }

    let mut lines = vec![format!("seed = {}", summary.seed)];
    if mode == OutputMode::Verbose {
        if let Some(model) = &summary.model {
            lines.push(format!("model = {model}"));
        }
        lines.push(format!("sampler = {}", summary.sampler));
        lines.push(format!("steps = {}", summary.steps));
        lines.push(format!("scale = {}", summary.scale));
        if let Some((strength, noise)) = summary.img2img {
            lines.push(format!("strength = {strength}"));
            lines.push(format!("noise = {noise}"));
        }
    }

    let mut parts = vec![
        FigurePart::Text(lines.join("\n")),
        FigurePart::Text(format!("prompt = {}", summary.prompt)),
    ];
    if mode == OutputMode::Verbose {
        parts.push(FigurePart::Text(format!("undesired = {}", summary.negative_prompt)));
    }
    parts.push(FigurePart::Image(image));
    Reply::Figure(parts)
}
