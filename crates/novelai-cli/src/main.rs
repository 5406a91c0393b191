use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use novelai_contracts::chat::{parse_chat_line, ChatLine, CHAT_HELP_COMMANDS};
use novelai_contracts::config::SharedConfig;
use novelai_contracts::events::EventLog;
use novelai_contracts::media::ImageData;
use novelai_engine::{help_text, FigurePart, GenerationService, Reply, ReplySink, Session};

#[derive(Debug, Parser)]
#[command(name = "novelai-rs", version, about = "Chat-driven image generation against NovelAI-compatible backends")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive chat; each generate command runs on its own worker thread.
    Chat(ChatArgs),
    /// Runs a single command and exits.
    Run(RunArgs),
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    config: PathBuf,
    #[arg(long, default_value = "outputs")]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = "cli")]
    channel: String,
    #[arg(long, default_value = "cli-user")]
    user: String,
    #[arg(long, default_value_t = 1)]
    authority: u32,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    config: PathBuf,
    /// Command text, e.g. `novelai 1girl -r portrait`. A bare prompt is
    /// treated as a `novelai` command.
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value = "outputs")]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value_t = 1)]
    authority: u32,
    /// Let `<img src>` name a file on this machine.
    #[arg(long)]
    allow_local_images: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("novelai-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
        Command::Run(args) => run_once(args),
    }
}

fn build_service(config: &Path, events: Option<&Path>) -> Result<GenerationService> {
    let shared = SharedConfig::from_path(config)?;
    let snapshot = shared.snapshot();
    snapshot
        .validate()
        .with_context(|| format!("invalid config {}", config.display()))?;
    info!("using backend {}", snapshot.backend);
    let mut service = GenerationService::new(shared);
    if let Some(path) = events {
        let instance_id = format!("novelai-rs-{}", std::process::id());
        service = service.with_event_log(EventLog::new(path, instance_id));
    }
    Ok(service)
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let service = Arc::new(build_service(&args.config, args.events.as_deref())?);
    let sink = Arc::new(ConsoleSink::new(&args.out)?);
    let mut channel = args.channel.clone();
    let mut workers: Vec<JoinHandle<()>> = Vec::new();

    let stdin = io::stdin();
    let mut line = String::new();
    println!("novelai chat started. Type /help for commands.");

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        match parse_chat_line(line.trim_end_matches(['\n', '\r'])) {
            ChatLine::Noop => {}
            ChatLine::Generate { enhance, body } => {
                let session = Session {
                    user_id: args.user.clone(),
                    channel_id: channel.clone(),
                    authority: args.authority,
                };
                let service = Arc::clone(&service);
                let sink = Arc::clone(&sink);
                workers.retain(|worker| !worker.is_finished());
                workers.push(thread::spawn(move || {
                    if let Err(err) = service.handle(&session, &body, enhance, sink.as_ref()) {
                        warn!("could not deliver reply: {err:#}");
                    }
                }));
            }
            ChatLine::Meta { action, arg } => match action {
                "help" => {
                    println!("Commands: {}", CHAT_HELP_COMMANDS.join(" | "));
                    println!("{}", help_text(&service.config().snapshot()));
                }
                "reload" => match service.reload_config() {
                    Ok(change) if change.credentials_changed => {
                        println!("Config reloaded; credentials changed, token cache cleared.")
                    }
                    Ok(_) => println!("Config reloaded."),
                    Err(err) => println!("Reload failed: {err:#}"),
                },
                "set_channel" => {
                    if arg.trim().is_empty() {
                        println!("/channel requires an id");
                    } else {
                        channel = arg.trim().to_string();
                        println!("Channel set to {channel}");
                    }
                }
                "quit" => break,
                other => debug!("unhandled meta action {other}"),
            },
            ChatLine::Unknown { command, .. } => {
                println!("Unknown command /{command}. Type /help for commands.");
            }
            ChatLine::Chatter(text) => debug!("ignoring chatter: {text}"),
        }
    }

    for worker in workers {
        if worker.join().is_err() {
            warn!("a generation worker panicked");
        }
    }
    Ok(())
}

fn run_once(args: RunArgs) -> Result<i32> {
    let service = build_service(&args.config, args.events.as_deref())?
        .allow_local_images(args.allow_local_images);
    let sink = ConsoleSink::new(&args.out)?;
    let (enhance, body) = match parse_chat_line(&args.prompt) {
        ChatLine::Generate { enhance, body } => (enhance, body),
        _ => (false, args.prompt.clone()),
    };
    let session = Session {
        user_id: "cli-user".to_string(),
        channel_id: "cli".to_string(),
        authority: args.authority,
    };
    service.handle(&session, &body, enhance, &sink)?;
    Ok(if sink.images_written() > 0 { 0 } else { 1 })
}

/// Prints text replies and writes images into the output directory.
struct ConsoleSink {
    out_dir: PathBuf,
    next_message: AtomicUsize,
    images: AtomicUsize,
    stdout: Mutex<()>,
}

impl ConsoleSink {
    fn new(out_dir: &Path) -> Result<Self> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;
        Ok(Self {
            out_dir: out_dir.to_path_buf(),
            next_message: AtomicUsize::new(1),
            images: AtomicUsize::new(0),
            stdout: Mutex::new(()),
        })
    }

    fn images_written(&self) -> usize {
        self.images.load(Ordering::SeqCst)
    }

    fn message_id(&self) -> String {
        format!("msg-{}", self.next_message.fetch_add(1, Ordering::SeqCst))
    }

    fn write_image(&self, image: &ImageData) -> Result<PathBuf> {
        let index = self.images.fetch_add(1, Ordering::SeqCst) + 1;
        let path = self
            .out_dir
            .join(format!("novelai-{}-{index}.{}", std::process::id(), image.extension()));
        fs::write(&path, &image.bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    fn print(&self, text: &str) {
        let _guard = self.stdout.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        println!("{text}");
    }
}

impl ReplySink for ConsoleSink {
    fn send(&self, reply: Reply) -> Result<Vec<String>> {
        match reply {
            Reply::Text(text) => self.print(&text),
            Reply::Image(image) => {
                let path = self.write_image(&image)?;
                self.print(&format!("[image] {}", path.display()));
            }
            Reply::Figure(parts) => {
                for part in parts {
                    match part {
                        FigurePart::Text(text) => self.print(&text),
                        FigurePart::Image(image) => {
                            let path = self.write_image(&image)?;
                            self.print(&format!("[image] {}", path.display()));
                        }
                    }
                }
            }
        }
        Ok(vec![self.message_id()])
    }

    fn schedule_recall(&self, message_ids: Vec<String>, delay: Duration) {
        thread::spawn(move || {
            thread::sleep(delay);
            info!("recalled {}", message_ids.join(", "));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_writes_images_and_numbers_messages() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = ConsoleSink::new(&dir.path().join("out"))?;
        let first = sink.send(Reply::Text("Drawing, please wait...".to_string()))?;
        let second = sink.send(Reply::Figure(vec![
            FigurePart::Text("seed = 1".to_string()),
            FigurePart::Image(ImageData::new(b"\x89PNG".to_vec(), "image/png")),
        ]))?;
        assert_eq!(first, vec!["msg-1".to_string()]);
        assert_eq!(second, vec!["msg-2".to_string()]);
        assert_eq!(sink.images_written(), 1);

        let written: Vec<PathBuf> = fs::read_dir(dir.path().join("out"))?
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<io::Result<_>>()?;
        assert_eq!(written.len(), 1);
        assert_eq!(fs::read(&written[0])?, b"\x89PNG");
        assert_eq!(written[0].extension().and_then(|ext| ext.to_str()), Some("png"));
        Ok(())
    }

    #[test]
    fn service_requires_a_valid_config() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "type": "sd-webui" }"#)?;
        assert!(build_service(&path, None).is_err());

        fs::write(&path, r#"{ "type": "sd-webui", "endpoint": "http://127.0.0.1:7860" }"#)?;
        let service = build_service(&path, Some(&dir.path().join("events.jsonl")))?;
        assert!(help_text(&service.config().snapshot()).contains("--hires-fix"));
        Ok(())
    }
}
