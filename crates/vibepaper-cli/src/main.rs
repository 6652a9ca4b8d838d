use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use clap::{ArgAction, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vibepaper_contracts::events::EventWriter;
use vibepaper_contracts::models::{Fallback, ModelSelector, CAPABILITY_IMAGE};
use vibepaper_contracts::{AspectRatio, FileStorage, HistoryStore, Quality, WallpaperVariation};
use vibepaper_engine::{
    default_capability_registry, export_variation, new_session_id, BatchError, BatchOutcome,
    CredentialGate, EngineConfig, Orchestrator, Session, StaticCredentialGate,
};

#[derive(Debug, Parser)]
#[command(name = "vibepaper", version, about = "Generate phone wallpapers, four at a time")]
struct Cli {
    /// Directory holding history and the event log (default: .vibepaper)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Image model to request; falls back to the registry default
    #[arg(long, global = true)]
    model: Option<String>,
    /// Verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one batch of four variations
    Generate(GenerateArgs),
    /// List saved variations, newest first
    History(HistoryArgs),
    /// Delete all saved variations
    ClearHistory(ClearHistoryArgs),
    /// Write one saved variation to disk
    Export(ExportArgs),
    /// List known image models
    Models,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    /// Prompt text; defaults to the remix source's prompt with --remix
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long, default_value = "9:16")]
    aspect_ratio: AspectRatio,
    #[arg(long, default_value = "2K")]
    quality: Quality,
    /// Id of a saved variation to use as the visual reference
    #[arg(long)]
    remix: Option<String>,
    /// Where to write the images (default: <data-dir>/wallpapers)
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct HistoryArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Debug, Parser)]
struct ClearHistoryArgs {
    #[arg(long)]
    yes: bool,
}

#[derive(Debug, Parser)]
struct ExportArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    out: PathBuf,
}

const PROMPT_PREVIEW_CHARS: usize = 60;

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        // Output piped into something that stopped reading, e.g. `| head`.
        Err(err) if is_broken_pipe(&err) => std::process::exit(0),
        Err(err) => {
            eprintln!("vibepaper error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = EngineConfig::from_env()
        .with_data_dir(cli.data_dir.clone())
        .with_image_model(cli.model.clone());
    match cli.command {
        Command::Generate(args) => run_generate(&config, args),
        Command::History(args) => run_history(&config, args),
        Command::ClearHistory(args) => run_clear_history(&config, args),
        Command::Export(args) => run_export(&config, args),
        Command::Models => run_models(&config),
    }
}

fn is_broken_pipe(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|io_err| io_err.kind() == io::ErrorKind::BrokenPipe)
    })
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

/// Credential gate that asks on the terminal when a key is needed.
struct TerminalCredentialGate {
    inner: StaticCredentialGate,
}

impl TerminalCredentialGate {
    fn from_env() -> Self {
        Self {
            inner: StaticCredentialGate::from_env(),
        }
    }
}

impl CredentialGate for TerminalCredentialGate {
    fn has_valid_credential(&self) -> bool {
        self.inner.has_valid_credential()
    }

    fn api_key(&self) -> Option<String> {
        self.inner.api_key()
    }

    fn request_credential_selection(&self) -> Result<()> {
        let mut stderr = io::stderr();
        write!(stderr, "Gemini API key: ")?;
        stderr.flush()?;
        let key = read_key(&mut io::stdin().lock())?;
        if !self.inner.select_key(&key) {
            bail!("no API key entered");
        }
        Ok(())
    }

    fn invalidate(&self) {
        self.inner.invalidate();
    }
}

fn read_key(reader: &mut impl BufRead) -> Result<String> {
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .context("failed to read API key from stdin")?;
    Ok(line.trim().to_string())
}

fn open_session(
    config: &EngineConfig,
    capability: &str,
) -> Result<(Session<FileStorage>, Arc<TerminalCredentialGate>)> {
    let selection = ModelSelector::default().select(config.image_model.as_deref(), capability)?;
    if let Some(fallback @ Fallback::Unavailable { .. }) = &selection.fallback {
        warn!(model = %selection.model.name, "{fallback}");
    }

    let gate = Arc::new(TerminalCredentialGate::from_env());
    let registry = default_capability_registry(config, &selection.model.name, gate.clone());
    let backend = registry.get(&selection.model.provider).with_context(|| {
        format!(
            "model '{}' names unknown capability '{}' (known: {})",
            selection.model.name,
            selection.model.provider,
            registry.names().join(", ")
        )
    })?;
    info!(model = %selection.model.name, capability = %backend.name(), "capability selected");

    let orchestrator = Arc::new(Orchestrator::new(backend, gate.clone()));
    let history = HistoryStore::new(FileStorage::new(&config.data_dir));
    let events = EventWriter::new(config.events_path(), new_session_id());
    Ok((Session::open(orchestrator, history, Some(events)), gate))
}

fn run_generate(config: &EngineConfig, args: GenerateArgs) -> Result<i32> {
    let blank_prompt = args
        .prompt
        .as_deref()
        .map_or(true, |prompt| prompt.trim().is_empty());
    // Without a remix source there is no other prompt to fall back to.
    if blank_prompt && args.remix.is_none() {
        eprintln!("Nothing to generate: the prompt is empty.");
        return Ok(2);
    }
    let capability = ModelSelector::capability_for(args.remix.is_some());
    let (mut session, gate) = open_session(config, capability)?;
    if let Some(id) = args.remix.as_deref() {
        session.remix(id)?;
    }
    if let Some(prompt) = args.prompt.filter(|prompt| !prompt.trim().is_empty()) {
        session.set_prompt(prompt);
    }
    session.set_aspect_ratio(args.aspect_ratio);
    session.set_quality(args.quality);

    let mut outcome = session.generate();
    if matches!(outcome, Err(BatchError::CredentialRequired)) {
        gate.request_credential_selection()?;
        outcome = session.generate();
    }

    match outcome {
        Ok(BatchOutcome::Completed(items)) => {
            let out_dir = args
                .out
                .unwrap_or_else(|| config.data_dir.join("wallpapers"));
            let mut out = io::stdout().lock();
            for item in &items {
                let path = export_variation(item, &out_dir)?;
                writeln!(out, "{}  {}", item.id, path.display())?;
            }
            Ok(0)
        }
        Ok(BatchOutcome::SkippedEmptyPrompt) => {
            eprintln!("Nothing to generate: the prompt is empty.");
            Ok(2)
        }
        Ok(BatchOutcome::RejectedBusy) => {
            eprintln!("A batch is already running.");
            Ok(2)
        }
        Err(err) => {
            eprintln!("{}", err.user_message());
            if let BatchError::GenerationFailed { source, .. } = &err {
                info!(error = %source, "first failure in batch");
            }
            Ok(1)
        }
    }
}

fn run_history(config: &EngineConfig, args: HistoryArgs) -> Result<i32> {
    let history = HistoryStore::open(FileStorage::new(&config.data_dir));
    let mut out = io::stdout().lock();
    if history.is_empty() {
        writeln!(out, "No saved wallpapers.")?;
        return Ok(0);
    }
    for item in history.items().iter().take(args.limit) {
        writeln!(out, "{}", history_line(item))?;
    }
    if history.len() > args.limit {
        writeln!(out, "({} more)", history.len() - args.limit)?;
    }
    Ok(0)
}

fn run_clear_history(config: &EngineConfig, args: ClearHistoryArgs) -> Result<i32> {
    if !args.yes {
        bail!("refusing to clear history without --yes");
    }
    let (mut session, _) = open_session(config, CAPABILITY_IMAGE)?;
    let removed = session.history().len();
    session.clear_history()?;
    writeln!(io::stdout().lock(), "Removed {removed} saved wallpapers.")?;
    Ok(0)
}

fn run_export(config: &EngineConfig, args: ExportArgs) -> Result<i32> {
    let history = HistoryStore::open(FileStorage::new(&config.data_dir));
    let item = history
        .find(&args.id)
        .with_context(|| format!("no saved wallpaper with id '{}'", args.id))?;
    let path = export_variation(item, &args.out)?;
    writeln!(io::stdout().lock(), "{}", path.display())?;
    Ok(0)
}

fn run_models(config: &EngineConfig) -> Result<i32> {
    let selector = ModelSelector::default();
    let active = selector.select(config.image_model.as_deref(), CAPABILITY_IMAGE)?;
    let mut out = io::stdout().lock();
    for model in selector.registry.list() {
        let marker = if *model == active.model { "*" } else { " " };
        writeln!(
            out,
            "{marker} {:<30} {:<8} {}",
            model.name,
            model.provider,
            model.capabilities.join(",")
        )?;
    }
    Ok(0)
}

fn history_line(item: &WallpaperVariation) -> String {
    let created = DateTime::from_timestamp_millis(item.created_at)
        .map(|value| value.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}  {}  {:<5} {:<3} {}",
        item.id,
        created,
        item.aspect_ratio.tag(),
        item.quality.image_size(),
        preview(&item.prompt, PROMPT_PREVIEW_CHARS)
    )
}

fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut cut: String = flat.chars().take(max_chars.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}
