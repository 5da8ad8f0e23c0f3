use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::thread;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use replica_contracts::events::EventWriter;
use replica_contracts::models::{Capability, ModelRegistry, ModelSelector};
use replica_contracts::runs::summary::{now_utc_iso, write_summary, RunSummary};
use replica_contracts::{PipelineInput, ReferenceFile};
use replica_engine::imaging::decode_reference;
use replica_engine::{build_services, Pipeline, PipelineConfig, Surveyor};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "replica", version, about = "Turn screenshots and instructions into UI code")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the full pipeline and write the generated files.
    Run(RunArgs),
    /// Survey one reference image and print its visual manifest.
    Survey(SurveyArgs),
    /// List the model registry.
    Models(ModelsArgs),
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long = "reference")]
    references: Vec<PathBuf>,
    #[arg(long, default_value = "")]
    instructions: String,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    current_code: Option<PathBuf>,
    /// JSON object passed through to code generation.
    #[arg(long)]
    app_context: Option<String>,
    #[arg(long)]
    events: Option<PathBuf>,
    /// Use the offline deterministic services.
    #[arg(long)]
    dryrun: bool,
    #[arg(long)]
    max_heal_iterations: Option<u32>,
    #[arg(long)]
    target_fidelity: Option<f64>,
    #[arg(long)]
    render_command: Option<String>,
}

#[derive(Debug, Parser)]
struct SurveyArgs {
    #[arg(long)]
    reference: PathBuf,
    #[arg(long)]
    dryrun: bool,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ModelsArgs {
    /// Only list models with this capability (vision, code, text, image).
    #[arg(long)]
    capability: Option<String>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("replica error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_pipeline(args),
        Command::Survey(args) => run_survey(args),
        Command::Models(args) => run_models(args),
    }
}

fn run_pipeline(args: RunArgs) -> Result<i32> {
    let mut config = PipelineConfig::from_env();
    if let Some(iterations) = args.max_heal_iterations {
        config.max_heal_iterations = iterations;
    }
    if let Some(target) = args.target_fidelity {
        config.target_fidelity = target.clamp(0.0, 100.0);
    }
    if args.render_command.is_some() {
        config.render_command = args.render_command.clone();
    }
    if config.asset_dir.is_none() {
        config.asset_dir = Some(args.out.join("assets"));
    }

    let input = PipelineInput {
        files: args
            .references
            .iter()
            .map(|path| read_reference(path))
            .collect::<Result<Vec<_>>>()?,
        instructions: args.instructions.clone(),
        current_code: match &args.current_code {
            Some(path) => Some(
                fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
            ),
            None => None,
        },
        app_context: args
            .app_context
            .as_deref()
            .map(parse_app_context)
            .transpose()?,
    };

    let services = build_services(&config, args.dryrun)?;
    let run_id = Uuid::new_v4().to_string();
    let started_at = now_utc_iso();
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let (events, rx) = EventWriter::jsonl_with_channel(&events_path, &run_id);
    let progress = thread::spawn(move || print_progress(rx));

    let pipeline = Pipeline::new(config, services, events);
    let outcome = pipeline.run(&input);
    drop(pipeline);
    let _ = progress.join();
    let result = outcome?;

    for file in &result.files {
        let path = output_path(&args.out, &file.path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, &file.content)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    write_json_value(&args.out.join("result.json"), &serde_json::to_value(&result)?)?;
    let summary = RunSummary::from_result(&run_id, &started_at, &result);
    let mut extra = Map::new();
    extra.insert(
        "out_dir".to_string(),
        Value::String(args.out.display().to_string()),
    );
    extra.insert(
        "events".to_string(),
        Value::String(events_path.display().to_string()),
    );
    write_summary(&args.out.join("summary.json"), &summary, Some(&extra))?;

    eprintln!(
        "{} run {}: {} file(s) in {}",
        result.strategy.mode.as_str(),
        run_id,
        result.files.len(),
        args.out.display()
    );
    if let Some(score) = result.fidelity {
        eprintln!("fidelity: {score:.2}");
    }
    for warning in &result.warnings {
        eprintln!("warning: {warning}");
    }
    Ok(0)
}

fn run_survey(args: SurveyArgs) -> Result<i32> {
    let config = PipelineConfig::from_env();
    let services = build_services(&config, args.dryrun)?;
    let file = read_reference(&args.reference)?;
    if !file.is_image() {
        bail!("{} is not an image", args.reference.display());
    }
    let bytes = decode_reference(&file)?;
    let model = vision_model(&config, services.vision.name())?;
    let events = match &args.events {
        Some(path) => EventWriter::jsonl(path, Uuid::new_v4().to_string()),
        None => EventWriter::new(Uuid::new_v4().to_string()),
    };
    let outcome = Surveyor::new(services.vision.as_ref(), &model, &config, &events)
        .survey_layout(0, &file, &bytes);
    for warning in &outcome.warnings {
        eprintln!("warning: {warning}");
    }
    println!("{}", serde_json::to_string_pretty(&outcome.manifest)?);
    Ok(0)
}

fn run_models(args: ModelsArgs) -> Result<i32> {
    let capability = args.capability.as_deref().map(parse_capability).transpose()?;
    let registry = ModelRegistry::new(None);
    for model in registry.list() {
        if capability.is_some_and(|capability| !model.supports(capability)) {
            continue;
        }
        let capabilities: Vec<&str> = model
            .capabilities
            .iter()
            .map(|capability| capability.as_str())
            .collect();
        let context = model
            .context_window
            .map(|tokens| format!("{tokens} tokens"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<28} {:<8} {:<20} {}",
            model.name,
            model.provider,
            capabilities.join(","),
            context
        );
    }
    Ok(0)
}

/// Mirrors stage progress to stderr until the writer is dropped.
fn print_progress(rx: Receiver<Value>) {
    for event in rx {
        let stage = event.get("stage").and_then(Value::as_str).unwrap_or("");
        match event.get("type").and_then(Value::as_str).unwrap_or("") {
            "route_selected" => eprintln!(
                "route: {}",
                event.get("mode").and_then(Value::as_str).unwrap_or("?")
            ),
            "stage_finished" => eprintln!(
                "{stage}: done in {}ms",
                event.get("elapsed_ms").and_then(Value::as_u64).unwrap_or(0)
            ),
            "stage_skipped" => eprintln!(
                "{stage}: skipped ({})",
                event.get("reason").and_then(Value::as_str).unwrap_or("")
            ),
            "healing_iteration" => eprintln!(
                "healing: score {:.2} ({})",
                event.get("score").and_then(Value::as_f64).unwrap_or(0.0),
                event.get("decision").and_then(Value::as_str).unwrap_or("")
            ),
            _ => {}
        }
    }
}

fn vision_model(config: &PipelineConfig, provider: &str) -> Result<String> {
    let registry = ModelRegistry::new(None);
    if registry
        .by_capability(Capability::Vision, Some(provider))
        .is_empty()
    {
        return Ok(config
            .vision_model
            .clone()
            .unwrap_or_else(|| provider.to_string()));
    }
    let selection = ModelSelector::new(Some(registry)).select(
        config.vision_model.as_deref(),
        Capability::Vision,
        Some(provider),
    )?;
    if let Some(reason) = selection.fallback_reason {
        eprintln!("warning: {reason} Using '{}'.", selection.model.name);
    }
    Ok(selection.model.name)
}

fn parse_capability(raw: &str) -> Result<Capability> {
    Ok(match raw.trim().to_ascii_lowercase().as_str() {
        "vision" => Capability::Vision,
        "code" => Capability::Code,
        "text" => Capability::Text,
        "image" => Capability::Image,
        other => bail!("unknown capability '{other}' (expected vision, code, text or image)"),
    })
}

fn read_reference(path: &Path) -> Result<ReferenceFile> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(ReferenceFile {
        base64: BASE64.encode(bytes),
        mime_type: guess_mime(path).to_string(),
        filename: path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string(),
    })
}

fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        _ => "image/png",
    }
}

fn parse_app_context(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw).context("--app-context is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("--app-context must be a JSON object, got {}", json_kind(&other)),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Joins a generated file path under `out`, refusing anything that would
/// escape it.
fn output_path(out: &Path, relative: &str) -> Result<PathBuf> {
    let candidate = Path::new(relative.trim());
    let mut path = out.to_path_buf();
    let mut depth = 0usize;
    for component in candidate.components() {
        match component {
            Component::Normal(part) => {
                path.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            _ => bail!("refusing to write generated file outside the output dir: {relative}"),
        }
    }
    if depth == 0 {
        bail!("generated file has an empty path");
    }
    Ok(path)
}

fn write_json_value(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}
