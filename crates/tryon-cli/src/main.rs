use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use tryon_contracts::error::PipelineError;
use tryon_contracts::presets::PresetRegistry;
use tryon_engine::capability::{CancelToken, ImageData, SynthesisTier};
use tryon_engine::identity_lock::LockMode;
use tryon_engine::{TryOnEngine, TryOnRequest};

#[derive(Debug, Parser)]
#[command(name = "tryon-rs", version, about = "Photorealistic garment try-on generator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate a try-on image from a person photo and a garment reference.
    Generate(GenerateArgs),
    /// List the built-in scene presets.
    Presets,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    /// Photo of the person wearing their original outfit.
    #[arg(long)]
    person: PathBuf,
    /// Garment reference: a product shot or a photo of someone wearing it.
    #[arg(long)]
    garment: PathBuf,
    /// Run directory for the output image, attempt images, and trace.
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    preset: Option<String>,
    /// Free-form scene instruction appended to the prompt.
    #[arg(long)]
    instruction: Option<String>,
    /// Extra photos of the same person (repeatable).
    #[arg(long = "identity-ref")]
    identity_refs: Vec<PathBuf>,
    /// Accessory product shots to include (repeatable).
    #[arg(long = "accessory")]
    accessory_refs: Vec<PathBuf>,
    /// Output aspect ratio, e.g. 3:4.
    #[arg(long)]
    aspect: Option<String>,
    #[arg(long, default_value = "fast")]
    tier: String,
    #[arg(long = "lock-mode", default_value = "full-face")]
    lock_mode: String,
    #[arg(long = "max-attempts")]
    max_attempts: Option<u32>,
    /// Trace JSONL path; defaults to <out>/trace.jsonl.
    #[arg(long)]
    trace: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            let code = err
                .downcast_ref::<PipelineError>()
                .map(PipelineError::code)
                .unwrap_or("internal");
            eprintln!("tryon-rs error [{code}]: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Presets => run_presets(),
    }
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let tier = SynthesisTier::parse(&args.tier).ok_or_else(|| {
        PipelineError::InputValidation(format!("unknown tier '{}' (fast|high)", args.tier))
    })?;
    let lock_mode = LockMode::parse(&args.lock_mode).ok_or_else(|| {
        PipelineError::InputValidation(format!(
            "unknown lock mode '{}' (full-face|eyes-only|disabled)",
            args.lock_mode
        ))
    })?;

    let request = TryOnRequest {
        person: load_image(&args.person)?,
        garment: load_image(&args.garment)?,
        preset_id: args.preset,
        instruction: args.instruction,
        identity_refs: load_images(&args.identity_refs)?,
        accessory_refs: load_images(&args.accessory_refs)?,
        aspect_ratio: args.aspect,
        tier,
        lock_mode,
        max_attempts: args.max_attempts,
        cancel: CancelToken::new(),
    };

    let mut engine = TryOnEngine::new(&args.out);
    if let Some(trace) = args.trace {
        engine = engine.with_trace_path(trace);
    }
    let outcome = engine.generate_try_on(&request)?;

    let summary = json!({
        "request_id": outcome.request_id,
        "accepted": outcome.accepted,
        "attempt_index": outcome.attempt_index,
        "output": outcome.image_path.display().to_string(),
        "prompt_used": outcome.diagnostics.prompt_used,
        "identity_lock_applied": outcome.diagnostics.identity_lock_applied,
        "warnings": outcome.diagnostics.warnings,
        "attempts": outcome.diagnostics.attempts,
        "total_time_ms": outcome.diagnostics.total_time_ms,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(0)
}

fn run_presets() -> Result<i32> {
    let registry = PresetRegistry::default();
    let listing: Vec<_> = registry
        .list()
        .map(|preset| {
            json!({
                "id": preset.id,
                "category": preset.category,
                "scene": preset.scene_text,
                "deviation": preset.clamped_deviation(),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(0)
}

fn load_image(path: &Path) -> Result<ImageData> {
    let bytes =
        fs::read(path).with_context(|| format!("failed reading image {}", path.display()))?;
    Ok(ImageData {
        bytes,
        mime_type: mime_for_path(path).to_string(),
    })
}

fn load_images(paths: &[PathBuf]) -> Result<Vec<ImageData>> {
    paths.iter().map(|path| load_image(path)).collect()
}

fn mime_for_path(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use clap::CommandFactory;

    use super::{mime_for_path, Cli};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn mime_follows_file_extension() {
        assert_eq!(mime_for_path(Path::new("a.JPG")), "image/jpeg");
        assert_eq!(mime_for_path(Path::new("a.webp")), "image/webp");
        assert_eq!(mime_for_path(Path::new("a.png")), "image/png");
        assert_eq!(mime_for_path(Path::new("a")), "image/png");
    }
}
