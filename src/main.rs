use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use dotenvy::dotenv;
use tracing::{error, info};

use identity_tryon::config::CONFIG;
use identity_tryon::guard::{InFlightGuard, TryOnService};
use identity_tryon::llm::GeminiClient;
use identity_tryon::pipeline::{GenerationInput, PipelineSettings, TryOnPipeline};
use identity_tryon::render::AspectRatio;
use identity_tryon::scene::PresetCatalog;
use identity_tryon::utils::logging::init_logging;

const CLI_USER: &str = "cli";

#[derive(Debug)]
struct CliArgs {
    person: PathBuf,
    garment: PathBuf,
    out: PathBuf,
    aspect_ratio: AspectRatio,
    garment_description: Option<String>,
    user_request: Option<String>,
    preset_id: Option<String>,
    preset_description: Option<String>,
    lighting_description: Option<String>,
    debug_out: Option<PathBuf>,
}

fn usage() -> &'static str {
    "Usage: identity_tryon --person <file> --garment <file> --out <file> [--aspect-ratio 1:1|4:5|3:4|9:16] [--garment-description <text>] [--request <text>] [--preset <id>] [--preset-description <text>] [--lighting <text>] [--debug-out <file>]"
}

fn parse_cli_args(args: &[String]) -> anyhow::Result<CliArgs> {
    let mut person = None;
    let mut garment = None;
    let mut out = None;
    let mut aspect_ratio = AspectRatio::Portrait4x5;
    let mut garment_description = None;
    let mut user_request = None;
    let mut preset_id = None;
    let mut preset_description = None;
    let mut lighting_description = None;
    let mut debug_out = None;

    let mut index = 1;
    while index < args.len() {
        let flag = args[index].as_str();
        if matches!(flag, "--help" | "-h") {
            return Err(anyhow!(usage()));
        }
        index += 1;
        let value = args
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow!("Missing value for {flag}\n{}", usage()))?;
        match flag {
            "--person" => person = Some(PathBuf::from(value)),
            "--garment" => garment = Some(PathBuf::from(value)),
            "--out" => out = Some(PathBuf::from(value)),
            "--aspect-ratio" => {
                aspect_ratio = AspectRatio::parse(&value)
                    .ok_or_else(|| anyhow!("Invalid --aspect-ratio value: {value}"))?;
            }
            "--garment-description" => garment_description = Some(value),
            "--request" => user_request = Some(value),
            "--preset" => preset_id = Some(value),
            "--preset-description" => preset_description = Some(value),
            "--lighting" => lighting_description = Some(value),
            "--debug-out" => debug_out = Some(PathBuf::from(value)),
            other => {
                return Err(anyhow!("Unknown argument: {other}\n{}", usage()));
            }
        }
        index += 1;
    }

    Ok(CliArgs {
        person: person.ok_or_else(|| anyhow!("--person is required\n{}", usage()))?,
        garment: garment.ok_or_else(|| anyhow!("--garment is required\n{}", usage()))?,
        out: out.ok_or_else(|| anyhow!("--out is required\n{}", usage()))?,
        aspect_ratio,
        garment_description,
        user_request,
        preset_id,
        preset_description,
        lighting_description,
        debug_out,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    let cli = parse_cli_args(&args)?;
    let _guards = init_logging(&CONFIG.log_level, Path::new("logs"));

    let person = tokio::fs::read(&cli.person)
        .await
        .with_context(|| format!("Failed to read person image {}", cli.person.display()))?;
    let garment = tokio::fs::read(&cli.garment)
        .await
        .with_context(|| format!("Failed to read garment image {}", cli.garment.display()))?;

    let mut input = GenerationInput::new(person, garment, cli.aspect_ratio);
    input.garment_description = cli.garment_description;
    input.user_request = cli.user_request;
    input.preset_id = cli.preset_id;
    input.preset_description = cli.preset_description;
    input.lighting_description = cli.lighting_description;

    let client = Arc::new(GeminiClient::from_config(&CONFIG));
    let catalog = PresetCatalog::load(CONFIG.presets_path.as_deref());
    let pipeline = TryOnPipeline::new(
        Arc::clone(&client),
        client,
        catalog,
        PipelineSettings::from_config(&CONFIG),
    );
    let service = TryOnService::new(pipeline, InFlightGuard::from_config(&CONFIG));

    info!("Starting identity-preserving try-on");
    let result = service.generate_for_user(CLI_USER, input).await?;

    if let Some(path) = &cli.debug_out {
        let debug_json = serde_json::to_vec_pretty(&result)?;
        tokio::fs::write(path, debug_json)
            .await
            .with_context(|| format!("Failed to write debug trace {}", path.display()))?;
    }

    let Some(image) = result.image.as_deref().filter(|_| result.success) else {
        let reason = result.debug.error.clone().unwrap_or_else(|| "unknown error".to_string());
        error!(request_id = %result.debug.request_id, "Try-on failed: {}", reason);
        return Err(anyhow!("Try-on failed: {reason}"));
    };
    tokio::fs::write(&cli.out, image)
        .await
        .with_context(|| format!("Failed to write output image {}", cli.out.display()))?;

    info!(
        request_id = %result.debug.request_id,
        out = %cli.out.display(),
        retried = result.debug.retried,
        generation_time_ms = result.generation_time_ms,
        "Try-on image written"
    );
    Ok(())
}
