use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use tilerefine_core::catalog::UpscalerCatalog;
use tilerefine_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use tilerefine_core::http_backend::HttpTileModel;
use tilerefine_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, RedactingMakeWriter,
    DEFAULT_LOG_FILTER,
};
use tilerefine_core::pipeline::{PredictRequest, Predictor};
use tilerefine_core::runtime::{log_runtime_lib_status, setup_runtime_libs};
use tilerefine_core::session::ExecutionTarget;
use tilerefine_core::tile_model::TileAdapter;
use tilerefine_core::upscaler::RESAMPLE_UPSCALER;

#[derive(Parser, Debug)]
#[command(
    name = "tilerefine",
    about = "Tile-based diffusion refinement for upscaled images"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upscale and refine one image.
    Upscale(UpscaleArgs),
    /// Inspect or fetch pre-upscaler weights.
    #[command(subcommand)]
    Models(ModelsCommand),
}

#[derive(Subcommand, Debug)]
enum ModelsCommand {
    List {
        #[arg(long, help = "Print the catalog as JSON")]
        json: bool,
    },
    Download { name: String },
}

#[derive(Args, Debug, Default, Clone)]
struct UpscaleArgs {
    #[arg(help = "Image to upscale")]
    input: PathBuf,
    #[arg(long, help = "Pre-upscaler name from the catalog, or \"resample\"")]
    upscaler: Option<String>,
    #[arg(long, help = "Overall scale factor")]
    upscale_by: Option<f32>,
    #[arg(long, help = "Sampling steps per tile")]
    steps: Option<u32>,
    #[arg(long, help = "Denoising strength in (0, 1]")]
    denoise: Option<f32>,
    #[arg(long, help = "HDR tone fusion intensity (0 disables)")]
    hdr: Option<f32>,
    #[arg(long)]
    guidance_scale: Option<f32>,
    #[arg(long, action = ArgAction::SetTrue)]
    no_color_correction: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    adaptive_tiling: bool,
    #[arg(short = 'o', long)]
    output_dir: Option<PathBuf>,
    #[arg(long, help = "Base URL of the tile model service")]
    endpoint: Option<String>,
    #[arg(long, help = "Pre-upscaler execution provider: cuda, tensorrt or cpu")]
    execution: Option<String>,
}

impl UpscaleArgs {
    /// Flags win over config.toml.
    fn apply_to(&self, config: &mut AppConfig, cwd: &Path) {
        let refine = &mut config.refine;
        if let Some(upscaler) = &self.upscaler {
            refine.upscaler = upscaler.clone();
        }
        if let Some(factor) = self.upscale_by {
            refine.upscale_by = factor;
        }
        if let Some(steps) = self.steps {
            refine.steps = steps;
        }
        if let Some(denoise) = self.denoise {
            refine.denoise = denoise;
        }
        if let Some(hdr) = self.hdr {
            refine.hdr = hdr;
        }
        if let Some(scale) = self.guidance_scale {
            refine.guidance_scale = scale;
        }
        if self.no_color_correction {
            refine.color_correction = false;
        }
        if self.adaptive_tiling {
            refine.adaptive_tiling = true;
        }
        if let Some(dir) = &self.output_dir {
            config.paths.output_dir = cwd.join(dir);
        }
        if let Some(endpoint) = &self.endpoint {
            config.backend.endpoint = endpoint.clone();
        }
        if let Some(execution) = &self.execution {
            config.upscaler.execution = ExecutionTarget::from_str_lossy(execution);
        }
    }
}

pub fn run_from_env() -> Result<()> {
    let runtime_report = setup_runtime_libs();
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_runtime_lib_status(&runtime_report);

    initialize_data_dir(&resolved_data_dir)?;
    let cfg_path = config_path(&resolved_data_dir);
    let config = AppConfig::load_from_path(&cfg_path)?;
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );

    match cli.command {
        Commands::Upscale(args) => run_upscale(args, config, &resolved_data_dir),
        Commands::Models(command) => run_models(command, &config, &resolved_data_dir),
    }
}

fn run_upscale(args: UpscaleArgs, mut config: AppConfig, data_dir: &Path) -> Result<()> {
    let cwd = std::env::current_dir().context("failed to resolve working directory")?;
    args.apply_to(&mut config, &cwd);
    let input = cwd.join(&args.input);

    let model = HttpTileModel::connect(&config.backend)?;
    let adapter = TileAdapter::new(model, config.adapter_options());
    let mut predictor = Predictor::new(&config, data_dir, adapter)?;

    let request = PredictRequest::from_config(input, &config.refine);
    let output = predictor.predict(&request)?;

    println!("{}", output.path.display());
    eprintln!(
        "{}x{} from {} tiles in {}",
        output.width,
        output.height,
        output.tiles,
        format_duration(output.elapsed.as_secs_f64())
    );
    Ok(())
}

fn run_models(command: ModelsCommand, config: &AppConfig, data_dir: &Path) -> Result<()> {
    let paths = config.resolved_paths(data_dir);
    let catalog = UpscalerCatalog::load(paths.models_dir)?;

    match command {
        ModelsCommand::List { json: true } => {
            println!("{}", catalog.to_json()?);
            Ok(())
        }
        ModelsCommand::List { json: false } => {
            println!(
                "{:<24} x{:<2} {:<10} {}",
                RESAMPLE_UPSCALER, "*", "builtin", "bilinear resampling, no weights"
            );
            for entry in catalog.list() {
                let status = if catalog.is_downloaded(&entry.name) {
                    "downloaded"
                } else if entry.url.is_some() {
                    "available"
                } else {
                    "manual"
                };
                println!(
                    "{:<24} x{:<2} {:<10} {}",
                    entry.name, entry.scale, status, entry.description
                );
            }
            Ok(())
        }
        ModelsCommand::Download { name } => {
            let path = catalog.download(&name)?;
            println!("{}", path.display());
            Ok(())
        }
    }
}

fn format_duration(secs: f64) -> String {
    let total = secs.max(0.0).round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}h{m:02}m{s:02}s")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{secs:.1}s")
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);
    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = &panic_hook_plan
    {
        let attempted_crash_dir = attempted_crash_dir
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        eprintln!(
            "Warning: panic crash artifact hook unavailable (path: {attempted_crash_dir}; reason: {reason}). Panics will not be persisted to crash logs."
        );
    }

    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filters = logging::compose_logging_filters(&init_options);
    let console_env_filter = parse_env_filter_with_fallback(&filters.console_filter, "console");

    match logging::build_file_sink_plan(&init_options) {
        FileSinkPlan::Ready { appender, .. } => {
            let file_env_filter = parse_env_filter_with_fallback(&filters.file_filter, "file");
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(RedactingMakeWriter::new(appender))
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let attempted_log_dir = attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());

            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }

    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Panic crash artifact hook unavailable; continuing without panic artifacts"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}
