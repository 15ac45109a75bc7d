use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use fluxstep_core::loader;

use fluxstep_server::api::{self, AppState, SessionCoordinator, SessionDefaults};
use fluxstep_server::config::{ServerConfig, Settings};
use fluxstep_server::logging::{self, LogFormat};
use fluxstep_server::shutdown::shutdown_signal;

#[derive(Parser)]
#[command(name = "fluxstep", about = "Step-wise FLUX generation over WebSocket")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load the model and serve `/ws-flux`
    Serve(ServeArgs),
    /// Write the given options to the config file and exit
    SaveConfig(ServeArgs),
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// Local model directory or HuggingFace Hub repo id
    #[arg(long, env = "FLUXSTEP_MODEL")]
    model: Option<String>,

    /// Weight precision: bf16, fp16, fp32
    #[arg(long)]
    dtype: Option<String>,

    /// CUDA / Metal device ordinal
    #[arg(long)]
    device: Option<usize>,

    /// Run on the CPU even if an accelerator is available
    #[arg(long)]
    cpu: bool,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Steps used when a client does not ask for a count
    #[arg(long)]
    steps: Option<usize>,

    #[arg(long)]
    guidance_scale: Option<f64>,

    #[arg(long)]
    height: Option<usize>,

    #[arg(long)]
    width: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// Largest step count a client may request
    #[arg(long)]
    max_steps: Option<usize>,

    /// Comma-separated list of allowed CORS origins ("*" for any)
    #[arg(long)]
    allowed_origins: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Skip attention capture; steps then carry no attention maps
    #[arg(long)]
    no_attention: bool,

    /// Config file to read instead of ~/.config/fluxstep/config.toml
    #[arg(long)]
    config: Option<PathBuf>,
}

impl ServeArgs {
    fn to_config(&self) -> ServerConfig {
        ServerConfig {
            model: self.model.clone(),
            dtype: self.dtype.clone(),
            device: self.device,
            cpu: self.cpu.then_some(true),
            host: self.host.clone(),
            port: self.port,
            steps: self.steps,
            guidance_scale: self.guidance_scale,
            height: self.height,
            width: self.width,
            seed: self.seed,
            max_steps: self.max_steps,
            allowed_origins: self.allowed_origins.clone(),
            log_level: self.log_level.clone(),
            capture_attention: self.no_attention.then_some(false),
        }
    }

    fn file_config(&self) -> anyhow::Result<ServerConfig> {
        match &self.config {
            Some(path) => Ok(ServerConfig::load_from(path)?),
            None => Ok(ServerConfig::load()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => {
            let mut config = args.file_config()?;
            config.merge(&args.to_config());
            run_server(config.resolve()).await
        }
        Command::SaveConfig(args) => {
            let mut config = args.file_config()?;
            config.merge(&args.to_config());
            let path = match &args.config {
                Some(path) => {
                    config.save_to(path)?;
                    path.clone()
                }
                None => config.save()?,
            };
            eprintln!("Saved config to: {}", path.display());
            Ok(())
        }
    }
}

async fn run_server(settings: Settings) -> anyhow::Result<()> {
    logging::init(&settings.log_level, LogFormat::from_env())?;
    tracing::info!(?settings, "starting fluxstep");

    let model = settings.model.clone();
    let dtype = loader::parse_dtype(&settings.dtype)?;
    let (cpu, ordinal) = (settings.cpu, settings.device);
    let components = tokio::task::spawn_blocking(move || {
        let device = loader::select_device(cpu, ordinal)?;
        tracing::info!(?device, ?dtype, %model, "loading model");
        let files = loader::fetch_model(&model)?;
        loader::load_components(&files, dtype, &device)
    })
    .await??;
    tracing::info!("model loaded");

    let defaults = SessionDefaults {
        steps: settings.steps,
        guidance_scale: settings.guidance_scale,
        height: settings.height,
        width: settings.width,
        seed: settings.seed,
        capture_attention: settings.capture_attention,
        max_steps: settings.max_steps,
    };
    let state = AppState::new(Arc::new(SessionCoordinator::new(components, defaults)));
    let app = api::create_router(state, api::build_cors_layer(&settings.allowed_origins));

    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Serving on ws://{addr}/ws-flux");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shut down");
    Ok(())
}
