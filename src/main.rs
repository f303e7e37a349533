//! Main entry point for the diffusion serving framework

use diffusion_serving::{
    api, config::LoggingConfig, config::Settings, pipeline::registry::PipelineRegistry,
    AppState,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let json = config.format.eq_ignore_ascii_case("json");

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::load()?;
    init_logging(&settings.logging);
    settings.validate()?;

    info!("Starting diffusion serving");
    info!(
        model = %settings.pipeline.model,
        enable_txt2img = settings.pipeline.enable_txt2img,
        enable_img2img = settings.pipeline.enable_img2img,
        memory_efficient_attention = settings.pipeline.memory_efficient_attention,
        "Loaded configuration: server={}:{}",
        settings.server.host,
        settings.server.port
    );

    // Load pipelines; the server does not start without them
    let registry = PipelineRegistry::initialize(&settings.pipeline).await?;

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let app_state = Arc::new(AppState::new(settings, registry));
    app_state.uploads.ensure_storage_dir().await?;
    app_state.outputs.ensure_storage_dir().await?;

    // Build the router
    let app = api::routes::create_router(app_state.clone());

    info!("Server listening on {}", addr);

    // Start the server
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
