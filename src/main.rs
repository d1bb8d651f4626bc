//! Local LLM chat server using WGPU
//!
//! (c) Softlandia 2025

use local_llm_chat::api;
use local_llm_chat::infrastructure::engine_host::{EngineHost, EngineStatus, LogProgress};
use local_llm_chat::infrastructure::settings::Settings;

use anyhow::anyhow;
use log::{error, info, warn};
use tokio::runtime::{Builder, Runtime};

fn main() -> anyhow::Result<()> {
    // initialize tracing
    tracing_subscriber::fmt::init();

    let runtime: Runtime = Builder::new_multi_thread().enable_all().build()?;

    runtime.block_on(web_server_task())
}

async fn web_server_task() -> anyhow::Result<()> {
    let provider = local_llm_chat::services()
        .build_provider()
        .map_err(|e| anyhow!("invalid service configuration: {e:?}"))?;

    let settings = provider.get_required::<Settings>();
    let engine_host = provider.get_required::<EngineHost>();

    match engine_host.probe().await {
        EngineStatus::Unsupported { reason } => {
            warn!("Model loading is disabled: {reason}");
        }
        _ if settings.autoload_model => {
            let model = settings.default_model.clone();
            tokio::spawn(async move {
                if let Err(err) = engine_host.load(&model, &LogProgress).await {
                    error!("Autoload of {model} failed: {err}");
                }
            });
        }
        _ => {}
    }

    let app = api::app(provider);

    let listener = tokio::net::TcpListener::bind(&settings.bind_address).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    info!("Shutting down...");

    Ok(())
}
