//! IS22 Frame Gateway
//!
//! Main entry point for the frame streaming gateway.

use is22_framegw::{
    camera_directory::{CameraDirectory, HttpCameraDirectory, StaticCameraDirectory},
    channel_registry::ChannelRegistry,
    frame_source::{check_transcoder, AdapterVariant, DirectFeedSource, PipelineSource, SourceSet},
    heartbeat_monitor::HeartbeatMonitor,
    session_controller::SessionController,
    state::{AppConfig, AppState},
    stream_gateway::StreamGateway,
    web_api,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Camera directory from CAMERA_API_URL, else CAMERA_CONFIG_PATH, else empty
async fn build_camera_directory(config: &AppConfig) -> anyhow::Result<Arc<dyn CameraDirectory>> {
    if let Some(url) = &config.camera_api_url {
        tracing::info!(camera_api_url = %url, "Using camera registry API");
        return Ok(Arc::new(HttpCameraDirectory::new(url.clone())?));
    }

    match &config.camera_config_path {
        Some(path) => {
            let directory = StaticCameraDirectory::from_file(path).await?;
            tracing::info!(path = %path.display(), "Loaded static camera list");
            Ok(Arc::new(directory))
        }
        None => {
            tracing::warn!("No camera source configured; every start will fail with a configuration error");
            Ok(Arc::new(StaticCameraDirectory::new(Vec::new())))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "is22_framegw=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting IS22 Frame Gateway v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        go2rtc_url = %config.go2rtc_url,
        go2rtc_rtsp_url = %config.go2rtc_rtsp_url,
        ffmpeg_path = %config.ffmpeg_path,
        source_bindings = %config.source_bindings,
        max_sessions = config.max_sessions,
        max_transcoders = config.max_transcoders,
        max_frame_bytes = config.max_frame_bytes,
        "Configuration loaded"
    );

    // Check the transcoding utility; sessions on the pipeline variant fail without it
    let transcoder_version = match check_transcoder(&config.ffmpeg_path).await {
        Ok(version) => {
            tracing::info!(version = %version, "Transcoder available");
            Some(version)
        }
        Err(e) => {
            tracing::error!(error_code = e.code(), error = %e, "Transcoder check failed");
            None
        }
    };

    // Initialize components
    let registry = Arc::new(ChannelRegistry::new(config.registry_config()));

    let stream = Arc::new(
        StreamGateway::new(config.go2rtc_url.clone(), config.go2rtc_rtsp_url.clone())?
            .with_playback(config.playback_api_url.clone()),
    );
    tracing::info!("StreamGateway initialized");

    let directory = build_camera_directory(&config).await?;

    let pipeline = Arc::new(
        PipelineSource::new(stream.clone(), config.transcoder_config(), config.max_transcoders)
            .with_max_frame_bytes(config.max_frame_bytes.max(1024)),
    );
    let direct_feed = Arc::new(DirectFeedSource::new(
        stream.clone(),
        Duration::from_secs(config.read_timeout_sec.max(1)),
    ));
    let sources = Arc::new(
        SourceSet::new(AdapterVariant::Pipeline)
            .with_source(pipeline)
            .with_source(direct_feed)
            .with_bindings(&config.source_bindings)?,
    );

    let sessions = Arc::new(SessionController::new(
        config.session_config(),
        registry.clone(),
        sources,
        directory,
    ));
    tracing::info!("SessionController initialized");

    // Start heartbeat monitor
    let heartbeat = Arc::new(HeartbeatMonitor::new(registry.clone(), config.heartbeat_config()));
    let heartbeat_task = heartbeat.start();
    tracing::info!(
        interval_sec = config.heartbeat_interval_sec,
        inactivity_timeout_sec = config.inactivity_timeout_sec,
        "HeartbeatMonitor started"
    );

    let state = AppState {
        config: Arc::new(config),
        sessions: sessions.clone(),
        registry,
        stream,
        transcoder_version,
        started_at: Instant::now(),
    };

    let app = web_api::create_router(state.clone())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(sessions))
        .await?;

    heartbeat_task.abort();
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Resolves on ctrl-c after every session is stopped, so open sockets close
/// before the server drains
async fn shutdown_signal(sessions: Arc<SessionController>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down, stopping sessions");
    sessions.stop_all().await;
}
