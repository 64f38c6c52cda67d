mod config;
mod errors;
mod render;
mod routes;
mod state;
mod templates;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use aws_config::Region;
use axum::extract::DefaultBodyLimit;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, TemplateStoreKind};
use crate::render::{ChromeEngine, ReadinessWaiter, RenderPipeline, SessionManager};
use crate::routes::build_router;
use crate::state::AppState;
use crate::templates::{FsTemplateStore, HelperRegistry, S3TemplateStore, TemplateCompiler, TemplateStore};

/// Headroom past the render ceiling so the pipeline reports `OverallTimeout`
/// before the transport cuts the connection.
const TRANSPORT_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on invalid env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}={},tower_http={}",
                env!("CARGO_PKG_NAME"),
                &config.rust_log,
                &config.rust_log
            ))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting renderer v{}", env!("CARGO_PKG_VERSION"));

    let store = build_template_store(&config).await;

    // Assembled once; read-only from here on
    let helpers = Arc::new(HelperRegistry::standard());

    let sessions = SessionManager::new(Arc::new(ChromeEngine), config.session.clone());
    info!(
        "Browser sessions: sandbox={}, disable_dev_shm={}, chrome={}",
        config.session.sandbox,
        config.session.disable_dev_shm,
        config
            .session
            .chrome_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "auto-detect".to_string())
    );

    let pipeline = RenderPipeline::new(
        store,
        TemplateCompiler::new(helpers),
        sessions,
        ReadinessWaiter::new(config.readiness.clone()),
        config.layout.clone(),
        config.timeouts,
    );
    info!(
        "Render pipeline ready: format={:?}, overall timeout {}ms",
        config.layout.format,
        config.timeouts.overall.as_millis()
    );

    let state = AppState {
        pipeline: Arc::new(pipeline),
    };

    // Build router
    let app = build_router(state)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TimeoutLayer::new(
            config.timeouts.overall + TRANSPORT_TIMEOUT_MARGIN,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// S3-compatible bucket (AWS, MinIO, GCS interop) or a local directory.
async fn build_template_store(config: &Config) -> Arc<dyn TemplateStore> {
    match config.template_store {
        TemplateStoreKind::S3 => {
            let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(Region::new(config.aws_region.clone()))
                .load()
                .await;

            let mut s3_config = aws_sdk_s3::config::Builder::from(&sdk_config);
            if let Some(endpoint) = &config.s3_endpoint {
                s3_config = s3_config.endpoint_url(endpoint).force_path_style(true);
            }
            let client = aws_sdk_s3::Client::from_conf(s3_config.build());

            info!(
                "Template store: s3://{} ({})",
                config.template_bucket,
                config.s3_endpoint.as_deref().unwrap_or("default endpoint")
            );
            Arc::new(S3TemplateStore::new(client, config.template_bucket.clone()))
        }
        TemplateStoreKind::Fs => {
            info!("Template store: {}", config.template_dir.display());
            Arc::new(FsTemplateStore::new(config.template_dir.clone()))
        }
    }
}
