use clap::Parser;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wiki_upload::config::UploadConfig;
use wiki_upload::infrastructure::{database, storage};
use wiki_upload::services::scanner::create_scanner;
use wiki_upload::services::upload_service::UploadService;
use wiki_upload::services::verification::VerificationPipeline;
use wiki_upload::services::worker::BackgroundWorker;
use wiki_upload::{AppState, create_app};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Service type to run (api, worker, all)
    #[arg(short, long, default_value = "all")]
    mode: String,

    /// Port for the API server
    #[arg(short, long, default_value_t = 3000)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initial Environment & Logging Setup
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wiki_upload=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if !matches!(args.mode.as_str(), "api" | "worker" | "all") {
        anyhow::bail!("Unknown mode '{}', expected api, worker or all", args.mode);
    }

    info!("🚀 Starting Wiki Upload Service [Mode: {}]...", args.mode);

    // 2. Setup Common Infrastructure
    let db = database::setup_database().await?;
    let storage_service = storage::setup_storage().await?;

    let config = Arc::new(match std::env::var("APP_ENV").as_deref() {
        Ok("production") => UploadConfig::production(),
        Ok("development") => UploadConfig::development(),
        _ => UploadConfig::from_env(),
    });
    info!(
        "🛡️  Upload Config: Max Size={}MB, Chunk Min={}B, Async={}, URL Uploads={}, Virus Scan={}",
        config.max_upload_size / 1024 / 1024,
        config.min_chunk_size,
        config.enable_async_uploads,
        config.enable_url_uploads,
        config.enable_virus_scan
    );

    let scanner = create_scanner(&config);
    let verifier = VerificationPipeline::new(config.clone(), scanner);
    let upload_service =
        UploadService::new(db.clone(), storage_service, config.clone(), verifier)?;

    // 3. Setup Graceful Shutdown Channel
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut handles = Vec::new();

    // 4. Initialize Worker Service
    if args.mode == "worker" || args.mode == "all" {
        let worker = BackgroundWorker::new(
            upload_service.stash().clone(),
            upload_service.locks().clone(),
            shutdown_rx.clone(),
        );
        handles.push(tokio::spawn(worker.run()));
        info!("👷 Worker service initialized.");
    }

    // 5. Initialize API Service
    if args.mode == "api" || args.mode == "all" {
        let state = AppState {
            db: db.clone(),
            config: config.clone(),
            upload_service,
        };

        // Configure tracing layer for HTTP requests
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown");
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            })
            .on_request(|request: &axum::http::Request<_>, _span: &tracing::Span| {
                info!("📥 {} {}", request.method(), request.uri());
            })
            .on_response(
                |response: &axum::http::Response<_>,
                 latency: std::time::Duration,
                 _span: &tracing::Span| {
                    info!(
                        "📤 Finished in {:?} with status {}",
                        latency,
                        response.status()
                    );
                },
            );

        let app = create_app(state).layer(trace_layer);
        let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;

        info!("✅ API Server listening on: http://0.0.0.0:{}", args.port);
        info!("📖 Swagger UI documentation: http://localhost:{}/swagger-ui", args.port);

        let mut server_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown.changed().await;
                })
                .await
            {
                error!("❌ Server runtime error: {}", e);
            }
        }));
    }

    // 6. Wait for Shutdown Signal
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    info!("🛑 Shutting down upload services...");
    for handle in handles {
        if let Err(e) = handle.await {
            error!("Task ended abnormally: {}", e);
        }
    }

    info!("👋 Upload service exited cleanly.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, initiating graceful shutdown...");
        },
    }
}
