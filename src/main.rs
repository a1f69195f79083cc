use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use tracing::{error, info};

use camgate::{web, AppConfig, SharedService, StreamService};

/// camgate - RTSP to HLS video-ingest gateway
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "camgate.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = AppConfig::load(&args.config)?;
    info!("camgate initialized. HLS root: {}", config.server.hls_root);

    let service = StreamService::new(config.clone());

    // Health scanner, memory governor, CSV logger.
    let _guardians = service.spawn_background_tasks();

    // Streams seeded from the config file.
    for seed in &config.streams {
        if !seed.auto_start {
            continue;
        }
        match service.start(&seed.url, &seed.name) {
            Ok(playlist) => info!("Seeded stream [{}] -> {}", seed.name, playlist),
            Err(err) => error!("Failed to seed stream [{}]: {}", seed.name, err),
        }
    }

    let app = Router::new()
        .route("/", get(web::admin::index_handler))
        .route("/sys/status", get(web::admin::sys_status))
        .route("/streams", get(web::admin::list_streams))
        .route("/streams/:name/start", post(web::admin::handle_start))
        .route("/streams/:name/stop", post(web::admin::handle_stop))
        .route("/streams/:name/status", get(web::admin::stream_status))
        .route("/streams/:name/stats", get(web::admin::stream_stats))
        .route("/hls/:stream_name/:file_name", get(web::hls::serve_hls_file))
        .with_state(service.clone());

    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(service.clone()))
        .await?;

    service.shutdown().await;
    Ok(())
}

async fn shutdown_signal(_service: SharedService) {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
