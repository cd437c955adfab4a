use envconfig::Envconfig;
use tokio::signal;

use tastemap::config::Config;
use tastemap::pipeline::Pipeline;
use tastemap::router::router;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("shutting down gracefully...");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");
    let bind = config.bind();

    let pipeline = Pipeline::new(config)
        .await
        .expect("failed to construct pipeline");
    let store = pipeline.run().await.expect("pipeline run failed");

    let app = router(store);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .expect("failed to bind listener");

    tracing::info!("listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown())
        .await
        .expect("server error");
}
