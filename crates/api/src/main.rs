use std::net::SocketAddr;
use std::sync::Arc;

use evently_api::app::{build_app, build_services};
use evently_api::config::ApiConfig;
use evently_api::shutdown::{signal, ShutdownHooks};

#[tokio::main]
async fn main() {
    evently_observability::init();

    let config = ApiConfig::from_env();
    let (state, feed) = match build_services().await {
        Ok(built) => built,
        Err(err) => {
            tracing::error!("bootstrap failed: {err}");
            std::process::exit(1);
        }
    };

    // LIFO: the listener's unlisten runs first so fan-out halts, then the
    // channels close, which ends every open SSE stream and lets the
    // server drain its connections.
    let mut hooks = ShutdownHooks::new();
    let notify = Arc::clone(&state.notify);
    hooks.register("close-channels", move || notify.close_all());
    hooks.register("unlisten", move || feed.unlisten());

    let app = build_app(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {addr}: {e}"));
    tracing::info!("evently listening on {addr}");

    let shutdown = async move {
        signal().await;
        hooks.run();
    };
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!("server failed: {err}");
        std::process::exit(1);
    }
}
