//! Shutdown hooks, run in LIFO registration order.

/// Collects teardown actions during bootstrap and runs them in reverse
/// on the way out, so late-wired components (the upstream listener) stop
/// before the foundations they use (the pool, the server socket).
#[derive(Default)]
pub struct ShutdownHooks {
    hooks: Vec<(&'static str, Box<dyn FnOnce() + Send>)>,
}

impl ShutdownHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &'static str, hook: impl FnOnce() + Send + 'static) {
        self.hooks.push((name, Box::new(hook)));
    }

    pub fn run(mut self) {
        while let Some((name, hook)) = self.hooks.pop() {
            tracing::debug!(hook = name, "running shutdown hook");
            hook();
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
