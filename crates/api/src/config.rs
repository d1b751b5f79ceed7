//! HTTP service configuration.

const DEFAULT_PORT: u16 = 4802;

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub port: u16,
}

impl ApiConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        Self { port }
    }
}
