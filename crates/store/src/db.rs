//! Database configuration and pool construction.
//!
//! Connection settings come from the environment: either a single
//! `DATABASE_URL`, or `DB_PREFIX` naming a prefix under which
//! `<PREFIX>_DATABASE`, `<PREFIX>_USER`, `<PREFIX>_PASSWORD`,
//! `<PREFIX>_HOST` and `<PREFIX>_PORT` are looked up. Any truthy `PGSSL`
//! requires TLS without verifying the server certificate.

use std::str::FromStr;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};

use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone)]
pub struct DbConfig {
    options: PgConnectOptions,
}

impl DbConfig {
    pub fn from_env() -> StoreResult<Self> {
        let ssl = std::env::var("PGSSL").is_ok_and(|v| is_truthy(&v));

        let mut options = if let Ok(url) = std::env::var("DATABASE_URL") {
            PgConnectOptions::from_str(&url)
                .map_err(|e| StoreError::config(format!("DATABASE_URL: {e}")))?
        } else if let Ok(prefix) = std::env::var("DB_PREFIX") {
            let var = |suffix: &str| -> StoreResult<String> {
                let name = format!("{prefix}_{suffix}");
                std::env::var(&name).map_err(|_| StoreError::config(format!("{name} is not set")))
            };
            let port: u16 = var("PORT")?
                .parse()
                .map_err(|e| StoreError::config(format!("{prefix}_PORT: {e}")))?;
            PgConnectOptions::new()
                .host(&var("HOST")?)
                .port(port)
                .database(&var("DATABASE")?)
                .username(&var("USER")?)
                .password(&var("PASSWORD")?)
        } else {
            return Err(StoreError::config(
                "set DATABASE_URL or DB_PREFIX to locate the database",
            ));
        };

        if ssl {
            options = options.ssl_mode(PgSslMode::Require);
        }

        Ok(Self { options })
    }

    pub async fn connect(&self) -> StoreResult<PgPool> {
        PgPoolOptions::new()
            .connect_with(self.options.clone())
            .await
            .map_err(|e| match &e {
                sqlx::Error::Io(io) if io.kind() == std::io::ErrorKind::ConnectionRefused => {
                    StoreError::Unavailable
                }
                _ => StoreError::config(format!("database connection failed: {e}")),
            })
    }
}

fn is_truthy(value: &str) -> bool {
    !matches!(value.trim(), "" | "0" | "false" | "no" | "off")
}
