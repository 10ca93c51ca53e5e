use std::time::Duration;

use anyhow::Context;

const DEFAULT_SCORING_TIMEOUT_SECS: u64 = 30;

/// Process configuration, read once at startup from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub scoring_url: Option<String>,
    pub scoring_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set to a production Postgres instance")?;

        let scoring_url = std::env::var("SCORING_URL").ok().filter(|v| !v.is_empty());

        let scoring_timeout = match std::env::var("SCORING_TIMEOUT_SECS") {
            Ok(raw) => Duration::from_secs(
                raw.parse::<u64>()
                    .context("SCORING_TIMEOUT_SECS must be a whole number of seconds")?,
            ),
            Err(_) => Duration::from_secs(DEFAULT_SCORING_TIMEOUT_SECS),
        };

        Ok(AppConfig {
            database_url,
            scoring_url,
            scoring_timeout,
        })
    }

    /// The scoring endpoint is only needed by `import`; everything else
    /// runs without it.
    pub fn require_scoring_url(&self) -> anyhow::Result<&str> {
        self.scoring_url
            .as_deref()
            .context("SCORING_URL must be set to the scoring service base URL")
    }
}
