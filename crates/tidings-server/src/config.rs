use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

use tidings_gateway::SessionConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// How long shutdown waits for sessions to drain.
    pub shutdown_timeout: Duration,
    pub session: SessionConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = SessionConfig::default();
        let session = SessionConfig {
            queue_capacity: parse(&get, "TIDINGS_QUEUE_CAPACITY", defaults.queue_capacity)?,
            write_timeout: Duration::from_millis(parse(
                &get,
                "TIDINGS_WRITE_TIMEOUT_MS",
                defaults.write_timeout.as_millis() as u64,
            )?),
            ..defaults
        };
        anyhow::ensure!(session.queue_capacity > 0, "TIDINGS_QUEUE_CAPACITY must be positive");

        Ok(Self {
            host: get("TIDINGS_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse(&get, "TIDINGS_PORT", 4000)?,
            db_path: get("TIDINGS_DB_PATH")
                .unwrap_or_else(|| "tidings.db".into())
                .into(),
            shutdown_timeout: Duration::from_secs(parse(&get, "TIDINGS_SHUTDOWN_TIMEOUT_SECS", 10)?),
            session,
        })
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key}={raw:?} is not a valid value")),
        None => Ok(default),
    }
}
