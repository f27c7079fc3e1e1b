use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context as _, Result};

use crate::db::DbConfig;
use crate::engine::EngineSettings;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    /// Run on the in-process store instead of Postgres. State is lost on exit.
    pub in_memory: bool,
    pub database: DbConfig,
    pub engine: EngineSettings,
    pub cleanup_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("BERTH_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("BERTH_LISTEN_ADDR must be a socket address")?;

        let log_level = std::env::var("BERTH_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = flag_from_env("BERTH_DEV");
        let in_memory = flag_from_env("BERTH_IN_MEMORY");

        let database = DbConfig::from_env();

        let defaults = EngineSettings::default();
        let engine = EngineSettings {
            reservation_ttl: secs_from_env("BERTH_PORT_RESERVATION_TTL_SECS")?
                .unwrap_or(defaults.reservation_ttl),
            task_stale_after: secs_from_env("BERTH_TASK_STALE_SECS")?
                .unwrap_or(defaults.task_stale_after),
            node_reachable_within: secs_from_env("BERTH_NODE_REACHABLE_SECS")?
                .unwrap_or(defaults.node_reachable_within),
        };

        let cleanup_interval = secs_from_env("BERTH_CLEANUP_INTERVAL_SECS")?
            .unwrap_or(Duration::from_secs(300));

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            in_memory,
            database,
            engine,
            cleanup_interval,
        })
    }
}

fn secs_from_env(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(raw) => {
            let secs: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{name} must be a whole number of seconds"))?;
            Ok(Some(Duration::from_secs(secs)))
        }
        Err(_) => Ok(None),
    }
}

fn flag_from_env(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}
