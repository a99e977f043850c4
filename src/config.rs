//! Configuration loaded from environment variables at startup.
//!
//! Follows the config-struct-with-defaults shape of
//! `commands::config::AxonConfig`, adapted from TOML-file loading to
//! env-var loading since this service's external interface is defined in
//! terms of environment variables, not a config file.

use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub postoffice_url: Option<String>,
    pub security_url: Option<String>,
    pub missioncontrol_url: Option<String>,
    pub primary_worker_url: Option<String>,
    pub primary_worker_capacity: u32,
    pub worker_refresh_interval_secs: u64,
    pub reaper_interval_secs: u64,
    pub orphan_sweep_interval_secs: u64,
    pub bearer_token: String,
}

impl Config {
    /// Load configuration from environment variables, applying the
    /// documented defaults for anything unset.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            port: env_parsed("PORT", 5080)?,
            postoffice_url: env::var("POSTOFFICE_URL").ok(),
            security_url: env::var("SECURITY_URL").ok(),
            missioncontrol_url: env::var("MISSIONCONTROL_URL").ok(),
            primary_worker_url: env::var("PRIMARY_WORKER_URL").ok(),
            primary_worker_capacity: env_parsed("PRIMARY_WORKER_CAPACITY", 250)?,
            worker_refresh_interval_secs: env_parsed("WORKER_REFRESH_INTERVAL_SECONDS", 60)?,
            reaper_interval_secs: env_parsed("REAPER_INTERVAL_SECONDS", 60)?,
            orphan_sweep_interval_secs: 300,
            bearer_token: env::var("CORE_BEARER_TOKEN").unwrap_or_else(|_| {
                tracing::warn!(
                    "CORE_BEARER_TOKEN not set; using development default token. \
                     Set CORE_BEARER_TOKEN in any non-development deployment."
                );
                "traffic-core-dev-token-change-me".to_string()
            }),
        })
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        // SAFETY: test runs single-threaded w.r.t. this var via serial env access below.
        unsafe {
            env::remove_var("PORT");
        }
        let config = Config::from_env().unwrap();
        assert_eq!(config.port, 5080);
        assert_eq!(config.primary_worker_capacity, 250);
        assert_eq!(config.worker_refresh_interval_secs, 60);
    }
}
