use crate::{AgentComError, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;

use crate::constants::{
    DEFAULT_AGENT_HEARTBEAT_TIMEOUT_SECS, DEFAULT_BACKUP_RETENTION_COUNT,
    DEFAULT_BUDGET_CONTEMPLATING_PER_HOUR, DEFAULT_BUDGET_EXECUTING_PER_HOUR,
    DEFAULT_BUDGET_IMPROVING_PER_HOUR, DEFAULT_HUB_WATCHDOG_SECS, DEFAULT_REAPER_INTERVAL_SECS,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    pub api: ApiConfig,
    pub rate_limit: RateLimitConfig,
    pub cost_ledger: CostLedgerConfig,
    pub hub_fsm: HubFsmConfig,
    pub reaper: ReaperConfig,
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub data_dir: String,
    pub backup_retention_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub bearer_token: Option<String>,
    pub enable_auth: bool,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub default_capacity: f64,
    pub default_refill_per_sec: f64,
    pub heartbeat_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostLedgerConfig {
    pub executing_per_hour: u32,
    pub improving_per_hour: u32,
    pub contemplating_per_hour: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubFsmConfig {
    pub tick_interval_secs: u64,
    pub watchdog_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub github_secret: Option<String>,
    pub registered_repos: Vec<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        match dotenv() {
            Ok(path) => tracing::info!("loaded .env file from: {:?}", path),
            Err(e) => tracing::debug!("no .env file loaded: {}", e),
        }

        let bearer_token = env::var("AGENTCOM_BEARER_TOKEN").ok();

        match &bearer_token {
            Some(key) if key.trim().is_empty() => {
                return Err(AgentComError::Configuration(
                    "AGENTCOM_BEARER_TOKEN is set but blank".to_string(),
                ));
            }
            Some(key) if key.len() < 32 => {
                return Err(AgentComError::Configuration(
                    "AGENTCOM_BEARER_TOKEN must be at least 32 characters".to_string(),
                ));
            }
            None => {
                tracing::warn!(
                    "AGENTCOM_BEARER_TOKEN not set; a token will be minted and printed on startup"
                );
            }
            Some(_) => {}
        }

        let allowed_origins = env::var("AGENTCOM_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let api = ApiConfig {
            host: env::var("AGENTCOM_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("AGENTCOM_PORT")
                .unwrap_or_else(|_| "4500".to_string())
                .parse()
                .map_err(|_| AgentComError::Configuration("AGENTCOM_PORT must be a u16".into()))?,
            bearer_token,
            enable_auth: true,
            allowed_origins,
        };

        let store = StoreConfig {
            data_dir: env::var("AGENTCOM_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            backup_retention_count: env::var("AGENTCOM_BACKUP_RETENTION")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BACKUP_RETENTION_COUNT),
        };

        let rate_limit = RateLimitConfig {
            default_capacity: env::var("AGENTCOM_RATE_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10.0),
            default_refill_per_sec: env::var("AGENTCOM_RATE_REFILL_PER_SEC")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1.0),
            heartbeat_timeout_secs: env::var("AGENTCOM_HEARTBEAT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_AGENT_HEARTBEAT_TIMEOUT_SECS),
        };

        let cost_ledger = CostLedgerConfig {
            executing_per_hour: env::var("AGENTCOM_BUDGET_EXECUTING")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BUDGET_EXECUTING_PER_HOUR),
            improving_per_hour: env::var("AGENTCOM_BUDGET_IMPROVING")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BUDGET_IMPROVING_PER_HOUR),
            contemplating_per_hour: env::var("AGENTCOM_BUDGET_CONTEMPLATING")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BUDGET_CONTEMPLATING_PER_HOUR),
        };

        let hub_fsm = HubFsmConfig {
            tick_interval_secs: env::var("AGENTCOM_HUB_TICK_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            watchdog_secs: env::var("AGENTCOM_HUB_WATCHDOG_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_HUB_WATCHDOG_SECS),
        };

        let reaper = ReaperConfig {
            interval_secs: env::var("AGENTCOM_REAPER_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_REAPER_INTERVAL_SECS),
        };

        let webhook = WebhookConfig {
            github_secret: env::var("AGENTCOM_GITHUB_WEBHOOK_SECRET").ok(),
            registered_repos: env::var("AGENTCOM_REGISTERED_REPOS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        };

        Ok(Config {
            store,
            api,
            rate_limit,
            cost_ledger,
            hub_fsm,
            reaper,
            webhook,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_load_with_defaults() {
        env::remove_var("AGENTCOM_BEARER_TOKEN");
        env::remove_var("AGENTCOM_PORT");
        let config = Config::load().expect("config should load with defaults");
        assert_eq!(config.api.port, 4500);
        assert_eq!(config.reaper.interval_secs, DEFAULT_REAPER_INTERVAL_SECS);
    }

    #[test]
    #[serial]
    fn test_rejects_short_bearer_token() {
        env::set_var("AGENTCOM_BEARER_TOKEN", "tooshort");
        let result = Config::load();
        env::remove_var("AGENTCOM_BEARER_TOKEN");
        assert!(result.is_err());
    }
}
