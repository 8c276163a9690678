use serde::{Deserialize, Serialize};
use std::fs;

use anyhow::{Context, Result};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub economy: EconomyConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

/// Per-market actor and event bus sizing.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EngineConfig {
    /// Bounded command channel per market worker
    pub command_queue_size: usize,
    /// Ring buffer between engine commits and the event dispatcher
    pub event_queue_size: usize,
    /// Aggregated levels per side in published snapshots
    pub snapshot_depth: usize,
    /// Enqueue deadline for gateway commands, in milliseconds
    pub command_deadline_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_queue_size: 256,
            event_queue_size: 8_192,
            snapshot_depth: 20,
            command_deadline_ms: 2_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_ttl_hours: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "dev-only-secret".to_string(),
            token_ttl_hours: 24,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EconomyConfig {
    /// Cents granted to every new user (1000 tokens)
    pub initial_balance_cents: u64,
}

impl Default for EconomyConfig {
    fn default() -> Self {
        Self {
            initial_balance_cents: 100_000,
        }
    }
}

impl AppConfig {
    /// Load config from YAML file based on environment
    pub fn load(env: &str) -> Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        let mut config: Self =
            serde_yaml::from_str(&content).context("Failed to parse config yaml")?;

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Environment variables take precedence over YAML config.
    /// Format: PDX_<SECTION>_<FIELD>.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("PDX_GATEWAY_PORT") {
            if let Ok(p) = port.parse::<u16>() {
                tracing::info!("Config override: gateway.port = {} (from PDX_GATEWAY_PORT)", p);
                self.gateway.port = p;
            }
        }
        if let Ok(host) = std::env::var("PDX_GATEWAY_HOST") {
            tracing::info!("Config override: gateway.host = {} (from PDX_GATEWAY_HOST)", host);
            self.gateway.host = host;
        }
        if let Ok(level) = std::env::var("PDX_LOG_LEVEL") {
            tracing::info!("Config override: log_level = {} (from PDX_LOG_LEVEL)", level);
            self.log_level = level;
        }
        if let Ok(secret) = std::env::var("PDX_JWT_SECRET") {
            tracing::info!("Config override: auth.jwt_secret = [REDACTED] (from PDX_JWT_SECRET)");
            self.auth.jwt_secret = secret;
        }
    }

    /// Validate configuration at startup.
    pub fn validate(&self) -> Result<()> {
        if self.gateway.port == 0 {
            anyhow::bail!("Invalid gateway.port: must be > 0");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log_level '{}': must be one of {:?}",
                self.log_level,
                valid_levels
            );
        }

        if self.engine.command_queue_size == 0 {
            anyhow::bail!("Invalid engine.command_queue_size: must be > 0");
        }
        if self.engine.event_queue_size == 0 {
            anyhow::bail!("Invalid engine.event_queue_size: must be > 0");
        }
        if self.engine.snapshot_depth == 0 {
            anyhow::bail!("Invalid engine.snapshot_depth: must be > 0");
        }
        if self.auth.jwt_secret.is_empty() {
            anyhow::bail!("Invalid auth.jwt_secret: must not be empty");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "predex.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
            gateway: GatewayConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            engine: EngineConfig::default(),
            auth: AuthConfig::default(),
            economy: EconomyConfig::default(),
        }
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_validate_invalid_port() {
        let mut config = base_config();
        config.gateway.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = base_config();
        config.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_secret() {
        let mut config = base_config();
        config.auth.jwt_secret = String::new();
        assert!(config.validate().is_err());
    }
}
