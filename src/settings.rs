use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct Postgres {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Http {
    pub listen: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Broker {
    pub brokers: String,
    pub group_id: String,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
    #[serde(default = "default_dead_letter_suffix")]
    pub dead_letter_suffix: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Baas {
    pub url: String,
    pub api_key: String,
    /// Without it every webhook fails verification.
    pub webhook_secret: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Routing {
    #[serde(default = "default_free_transfer_limit")]
    pub free_transfer_limit: i32,
}

impl Default for Routing {
    fn default() -> Self {
        Routing {
            free_transfer_limit: default_free_transfer_limit(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Scheduler {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_subscription_period_days")]
    pub subscription_period_days: i64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler {
            sweep_interval_secs: default_sweep_interval_secs(),
            subscription_period_days: default_subscription_period_days(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    pub postgres: Postgres,
    pub http: Http,
    pub broker: Broker,
    pub baas: Baas,
    #[serde(default)]
    pub routing: Routing,
    #[serde(default)]
    pub scheduler: Scheduler,
}

fn default_max_connections() -> u32 {
    5
}

fn default_publish_timeout_ms() -> u64 {
    5000
}

fn default_max_delivery_attempts() -> u32 {
    3
}

fn default_dead_letter_suffix() -> String {
    ".dlq".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_free_transfer_limit() -> i32 {
    crate::services::routing::DEFAULT_FREE_TRANSFER_LIMIT
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_subscription_period_days() -> i64 {
    30
}

impl Settings {
    /// Loads `path`, then overlays `ORCHESTRATOR__SECTION__KEY` variables.
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("ORCHESTRATOR").separator("__"))
            .build()?;

        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    const MINIMAL: &str = r#"
        [postgres]
        url = "postgres://localhost/orchestrator"

        [http]
        listen = "0.0.0.0:8080"

        [broker]
        brokers = "localhost:9092"
        group_id = "orchestrator"

        [baas]
        url = "https://api.sandbox.getanchor.co"
        api_key = "key"
    "#;

    #[test]
    fn defaults_fill_optional_sections() {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(MINIMAL, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.postgres.max_connections, 5);
        assert_eq!(settings.broker.max_delivery_attempts, 3);
        assert_eq!(settings.broker.dead_letter_suffix, ".dlq");
        assert_eq!(settings.routing.free_transfer_limit, 5);
        assert_eq!(settings.scheduler.subscription_period_days, 30);
        assert!(settings.baas.webhook_secret.is_none());
    }
}
