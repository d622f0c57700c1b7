//! Configuration loading from TOML files
//!
//! Config file is selected via the `--config <path>` argument, default
//! `config/dev.toml`. Every section is optional and falls back to defaults.

use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::warn;

/// What the pipeline does with the remaining routes once the oracle fails on one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanoutPolicy {
    /// Abandon the rest of the fan-out for this incident
    #[default]
    FailFast,
    /// Record the failure and keep evaluating the next routes
    Continue,
}

impl FanoutPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FanoutPolicy::FailFast => "fail_fast",
            FanoutPolicy::Continue => "continue",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Instance identifier, used as the metrics label
    #[serde(default = "default_service_id")]
    pub id: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { id: default_service_id() }
    }
}

fn default_service_id() -> String {
    "fleet-engine".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "fleet-engine".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicsConfig {
    /// Inbound incident events
    #[serde(default = "default_incidents_topic")]
    pub incidents: String,
    /// Outbound rider notifications (QoS 1)
    #[serde(default = "default_notifications_topic")]
    pub notifications: String,
    /// Raw payloads that failed to decode (disabled when unset)
    #[serde(default)]
    pub dead_letter: Option<String>,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            incidents: default_incidents_topic(),
            notifications: default_notifications_topic(),
            dead_letter: None,
        }
    }
}

fn default_incidents_topic() -> String {
    "accident".to_string()
}

fn default_notifications_topic() -> String {
    "social".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    #[serde(default = "default_oracle_url")]
    pub base_url: String,
    #[serde(default = "default_oracle_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self { base_url: default_oracle_url(), timeout_ms: default_oracle_timeout_ms() }
    }
}

fn default_oracle_url() -> String {
    "http://localhost:9000".to_string()
}

fn default_oracle_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub fanout_policy: FanoutPolicy,
    /// Extra attempts per route after a failed proximity check
    #[serde(default)]
    pub oracle_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Notification text; `{route}` is replaced with the route number
    #[serde(default = "default_notification_template")]
    pub notification_template: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fanout_policy: FanoutPolicy::default(),
            oracle_retries: 0,
            retry_backoff_ms: default_retry_backoff_ms(),
            notification_template: default_notification_template(),
        }
    }
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_notification_template() -> String {
    "Accident reported on route {route}. Sorry for the bus delay.".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: default_prometheus_port() }
    }
}

fn default_metrics_interval() -> u64 {
    30
}

fn default_prometheus_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Run an embedded MQTT broker (local development)
    #[serde(default)]
    pub embedded: bool,
    #[serde(default = "default_broker_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
}

fn default_broker_bind_address() -> String {
    "0.0.0.0".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { embedded: false, bind_address: default_broker_bind_address(), port: default_mqtt_port() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FleetConfig {
    /// JSON snapshot with routes and buses to seed the store
    #[serde(default)]
    pub snapshot: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub topics: TopicsConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub fleet: FleetConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    service_id: String,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_client_id: String,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_keep_alive_secs: u64,
    incidents_topic: String,
    notifications_topic: String,
    dead_letter_topic: Option<String>,
    oracle_base_url: String,
    oracle_timeout_ms: u64,
    fanout_policy: FanoutPolicy,
    oracle_retries: u32,
    retry_backoff_ms: u64,
    notification_template: String,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    broker_embedded: bool,
    broker_bind_address: String,
    broker_port: u16,
    fleet_snapshot: Option<String>,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            service_id: toml_config.service.id,
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_client_id: toml_config.mqtt.client_id,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            mqtt_keep_alive_secs: toml_config.mqtt.keep_alive_secs,
            incidents_topic: toml_config.topics.incidents,
            notifications_topic: toml_config.topics.notifications,
            dead_letter_topic: toml_config.topics.dead_letter,
            oracle_base_url: toml_config.oracle.base_url,
            oracle_timeout_ms: toml_config.oracle.timeout_ms,
            fanout_policy: toml_config.pipeline.fanout_policy,
            oracle_retries: toml_config.pipeline.oracle_retries,
            retry_backoff_ms: toml_config.pipeline.retry_backoff_ms,
            notification_template: toml_config.pipeline.notification_template,
            metrics_interval_secs: toml_config.metrics.interval_secs.max(1),
            prometheus_port: toml_config.metrics.prometheus_port,
            broker_embedded: toml_config.broker.embedded,
            broker_bind_address: toml_config.broker.bind_address,
            broker_port: toml_config.broker.port,
            fleet_snapshot: toml_config.fleet.snapshot,
            config_file,
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration from `path`, falling back to defaults on any error
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_client_id(&self) -> &str {
        &self.mqtt_client_id
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn mqtt_keep_alive_secs(&self) -> u64 {
        self.mqtt_keep_alive_secs
    }

    pub fn incidents_topic(&self) -> &str {
        &self.incidents_topic
    }

    pub fn notifications_topic(&self) -> &str {
        &self.notifications_topic
    }

    pub fn dead_letter_topic(&self) -> Option<&str> {
        self.dead_letter_topic.as_deref()
    }

    pub fn oracle_base_url(&self) -> &str {
        &self.oracle_base_url
    }

    pub fn oracle_timeout_ms(&self) -> u64 {
        self.oracle_timeout_ms
    }

    pub fn fanout_policy(&self) -> FanoutPolicy {
        self.fanout_policy
    }

    pub fn oracle_retries(&self) -> u32 {
        self.oracle_retries
    }

    pub fn retry_backoff_ms(&self) -> u64 {
        self.retry_backoff_ms
    }

    pub fn notification_template(&self) -> &str {
        &self.notification_template
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn broker_embedded(&self) -> bool {
        self.broker_embedded
    }

    pub fn broker_bind_address(&self) -> &str {
        &self.broker_bind_address
    }

    pub fn broker_port(&self) -> u16 {
        self.broker_port
    }

    pub fn fleet_snapshot(&self) -> Option<&str> {
        self.fleet_snapshot.as_deref()
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Overrides the fan-out policy
    pub fn with_fanout_policy(mut self, policy: FanoutPolicy) -> Self {
        self.fanout_policy = policy;
        self
    }

    /// Overrides oracle retries and the base backoff
    pub fn with_oracle_retries(mut self, retries: u32, backoff_ms: u64) -> Self {
        self.oracle_retries = retries;
        self.retry_backoff_ms = backoff_ms;
        self
    }

    /// Sets the dead-letter topic
    pub fn with_dead_letter_topic(mut self, topic: &str) -> Self {
        self.dead_letter_topic = Some(topic.to_string());
        self
    }
}
