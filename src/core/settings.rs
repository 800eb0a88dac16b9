use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::error::QueryError;
use crate::core::models::{Expression, GroupDefinition};
use crate::core::query::QueryDescriptor;
use crate::core::retry::{RetryPolicy, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY};

const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub clients: BTreeMap<String, ClientSettings>,
    pub scheduler: SchedulerSettings,
    pub converter: ConverterSettings,
    pub output: OutputSettings,
    pub probes: ProbeSettings,
    pub self_metrics: SelfMetricsSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub region: String,
    pub endpoint: Option<String>,
    pub profile: Option<String>,
    /// Role ARN assumed through STS on top of the default credential chain.
    pub assume_role: Option<String>,
    pub max_pages: Option<u32>,
    pub request_timeout_secs: u64,
    pub metrics: Vec<MetricSettings>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            // Cost Explorer is global and only served from us-east-1
            region: "us-east-1".to_string(),
            endpoint: None,
            profile: None,
            assume_role: None,
            max_pages: None,
            request_timeout_secs: 30,
            metrics: Vec::new(),
        }
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn descriptors(&self) -> Result<Vec<QueryDescriptor>, QueryError> {
        self.metrics.iter().map(MetricSettings::to_descriptor).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSettings {
    pub granularity: String,
    pub metrics: Vec<String>,
    #[serde(default)]
    pub group_by: Vec<GroupDefinition>,
    #[serde(default)]
    pub filter: Option<Expression>,
}

impl MetricSettings {
    pub fn to_descriptor(&self) -> Result<QueryDescriptor, QueryError> {
        QueryDescriptor::new(
            &self.granularity,
            self.metrics.clone(),
            self.group_by.clone(),
            self.filter.clone(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Halt only the slot that ran out of retries.
    #[default]
    Isolate,
    /// Shut the whole process down.
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub retry_delay_secs: u64,
    pub max_retries: u32,
    pub failure_policy: FailurePolicy,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            retry_delay_secs: DEFAULT_RETRY_DELAY.as_secs(),
            max_retries: DEFAULT_MAX_RETRIES,
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl SchedulerSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(self.retry_delay_secs), self.max_retries)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterSettings {
    pub cooldown_secs: u64,
    pub metric_prefix: String,
    pub job: String,
}

impl Default for ConverterSettings {
    fn default() -> Self {
        Self {
            cooldown_secs: 30 * 60,
            metric_prefix: "ce_exporter".to_string(),
            job: "ce-exporter".to_string(),
        }
    }
}

impl ConverterSettings {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            path: "/metrics".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    pub host: String,
    pub port: u16,
    pub liveness: String,
    pub readiness: String,
    pub startup: String,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8989,
            liveness: "/live".to_string(),
            readiness: "/ready".to_string(),
            startup: "/start".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfMetricsSettings {
    pub interval_secs: u64,
}

impl Default for SelfMetricsSettings {
    fn default() -> Self {
        Self { interval_secs: 10 }
    }
}

impl SelfMetricsSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Settings {
    /// Explicit path (flag or env) first, then `./config.toml`, then the user
    /// config directory.
    pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }

        let local = PathBuf::from(DEFAULT_CONFIG_FILE);
        if local.exists() {
            return Ok(local);
        }

        dirs::config_dir()
            .map(|p| p.join("cost-meter").join(DEFAULT_CONFIG_FILE))
            .context("Could not determine config directory")
    }

    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_path(explicit)?;

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let settings = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        settings
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        tracing::info!(?path, clients = settings.clients.len(), "Loaded config");
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.clients.is_empty() {
            anyhow::bail!("client configuration is required. Supported clients: aws");
        }

        for (name, client) in &self.clients {
            if client.metrics.is_empty() {
                anyhow::bail!("clients.{name}: no metrics configured");
            }
            if client.request_timeout_secs == 0 {
                anyhow::bail!("clients.{name}.request_timeout_secs must be greater than 0");
            }
            if let Some(endpoint) = &client.endpoint {
                if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                    anyhow::bail!("clients.{name}.endpoint must be an http(s) URL, got {endpoint:?}");
                }
            }
            if let Some(role) = &client.assume_role {
                if !role.starts_with("arn:") {
                    anyhow::bail!("clients.{name}.assume_role must be a role ARN, got {role:?}");
                }
            }
            if client.max_pages == Some(0) {
                anyhow::bail!("clients.{name}.max_pages must be greater than 0 when set");
            }
            for (index, metric) in client.metrics.iter().enumerate() {
                metric
                    .to_descriptor()
                    .with_context(|| format!("clients.{name}.metrics[{index}]"))?;
            }
        }

        if self.scheduler.max_retries == 0 {
            anyhow::bail!("scheduler.max_retries must be greater than 0");
        }
        if self.scheduler.retry_delay_secs == 0 {
            anyhow::bail!("scheduler.retry_delay_secs must be greater than 0");
        }
        if self.converter.cooldown_secs == 0 {
            anyhow::bail!("converter.cooldown_secs must be greater than 0");
        }
        if self.self_metrics.interval_secs == 0 {
            anyhow::bail!("self_metrics.interval_secs must be greater than 0");
        }

        for (field, port) in [("output.port", self.output.port), ("probes.port", self.probes.port)] {
            if port == 0 {
                anyhow::bail!("{field} must be between 1 and 65535");
            }
        }
        if self.output.port == self.probes.port && self.output.host == self.probes.host {
            anyhow::bail!("output and probes cannot share port {}", self.output.port);
        }

        for (field, path) in [
            ("output.path", &self.output.path),
            ("probes.liveness", &self.probes.liveness),
            ("probes.readiness", &self.probes.readiness),
            ("probes.startup", &self.probes.startup),
        ] {
            if !path.starts_with('/') {
                anyhow::bail!("{field} must start with '/', got {path:?}");
            }
        }
        if self.output.path == "/" {
            anyhow::bail!("output.path cannot be '/', it serves the welcome page");
        }

        Ok(())
    }
}
