//! cutover.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;
use crate::error::ConfigError;
use crate::types::{ProbeConfig, ServiceSpec, ShiftPlan, ShiftStep};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CutoverConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Largest instance count a single target group may launch.
    #[serde(default = "default_max_group_size")]
    pub max_group_size: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_group_size: default_max_group_size(),
        }
    }
}

/// Which backends drive the registry, compute, and load balancer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformMode {
    /// In-process simulated backends; probes always succeed.
    #[default]
    Simulated,
    /// Simulated registry/compute/load balancer, real HTTP probes.
    SimulatedHttpProbe,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default)]
    pub mode: PlatformMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub id: String,
    pub image: String,
    pub port: Option<u16>,
    pub desired_count: u32,
    pub health: Option<HealthConfig>,
    pub validation_timeout: Option<String>,
    pub shift_step_timeout: Option<String>,
    pub plan: Option<PlanConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub path: Option<String>,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub retries: Option<u32>,
    /// Healthy percentage required for quorum (0–100).
    pub healthy_percent: Option<u32>,
    pub sustain: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConfig {
    /// "atomic" or "weighted".
    pub strategy: String,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    pub weight: u8,
    pub hold: String,
}

fn default_port() -> u16 {
    8480
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/cutover")
}

fn default_max_group_size() -> u32 {
    32
}

impl CutoverConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Convert every `[[services]]` entry into a `ServiceSpec`.
    pub fn service_specs(&self) -> Result<Vec<ServiceSpec>, ConfigError> {
        self.services.iter().map(ServiceConfig::to_spec).collect()
    }

    /// Scaffold a config with a single service.
    pub fn scaffold(service: &str, image: &str) -> Self {
        CutoverConfig {
            daemon: DaemonConfig::default(),
            limits: LimitsConfig::default(),
            platform: PlatformConfig::default(),
            services: vec![ServiceConfig {
                id: service.to_string(),
                image: image.to_string(),
                port: Some(80),
                desired_count: 2,
                health: Some(HealthConfig {
                    path: Some("/health".to_string()),
                    interval: Some("5s".to_string()),
                    timeout: Some("2s".to_string()),
                    retries: Some(3),
                    healthy_percent: Some(100),
                    sustain: None,
                }),
                validation_timeout: Some("5m".to_string()),
                shift_step_timeout: Some("30s".to_string()),
                plan: Some(PlanConfig {
                    strategy: "atomic".to_string(),
                    steps: Vec::new(),
                }),
            }],
        }
    }
}

impl ServiceConfig {
    pub fn to_spec(&self) -> Result<ServiceSpec, ConfigError> {
        let mut spec = ServiceSpec::new(&self.id, &self.image, self.desired_count);
        if let Some(port) = self.port {
            spec.port = port;
        }
        if let Some(health) = &self.health {
            spec.health = health.to_probe_config(&self.id)?;
        }
        if let Some(v) = &self.validation_timeout {
            spec.validation_timeout = duration_field(&self.id, "validation_timeout", v)?;
        }
        if let Some(v) = &self.shift_step_timeout {
            spec.shift_step_timeout = duration_field(&self.id, "shift_step_timeout", v)?;
        }
        if let Some(plan) = &self.plan {
            spec.plan = plan.to_shift_plan(&self.id)?;
        }
        if spec.desired_count == 0 {
            return Err(ConfigError::Service {
                service: self.id.clone(),
                reason: "desired_count must be at least 1".to_string(),
            });
        }
        Ok(spec)
    }
}

impl HealthConfig {
    fn to_probe_config(&self, service: &str) -> Result<ProbeConfig, ConfigError> {
        let mut cfg = ProbeConfig::default();
        if let Some(path) = &self.path {
            cfg.path = path.clone();
        }
        if let Some(v) = &self.interval {
            cfg.interval = duration_field(service, "health.interval", v)?;
        }
        if let Some(v) = &self.timeout {
            cfg.timeout = duration_field(service, "health.timeout", v)?;
        }
        if let Some(retries) = self.retries {
            cfg.retries = retries.max(1);
        }
        if let Some(percent) = self.healthy_percent {
            if percent > 100 {
                return Err(ConfigError::Service {
                    service: service.to_string(),
                    reason: format!("healthy_percent {percent} exceeds 100"),
                });
            }
            cfg.healthy_threshold = f64::from(percent) / 100.0;
        }
        if let Some(v) = &self.sustain {
            cfg.sustain = Some(duration_field(service, "health.sustain", v)?);
        }
        Ok(cfg)
    }
}

impl PlanConfig {
    fn to_shift_plan(&self, service: &str) -> Result<ShiftPlan, ConfigError> {
        match self.strategy.as_str() {
            "atomic" | "all_at_once" => Ok(ShiftPlan::Atomic),
            "weighted" | "canary" => {
                let steps = self
                    .steps
                    .iter()
                    .map(|s| {
                        Ok(ShiftStep {
                            weight: s.weight,
                            hold: duration_field(service, "plan.steps.hold", &s.hold)?,
                        })
                    })
                    .collect::<Result<Vec<_>, ConfigError>>()?;
                if steps.is_empty() {
                    return Err(ConfigError::Service {
                        service: service.to_string(),
                        reason: "weighted plan needs at least one step".to_string(),
                    });
                }
                Ok(ShiftPlan::Weighted { steps })
            }
            other => Err(ConfigError::Service {
                service: service.to_string(),
                reason: format!("unknown plan strategy {other:?}"),
            }),
        }
    }
}

fn duration_field(service: &str, field: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::Duration {
        field: format!("{service}.{field}"),
        value: value.to_string(),
    })
}
