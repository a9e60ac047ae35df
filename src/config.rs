//! Configuration loading.
//!
//! A `Settings` struct loaded via `figment` from a TOML file plus
//! `SPM_`-prefixed environment overrides, validated once at load time via
//! [`crate::validation`] before any component is spawned: a bad descriptor
//! tree is a fatal `ConfigurationError`, never a per-component runtime
//! surprise.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::component::ComponentDescriptor;
use crate::error::{Result, SpmError};
use crate::validation;

fn default_request_timeout_ms() -> u64 {
    2500
}

fn default_max_retries() -> u32 {
    3
}

fn default_loop_period_ms() -> u64 {
    100
}

fn default_monitor_loop_sleep_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Cache capacities outside this range are almost certainly a typo: 0
/// makes a topic's replay buffer pointless, and six figures of buffered
/// envelopes per topic is well past any deployment this crate targets.
const CACHE_CAPACITY_RANGE: std::ops::RangeInclusive<usize> = 1..=100_000;

/// Validate that `addr` is a `host:port` pair whose host parses as an IP
/// address, matching the only addressing scheme this crate's transports use.
fn validate_socket_addr(addr: &str) -> std::result::Result<(), String> {
    let host = addr
        .rsplit_once(':')
        .map(|(host, _port)| host)
        .ok_or_else(|| format!("missing port in '{addr}'"))?;
    validation::is_valid_ip(host).map_err(|reason| format!("{reason} ('{addr}')"))
}

/// Application-wide settings, matching `config_v4.rs`'s `ApplicationConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Human-readable name for this deployment, used only in logs.
    pub name: String,
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Global timing defaults every component inherits unless overridden by its
/// own descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSettings {
    /// Control client request timeout. Default 2500ms.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Control client retry count. Default 3.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Main-loop sleep between `tick()` calls for Translator/Scheduler/
    /// DriftScheduler. Default 100ms.
    #[serde(default = "default_loop_period_ms")]
    pub loop_period_ms: u64,
    /// Monitor's own `run_per_loop` sleep. Default 1000ms.
    #[serde(default = "default_monitor_loop_sleep_ms")]
    pub monitor_loop_sleep_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            max_retries: default_max_retries(),
            loop_period_ms: default_loop_period_ms(),
            monitor_loop_sleep_ms: default_monitor_loop_sleep_ms(),
        }
    }
}

/// Top-level configuration tree: one file describes the application, its
/// timing defaults, and the full component descriptor tree the Monitor
/// spawns from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application-level settings.
    pub application: ApplicationSettings,
    /// Global timing defaults.
    #[serde(default)]
    pub timing: TimingSettings,
    /// The descriptor tree the Monitor (C11) spawns and supervises.
    pub components: Vec<ComponentDescriptor>,
}

impl Settings {
    /// Load configuration from `path`, merging `SPM_`-prefixed environment
    /// overrides on top (e.g. `SPM_APPLICATION_LOG_LEVEL=debug`), mirroring
    /// `V4Config::load_from`.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SPM_").split("_"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the loaded tree: log level is recognized, component names
    /// are unique and non-empty, heartbeat ports and drift-log paths are
    /// well-formed, and every descriptor's `depends_on` names an actual
    /// component in the same tree.
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(SpmError::ConfigurationError(format!(
                "invalid log_level '{}', must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let mut names = std::collections::HashSet::new();
        for component in &self.components {
            validation::is_not_empty(&component.name)
                .map_err(|reason| SpmError::ConfigurationError(reason.to_string()))?;
            validation::is_valid_port(component.heartbeat_base_port).map_err(|reason| {
                SpmError::ConfigurationError(format!("{}: {reason}", component.name))
            })?;
            validate_component_addrs(&component.name, &component.kind)?;
            if let crate::component::ComponentKind::DriftScheduler { csv_path, .. } = &component.kind {
                validation::is_valid_path(csv_path).map_err(|reason| {
                    SpmError::ConfigurationError(format!("{}: {reason}", component.name))
                })?;
            }
            if !names.insert(component.name.as_str()) {
                return Err(SpmError::ConfigurationError(format!(
                    "duplicate component name: {}",
                    component.name
                )));
            }
        }

        for component in &self.components {
            for dependency in component.depends_on() {
                if !names.contains(dependency.as_str()) {
                    return Err(SpmError::ConfigurationError(format!(
                        "component '{}' depends on unknown component '{}'",
                        component.name, dependency
                    )));
                }
            }
        }

        Ok(())
    }

    /// The descriptor named `name`, if present.
    pub fn component(&self, name: &str) -> Option<&ComponentDescriptor> {
        self.components.iter().find(|c| c.name == name)
    }
}

/// Validate every bind/connect address and cache capacity a descriptor
/// carries, prefixing errors with `name` the same way the port/path checks
/// above do.
fn validate_component_addrs(name: &str, kind: &crate::component::ComponentKind) -> Result<()> {
    use crate::component::ComponentKind;

    let addrs: Vec<&str> = match kind {
        ComponentKind::Translator { publish_addr, control_addr, .. } => {
            vec![publish_addr, control_addr]
        }
        ComponentKind::Scheduler { cache_upstream, cache_downstream, router_addr, router_upstream, .. } => {
            vec![cache_upstream, cache_downstream, router_addr, router_upstream]
        }
        ComponentKind::DriftScheduler {
            cache_upstream,
            cache_downstream,
            router_addr,
            router_upstream,
            rescan_publisher_addr,
            ..
        } => {
            vec![cache_upstream, cache_downstream, router_addr, router_upstream, rescan_publisher_addr]
        }
    };
    for addr in addrs {
        validate_socket_addr(addr).map_err(|reason| SpmError::ConfigurationError(format!("{name}: {reason}")))?;
    }

    if let ComponentKind::Scheduler { cache_capacity, cache_capacity_overrides, .. }
    | ComponentKind::DriftScheduler { cache_capacity, cache_capacity_overrides, .. } = kind
    {
        validation::is_in_range(*cache_capacity, CACHE_CAPACITY_RANGE)
            .map_err(|reason| SpmError::ConfigurationError(format!("{name}: {reason}")))?;
        for (topic, capacity) in cache_capacity_overrides {
            validation::is_in_range(*capacity, CACHE_CAPACITY_RANGE).map_err(|reason| {
                SpmError::ConfigurationError(format!("{name}: {reason} (topic '{topic}')"))
            })?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentKind;
    use crate::topics::ScanTopicPolicy;

    fn sample(name: &str, log_level: &str) -> Settings {
        Settings {
            application: ApplicationSettings { name: name.to_string(), log_level: log_level.to_string() },
            timing: TimingSettings::default(),
            components: vec![ComponentDescriptor {
                name: "translator".to_string(),
                heartbeat_base_port: 9000,
                heartbeat_period_ms: 1000,
                missed_beats_before_dead: 5,
                kind: ComponentKind::Translator {
                    instrument: "mock".to_string(),
                    publish_addr: "127.0.0.1:19000".to_string(),
                    control_addr: "127.0.0.1:19001".to_string(),
                    scan_topic_policy: ScanTopicPolicy::PerType,
                    depends_on: vec![],
                },
            }],
        }
    }

    #[test]
    fn valid_settings_pass_validation() {
        assert!(sample("demo", "info").validate().is_ok());
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        assert!(sample("demo", "nonsense").validate().is_err());
    }

    #[test]
    fn duplicate_component_names_are_rejected() {
        let mut settings = sample("demo", "info");
        let duplicate = settings.components[0].clone();
        settings.components.push(duplicate);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn dangling_dependency_is_rejected() {
        let mut settings = sample("demo", "info");
        settings.components.push(ComponentDescriptor {
            name: "scheduler".to_string(),
            heartbeat_base_port: 9000,
            heartbeat_period_ms: 1000,
            missed_beats_before_dead: 5,
            kind: ComponentKind::Scheduler {
                cache_upstream: "127.0.0.1:19000".to_string(),
                cache_downstream: "127.0.0.1:19010".to_string(),
                cache_capacity: 256,
                cache_capacity_overrides: std::collections::HashMap::new(),
                router_addr: "127.0.0.1:19011".to_string(),
                router_upstream: "127.0.0.1:19001".to_string(),
                depends_on: vec!["nonexistent".to_string()],
            },
        });
        assert!(settings.validate().is_err());
    }

    #[test]
    fn load_from_missing_file_errors() {
        let result = Settings::load_from("/nonexistent/path/config.toml");
        assert!(result.is_err());
    }

    #[test]
    fn zero_heartbeat_base_port_is_rejected() {
        let mut settings = sample("demo", "info");
        settings.components[0].heartbeat_base_port = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn non_ip_host_in_publish_addr_is_rejected() {
        let mut settings = sample("demo", "info");
        if let ComponentKind::Translator { publish_addr, .. } = &mut settings.components[0].kind {
            *publish_addr = "localhost:19000".to_string();
        }
        assert!(settings.validate().is_err());
    }

    #[test]
    fn zero_cache_capacity_is_rejected() {
        let mut settings = sample("demo", "info");
        settings.components.push(ComponentDescriptor {
            name: "scheduler".to_string(),
            heartbeat_base_port: 9001,
            heartbeat_period_ms: 1000,
            missed_beats_before_dead: 5,
            kind: ComponentKind::Scheduler {
                cache_upstream: "127.0.0.1:19000".to_string(),
                cache_downstream: "127.0.0.1:19010".to_string(),
                cache_capacity: 0,
                cache_capacity_overrides: std::collections::HashMap::new(),
                router_addr: "127.0.0.1:19011".to_string(),
                router_upstream: "127.0.0.1:19001".to_string(),
                depends_on: vec!["translator".to_string()],
            },
        });
        assert!(settings.validate().is_err());
    }

    #[test]
    fn out_of_range_cache_capacity_override_is_rejected() {
        let mut settings = sample("demo", "info");
        let mut overrides = std::collections::HashMap::new();
        overrides.insert("scan2d".to_string(), 0usize);
        settings.components.push(ComponentDescriptor {
            name: "scheduler".to_string(),
            heartbeat_base_port: 9001,
            heartbeat_period_ms: 1000,
            missed_beats_before_dead: 5,
            kind: ComponentKind::Scheduler {
                cache_upstream: "127.0.0.1:19000".to_string(),
                cache_downstream: "127.0.0.1:19010".to_string(),
                cache_capacity: 256,
                cache_capacity_overrides: overrides,
                router_addr: "127.0.0.1:19011".to_string(),
                router_upstream: "127.0.0.1:19001".to_string(),
                depends_on: vec!["translator".to_string()],
            },
        });
        assert!(settings.validate().is_err());
    }
}
