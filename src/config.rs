//! Configuration model for `config.yaml`.
//!
//! The file carries global settings plus a map of service definitions.
//! Loading validates everything up front; after a successful load the
//! definitions are immutable for the life of the process.
//!
//! Two healthcheck shapes exist in the wild: the canonical
//! `test_type`/`test_target`/`start_period` form and an older
//! `enable`/`url`/`check_delay` form. The loader accepts either but
//! refuses blocks that mix the two.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::health::{ProbeKind, ProbeSettings};
use crate::paths::Paths;
use crate::service::ServiceSpec;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_app_data_home")]
    pub app_data_home: String,
    #[serde(default = "default_sys_service_name")]
    pub sys_service_name: String,
    #[serde(default = "default_sys_service_desc")]
    pub sys_service_desc: String,
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_app_data_home() -> String {
    let home = dirs::home_dir().unwrap_or_else(|| ".".into());
    home.join(".process-compose").to_string_lossy().into_owned()
}

fn default_sys_service_name() -> String {
    "process-compose".to_string()
}

fn default_sys_service_desc() -> String {
    "Process supervision and management tool".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Filled from the services map key after parse
    #[serde(skip)]
    pub name: String,
    pub start_cmd: Vec<String>,
    #[serde(default)]
    pub log_redirect: bool,
    /// Seconds between prerequisites turning healthy and the spawn
    #[serde(default)]
    pub startup_delay: u64,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Extra environment passed to the child
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Rotate the redirected log above this size
    #[serde(default = "default_log_max_size_mib")]
    pub log_max_size_mib: u64,
    /// Rotated files to keep
    #[serde(default = "default_log_keep")]
    pub log_keep: usize,
    pub healthcheck: Option<HealthcheckConfig>,
}

fn default_log_max_size_mib() -> u64 {
    10
}

fn default_log_keep() -> usize {
    5
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    Process,
    Http,
    Tcp,
    Cmd,
}

/// Healthcheck block, canonical and legacy fields side by side.
///
/// Normalization into [`ProbeSettings`] happens in [`HealthcheckConfig::resolve`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct HealthcheckConfig {
    // Canonical shape
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_type: Option<TestType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_period: Option<u64>,
    /// Restart policy toggle; lifted out of the probe itself
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart: Option<bool>,

    // Legacy shape
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_delay: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_failures: Option<u32>,
}

impl HealthcheckConfig {
    fn has_canonical_fields(&self) -> bool {
        self.test_type.is_some()
            || self.test_target.is_some()
            || self.timeout.is_some()
            || self.interval.is_some()
            || self.retries.is_some()
            || self.start_period.is_some()
    }

    fn has_legacy_fields(&self) -> bool {
        self.enable.is_some()
            || self.url.is_some()
            || self.check_delay.is_some()
            || self.max_failures.is_some()
    }

    /// Normalize into probe settings. `Ok(None)` means the block disables
    /// health checking (legacy `enable: false`).
    pub fn resolve(&self) -> std::result::Result<Option<ProbeSettings>, String> {
        if self.has_canonical_fields() && self.has_legacy_fields() {
            return Err(
                "healthcheck mixes legacy (enable/url/check_delay/max_failures) and \
                 canonical (test_type/test_target/...) fields"
                    .to_string(),
            );
        }

        if self.has_legacy_fields() {
            if self.enable == Some(false) {
                return Ok(None);
            }
            let kind = match &self.url {
                Some(url) => ProbeKind::Http { url: url.clone() },
                None => ProbeKind::Process,
            };
            return Ok(Some(ProbeSettings {
                kind,
                timeout: Duration::from_secs(5),
                interval: Duration::from_secs(10),
                retries: self.max_failures.unwrap_or(3),
                start_period: Duration::from_secs(self.check_delay.unwrap_or(0)),
            }));
        }

        let test_type = self.test_type.unwrap_or(TestType::Process);
        let kind = match (test_type, &self.test_target) {
            (TestType::Process, None) => ProbeKind::Process,
            (TestType::Process, Some(_)) => {
                return Err("test_target is not valid for test_type: process".to_string());
            }
            (TestType::Http, Some(url)) => ProbeKind::Http { url: url.clone() },
            (TestType::Tcp, Some(addr)) => ProbeKind::Tcp { addr: addr.clone() },
            (TestType::Cmd, Some(command)) => ProbeKind::Cmd {
                command: command.clone(),
            },
            (t, None) => {
                return Err(format!("test_target is required for test_type: {:?}", t));
            }
        };
        Ok(Some(ProbeSettings {
            kind,
            timeout: Duration::from_secs(self.timeout.unwrap_or(5)),
            interval: Duration::from_secs(self.interval.unwrap_or(10)),
            retries: self.retries.unwrap_or(3),
            start_period: Duration::from_secs(self.start_period.unwrap_or(0)),
        }))
    }
}

impl ServiceConfig {
    fn resolve_spec(&self, paths: &Paths) -> std::result::Result<ServiceSpec, String> {
        if self.start_cmd.is_empty() {
            return Err("start_cmd must not be empty".to_string());
        }
        if self.start_cmd[0].trim().is_empty() {
            return Err("start_cmd[0] must not be blank".to_string());
        }
        if self.depends_on.iter().any(|d| d == &self.name) {
            return Err("service cannot depend on itself".to_string());
        }
        let probe = match &self.healthcheck {
            Some(hc) => hc.resolve()?,
            None => None,
        };
        let restart = self
            .healthcheck
            .as_ref()
            .and_then(|hc| hc.restart)
            .unwrap_or(true);
        Ok(ServiceSpec {
            name: self.name.clone(),
            work_dir: paths.service_work_dir(&self.name),
            start_cmd: self.start_cmd.clone(),
            environment: self.environment.clone(),
            log_redirect: self.log_redirect,
            log_dir: paths.service_log_dir(&self.name),
            log_max_size: self.log_max_size_mib * 1024 * 1024,
            log_keep: self.log_keep,
            data_dir: paths.service_home(&self.name),
            startup_delay: Duration::from_secs(self.startup_delay),
            depends_on: self.depends_on.clone(),
            probe,
            restart,
        })
    }
}

impl GlobalConfig {
    /// Parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&contents).map_err(|reason| Error::ConfigInvalid {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Parse and validate config file contents.
    pub fn parse(contents: &str) -> std::result::Result<Self, String> {
        let mut config: GlobalConfig =
            serde_yaml::from_str(contents).map_err(|e| e.to_string())?;
        for (name, service) in config.services.iter_mut() {
            service.name = name.clone();
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        for (name, service) in &self.services {
            for dep in &service.depends_on {
                if !self.services.contains_key(dep) {
                    return Err(format!(
                        "service {} depends on unknown service {}",
                        name, dep
                    ));
                }
            }
            // Surface per-service problems with the service named.
            let probe_paths = Paths::new(".".into(), ".".into());
            service
                .resolve_spec(&probe_paths)
                .map_err(|reason| format!("service {}: {}", name, reason))?;
        }
        Ok(())
    }

    /// Resolve every service definition against the filesystem layout.
    pub fn service_specs(&self, paths: &Paths) -> Result<Vec<ServiceSpec>> {
        let mut specs = Vec::with_capacity(self.services.len());
        for (name, service) in &self.services {
            let spec = service
                .resolve_spec(paths)
                .map_err(|reason| Error::ConfigInvalid {
                    path: paths.root_dir.join(crate::paths::CONFIG_FILE_NAME),
                    reason: format!("service {}: {}", name, reason),
                })?;
            specs.push(spec);
        }
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(specs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
log_level: debug
app_data_home: /tmp/pc-data
services:
  db:
    start_cmd: ["./db-server", "--port", "5432"]
    log_redirect: true
    healthcheck:
      test_type: tcp
      test_target: 127.0.0.1:5432
      interval: 2
      retries: 5
  web:
    start_cmd: ["./web"]
    startup_delay: 3
    depends_on: [db]
"#;

    #[test]
    fn parses_canonical_config() {
        let config = GlobalConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.services.len(), 2);

        let db = &config.services["db"];
        assert_eq!(db.name, "db");
        assert!(db.log_redirect);
        let probe = db.healthcheck.as_ref().unwrap().resolve().unwrap().unwrap();
        assert_eq!(
            probe.kind,
            ProbeKind::Tcp {
                addr: "127.0.0.1:5432".to_string()
            }
        );
        assert_eq!(probe.interval, Duration::from_secs(2));
        assert_eq!(probe.retries, 5);
        assert_eq!(probe.timeout, Duration::from_secs(5));

        let web = &config.services["web"];
        assert_eq!(web.startup_delay, 3);
        assert_eq!(web.depends_on, vec!["db".to_string()]);
    }

    #[test]
    fn parsing_is_idempotent() {
        let once = GlobalConfig::parse(SAMPLE).unwrap();
        let twice = GlobalConfig::parse(SAMPLE).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn defaults_apply() {
        let config = GlobalConfig::parse("services: {}").unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.sys_service_name, "process-compose");
        assert!(config.services.is_empty());
    }

    #[test]
    fn legacy_shape_maps_to_canonical() {
        let yaml = r#"
services:
  api:
    start_cmd: ["./api"]
    healthcheck:
      enable: true
      url: http://127.0.0.1:8080/health
      check_delay: 7
      max_failures: 2
"#;
        let config = GlobalConfig::parse(yaml).unwrap();
        let probe = config.services["api"]
            .healthcheck
            .as_ref()
            .unwrap()
            .resolve()
            .unwrap()
            .unwrap();
        assert_eq!(
            probe.kind,
            ProbeKind::Http {
                url: "http://127.0.0.1:8080/health".to_string()
            }
        );
        assert_eq!(probe.start_period, Duration::from_secs(7));
        assert_eq!(probe.retries, 2);
    }

    #[test]
    fn legacy_disable_turns_probe_off() {
        let hc = HealthcheckConfig {
            enable: Some(false),
            ..Default::default()
        };
        assert_eq!(hc.resolve().unwrap(), None);
    }

    #[test]
    fn mixed_shapes_are_rejected() {
        let yaml = r#"
services:
  api:
    start_cmd: ["./api"]
    healthcheck:
      test_type: http
      test_target: http://127.0.0.1:8080/
      check_delay: 7
"#;
        let err = GlobalConfig::parse(yaml).unwrap_err();
        assert!(err.contains("mixes"), "unexpected error: {}", err);
    }

    #[test]
    fn missing_target_is_rejected() {
        let yaml = r#"
services:
  api:
    start_cmd: ["./api"]
    healthcheck:
      test_type: http
"#;
        let err = GlobalConfig::parse(yaml).unwrap_err();
        assert!(err.contains("test_target"), "unexpected error: {}", err);
    }

    #[test]
    fn empty_start_cmd_is_rejected() {
        let yaml = r#"
services:
  api:
    start_cmd: []
"#;
        let err = GlobalConfig::parse(yaml).unwrap_err();
        assert!(err.contains("start_cmd"), "unexpected error: {}", err);
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let yaml = r#"
services:
  api:
    start_cmd: ["./api"]
    depends_on: [ghost]
"#;
        let err = GlobalConfig::parse(yaml).unwrap_err();
        assert!(err.contains("ghost"), "unexpected error: {}", err);
    }

    #[test]
    fn specs_resolve_against_layout() {
        let config = GlobalConfig::parse(SAMPLE).unwrap();
        let paths = Paths::new("/opt/pc".into(), "/tmp/pc-data".into());
        let specs = config.service_specs(&paths).unwrap();
        assert_eq!(specs.len(), 2);
        let db = specs.iter().find(|s| s.name == "db").unwrap();
        assert_eq!(db.work_dir, std::path::PathBuf::from("/opt/pc/db"));
        assert_eq!(db.log_max_size, 10 * 1024 * 1024);
        assert!(db.restart);
    }
}
