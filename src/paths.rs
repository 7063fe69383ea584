//! Filesystem layout for the supervisor and its services.
//!
//! ```text
//! <binary_dir>/
//!   process-compose[.exe]
//!   config.yaml
//!   <service>/...              service working directories
//! <app_data_home>/
//!   supervisor.pid
//!   supervisor.log
//!   status.json
//!   <service>/pid
//!   <service>/logs/<service>.log(.N)
//! ```

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Config file name, sibling to the binary.
pub const CONFIG_FILE_NAME: &str = "config.yaml";
/// Environment variable overriding the config path.
pub const CONFIG_ENV_VAR: &str = "PROCESS_COMPOSE_CONFIG";

/// Resolved directory roots; immutable after load.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Directory containing the supervisor binary and service work dirs
    pub root_dir: PathBuf,
    /// Per-installation writable state
    pub app_data_home: PathBuf,
}

impl Paths {
    pub fn new(root_dir: PathBuf, app_data_home: PathBuf) -> Self {
        Self {
            root_dir,
            app_data_home,
        }
    }

    /// Service working directory, sibling to the binary, named after the
    /// service.
    pub fn service_work_dir(&self, name: &str) -> PathBuf {
        self.root_dir.join(name)
    }

    /// Per-service writable home under the app data home.
    pub fn service_home(&self, name: &str) -> PathBuf {
        self.app_data_home.join(name)
    }

    pub fn service_log_dir(&self, name: &str) -> PathBuf {
        self.service_home(name).join("logs")
    }

    pub fn service_log_file(&self, name: &str) -> PathBuf {
        self.service_log_dir(name).join(format!("{}.log", name))
    }

    pub fn service_pid_file(&self, name: &str) -> PathBuf {
        self.service_home(name).join("pid")
    }

    pub fn supervisor_pid_file(&self) -> PathBuf {
        self.app_data_home.join("supervisor.pid")
    }

    pub fn supervisor_log_file(&self) -> PathBuf {
        self.app_data_home.join("supervisor.log")
    }

    pub fn status_file(&self) -> PathBuf {
        self.app_data_home.join("status.json")
    }

    /// Create the writable directories for every named service.
    pub fn ensure_service_dirs<'a, I>(&self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        std::fs::create_dir_all(&self.app_data_home)?;
        for name in names {
            std::fs::create_dir_all(self.service_log_dir(name))?;
        }
        Ok(())
    }
}

/// Directory holding the running binary.
pub fn binary_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| Error::Io(std::io::Error::other("binary has no parent directory")))
}

/// Config file path: `PROCESS_COMPOSE_CONFIG` when set, otherwise
/// `config.yaml` next to the binary.
pub fn config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        return Ok(PathBuf::from(path));
    }
    Ok(binary_dir()?.join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_under_roots() {
        let paths = Paths::new(PathBuf::from("/opt/pc"), PathBuf::from("/var/lib/pc"));
        assert_eq!(paths.service_work_dir("db"), PathBuf::from("/opt/pc/db"));
        assert_eq!(
            paths.service_log_file("db"),
            PathBuf::from("/var/lib/pc/db/logs/db.log")
        );
        assert_eq!(
            paths.service_pid_file("db"),
            PathBuf::from("/var/lib/pc/db/pid")
        );
        assert_eq!(
            paths.supervisor_pid_file(),
            PathBuf::from("/var/lib/pc/supervisor.pid")
        );
    }
}
