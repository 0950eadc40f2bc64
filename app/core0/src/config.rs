//! Configuration management.
//!
//! Loaded from defaults, then the TOML file named by `-c`, then
//! `CORE0_*` environment variables.
//!
//! ```toml
//! [containers]
//! root_dir = "/var/cache/containers"
//! backend_dir = "/var/cache/containers/backend"
//! socket_path = "/var/run/core0.sock"
//! agent_binary = "coreX"
//!
//! [network]
//! bridge = "core0"
//! bridge_ip = "172.18.0.1"
//!
//! [logging]
//! level = "info"
//! ```

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use core_containers::ContainerSettings;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub containers: ContainersSection,
    pub network: NetworkSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainersSection {
    pub root_dir: PathBuf,
    pub backend_dir: PathBuf,
    pub socket_path: PathBuf,
    pub agent_binary: String,
}

impl Default for ContainersSection {
    fn default() -> Self {
        let settings = ContainerSettings::default();
        Self {
            root_dir: settings.root_dir,
            backend_dir: settings.backend_dir,
            socket_path: settings.socket_path,
            agent_binary: settings.agent_binary,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub bridge: String,
    pub bridge_ip: Ipv4Addr,
}

impl Default for NetworkSection {
    fn default() -> Self {
        let settings = ContainerSettings::default();
        Self {
            bridge: settings.bridge,
            bridge_ip: settings.bridge_ip,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl Config {
    /// Loads configuration from a file, with `CORE0_*` environment
    /// variables taking precedence.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("CORE0_").split("_"))
            .extract()
    }

    /// The container subsystem's view of this configuration.
    #[must_use]
    pub fn container_settings(&self) -> ContainerSettings {
        ContainerSettings {
            root_dir: self.containers.root_dir.clone(),
            backend_dir: self.containers.backend_dir.clone(),
            socket_path: self.containers.socket_path.clone(),
            agent_binary: self.containers.agent_binary.clone(),
            bridge: self.network.bridge.clone(),
            bridge_ip: self.network.bridge_ip,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_without_a_file() {
        let config = Config::load_from("/no/such/core0.toml").unwrap();
        assert_eq!(config.network.bridge, "core0");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[network]\nbridge = \"zt0\"\nbridge_ip = \"10.100.0.1\"\n"
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.network.bridge, "zt0");
        assert_eq!(config.network.bridge_ip, Ipv4Addr::new(10, 100, 0, 1));
        // Untouched sections keep their defaults.
        assert_eq!(config.containers.agent_binary, "coreX");

        let settings = config.container_settings();
        assert_eq!(settings.bridge, "zt0");
    }
}
