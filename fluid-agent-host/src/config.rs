//! Agent configuration
//!
//! Handles:
//! - Control plane URL and host token
//! - MicroVM, network, image and SSH settings
//! - Janitor sweep interval and default sandbox TTL
//! - Persisting the host id assigned by the kernel
//!
//! Stored as TOML under `dirs::config_dir()/fluid-agent/config.toml`,
//! overridable with `FLUID_AGENT_CONFIG`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Empty until assigned; the hostname is announced instead.
    pub host_id: String,
    pub heartbeat_interval_secs: u64,
    pub control_plane: ControlPlaneConfig,
    pub microvm: MicroVmConfig,
    pub network: NetworkConfig,
    pub image: ImageConfig,
    pub ssh: SshConfig,
    pub libvirt: LibvirtConfig,
    pub state: StateConfig,
    pub janitor: JanitorConfig,
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MicroVmConfig {
    pub qemu_binary: String,
    pub work_dir: PathBuf,
    pub default_vcpus: u32,
    pub default_memory_mb: u64,
    pub command_timeout_secs: u64,
    pub ip_discovery_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub default_bridge: String,
    /// libvirt network name -> bridge
    pub bridge_map: HashMap<String, String>,
    pub dhcp_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub default_user: String,
    pub key_path: String,
    pub proxy_jump: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibvirtConfig {
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JanitorConfig {
    pub interval_secs: u64,
    /// Applied to sandboxes created without a TTL. 0 keeps them forever.
    pub default_ttl_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host_id: String::new(),
            heartbeat_interval_secs: 30,
            control_plane: ControlPlaneConfig::default(),
            microvm: MicroVmConfig::default(),
            network: NetworkConfig::default(),
            image: ImageConfig::default(),
            ssh: SshConfig::default(),
            libvirt: LibvirtConfig::default(),
            state: StateConfig::default(),
            janitor: JanitorConfig::default(),
            source_path: None,
        }
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            url: format!("ws://127.0.0.1:8080{}", fluid_protocol::CONNECT_PATH),
            token: String::new(),
        }
    }
}

impl Default for MicroVmConfig {
    fn default() -> Self {
        Self {
            qemu_binary: "qemu-system-x86_64".to_string(),
            work_dir: PathBuf::from("/var/lib/fluid/sandboxes"),
            default_vcpus: 2,
            default_memory_mb: 2048,
            command_timeout_secs: 300,
            ip_discovery_timeout_secs: 120,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            default_bridge: "virbr0".to_string(),
            bridge_map: HashMap::new(),
            dhcp_mode: "libvirt".to_string(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self { base_dir: PathBuf::from("/var/lib/fluid/images") }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self { default_user: "sandbox".to_string(), key_path: String::new(), proxy_jump: String::new() }
    }
}

impl Default for LibvirtConfig {
    fn default() -> Self {
        Self { uri: "qemu:///system".to_string() }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("/var/lib/fluid/agent-state.json") }
    }
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self { interval_secs: 60, default_ttl_secs: 24 * 3600 }
    }
}

impl JanitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

impl AgentConfig {
    /// Load config from `FLUID_AGENT_CONFIG` or the OS config dir
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| format!("reading {}", config_path.display()))?;
            Self::parse(&content).with_context(|| format!("parsing {}", config_path.display()))?
        } else {
            // First run: defaults, saved on first host id assignment
            Self::default()
        };
        config.source_path = Some(config_path);
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Save config back to where it was loaded from
    pub async fn save(&self) -> Result<()> {
        let config_path = match &self.source_path {
            Some(p) => p.clone(),
            None => Self::config_file_path()?,
        };

        if let Some(parent) = config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(&config_path, content).await?;
        Ok(())
    }

    /// Config file path, `FLUID_AGENT_CONFIG` first
    pub fn config_file_path() -> Result<PathBuf> {
        if let Ok(p) = std::env::var("FLUID_AGENT_CONFIG") {
            return Ok(PathBuf::from(p));
        }
        let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("fluid-agent");
        path.push("config.toml");
        Ok(path)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.microvm.command_timeout_secs)
    }

    pub fn ip_discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.microvm.ip_discovery_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.command_timeout(), Duration::from_secs(300));
        assert_eq!(config.ip_discovery_timeout(), Duration::from_secs(120));
        assert!(config.control_plane.url.ends_with("/v1/hosts/connect"));
        assert_eq!(config.janitor.interval(), Duration::from_secs(60));
        assert_eq!(config.janitor.default_ttl(), Duration::from_secs(86400));
    }

    #[test]
    fn test_parse_janitor_section() {
        let config = AgentConfig::parse("[janitor]\ninterval_secs = 0\ndefault_ttl_secs = 600\n").unwrap();
        // 0 would make the sweep spin
        assert_eq!(config.janitor.interval(), Duration::from_secs(1));
        assert_eq!(config.janitor.default_ttl(), Duration::from_secs(600));
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = AgentConfig::parse(
            r#"
host_id = "host-1"

[control_plane]
url = "wss://kernel.example/v1/hosts/connect"
token = "secret"

[network.bridge_map]
default = "virbr0"
lab = "br-lab"
"#,
        )
        .unwrap();
        assert_eq!(config.host_id, "host-1");
        assert_eq!(config.control_plane.token, "secret");
        assert_eq!(config.network.bridge_map["lab"], "br-lab");
        assert_eq!(config.network.default_bridge, "virbr0");
        assert_eq!(config.microvm.qemu_binary, "qemu-system-x86_64");
    }

    #[tokio::test]
    async fn test_save_roundtrips_host_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig {
            source_path: Some(dir.path().join("nested/config.toml")),
            ..Default::default()
        };
        config.host_id = "assigned-7".into();
        config.save().await.unwrap();

        let content = std::fs::read_to_string(dir.path().join("nested/config.toml")).unwrap();
        let reloaded = AgentConfig::parse(&content).unwrap();
        assert_eq!(reloaded.host_id, "assigned-7");
    }
}
