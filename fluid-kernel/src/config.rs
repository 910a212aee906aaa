use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, time::Duration};
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub listen_addr: String,
    pub heartbeat_timeout_secs: u64,
    pub default_ttl_secs: u64,        // 0 = pas de TTL par défaut
    pub data_dir: Option<String>,     // None => store en mémoire uniquement
    pub host_tokens: HashMap<String, HostTokenConf>,
    pub mqtt: Option<MqttConf>,
}

/// Identité associée à un token d'hôte
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HostTokenConf {
    pub org_id: String,
    /// Si présent, remplace le host_id annoncé par l'agent
    pub host_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            heartbeat_timeout_secs: 90,
            default_ttl_secs: 0,
            data_dir: None,
            host_tokens: HashMap::new(),
            mqtt: None,
        }
    }
}

impl KernelConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs.max(1))
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn authorize_host(&self, token: &str) -> Option<&HostTokenConf> {
        if token.is_empty() {
            return None;
        }
        self.host_tokens.get(token)
    }

    /// Variables d'environnement prioritaires sur le fichier YAML
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("FLUID_LISTEN_ADDR") {
            if !addr.trim().is_empty() {
                self.listen_addr = addr;
            }
        }
        if let Some(secs) = env_u64("FLUID_HEARTBEAT_TIMEOUT_SECS") {
            self.heartbeat_timeout_secs = secs;
        }
        if let Some(secs) = env_u64("FLUID_DEFAULT_TTL_SECS") {
            self.default_ttl_secs = secs;
        }
        if let Ok(dir) = std::env::var("FLUID_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.data_dir = Some(dir);
            }
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("[config] ignoring invalid {}={}", key, raw);
            None
        }
    }
}

pub fn parse_config(txt: &str) -> Result<KernelConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(txt)
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("FLUID_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt).unwrap_or_else(|e| {
            warn!("[config] config invalide {}: {e}", path);
            KernelConfig::default()
        })
    } else {
        info!("[config] pas de {}, usage config par défaut", path);
        KernelConfig::default()
    };
    cfg.apply_env_overrides();
    cfg
}
