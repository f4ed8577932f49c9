//! Engine specific configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::proxy::split_host_port;

/// Snell client configuration file
///
/// ```json
/// {
///   "local_addr": "127.0.0.1", "local_port": 1080,
///   "remote_addr": "1.2.3.4", "remote_port": 443,
///   "psk": "secret",
///   "obfs": { "obfs_type": "http", "obfs_host": "example.com" },
///   "api": { "enabled": false, "api_addr": "127.0.0.1", "api_port": 9090 }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnellConfig {
    #[serde(default)]
    pub api: SnellApi,
    #[serde(default)]
    pub local_addr: String,
    #[serde(default)]
    pub local_port: u16,
    #[serde(default)]
    pub psk: String,
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default)]
    pub remote_port: u16,
    #[serde(default)]
    pub obfs: SnellObfs,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnellApi {
    #[serde(default)]
    pub api_addr: String,
    #[serde(default)]
    pub api_port: u16,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnellObfs {
    #[serde(default)]
    pub obfs_host: String,
    #[serde(default)]
    pub obfs_type: String,
}

impl SnellConfig {
    /// Read and parse a Snell JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = read_config(path)?;
        serde_json::from_str(&content).map_err(|source| Error::JsonParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Compose the arguments the Snell client is started with
    pub fn launch(&self) -> SnellLaunch {
        SnellLaunch {
            local: format!("{}:{}", self.local_addr, self.local_port),
            remote: format!("{}:{}", self.remote_addr, self.remote_port),
            obfs_type: self.obfs.obfs_type.clone(),
            obfs_host: self.obfs.obfs_host.clone(),
            psk: self.psk.clone(),
            client_mode: true,
            api_enabled: self.api.enabled,
            api: format!("{}:{}", self.api.api_addr, self.api.api_port),
        }
    }
}

/// Arguments of a Snell client start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnellLaunch {
    /// Local SOCKS bind address, `addr:port`
    pub local: String,
    /// Snell server, `addr:port`
    pub remote: String,
    pub obfs_type: String,
    pub obfs_host: String,
    pub psk: String,
    /// Always set; the engine runs as a client
    pub client_mode: bool,
    pub api_enabled: bool,
    /// API listen address, `addr:port`; composed even when the API is off
    pub api: String,
}

/// Shadowsocks client settings passed inline by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowsocksConfig {
    /// Local SOCKS listen address
    pub client_addr: String,
    /// Server address
    pub server_addr: String,
    pub cipher: String,
    pub password: String,
    pub plugin: Option<String>,
    pub plugin_options: Option<String>,
    /// API listen address when the API is enabled
    pub api_addr: Option<String>,
}

impl ShadowsocksConfig {
    /// Build from the raw host arguments; blank plugin fields mean "none"
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        client_addr: &str,
        server_addr: &str,
        cipher: &str,
        password: &str,
        plugin: &str,
        plugin_options: &str,
        enable_api: bool,
        api_addr: &str,
    ) -> Result<Self> {
        let config = Self {
            client_addr: client_addr.trim().to_string(),
            server_addr: server_addr.trim().to_string(),
            cipher: cipher.trim().to_string(),
            password: password.to_string(),
            plugin: non_blank(plugin),
            plugin_options: non_blank(plugin_options),
            api_addr: if enable_api {
                Some(api_addr.trim().to_string())
            } else {
                None
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate addresses and credentials
    pub fn validate(&self) -> Result<()> {
        split_host_port(&self.client_addr)?;
        split_host_port(&self.server_addr)?;
        if self.cipher.is_empty() {
            return Err(Error::Config("shadowsocks cipher must not be empty".into()));
        }
        if self.password.is_empty() {
            return Err(Error::Config("shadowsocks password must not be empty".into()));
        }
        if self.plugin_options.is_some() && self.plugin.is_none() {
            return Err(Error::Config("plugin options given without a plugin".into()));
        }
        if let Some(api) = &self.api_addr {
            split_host_port(api)?;
        }
        Ok(())
    }
}

fn non_blank(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

/// Read an engine configuration file
pub(crate) fn read_config(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
        path: path.to_path_buf(),
        source,
    })
}

/// Check that an engine configuration file holds well formed JSON
pub(crate) fn check_json(path: &Path) -> Result<()> {
    let content = read_config(path)?;
    serde_json::from_str::<serde_json::Value>(&content).map_err(|source| Error::JsonParse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}
