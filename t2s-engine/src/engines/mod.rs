//! Proxy engines
//!
//! Each engine kind has its own configuration shape. [`EngineConfig::prepare`]
//! reads and checks it, producing a [`LaunchPlan`] that an [`EngineBackend`]
//! turns into a running [`ProxyEngine`].

pub mod config;
pub mod process;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use config::{ShadowsocksConfig, SnellApi, SnellConfig, SnellLaunch, SnellObfs};
pub use process::{ProcessBackend, ProcessEngine};

/// Supported proxy engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Trojan,
    Shadowsocks,
    V2ray,
    Snell,
}

impl EngineKind {
    /// All kinds, in slot order
    pub const ALL: [EngineKind; 4] = [
        EngineKind::Trojan,
        EngineKind::Shadowsocks,
        EngineKind::V2ray,
        EngineKind::Snell,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            EngineKind::Trojan => 0,
            EngineKind::Shadowsocks => 1,
            EngineKind::V2ray => 2,
            EngineKind::Snell => 3,
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Trojan => write!(f, "trojan-go"),
            EngineKind::Shadowsocks => write!(f, "shadowsocks"),
            EngineKind::V2ray => write!(f, "v2ray"),
            EngineKind::Snell => write!(f, "snell"),
        }
    }
}

/// What a host asks an engine to start with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineConfig {
    /// trojan-go JSON configuration file
    Trojan { config_file: PathBuf },
    /// Inline shadowsocks settings
    Shadowsocks(ShadowsocksConfig),
    /// v2ray JSON configuration file
    V2ray { config_file: PathBuf },
    /// Snell JSON configuration file
    Snell { config_file: PathBuf },
}

impl EngineConfig {
    pub fn kind(&self) -> EngineKind {
        match self {
            EngineConfig::Trojan { .. } => EngineKind::Trojan,
            EngineConfig::Shadowsocks(_) => EngineKind::Shadowsocks,
            EngineConfig::V2ray { .. } => EngineKind::V2ray,
            EngineConfig::Snell { .. } => EngineKind::Snell,
        }
    }

    /// Read and check the configuration
    ///
    /// Fails on unreadable files, malformed JSON and invalid inline fields.
    pub fn prepare(&self) -> Result<LaunchPlan> {
        match self {
            EngineConfig::Trojan { config_file } => {
                config::check_json(config_file)?;
                Ok(LaunchPlan::Trojan {
                    config_file: config_file.clone(),
                })
            }
            EngineConfig::Shadowsocks(ss) => {
                ss.validate()?;
                Ok(LaunchPlan::Shadowsocks(ss.clone()))
            }
            EngineConfig::V2ray { config_file } => {
                config::check_json(config_file)?;
                Ok(LaunchPlan::V2ray {
                    config_file: config_file.clone(),
                })
            }
            EngineConfig::Snell { config_file } => {
                let snell = SnellConfig::load(config_file)?;
                Ok(LaunchPlan::Snell(snell.launch()))
            }
        }
    }
}

/// Checked arguments an engine is launched with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchPlan {
    Trojan { config_file: PathBuf },
    Shadowsocks(ShadowsocksConfig),
    V2ray { config_file: PathBuf },
    Snell(SnellLaunch),
}

impl LaunchPlan {
    pub fn kind(&self) -> EngineKind {
        match self {
            LaunchPlan::Trojan { .. } => EngineKind::Trojan,
            LaunchPlan::Shadowsocks(_) => EngineKind::Shadowsocks,
            LaunchPlan::V2ray { .. } => EngineKind::V2ray,
            LaunchPlan::Snell(_) => EngineKind::Snell,
        }
    }
}

/// Outcome of a configuration test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestReport {
    pub ok: bool,
    /// Diagnostics from the engine
    pub message: String,
}

/// A launched engine
#[async_trait]
pub trait ProxyEngine: Send + Sync {
    /// Run until closed or until the engine exits
    async fn run(&self) -> Result<()>;

    /// Ask the engine to stop; a second call fails
    fn close(&self) -> Result<()>;
}

/// Launches engines of every kind
#[async_trait]
pub trait EngineBackend: Send + Sync {
    /// Launch an engine for `plan`; `run` is driven by the caller
    async fn launch(&self, plan: &LaunchPlan) -> Result<Arc<dyn ProxyEngine>>;

    /// Version string of an engine
    async fn version(&self, kind: EngineKind) -> Result<String>;

    /// Check a configuration without starting the engine
    async fn test(&self, plan: &LaunchPlan) -> Result<TestReport>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_kind_slots_are_distinct() {
        let mut seen = [false; 4];
        for kind in EngineKind::ALL {
            assert!(!seen[kind.index()]);
            seen[kind.index()] = true;
        }
    }

    #[test]
    fn test_prepare_snell_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snell.json");
        std::fs::write(
            &path,
            r#"{"local_addr":"127.0.0.1","local_port":1080,"psk":"x","remote_addr":"1.2.3.4","remote_port":443}"#,
        )
        .unwrap();

        let plan = EngineConfig::Snell { config_file: path }.prepare().unwrap();
        match plan {
            LaunchPlan::Snell(launch) => {
                assert_eq!(launch.local, "127.0.0.1:1080");
                assert_eq!(launch.remote, "1.2.3.4:443");
            }
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_prepare_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{\"run_type\": ").unwrap();

        for config in [
            EngineConfig::Trojan { config_file: path.clone() },
            EngineConfig::V2ray { config_file: path.clone() },
            EngineConfig::Snell { config_file: path.clone() },
        ] {
            let err = config.prepare().unwrap_err();
            assert!(matches!(err, Error::JsonParse { .. }), "{:?}", config.kind());
        }
    }
}
