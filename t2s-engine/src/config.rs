//! Configuration types for the bridge

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use t2s_tun::TunParams;

use crate::engines::EngineKind;
use crate::error::{Error, Result};

/// Main configuration structure
///
/// The configuration file uses TOML format. Every section is optional;
/// omitted values fall back to the defaults shown below.
///
/// # Example Configuration
///
/// ```toml
/// [tun]
/// mtu = 1500
/// netmask = "255.255.255.0"
/// udp_idle_timeout = 60
///
/// [engines]
/// trojan = "/usr/local/bin/trojan-go"
/// stop_timeout = 5
///
/// [log]
/// level = "info"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Virtual interface and relay settings
    #[serde(default)]
    pub tun: TunSection,

    /// Proxy engine settings
    #[serde(default)]
    pub engines: EnginesSection,

    /// Logging settings
    #[serde(default)]
    pub log: LogSection,
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.tun.validate()?;
        self.engines.validate()?;

        if !matches!(
            self.log.level.as_str(),
            "error" | "warn" | "info" | "debug" | "trace" | "off"
        ) {
            return Err(Error::Config(format!(
                "unknown log level {:?}",
                self.log.level
            )));
        }

        Ok(())
    }

    /// Interface parameters from the host's textual arguments
    ///
    /// Netmask and MTU come from the `[tun]` section.
    pub fn tun_params(
        &self,
        name: &str,
        address: &str,
        gateway: &str,
        dns: &str,
    ) -> Result<TunParams> {
        let mut params = TunParams::from_strings(name, address, gateway, dns)?;
        params.netmask = self.tun.netmask;
        params.mtu = self.tun.mtu;
        params.validate()?;
        Ok(params)
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# tun2socks bridge configuration

[tun]
# MTU of the virtual interface, 576 to 1500 (default: 1500)
mtu = 1500

# Netmask applied to the interface address (default: 255.255.255.0)
netmask = "255.255.255.0"

# Seconds a SOCKS UDP association may stay idle before it is torn down
udp_idle_timeout = 60

[engines]
# Engine executables. Bare names are looked up on PATH.
trojan = "trojan-go"
shadowsocks = "shadowsocks2"
v2ray = "v2ray"
snell = "snell-client"

# Seconds to wait for an engine to exit after it was asked to close
stop_timeout = 5

[log]
# Log level: "error", "warn", "info", "debug", "trace"
# RUST_LOG overrides this when set.
level = "info"
"#
        .to_string()
    }
}

/// Virtual interface and relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunSection {
    /// MTU of the virtual interface
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Netmask applied to the interface address
    #[serde(default = "default_netmask")]
    pub netmask: Ipv4Addr,

    /// Idle timeout of SOCKS UDP associations, in seconds
    #[serde(default = "default_udp_idle_timeout")]
    pub udp_idle_timeout: u64,
}

impl Default for TunSection {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            netmask: default_netmask(),
            udp_idle_timeout: default_udp_idle_timeout(),
        }
    }
}

impl TunSection {
    fn validate(&self) -> Result<()> {
        t2s_tun::check_mtu(self.mtu)?;
        t2s_tun::config::netmask_to_prefix(self.netmask)?;
        if self.udp_idle_timeout == 0 {
            return Err(Error::Config("udp_idle_timeout must be at least 1".into()));
        }
        Ok(())
    }

    /// UDP association idle timeout
    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_timeout)
    }
}

/// Proxy engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnginesSection {
    /// trojan-go executable
    #[serde(default = "default_trojan")]
    pub trojan: PathBuf,

    /// go-shadowsocks2 executable
    #[serde(default = "default_shadowsocks")]
    pub shadowsocks: PathBuf,

    /// v2ray executable
    #[serde(default = "default_v2ray")]
    pub v2ray: PathBuf,

    /// snell client executable
    #[serde(default = "default_snell")]
    pub snell: PathBuf,

    /// Seconds to wait for an engine to exit after close
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: u64,
}

impl Default for EnginesSection {
    fn default() -> Self {
        Self {
            trojan: default_trojan(),
            shadowsocks: default_shadowsocks(),
            v2ray: default_v2ray(),
            snell: default_snell(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

impl EnginesSection {
    fn validate(&self) -> Result<()> {
        for kind in EngineKind::ALL {
            if self.binary(kind).as_os_str().is_empty() {
                return Err(Error::Config(format!("{} executable path is empty", kind)));
            }
        }
        Ok(())
    }

    /// Executable configured for an engine kind
    pub fn binary(&self, kind: EngineKind) -> &Path {
        match kind {
            EngineKind::Trojan => &self.trojan,
            EngineKind::Shadowsocks => &self.shadowsocks,
            EngineKind::V2ray => &self.v2ray,
            EngineKind::Snell => &self.snell,
        }
    }

    /// Time an engine gets to exit after close
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout)
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_mtu() -> u16 {
    t2s_tun::MTU as u16
}

fn default_netmask() -> Ipv4Addr {
    t2s_tun::DEFAULT_NETMASK
}

fn default_udp_idle_timeout() -> u64 {
    60
}

fn default_trojan() -> PathBuf {
    PathBuf::from("trojan-go")
}

fn default_shadowsocks() -> PathBuf {
    PathBuf::from("shadowsocks2")
}

fn default_v2ray() -> PathBuf {
    PathBuf::from("v2ray")
}

fn default_snell() -> PathBuf {
    PathBuf::from("snell-client")
}

fn default_stop_timeout() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}
