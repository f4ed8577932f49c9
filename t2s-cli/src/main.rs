//! tun2socks bridge CLI
//!
//! Drives the relay session and the proxy engines from a terminal.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use t2s_engine::{BridgeConfig, EngineConfig, EngineKind, ShadowsocksConfig, Supervisor, Transition, Tun2Socks};

/// Bridge a tun interface to a SOCKS5 proxy and manage local proxy engines
#[derive(Parser)]
#[command(name = "tun2socks-bridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace); overrides the config file
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Relay a tun interface to a SOCKS5 proxy until interrupted
    Tun2socks {
        /// Interface name
        #[arg(long, default_value = "tun0")]
        name: String,

        /// Interface IPv4 address
        #[arg(long)]
        addr: String,

        /// Gateway IPv4 address
        #[arg(long)]
        gw: String,

        /// Comma separated DNS servers
        #[arg(long, default_value = "")]
        dns: String,

        /// SOCKS5 proxy, host:port
        #[arg(long)]
        proxy: String,
    },

    /// Run trojan-go until interrupted
    Trojan {
        /// trojan-go JSON configuration
        config_file: PathBuf,
    },

    /// Run a shadowsocks client until interrupted
    Shadowsocks {
        /// Local SOCKS listen address
        #[arg(long)]
        client: String,

        /// Server address
        #[arg(long)]
        server: String,

        #[arg(long)]
        cipher: String,

        #[arg(long)]
        password: String,

        #[arg(long, default_value = "")]
        plugin: String,

        #[arg(long, default_value = "")]
        plugin_opts: String,

        /// Enable the API on this address
        #[arg(long)]
        api: Option<String>,
    },

    /// Run v2ray until interrupted
    V2ray {
        /// v2ray JSON configuration
        config_file: PathBuf,
    },

    /// Check a v2ray configuration without running it
    V2rayTest {
        config_file: PathBuf,
    },

    /// Run the snell client until interrupted
    Snell {
        /// Snell JSON configuration
        config_file: PathBuf,
    },

    /// Print the trojan-go version
    Version,

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "tun2socks-bridge.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::GenConfig { output } = &cli.command {
        init_logging(cli.log_level.as_deref().unwrap_or("info"));
        return generate_config(output);
    }

    let config = load_config(cli.config.as_deref())?;
    init_logging(cli.log_level.as_deref().unwrap_or(config.log.level.as_str()));

    match cli.command {
        Commands::Tun2socks {
            name,
            addr,
            gw,
            dns,
            proxy,
        } => run_tun2socks(&config, &name, &addr, &gw, &dns, &proxy).await,
        Commands::Trojan { config_file } => {
            run_engine(&config, EngineConfig::Trojan { config_file }).await
        }
        Commands::Shadowsocks {
            client,
            server,
            cipher,
            password,
            plugin,
            plugin_opts,
            api,
        } => {
            let ss = ShadowsocksConfig::from_parts(
                &client,
                &server,
                &cipher,
                &password,
                &plugin,
                &plugin_opts,
                api.is_some(),
                api.as_deref().unwrap_or_default(),
            )
            .context("Invalid shadowsocks settings")?;
            run_engine(&config, EngineConfig::Shadowsocks(ss)).await
        }
        Commands::V2ray { config_file } => {
            run_engine(&config, EngineConfig::V2ray { config_file }).await
        }
        Commands::V2rayTest { config_file } => test_v2ray(&config, &config_file).await,
        Commands::Snell { config_file } => {
            run_engine(&config, EngineConfig::Snell { config_file }).await
        }
        Commands::Version => {
            let supervisor = Supervisor::system(&config);
            println!("{}", supervisor.trojan_version().await);
            Ok(())
        }
        Commands::GenConfig { .. } => Ok(()),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_tun2socks(
    config: &BridgeConfig,
    name: &str,
    addr: &str,
    gw: &str,
    dns: &str,
    proxy: &str,
) -> Result<()> {
    let params = config
        .tun_params(name, addr, gw, dns)
        .context("Invalid tun parameters")?;

    let bridge = Tun2Socks::system(config);
    bridge
        .start(&params, proxy)
        .await
        .with_context(|| format!("Failed to start tun2socks on {} via {}", name, proxy))?;

    info!("Relaying {} to {}", name, proxy);

    tokio::select! {
        res = wait_for_shutdown() => {
            res?;
            info!("Shutting down tun2socks...");
            if let Some(stats) = bridge.stats().await {
                info!("Relay counters: {:?}", stats);
            }
            bridge.stop().await.context("Failed to stop tun2socks")?;
        }
        res = bridge.wait() => {
            res.context("tun2socks session ended")?;
            warn!("tun2socks session ended on its own");
        }
    }

    Ok(())
}

async fn run_engine(config: &BridgeConfig, engine: EngineConfig) -> Result<()> {
    let kind = engine.kind();
    let supervisor = Supervisor::system(config);

    match supervisor
        .start(engine)
        .await
        .with_context(|| format!("Failed to start {}", kind))?
    {
        Transition::Started => info!("{} started", kind),
        other => bail!("{} did not start: {:?}", kind, other),
    }

    wait_for_shutdown().await?;

    info!("Shutting down {}...", kind);
    if let Err(e) = stop_with_timeout(&supervisor, kind, config.engines.stop_timeout()).await {
        error!("{}", e);
    }

    Ok(())
}

async fn stop_with_timeout(supervisor: &Supervisor, kind: EngineKind, timeout: Duration) -> Result<()> {
    // The supervisor bounds the join itself; this covers a wedged close
    tokio::time::timeout(timeout * 2, supervisor.stop(kind))
        .await
        .with_context(|| format!("Timed out stopping {}", kind))?
        .with_context(|| format!("Failed to stop {}", kind))?;
    Ok(())
}

async fn test_v2ray(config: &BridgeConfig, config_file: &Path) -> Result<()> {
    let supervisor = Supervisor::system(config);
    let (ok, message) = supervisor.test_v2ray(config_file).await;

    if !message.is_empty() {
        println!("{}", message);
    }
    if !ok {
        bail!("v2ray rejected {:?}", config_file);
    }

    println!("Configuration OK");
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<BridgeConfig> {
    match path {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path)),
        None => Ok(BridgeConfig::default()),
    }
}

fn generate_config(output: &Path) -> Result<()> {
    let sample = BridgeConfig::sample();

    std::fs::write(output, sample)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    info!("Generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);
    println!("\nPoint the [engines] paths at your proxy binaries before running.");

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to register SIGTERM handler")?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("Failed to register SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_tun2socks() {
        let cli = Cli::try_parse_from([
            "tun2socks-bridge",
            "tun2socks",
            "--addr",
            "10.0.0.2",
            "--gw",
            "10.0.0.1",
            "--dns",
            "8.8.8.8,1.1.1.1",
            "--proxy",
            "127.0.0.1:1080",
            "--log-level",
            "debug",
        ])
        .unwrap();

        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Commands::Tun2socks { name, proxy, dns, .. } => {
                assert_eq!(name, "tun0");
                assert_eq!(proxy, "127.0.0.1:1080");
                assert_eq!(dns, "8.8.8.8,1.1.1.1");
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn test_tun2socks_requires_proxy() {
        let res = Cli::try_parse_from(["tun2socks-bridge", "tun2socks", "--addr", "10.0.0.2", "--gw", "10.0.0.1"]);
        assert!(res.is_err());
    }

    #[test]
    fn test_parse_shadowsocks_api() {
        let cli = Cli::try_parse_from([
            "tun2socks-bridge",
            "shadowsocks",
            "--client",
            "127.0.0.1:1080",
            "--server",
            "1.2.3.4:8388",
            "--cipher",
            "aes-256-gcm",
            "--password",
            "pw",
            "--api",
            "127.0.0.1:9000",
        ])
        .unwrap();

        match cli.command {
            Commands::Shadowsocks { api, plugin, .. } => {
                assert_eq!(api.as_deref(), Some("127.0.0.1:9000"));
                assert!(plugin.is_empty());
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn test_generate_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        generate_config(&path).unwrap();

        let config = load_config(Some(path.as_path())).unwrap();
        assert_eq!(config.tun.mtu, 1500);
    }

    #[test]
    fn test_missing_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(dir.path().join("absent.toml").as_path())).unwrap_err();
        assert!(err.to_string().contains("Failed to load configuration"));
    }
}
