//! Engines run as child processes
//!
//! [`ProcessBackend`] starts each engine's executable (paths come from the
//! `[engines]` section of the bridge configuration) with arguments derived
//! from the launch plan. Closing an engine kills its child.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{EngineBackend, EngineKind, LaunchPlan, ProxyEngine, TestReport};
use crate::config::EnginesSection;
use crate::error::{Error, Result};

/// Command line arguments for a launch plan
pub fn engine_args(plan: &LaunchPlan) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    match plan {
        LaunchPlan::Trojan { config_file } | LaunchPlan::V2ray { config_file } => {
            args.push("-config".into());
            args.push(config_file.clone().into_os_string());
        }
        LaunchPlan::Shadowsocks(ss) => {
            args.extend(
                [
                    "-c",
                    ss.server_addr.as_str(),
                    "-socks",
                    ss.client_addr.as_str(),
                    "-cipher",
                    ss.cipher.as_str(),
                    "-password",
                    ss.password.as_str(),
                ]
                .map(OsString::from),
            );
            if let Some(plugin) = &ss.plugin {
                args.push("-plugin".into());
                args.push(plugin.into());
            }
            if let Some(opts) = &ss.plugin_options {
                args.push("-plugin-opts".into());
                args.push(opts.into());
            }
            if let Some(api) = &ss.api_addr {
                args.push("-api".into());
                args.push(api.into());
            }
        }
        LaunchPlan::Snell(snell) => {
            args.extend(
                [
                    "-l",
                    snell.local.as_str(),
                    "-s",
                    snell.remote.as_str(),
                    "-k",
                    snell.psk.as_str(),
                ]
                .map(OsString::from),
            );
            if !snell.obfs_type.is_empty() {
                args.push("-obfs".into());
                args.push((&snell.obfs_type).into());
            }
            if !snell.obfs_host.is_empty() {
                args.push("-obfs-host".into());
                args.push((&snell.obfs_host).into());
            }
            if snell.api_enabled {
                args.push("-api".into());
                args.push((&snell.api).into());
            }
        }
    }
    args
}

/// Runs engines as child processes
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    binaries: EnginesSection,
}

impl ProcessBackend {
    pub fn new(binaries: EnginesSection) -> Self {
        Self { binaries }
    }

    fn binary(&self, kind: EngineKind) -> PathBuf {
        self.binaries.binary(kind).to_path_buf()
    }
}

#[async_trait]
impl EngineBackend for ProcessBackend {
    async fn launch(&self, plan: &LaunchPlan) -> Result<Arc<dyn ProxyEngine>> {
        let kind = plan.kind();
        let binary = self.binary(kind);
        let args = engine_args(plan);

        log::debug!("Spawning {}: {} {:?}", kind, binary.display(), args);

        let child = Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Engine(format!("failed to spawn {}: {}", binary.display(), e)))?;

        Ok(Arc::new(ProcessEngine::new(kind, child)))
    }

    async fn version(&self, kind: EngineKind) -> Result<String> {
        let binary = self.binary(kind);
        let output = Command::new(&binary)
            .arg("-version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::Engine(format!("failed to execute {}: {}", binary.display(), e)))?;

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::Engine(format!("{} printed no version", kind)))
    }

    async fn test(&self, plan: &LaunchPlan) -> Result<TestReport> {
        let config_file = match plan {
            LaunchPlan::V2ray { config_file } => config_file,
            other => {
                return Err(Error::Engine(format!(
                    "{} has no configuration test",
                    other.kind()
                )))
            }
        };

        let binary = self.binary(EngineKind::V2ray);
        let output = Command::new(&binary)
            .arg("-test")
            .arg("-config")
            .arg(config_file)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::Engine(format!("failed to execute {}: {}", binary.display(), e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = [stdout.trim(), stderr.trim()]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("\n");

        Ok(TestReport {
            ok: output.status.success(),
            message,
        })
    }
}

/// Engine backed by a child process
pub struct ProcessEngine {
    kind: EngineKind,
    child: Mutex<Option<Child>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl ProcessEngine {
    pub fn new(kind: EngineKind, child: Child) -> Self {
        Self {
            kind,
            child: Mutex::new(Some(child)),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ProxyEngine for ProcessEngine {
    async fn run(&self) -> Result<()> {
        let mut child = self
            .child
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Engine(format!("{} is already running", self.kind)))?;

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if status.success() || self.cancel.is_cancelled() {
                    log::info!("{} exited ({})", self.kind, status);
                    Ok(())
                } else {
                    Err(Error::Engine(format!("{} exited with {}", self.kind, status)))
                }
            }
            _ = self.cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    log::warn!("Failed to kill {}: {}", self.kind, e);
                }
                log::debug!("{} killed", self.kind);
                Ok(())
            }
        }
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Engine(format!("{} already closed", self.kind)));
        }
        self.cancel.cancel();
        Ok(())
    }
}
