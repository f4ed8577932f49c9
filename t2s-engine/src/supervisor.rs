//! Multi-engine supervisor
//!
//! One slot per [`EngineKind`]. A slot is a lock around the optional running
//! instance, so start and stop of the same kind are serialized while
//! different kinds never contend. The running flag mirrors the slot for
//! lock-free status queries.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::BridgeConfig;
use crate::engines::{
    EngineBackend, EngineConfig, EngineKind, LaunchPlan, ProcessBackend, ProxyEngine,
    ShadowsocksConfig,
};
use crate::error::Result;
use crate::event::{BridgeEvent, EventHandler, LoggingEventHandler};

/// Default time an engine gets to exit after close
pub const ENGINE_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// What a start or stop request did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Started,
    AlreadyRunning,
    Stopped,
    NotRunning,
}

struct EngineInstance {
    engine: Arc<dyn ProxyEngine>,
    plan: LaunchPlan,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    instance: Mutex<Option<EngineInstance>>,
    running: AtomicBool,
}

/// Supervises one instance per engine kind
pub struct Supervisor {
    backend: Arc<dyn EngineBackend>,
    slots: [Slot; 4],
    stop_timeout: Duration,
    event_handler: Arc<dyn EventHandler>,
}

impl Supervisor {
    pub fn new(backend: Arc<dyn EngineBackend>) -> Self {
        Self {
            backend,
            slots: Default::default(),
            stop_timeout: ENGINE_STOP_TIMEOUT,
            event_handler: Arc::new(LoggingEventHandler),
        }
    }

    /// Supervisor running engines as child processes
    pub fn system(config: &BridgeConfig) -> Self {
        Self::new(Arc::new(ProcessBackend::new(config.engines.clone())))
            .with_stop_timeout(config.engines.stop_timeout())
    }

    /// Set a custom event handler
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = handler;
        self
    }

    /// Set how long `stop` waits for an engine to exit
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    fn slot(&self, kind: EngineKind) -> &Slot {
        &self.slots[kind.index()]
    }

    /// Whether an engine of this kind is running
    pub fn is_running(&self, kind: EngineKind) -> bool {
        self.slot(kind).running.load(Ordering::SeqCst)
    }

    /// Launch plan of the running instance of `kind`
    pub async fn running_plan(&self, kind: EngineKind) -> Option<LaunchPlan> {
        self.slot(kind)
            .instance
            .lock()
            .await
            .as_ref()
            .map(|instance| instance.plan.clone())
    }

    /// Start an engine
    ///
    /// Starting a kind that is already running changes nothing. Configuration
    /// and launch errors leave the kind stopped.
    pub async fn start(&self, config: EngineConfig) -> Result<Transition> {
        let kind = config.kind();
        let slot = self.slot(kind);
        let mut instance = slot.instance.lock().await;

        if instance.is_some() {
            log::info!("{} is already running", kind);
            return Ok(Transition::AlreadyRunning);
        }

        let plan = config.prepare().map_err(|e| {
            log::error!("Failed to load {} configuration: {}", kind, e);
            e
        })?;
        let engine = self.backend.launch(&plan).await.map_err(|e| {
            log::error!("Failed to launch {}: {}", kind, e);
            e
        })?;

        let runner = engine.clone();
        let task = tokio::spawn(async move {
            match runner.run().await {
                Ok(()) => log::debug!("{} run loop finished", kind),
                Err(e) => log::error!("{} stopped unexpectedly: {}", kind, e),
            }
        });

        *instance = Some(EngineInstance { engine, plan, task });
        slot.running.store(true, Ordering::SeqCst);
        drop(instance);

        log::info!("{} launched", kind);
        self.emit(BridgeEvent::EngineStarted { kind }).await;
        Ok(Transition::Started)
    }

    /// Stop an engine
    ///
    /// Stopping a kind that is not running changes nothing.
    pub async fn stop(&self, kind: EngineKind) -> Result<Transition> {
        let slot = self.slot(kind);
        let mut instance = slot.instance.lock().await;

        let Some(EngineInstance { engine, task, .. }) = instance.take() else {
            if kind == EngineKind::Snell {
                log::warn!("Tried to stop {} while it is not running", kind);
            } else {
                log::info!("{} is not running", kind);
            }
            return Ok(Transition::NotRunning);
        };

        log::info!("Stopping {}", kind);
        if let Err(e) = engine.close() {
            log::warn!("Failed to close {}: {}", kind, e);
        }

        let mut task = task;
        if tokio::time::timeout(self.stop_timeout, &mut task).await.is_err() {
            log::warn!(
                "{} did not exit within {:?}, abandoning it",
                kind,
                self.stop_timeout
            );
            task.abort();
        }

        slot.running.store(false, Ordering::SeqCst);
        drop(instance);

        log::info!("{} stopped", kind);
        self.emit(BridgeEvent::EngineStopped { kind }).await;
        Ok(Transition::Stopped)
    }

    /// Stop every running engine
    pub async fn stop_all(&self) {
        for kind in EngineKind::ALL {
            if let Err(e) = self.stop(kind).await {
                log::warn!("Failed to stop {}: {}", kind, e);
            }
        }
    }

    /// Version string reported by an engine
    pub async fn version(&self, kind: EngineKind) -> Result<String> {
        self.backend.version(kind).await
    }

    pub async fn start_trojan(&self, config_file: &Path) -> Result<Transition> {
        log::info!("Running trojan-go client, config file: {}", config_file.display());
        self.start(EngineConfig::Trojan {
            config_file: config_file.to_path_buf(),
        })
        .await
    }

    pub async fn start_shadowsocks(&self, config: ShadowsocksConfig) -> Result<Transition> {
        self.start(EngineConfig::Shadowsocks(config)).await
    }

    pub async fn start_v2ray(&self, config_file: &Path) -> Result<Transition> {
        self.start(EngineConfig::V2ray {
            config_file: config_file.to_path_buf(),
        })
        .await
    }

    pub async fn start_snell(&self, config_file: &Path) -> Result<Transition> {
        log::info!("Running snell client, config file: {}", config_file.display());
        self.start(EngineConfig::Snell {
            config_file: config_file.to_path_buf(),
        })
        .await
    }

    /// Check a v2ray configuration file, returning the verdict and diagnostics
    pub async fn test_v2ray(&self, config_file: &Path) -> (bool, String) {
        let config = EngineConfig::V2ray {
            config_file: config_file.to_path_buf(),
        };
        let plan = match config.prepare() {
            Ok(plan) => plan,
            Err(e) => return (false, e.to_string()),
        };
        match self.backend.test(&plan).await {
            Ok(report) => (report.ok, report.message),
            Err(e) => (false, e.to_string()),
        }
    }

    /// trojan-go version, or `"unknown"` when it cannot be queried
    pub async fn trojan_version(&self) -> String {
        match self.version(EngineKind::Trojan).await {
            Ok(version) => version,
            Err(e) => {
                log::warn!("Failed to query trojan-go version: {}", e);
                "unknown".to_string()
            }
        }
    }

    async fn emit(&self, event: BridgeEvent) {
        self.event_handler.on_event(event).await;
    }
}
