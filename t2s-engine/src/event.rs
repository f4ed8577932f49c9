//! Bridge events

use std::net::SocketAddr;

use crate::engines::EngineKind;

/// Events emitted by the lifecycle controller and the engine supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// A relay session started
    SessionStarted {
        /// Name of the virtual interface
        device: String,
        /// Resolved downstream proxy
        proxy: SocketAddr,
    },

    /// The relay loop of the current session exited
    RelayExited {
        /// Why the loop exited
        reason: String,
    },

    /// The relay session was stopped
    SessionStopped,

    /// A proxy engine was started
    EngineStarted { kind: EngineKind },

    /// A proxy engine was stopped
    EngineStopped { kind: EngineKind },

    /// Error occurred
    Error {
        /// Error message
        message: String,
        /// Whether the host should treat this as fatal
        fatal: bool,
    },
}

/// Event handler trait for receiving bridge events
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle a bridge event
    async fn on_event(&self, event: BridgeEvent);
}

/// Simple event handler that logs events
pub struct LoggingEventHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingEventHandler {
    async fn on_event(&self, event: BridgeEvent) {
        match event {
            BridgeEvent::SessionStarted { device, proxy } => {
                log::info!("Running tun2socks: device={}, proxy={}", device, proxy);
            }
            BridgeEvent::RelayExited { reason } => {
                log::info!("Relay loop exited: {}", reason);
            }
            BridgeEvent::SessionStopped => {
                log::info!("tun2socks stopped");
            }
            BridgeEvent::EngineStarted { kind } => {
                log::info!("{} launched", kind);
            }
            BridgeEvent::EngineStopped { kind } => {
                log::info!("{} stopped", kind);
            }
            BridgeEvent::Error { message, fatal } => {
                if fatal {
                    log::error!("Fatal: {}", message);
                } else {
                    log::warn!("Error: {}", message);
                }
            }
        }
    }
}
