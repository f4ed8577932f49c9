//! Tun2socks bridge engine
//!
//! This crate bridges a virtual network interface to a downstream SOCKS5
//! proxy and supervises the proxy engines that usually provide that SOCKS
//! endpoint. Both are driven by a host process, typically through the C
//! ABI in `t2s-ffi`, that may start and stop them repeatedly.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Host Layer                               │
//! │  ┌─────────────────┐              ┌─────────────────────┐   │
//! │  │    t2s-cli      │              │  t2s-ffi (C ABI)    │   │
//! │  └────────┬────────┘              └──────────┬──────────┘   │
//! │           └───────────────┬──────────────────┘              │
//! │                           ▼                                 │
//! │  ┌────────────────────────────────────────────────────────┐ │
//! │  │                   t2s-engine                           │ │
//! │  │  - Tun2Socks (single relay session)                    │ │
//! │  │  - Supervisor (one instance per engine kind)           │ │
//! │  │  - BridgeConfig (TOML), BridgeEvent                    │ │
//! │  └────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  t2s-tun (device)   ipstack (stack)   socks5-impl (SOCKS)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Packet path of a session:
//!
//! ```text
//! tun device ──recv──▶ relay ──input──▶ NetStack ──TCP/UDP──▶ SOCKS handlers ──▶ proxy
//! tun device ◀──send── relay ◀──output queue── NetStack
//! ```

pub mod config;
pub mod engines;
pub mod error;
pub mod event;
pub mod handler;
pub mod netstack;
pub mod proxy;
pub mod relay;
pub mod stack;
pub mod supervisor;
pub mod tun2socks;

pub use config::BridgeConfig;
pub use engines::{EngineBackend, EngineConfig, EngineKind, LaunchPlan, ProxyEngine, ShadowsocksConfig};
pub use error::{Error, Result};
pub use event::{BridgeEvent, EventHandler, LoggingEventHandler};
pub use proxy::ProxyTarget;
pub use relay::{RelayExit, RelaySnapshot};
pub use supervisor::{Supervisor, Transition};
pub use tun2socks::{DeviceOpener, StackFactory, Tun2Socks, TunOpener};

pub use t2s_tun::TunParams;
