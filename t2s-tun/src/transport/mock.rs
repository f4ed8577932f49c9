//! In-memory virtual interface for testing
//!
//! [`MockTunDevice`] simulates a tun device: tests inject packets the "OS"
//! sends through the interface and inspect what was written back.
//! [`MockTunRegistry`] emulates the OS refusing to open an interface name
//! whose previous handle has not been released yet, which is how a
//! descriptor leak shows up in practice ("device busy").
//!
//! # Example
//!
//! ```ignore
//! use t2s_tun::transport::mock::MockTunRegistry;
//! use t2s_tun::PacketDevice;
//!
//! async fn example() {
//!     let registry = MockTunRegistry::new();
//!     let device = registry.open(&params).unwrap();
//!
//!     device.inject_packet(vec![0x45, 0x00 /* ... */]);
//!     let mut buf = vec![0u8; 1500];
//!     let n = device.recv(&mut buf).await.unwrap();
//!
//!     device.send(&buf[..n]).await.unwrap();
//!     assert_eq!(device.sent_packets().len(), 1);
//! }
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::PacketDevice;
use crate::config::TunParams;
use crate::device::DeviceInfo;
use crate::error::{Error, Result};

/// Tracks which mock interface names are currently held open
#[derive(Debug, Clone, Default)]
pub struct MockTunRegistry {
    open: Arc<Mutex<HashSet<String>>>,
    opens: Arc<AtomicUsize>,
}

impl MockTunRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a mock device, failing if `params.name` is still held
    pub fn open(&self, params: &TunParams) -> Result<MockTunDevice> {
        params.validate()?;
        let mut open = lock(&self.open);
        if !open.insert(params.name.clone()) {
            return Err(Error::OpenFailed {
                params: params.to_string(),
                reason: "device or resource busy".into(),
            });
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(MockTunDevice::with_registry(
            DeviceInfo::from_params(params.name.clone(), params),
            Some(self.open.clone()),
        ))
    }

    /// Whether a device with this name is still held
    pub fn is_held(&self, name: &str) -> bool {
        lock(&self.open).contains(name)
    }

    /// Number of successful opens so far
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

/// Simulated tun device
#[derive(Debug)]
pub struct MockTunDevice {
    info: DeviceInfo,
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    sent: Mutex<Vec<Vec<u8>>>,
    closed: AtomicBool,
    wake: CancellationToken,
    fail_close: AtomicBool,
    registry: Option<Arc<Mutex<HashSet<String>>>>,
}

impl MockTunDevice {
    /// Create a stand-alone mock device
    pub fn new(name: &str, mtu: u16) -> Self {
        let info = DeviceInfo {
            name: name.to_string(),
            address: std::net::Ipv4Addr::new(10, 0, 0, 2),
            gateway: std::net::Ipv4Addr::new(10, 0, 0, 1),
            netmask: crate::DEFAULT_NETMASK,
            dns_servers: Vec::new(),
            mtu,
        };
        Self::with_registry(info, None)
    }

    fn with_registry(info: DeviceInfo, registry: Option<Arc<Mutex<HashSet<String>>>>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            info,
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            wake: CancellationToken::new(),
            fail_close: AtomicBool::new(false),
            registry,
        }
    }

    /// Queue a packet as if the OS routed it into the interface
    pub fn inject_packet(&self, packet: Vec<u8>) {
        let _ = self.inbound_tx.send(packet);
    }

    /// Packets written to the interface so far
    pub fn sent_packets(&self) -> Vec<Vec<u8>> {
        lock(&self.sent).clone()
    }

    /// Make the next `close` report a failure (after releasing the device)
    pub fn fail_next_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PacketDevice for MockTunDevice {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            _ = self.wake.cancelled() => Err(Error::Closed),
            packet = rx.recv() => match packet {
                Some(packet) => {
                    let n = packet.len().min(buf.len());
                    buf[..n].copy_from_slice(&packet[..n]);
                    Ok(n)
                }
                None => Err(Error::Closed),
            },
        }
    }

    async fn send(&self, buf: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        lock(&self.sent).push(buf.to_vec());
        Ok(buf.len())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyClosed);
        }
        self.wake.cancel();
        if self.fail_close.swap(false, Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other("simulated close failure")));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }
}

impl Drop for MockTunDevice {
    fn drop(&mut self) {
        if let Some(registry) = &self.registry {
            lock(registry).remove(&self.info.name);
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
