//! Tun device backed by `tun-rs`
//!
//! [`TunDevice::open()`] creates and configures the interface in one step.
//! This requires root/admin privileges.
//!
//! ```rust,ignore
//! let params = TunParams::builder()
//!     .name("tun1")
//!     .address(Ipv4Addr::new(240, 0, 0, 2))
//!     .gateway(Ipv4Addr::new(240, 0, 0, 1))
//!     .build()?;
//!
//! let device = TunDevice::open(&params).await?;
//! ```
//!
//! # Release
//!
//! [`TunDevice::close()`] marks the device closed, wakes any task blocked in
//! `recv` and brings the interface down; a failure of the latter is
//! returned to the caller. The file descriptor itself is released when the
//! last reference to the device is dropped, which cannot report errors, so
//! the owner must make sure the relay task has let go of its clone before
//! re-opening the same name.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::TunParams;
use crate::error::{Error, Result};
use crate::transport::PacketDevice;

/// Information about an open virtual interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Interface name as assigned by the OS
    pub name: String,
    /// Interface address
    pub address: Ipv4Addr,
    /// Gateway
    pub gateway: Ipv4Addr,
    /// Netmask
    pub netmask: Ipv4Addr,
    /// DNS servers passed through to the host
    pub dns_servers: Vec<Ipv4Addr>,
    /// MTU
    pub mtu: u16,
}

impl DeviceInfo {
    /// Describe a device that was opened with `params` under `name`
    pub fn from_params(name: impl Into<String>, params: &TunParams) -> Self {
        Self {
            name: name.into(),
            address: params.address,
            gateway: params.gateway,
            netmask: params.netmask,
            dns_servers: params.dns_servers.clone(),
            mtu: params.mtu,
        }
    }
}

/// OS virtual interface
pub struct TunDevice {
    inner: tun_rs::AsyncDevice,
    closed: AtomicBool,
    wake: CancellationToken,
    info: DeviceInfo,
}

impl TunDevice {
    /// Open the virtual interface with the given parameters
    ///
    /// `tun-rs` handles interface creation, address and MTU assignment and
    /// bringing the interface up. On failure the error names the parameter
    /// set and the device remains unopened.
    ///
    /// # Platform Requirements
    ///
    /// - **Linux**: Requires root or `CAP_NET_ADMIN` capability
    /// - **macOS**: Requires root privileges
    /// - **Windows**: Requires Administrator and WinTun driver
    pub async fn open(params: &TunParams) -> Result<Self> {
        params.validate()?;
        let prefix_len = params.prefix_len()?;

        let open_failed = |reason: String| Error::OpenFailed {
            params: params.to_string(),
            reason,
        };

        #[cfg(target_os = "linux")]
        if !crate::linux::is_tun_available() {
            return Err(open_failed("/dev/net/tun is missing, is the tun module loaded?".into()));
        }

        #[allow(unused_mut)]
        let mut builder = tun_rs::DeviceBuilder::new();
        #[cfg(not(target_os = "macos"))]
        {
            builder = builder.name(&params.name);
        }

        let device = builder
            .ipv4(params.address, prefix_len, Some(params.gateway))
            .mtu(params.mtu)
            .build_async()
            .map_err(|e| open_failed(e.to_string()))?;

        let name = device.name().map_err(|e| open_failed(e.to_string()))?;

        log::info!(
            "Opened tun device: {} (addr: {}/{}, gw: {}, MTU: {})",
            name,
            params.address,
            prefix_len,
            params.gateway,
            params.mtu
        );
        if !params.dns_servers.is_empty() {
            log::debug!("DNS servers for {}: {:?}", name, params.dns_servers);
        }

        Ok(Self {
            inner: device,
            closed: AtomicBool::new(false),
            wake: CancellationToken::new(),
            info: DeviceInfo::from_params(name, params),
        })
    }

    /// Get the MTU
    pub fn mtu(&self) -> u16 {
        self.info.mtu
    }

    /// Get the underlying file descriptor (Unix only)
    #[cfg(unix)]
    pub fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        self.inner.as_raw_fd()
    }
}

#[async_trait]
impl PacketDevice for TunDevice {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        tokio::select! {
            _ = self.wake.cancelled() => Err(Error::Closed),
            res = self.inner.recv(buf) => res.map_err(Error::Io),
        }
    }

    async fn send(&self, buf: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.inner.send(buf).await.map_err(Error::Io)
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyClosed);
        }
        self.wake.cancel();
        // The descriptor itself goes with the last reference
        self.inner.enabled(false).map_err(|e| {
            log::error!("Failed to bring down {}: {}", self.info.name, e);
            Error::Io(e)
        })?;
        log::info!("Closed tun device: {}", self.info.name);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        log::debug!("Released tun device handle: {}", self.info.name);
    }
}

impl std::fmt::Debug for TunDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunDevice")
            .field("info", &self.info)
            .field("closed", &self.is_closed())
            .finish()
    }
}
