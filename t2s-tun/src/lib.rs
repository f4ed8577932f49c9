//! Virtual network interface handle for the tun2socks bridge
//!
//! This crate owns the tun device that the bridge reads raw IP packets from
//! and writes processed packets back to. It exposes:
//!
//! - [`TunParams`]: the parameter set a device is opened with (name,
//!   address, gateway, netmask, DNS servers, MTU)
//! - [`TunDevice`]: the OS device, backed by `tun-rs`
//! - [`PacketDevice`]: the packet-level seam the relay loop is written
//!   against, so the relay can be driven by [`transport::mock::MockTunDevice`]
//!   in tests
//!
//! # Platform Requirements
//!
//! ## Linux
//! - Root privileges or `CAP_NET_ADMIN` capability
//! - TUN kernel module loaded (`modprobe tun`)
//!
//! ## macOS
//! - Root privileges (the name is ignored, a `utun` device is assigned)
//!
//! ## Windows
//! - Administrator privileges
//! - WinTun driver installed (<https://www.wintun.net/>)
//!
//! # Example
//!
//! ```ignore
//! use t2s_tun::{PacketDevice, TunDevice, TunParams};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let params = TunParams::from_strings("tun1", "240.0.0.2", "240.0.0.1", "8.8.8.8,1.1.1.1")?;
//!     let device = TunDevice::open(&params).await?;
//!
//!     let mut buf = vec![0u8; t2s_tun::MTU];
//!     let n = device.recv(&mut buf).await?;
//!     println!("Received {} bytes", n);
//!
//!     device.close()?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod transport;

#[cfg(target_os = "linux")]
pub mod linux;

pub use config::{TunParams, TunParamsBuilder};
pub use device::{DeviceInfo, TunDevice};
pub use error::{Error, Result};
pub use transport::PacketDevice;

/// Largest MTU the interface may use, and the size of the relay read buffer
pub const MTU: usize = 1500;

/// Smallest MTU accepted for the interface
pub const MIN_MTU: u16 = 576;

/// Check an MTU against [`MIN_MTU`] and [`MTU`]
pub fn check_mtu(mtu: u16) -> Result<()> {
    if mtu < MIN_MTU || usize::from(mtu) > MTU {
        return Err(Error::Config(format!(
            "MTU {} is out of range ({}..={})",
            mtu, MIN_MTU, MTU
        )));
    }
    Ok(())
}

/// Netmask applied when the caller does not supply one
pub const DEFAULT_NETMASK: std::net::Ipv4Addr = std::net::Ipv4Addr::new(255, 255, 255, 0);
