//! Packet-level seam between the virtual interface and the relay loop
//!
//! The relay loop is written against [`PacketDevice`] rather than
//! [`TunDevice`](crate::TunDevice) directly, so that it can be driven by
//! [`mock::MockTunDevice`] without root privileges.
//!
//! # Closing
//!
//! `close` may be called from a different task than the one blocked in
//! `recv`. Implementations must wake a pending `recv` with
//! [`Error::Closed`](crate::Error::Closed) and report a second `close` as
//! [`Error::AlreadyClosed`](crate::Error::AlreadyClosed).

pub mod mock;

use async_trait::async_trait;

use crate::device::DeviceInfo;
use crate::error::Result;

/// Async packet transport over a virtual interface
///
/// The interface operates at layer 3: every `recv` yields exactly one raw
/// IP packet and every `send` writes exactly one.
#[async_trait]
pub trait PacketDevice: Send + Sync {
    /// Receive one IP packet from the interface
    ///
    /// # Cancel Safety
    ///
    /// This method should be cancel-safe. If cancelled, no data is lost.
    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    /// Send one IP packet to the interface
    async fn send(&self, buf: &[u8]) -> Result<usize>;

    /// Release the interface
    ///
    /// The first call stops all I/O on the device and returns any error
    /// the release itself hit (for [`TunDevice`](crate::TunDevice), taking
    /// the link down). The OS handle may outlive this call until the last
    /// reference is dropped; that final step is infallible and unreported.
    fn close(&self) -> Result<()>;

    /// Whether `close` has been called
    fn is_closed(&self) -> bool;

    /// Get information about the interface
    fn info(&self) -> &DeviceInfo;

    /// Get the interface name
    fn name(&self) -> &str {
        &self.info().name
    }
}
