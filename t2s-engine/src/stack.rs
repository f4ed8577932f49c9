//! Userspace IP stack seam
//!
//! A [`NetStack`] turns raw IP packets into connection level streams. The
//! lifecycle controller wires it in a fixed order: the output callback
//! (stack to device) and both connection handlers are registered, then
//! [`NetStack::start`] is called, and only then does the relay loop feed
//! packets through [`NetStack::input`]. A stack refuses to start or accept
//! input until all three are in place.

pub mod mock;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};

/// Callback receiving packets the stack emits towards the device
pub type OutputFn = Arc<dyn Fn(&[u8]) -> io::Result<usize> + Send + Sync>;

/// Byte stream surfaced by the stack for one TCP connection or UDP flow
///
/// For UDP flows each read yields one datagram and each write sends one.
pub trait StackStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> StackStream for T {}

/// Owned stack stream
pub type BoxedStream = Box<dyn StackStream>;

/// Endpoints of an intercepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnMeta {
    /// Application side (address on the virtual interface)
    pub src: SocketAddr,
    /// Original destination
    pub dst: SocketAddr,
}

impl fmt::Display for ConnMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// Handler for TCP connections accepted by the stack
#[async_trait]
pub trait TcpConnHandler: Send + Sync {
    /// Serve one connection until either side closes
    async fn handle(&self, stream: BoxedStream, meta: ConnMeta) -> Result<()>;
}

/// Handler for UDP flows surfaced by the stack
#[async_trait]
pub trait UdpConnHandler: Send + Sync {
    /// Serve one flow until it goes idle or either side closes
    async fn handle(&self, stream: BoxedStream, meta: ConnMeta) -> Result<()>;
}

/// Userspace TCP/IP stack
#[async_trait]
pub trait NetStack: Send + Sync {
    /// Register the callback receiving packets bound for the device
    fn register_output(&self, output: OutputFn);

    /// Register the TCP connection handler
    fn register_tcp_handler(&self, handler: Arc<dyn TcpConnHandler>);

    /// Register the UDP flow handler
    fn register_udp_handler(&self, handler: Arc<dyn UdpConnHandler>);

    /// Start processing; fails with [`Error::StackNotReady`] if wiring is incomplete
    async fn start(&self) -> Result<()>;

    /// Feed one packet read from the device
    async fn input(&self, packet: &[u8]) -> Result<()>;

    /// Stop processing and drop all connections
    async fn shutdown(&self);
}

/// Registered pieces of a stack, checked before start
#[derive(Default)]
pub struct Wiring {
    pub output: Option<OutputFn>,
    pub tcp: Option<Arc<dyn TcpConnHandler>>,
    pub udp: Option<Arc<dyn UdpConnHandler>>,
}

impl Wiring {
    /// Check that every piece is registered
    pub fn ready(&self) -> Result<()> {
        if self.output.is_none() {
            return Err(Error::StackNotReady("no output callback"));
        }
        if self.tcp.is_none() {
            return Err(Error::StackNotReady("no TCP handler"));
        }
        if self.udp.is_none() {
            return Err(Error::StackNotReady("no UDP handler"));
        }
        Ok(())
    }
}

impl fmt::Debug for Wiring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wiring")
            .field("output", &self.output.is_some())
            .field("tcp", &self.tcp.is_some())
            .field("udp", &self.udp.is_some())
            .finish()
    }
}
