//! SOCKS5 connection handlers
//!
//! Every TCP connection the stack accepts becomes a SOCKS5 CONNECT to the
//! proxy target, spliced both ways. Every UDP flow gets its own SOCKS5 UDP
//! ASSOCIATE; datagrams are wrapped in the SOCKS5 UDP header on the way out
//! and unwrapped on the way back. An association is torn down after
//! [`UDP_IDLE_TIMEOUT`] without traffic or when the proxy closes the control
//! connection.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use socks5_impl::protocol::handshake;
use socks5_impl::protocol::{
    Address, AsyncStreamOperation, AuthMethod, Command, Reply, Request, Response, StreamOperation,
    UdpHeader,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::proxy::ProxyTarget;
use crate::stack::{BoxedStream, ConnMeta, NetStack, TcpConnHandler, UdpConnHandler};

/// Idle time after which a UDP association is released
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const UDP_BUF_SIZE: usize = 64 * 1024;


/// Install the SOCKS handlers for `target` into `stack`
pub fn register_socks_handlers(stack: &dyn NetStack, target: &ProxyTarget, udp_idle: Duration) {
    stack.register_tcp_handler(Arc::new(SocksTcpHandler::new(target.addr())));
    stack.register_udp_handler(Arc::new(SocksUdpHandler::new(target.addr(), udp_idle)));
    log::debug!("SOCKS handlers registered for {}", target);
}

/// Splices TCP connections through a SOCKS5 CONNECT
#[derive(Debug, Clone)]
pub struct SocksTcpHandler {
    proxy: SocketAddr,
}

impl SocksTcpHandler {
    pub fn new(proxy: SocketAddr) -> Self {
        Self { proxy }
    }
}

#[async_trait]
impl TcpConnHandler for SocksTcpHandler {
    async fn handle(&self, mut stream: BoxedStream, meta: ConnMeta) -> Result<()> {
        let mut server = TcpStream::connect(self.proxy).await?;
        socks5_impl::client::connect(&mut server, meta.dst, None)
            .await
            .map_err(|e| Error::Socks(format!("CONNECT {}: {}", meta.dst, e)))?;

        log::debug!("TCP {} via {}", meta, self.proxy);

        let (up, down) = tokio::io::copy_bidirectional(&mut stream, &mut server).await?;
        log::debug!("TCP {} closed ({} bytes up, {} bytes down)", meta, up, down);
        Ok(())
    }
}

/// Relays UDP flows through a SOCKS5 UDP association
#[derive(Debug, Clone)]
pub struct SocksUdpHandler {
    proxy: SocketAddr,
    idle_timeout: Duration,
}

impl SocksUdpHandler {
    pub fn new(proxy: SocketAddr, idle_timeout: Duration) -> Self {
        Self {
            proxy,
            idle_timeout,
        }
    }
}

#[async_trait]
impl UdpConnHandler for SocksUdpHandler {
    async fn handle(&self, mut stream: BoxedStream, meta: ConnMeta) -> Result<()> {
        // The association lives as long as this control connection
        let mut ctrl = TcpStream::connect(self.proxy).await?;
        let relay = udp_associate(&mut ctrl, self.proxy).await?;

        let bind: SocketAddr = match relay {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let udp = UdpSocket::bind(bind).await?;
        udp.connect(relay).await?;

        log::debug!("UDP {} via relay {}", meta, relay);

        let idle = tokio::time::sleep(self.idle_timeout);
        tokio::pin!(idle);

        let mut app_buf = vec![0u8; UDP_BUF_SIZE];
        let mut relay_buf = vec![0u8; UDP_BUF_SIZE];
        let mut ctrl_buf = [0u8; 64];
        let mut datagram = Vec::with_capacity(UDP_BUF_SIZE);

        loop {
            tokio::select! {
                _ = &mut idle => {
                    log::debug!("UDP {} idle, releasing association", meta);
                    break;
                }
                n = ctrl.read(&mut ctrl_buf) => {
                    if !matches!(n, Ok(n) if n > 0) {
                        log::debug!("UDP {} control connection closed", meta);
                        break;
                    }
                }
                n = stream.read(&mut app_buf) => {
                    let n = n?;
                    if n == 0 {
                        break;
                    }
                    datagram.clear();
                    UdpHeader::new(0, Address::from(meta.dst))
                        .write_to_stream(&mut datagram)
                        .map_err(|e| Error::Socks(e.to_string()))?;
                    datagram.extend_from_slice(&app_buf[..n]);
                    udp.send(&datagram).await?;
                    idle.as_mut().reset(Instant::now() + self.idle_timeout);
                }
                n = udp.recv(&mut relay_buf) => {
                    let n = n?;
                    let header = UdpHeader::retrieve_from_stream(&mut &relay_buf[..n])
                        .map_err(|e| Error::Socks(format!("bad UDP reply header: {}", e)))?;
                    let payload = relay_buf.get(header.len()..n).unwrap_or_default();
                    stream.write_all(payload).await?;
                    idle.as_mut().reset(Instant::now() + self.idle_timeout);
                }
            }
        }

        Ok(())
    }
}

/// Run the SOCKS5 UDP ASSOCIATE handshake and return the relay address
async fn udp_associate(ctrl: &mut TcpStream, proxy: SocketAddr) -> Result<SocketAddr> {
    handshake::Request::new(vec![AuthMethod::NoAuth])
        .write_to_async_stream(ctrl)
        .await?;
    let chosen = handshake::Response::retrieve_from_async_stream(ctrl).await?;
    if chosen.method != AuthMethod::NoAuth {
        return Err(Error::Socks(format!(
            "proxy refused no-auth method (chose {})",
            chosen.method
        )));
    }

    Request::new(Command::UdpAssociate, Address::unspecified())
        .write_to_async_stream(ctrl)
        .await?;
    let reply = Response::retrieve_from_async_stream(ctrl)
        .await
        .map_err(|e| Error::Socks(format!("bad UDP ASSOCIATE reply: {}", e)))?;
    if reply.reply != Reply::Succeeded {
        return Err(Error::Socks(format!("UDP ASSOCIATE rejected: {}", reply.reply)));
    }

    // An unspecified or named relay sits on the proxy host
    let relay = match reply.address {
        Address::SocketAddress(addr) if !addr.ip().is_unspecified() => addr,
        other => SocketAddr::new(proxy.ip(), other.port()),
    };
    Ok(relay)
}
