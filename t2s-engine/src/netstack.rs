//! Stack implementation backed by `ipstack`
//!
//! `ipstack` consumes an async byte device. [`IpStackNet`] gives it one made
//! of two halves: packets handed to [`NetStack::input`] go through a bounded
//! queue into the stack's read side, and everything the stack writes goes
//! straight to the registered output callback.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use ipstack::stream::IpStackStream;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::stack::{
    BoxedStream, ConnMeta, NetStack, OutputFn, TcpConnHandler, UdpConnHandler, Wiring,
};

/// Packets queued between the relay loop and the stack
pub const INPUT_QUEUE_LEN: usize = 1024;

const TCP_TIMEOUT: Duration = Duration::from_secs(600);

/// Userspace stack built on `ipstack`
pub struct IpStackNet {
    mtu: u16,
    udp_timeout: Duration,
    wiring: Mutex<Wiring>,
    inbound: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    cancel: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl IpStackNet {
    /// Create an unwired stack
    pub fn new(mtu: u16, udp_timeout: Duration) -> Self {
        Self {
            mtu,
            udp_timeout,
            wiring: Mutex::new(Wiring::default()),
            inbound: Mutex::new(None),
            cancel: CancellationToken::new(),
            accept_task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl NetStack for IpStackNet {
    fn register_output(&self, output: OutputFn) {
        lock(&self.wiring).output = Some(output);
    }

    fn register_tcp_handler(&self, handler: Arc<dyn TcpConnHandler>) {
        lock(&self.wiring).tcp = Some(handler);
    }

    fn register_udp_handler(&self, handler: Arc<dyn UdpConnHandler>) {
        lock(&self.wiring).udp = Some(handler);
    }

    async fn start(&self) -> Result<()> {
        let (output, tcp, udp) = {
            let wiring = lock(&self.wiring);
            wiring.ready()?;
            match (&wiring.output, &wiring.tcp, &wiring.udp) {
                (Some(o), Some(t), Some(u)) => (o.clone(), t.clone(), u.clone()),
                _ => return Err(Error::StackNotReady("incomplete wiring")),
            }
        };

        let mut inbound = lock(&self.inbound);
        if inbound.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let (tx, rx) = mpsc::channel(INPUT_QUEUE_LEN);
        let pipe = PacketPipe { inbound: rx, output };

        let mut config = ipstack::IpStackConfig::default();
        config.mtu(self.mtu);
        config.tcp_timeout(TCP_TIMEOUT);
        config.udp_timeout(self.udp_timeout);
        let stack = ipstack::IpStack::new(config, pipe);

        let cancel = self.cancel.clone();
        let task = tokio::spawn(accept_loop(stack, tcp, udp, cancel));

        *inbound = Some(tx);
        *lock(&self.accept_task) = Some(task);

        log::debug!("ipstack started (MTU {})", self.mtu);
        Ok(())
    }

    async fn input(&self, packet: &[u8]) -> Result<()> {
        let tx = lock(&self.inbound)
            .clone()
            .ok_or(Error::StackNotReady("not started"))?;

        match tx.try_send(packet.to_vec()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::trace!("Stack input queue full, dropping {} byte packet", packet.len());
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stack has shut down",
            ))),
        }
    }

    async fn shutdown(&self) {
        lock(&self.inbound).take();
        self.cancel.cancel();

        let task = lock(&self.accept_task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    log::warn!("Stack accept task failed: {}", e);
                }
            }
        }
        log::debug!("ipstack shut down");
    }
}

async fn accept_loop(
    mut stack: ipstack::IpStack,
    tcp: Arc<dyn TcpConnHandler>,
    udp: Arc<dyn UdpConnHandler>,
    cancel: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => break,
            res = stack.accept() => match res {
                Ok(stream) => stream,
                Err(e) => {
                    log::debug!("Stack accept ended: {}", e);
                    break;
                }
            },
        };

        match stream {
            IpStackStream::Tcp(stream) => {
                let meta = ConnMeta {
                    src: stream.local_addr(),
                    dst: stream.peer_addr(),
                };
                let handler = tcp.clone();
                spawn_conn(cancel.clone(), "TCP", meta, async move {
                    handler.handle(Box::new(stream) as BoxedStream, meta).await
                });
            }
            IpStackStream::Udp(stream) => {
                let meta = ConnMeta {
                    src: stream.local_addr(),
                    dst: stream.peer_addr(),
                };
                let handler = udp.clone();
                spawn_conn(cancel.clone(), "UDP", meta, async move {
                    handler.handle(Box::new(stream) as BoxedStream, meta).await
                });
            }
            IpStackStream::UnknownTransport(u) => {
                log::trace!(
                    "Unhandled transport 0x{:02X}, {} bytes",
                    u.ip_protocol(),
                    u.payload().len()
                );
            }
            IpStackStream::UnknownNetwork(pkt) => {
                log::trace!("Unknown network packet, {} bytes", pkt.len());
            }
        }
    }
}

fn spawn_conn<F>(cancel: CancellationToken, proto: &'static str, meta: ConnMeta, fut: F)
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::trace!("{} {} dropped at shutdown", proto, meta);
            }
            res = fut => {
                if let Err(e) = res {
                    log::debug!("{} {} error: {}", proto, meta, e);
                }
            }
        }
    });
}

/// Device half handed to `ipstack`
struct PacketPipe {
    inbound: mpsc::Receiver<Vec<u8>>,
    output: OutputFn,
}

impl AsyncRead for PacketPipe {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.inbound.poll_recv(cx) {
            Poll::Ready(Some(packet)) => {
                let n = packet.len().min(buf.remaining());
                buf.put_slice(&packet[..n]);
                Poll::Ready(Ok(()))
            }
            // The relay side is gone; ending the device ends the stack task
            Poll::Ready(None) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for PacketPipe {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready((self.output)(buf))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
