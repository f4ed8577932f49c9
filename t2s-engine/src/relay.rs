//! Packet relay between the virtual interface and the stack

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use t2s_tun::{PacketDevice, MTU};

use crate::stack::{NetStack, OutputFn};

/// Packets the stack may queue for the device before new ones are dropped
pub const OUTPUT_QUEUE_LEN: usize = 1024;

/// Why the relay loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayExit {
    /// The session token was cancelled
    Cancelled,
    /// The device was closed underneath the loop
    DeviceClosed,
    /// A read or write failed
    Failed(String),
}

impl std::fmt::Display for RelayExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayExit::Cancelled => write!(f, "cancelled"),
            RelayExit::DeviceClosed => write!(f, "device closed"),
            RelayExit::Failed(msg) => write!(f, "failed: {}", msg),
        }
    }
}

/// Per-session traffic counters
#[derive(Debug, Default)]
pub struct RelayStats {
    pub packets_in: AtomicU64,
    pub bytes_in: AtomicU64,
    pub packets_out: AtomicU64,
    pub bytes_out: AtomicU64,
    pub dropped_out: AtomicU64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a packet read from the device
    pub fn record_in(&self, bytes: usize) {
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_in.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a packet written to the device
    pub fn record_out(&self, bytes: usize) {
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current counters
    pub fn snapshot(&self) -> RelaySnapshot {
        RelaySnapshot {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            dropped_out: self.dropped_out.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of relay counters at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelaySnapshot {
    pub packets_in: u64,
    pub bytes_in: u64,
    pub packets_out: u64,
    pub bytes_out: u64,
    pub dropped_out: u64,
}

/// Create the stack output callback and the queue the relay drains
///
/// A full queue drops the packet (the transport above retransmits); a
/// closed queue means the session is gone and reports `BrokenPipe`.
pub fn output_channel(stats: Arc<RelayStats>) -> (OutputFn, mpsc::Receiver<Vec<u8>>) {
    let (tx, rx) = mpsc::channel::<Vec<u8>>(OUTPUT_QUEUE_LEN);
    let output: OutputFn = Arc::new(move |packet: &[u8]| match tx.try_send(packet.to_vec()) {
        Ok(()) => Ok(packet.len()),
        Err(mpsc::error::TrySendError::Full(_)) => {
            stats.dropped_out.fetch_add(1, Ordering::Relaxed);
            log::trace!("Device queue full, dropping {} byte packet", packet.len());
            Ok(packet.len())
        }
        Err(mpsc::error::TrySendError::Closed(_)) => Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "relay session ended",
        )),
    });
    (output, rx)
}

/// Pump packets between `device` and `stack` until cancelled or the device fails
///
/// Device reads go into one reused MTU sized buffer and are fed to the
/// stack; packets queued by the stack's output callback are written back to
/// the device. The loop never closes the device.
pub async fn run_relay(
    device: Arc<dyn PacketDevice>,
    stack: Arc<dyn NetStack>,
    mut output_rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
    stats: Arc<RelayStats>,
) -> RelayExit {
    let mut buf = vec![0u8; MTU];
    let name = device.name().to_string();
    log::debug!("Relay started on {}", name);

    let exit = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break RelayExit::Cancelled,

            res = device.recv(&mut buf) => match res {
                Ok(0) => continue,
                Ok(n) => {
                    stats.record_in(n);
                    if let Err(e) = stack.input(&buf[..n]).await {
                        break RelayExit::Failed(format!("stack input: {}", e));
                    }
                }
                Err(e) if e.is_closed() => break RelayExit::DeviceClosed,
                Err(e) => break RelayExit::Failed(format!("device read: {}", e)),
            },

            packet = output_rx.recv() => match packet {
                Some(packet) => match device.send(&packet).await {
                    Ok(n) => stats.record_out(n),
                    Err(e) if e.is_closed() => break RelayExit::DeviceClosed,
                    Err(e) => break RelayExit::Failed(format!("device write: {}", e)),
                },
                None => break RelayExit::Failed("stack output closed".into()),
            },
        }
    };

    match &exit {
        RelayExit::Failed(msg) => log::error!("Relay on {} failed: {}", name, msg),
        other => log::debug!("Relay on {} ended: {}", name, other),
    }
    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::mock::MockStack;
    use crate::stack::{BoxedStream, ConnMeta, TcpConnHandler, UdpConnHandler};
    use async_trait::async_trait;
    use std::time::Duration;
    use t2s_tun::transport::mock::MockTunDevice;

    struct Nop;

    #[async_trait]
    impl TcpConnHandler for Nop {
        async fn handle(&self, _s: BoxedStream, _m: ConnMeta) -> crate::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl UdpConnHandler for Nop {
        async fn handle(&self, _s: BoxedStream, _m: ConnMeta) -> crate::Result<()> {
            Ok(())
        }
    }

    async fn wired(stats: Arc<RelayStats>) -> (Arc<MockStack>, mpsc::Receiver<Vec<u8>>) {
        let stack = Arc::new(MockStack::new());
        let (output, rx) = output_channel(stats);
        stack.register_output(output);
        stack.register_tcp_handler(Arc::new(Nop));
        stack.register_udp_handler(Arc::new(Nop));
        stack.start().await.unwrap();
        (stack, rx)
    }

    #[tokio::test]
    async fn test_relay_pumps_both_ways() {
        let stats = Arc::new(RelayStats::new());
        let (stack, rx) = wired(stats.clone()).await;
        let device = Arc::new(MockTunDevice::new("mock0", 1500));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_relay(
            device.clone(),
            stack.clone(),
            rx,
            cancel.clone(),
            stats.clone(),
        ));

        device.inject_packet(vec![0x45, 1, 2, 3]);
        stack.emit(&[0x45, 9, 9]).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stack.inputs(), vec![vec![0x45, 1, 2, 3]]);
        assert_eq!(device.sent_packets(), vec![vec![0x45, 9, 9]]);

        cancel.cancel();
        assert_eq!(task.await.unwrap(), RelayExit::Cancelled);

        let snap = stats.snapshot();
        assert_eq!((snap.packets_in, snap.bytes_in), (1, 4));
        assert_eq!((snap.packets_out, snap.bytes_out), (1, 3));
    }

    #[tokio::test]
    async fn test_relay_exits_when_device_closed() {
        let stats = Arc::new(RelayStats::new());
        let (stack, rx) = wired(stats.clone()).await;
        let device = Arc::new(MockTunDevice::new("mock0", 1500));

        let task = tokio::spawn(run_relay(
            device.clone(),
            stack,
            rx,
            CancellationToken::new(),
            stats,
        ));

        tokio::task::yield_now().await;
        device.close().unwrap();
        assert_eq!(task.await.unwrap(), RelayExit::DeviceClosed);
        assert!(device.is_closed());
    }

    #[tokio::test]
    async fn test_relay_fails_on_unstarted_stack() {
        let stats = Arc::new(RelayStats::new());
        let stack = Arc::new(MockStack::new());
        let (_output, rx) = output_channel(stats.clone());
        let device = Arc::new(MockTunDevice::new("mock0", 1500));
        device.inject_packet(vec![0x45]);

        let exit = run_relay(device, stack, rx, CancellationToken::new(), stats).await;
        assert!(matches!(exit, RelayExit::Failed(ref msg) if msg.contains("stack input")));
    }

    #[test]
    fn test_output_closed_queue_is_broken_pipe() {
        let (output, rx) = output_channel(Arc::new(RelayStats::new()));
        drop(rx);
        let err = output(&[1, 2, 3]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_output_full_queue_drops() {
        let stats = Arc::new(RelayStats::new());
        let (output, _rx) = output_channel(stats.clone());
        for _ in 0..OUTPUT_QUEUE_LEN {
            output(&[0]).unwrap();
        }
        assert_eq!(output(&[1, 2]).unwrap(), 2);
        assert_eq!(stats.snapshot().dropped_out, 1);
    }
}
