//! Tun2socks lifecycle controller
//!
//! [`Tun2Socks`] owns at most one relay session. A session binds an open
//! virtual interface, a freshly built stack wired to the SOCKS proxy, a
//! cancellation token and the relay task. `start` builds all of it in order
//! and only then reports the bridge as running; `stop` tears it down and
//! joins the relay task before returning, so a following `start` can never
//! overlap with the previous session's relay on the same device.
//!
//! ```rust,ignore
//! let bridge = Tun2Socks::system(&BridgeConfig::default());
//! let params = TunParams::from_strings("tun1", "240.0.0.2", "240.0.0.1", "8.8.8.8")?;
//!
//! bridge.start(&params, "127.0.0.1:1080").await?;
//! assert!(bridge.is_running());
//! bridge.stop().await?;
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use t2s_tun::{PacketDevice, TunDevice, TunParams};

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::event::{BridgeEvent, EventHandler, LoggingEventHandler};
use crate::handler::{register_socks_handlers, UDP_IDLE_TIMEOUT};
use crate::netstack::IpStackNet;
use crate::proxy::ProxyTarget;
use crate::relay::{output_channel, run_relay, RelayExit, RelaySnapshot, RelayStats};
use crate::stack::NetStack;

/// Upper bound on waiting for the relay task during stop
pub const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens the virtual interface for a session
#[async_trait]
pub trait DeviceOpener: Send + Sync {
    async fn open(&self, params: &TunParams) -> t2s_tun::Result<Arc<dyn PacketDevice>>;
}

/// Opens real tun devices
#[derive(Debug, Default, Clone, Copy)]
pub struct TunOpener;

#[async_trait]
impl DeviceOpener for TunOpener {
    async fn open(&self, params: &TunParams) -> t2s_tun::Result<Arc<dyn PacketDevice>> {
        let device = TunDevice::open(params).await?;
        Ok(Arc::new(device))
    }
}

/// Builds a fresh stack for every session
pub type StackFactory = Arc<dyn Fn() -> Arc<dyn NetStack> + Send + Sync>;

struct Session {
    id: u64,
    device: Arc<dyn PacketDevice>,
    stack: Arc<dyn NetStack>,
    cancel: CancellationToken,
    done: CancellationToken,
    relay: JoinHandle<RelayExit>,
    stats: Arc<RelayStats>,
}

/// Single-session tun2socks bridge
pub struct Tun2Socks {
    opener: Arc<dyn DeviceOpener>,
    stack_factory: StackFactory,
    udp_idle_timeout: Duration,
    join_timeout: Duration,
    session: Mutex<Option<Session>>,
    running: AtomicBool,
    next_id: AtomicU64,
    event_handler: Arc<dyn EventHandler>,
}

impl Tun2Socks {
    /// Create a controller from its collaborators
    pub fn new(opener: Arc<dyn DeviceOpener>, stack_factory: StackFactory) -> Self {
        Self {
            opener,
            stack_factory,
            udp_idle_timeout: UDP_IDLE_TIMEOUT,
            join_timeout: STOP_JOIN_TIMEOUT,
            session: Mutex::new(None),
            running: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            event_handler: Arc::new(LoggingEventHandler),
        }
    }

    /// Controller using real tun devices and the `ipstack` stack
    pub fn system(config: &BridgeConfig) -> Self {
        let mtu = config.tun.mtu;
        let udp_timeout = config.tun.udp_idle_timeout();
        let factory: StackFactory =
            Arc::new(move || Arc::new(IpStackNet::new(mtu, udp_timeout)) as Arc<dyn NetStack>);
        Self::new(Arc::new(TunOpener), factory).with_udp_idle_timeout(udp_timeout)
    }

    /// Set a custom event handler
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = handler;
        self
    }

    /// Set how long `stop` waits for the relay task before aborting it
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Set the idle timeout of SOCKS UDP associations
    pub fn with_udp_idle_timeout(mut self, timeout: Duration) -> Self {
        self.udp_idle_timeout = timeout;
        self
    }

    /// Whether a session is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start a relay session
    ///
    /// Returns once the relay task is spawned. Any failure leaves the bridge
    /// stopped with no device held.
    pub async fn start(&self, params: &TunParams, proxy: &str) -> Result<()> {
        let mut slot = self.session.lock().await;
        if slot.is_some() {
            log::warn!("tun2socks is already running");
            return Err(Error::AlreadyRunning);
        }

        let target = ProxyTarget::resolve(proxy).await?;

        let device = self
            .opener
            .open(params)
            .await
            .map_err(|e| {
                if e.is_permission_denied() {
                    log::error!("Opening {} needs root or CAP_NET_ADMIN", params.name);
                }
                Error::DeviceOpenFailed(e)
            })?;

        let session = match self.launch(device.clone(), &target).await {
            Ok(session) => session,
            Err(e) => {
                if let Err(close_err) = device.close() {
                    log::warn!("Failed to release {} after start error: {}", device.name(), close_err);
                }
                return Err(e);
            }
        };

        log::info!(
            "tun2socks session {} started: {} -> {}",
            session.id,
            device.info().name,
            target
        );
        *slot = Some(session);
        self.running.store(true, Ordering::SeqCst);
        drop(slot);

        self.emit(BridgeEvent::SessionStarted {
            device: device.info().name.clone(),
            proxy: target.addr(),
        })
        .await;
        Ok(())
    }

    async fn launch(&self, device: Arc<dyn PacketDevice>, target: &ProxyTarget) -> Result<Session> {
        let stack = (self.stack_factory)();
        let stats = Arc::new(RelayStats::new());

        // Consumers on both sides are in place before the first packet
        let (output, output_rx) = output_channel(stats.clone());
        stack.register_output(output);
        register_socks_handlers(stack.as_ref(), target, self.udp_idle_timeout);
        stack.start().await?;

        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let relay = {
            let device = device.clone();
            let stack = stack.clone();
            let cancel = cancel.clone();
            let done = done.clone();
            let stats = stats.clone();
            let events = self.event_handler.clone();
            tokio::spawn(async move {
                let exit = run_relay(device, stack, output_rx, cancel, stats).await;
                done.cancel();
                events
                    .on_event(BridgeEvent::RelayExited {
                        reason: exit.to_string(),
                    })
                    .await;
                exit
            })
        };

        Ok(Session {
            id,
            device,
            stack,
            cancel,
            done,
            relay,
            stats,
        })
    }

    /// Stop the running session
    ///
    /// Returns [`Error::NotRunning`] when there is nothing to stop. A device
    /// close failure is reported as [`Error::CloseFailed`] after the rest of
    /// the session has been torn down.
    pub async fn stop(&self) -> Result<()> {
        let mut slot = self.session.lock().await;
        let session = match slot.take() {
            Some(session) => session,
            None => {
                log::info!("tun2socks is not running");
                return Err(Error::NotRunning);
            }
        };
        self.running.store(false, Ordering::SeqCst);

        let res = self.teardown(session).await;
        drop(slot);
        res
    }

    /// Wait until the current session ends
    ///
    /// Returns immediately when idle. A session whose relay loop ended on
    /// its own is torn down before this returns.
    pub async fn wait(&self) -> Result<()> {
        let (id, done) = match self.session.lock().await.as_ref() {
            Some(session) => (session.id, session.done.clone()),
            None => return Ok(()),
        };

        done.cancelled().await;

        let mut slot = self.session.lock().await;
        if slot.as_ref().map(|s| s.id) != Some(id) {
            return Ok(());
        }
        let Some(session) = slot.take() else {
            return Ok(());
        };
        log::info!("tun2socks session {} ended on its own", id);
        self.running.store(false, Ordering::SeqCst);
        self.teardown(session).await
    }

    /// Relay counters of the running session
    pub async fn stats(&self) -> Option<RelaySnapshot> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.stats.snapshot())
    }

    async fn teardown(&self, session: Session) -> Result<()> {
        let Session {
            id,
            device,
            stack,
            cancel,
            done,
            mut relay,
            stats,
        } = session;
        let name = device.info().name.clone();

        let closed = device.close();
        cancel.cancel();
        stack.shutdown().await;

        match tokio::time::timeout(self.join_timeout, &mut relay).await {
            Ok(Ok(exit)) => log::debug!("Relay of session {} joined: {}", id, exit),
            Ok(Err(e)) => log::warn!("Relay of session {} panicked: {}", id, e),
            Err(_) => {
                log::warn!(
                    "Relay of session {} did not exit within {:?}, aborting",
                    id,
                    self.join_timeout
                );
                relay.abort();
                let _ = relay.await;
            }
        }
        // An aborted relay never reaches its own cancel; waiters must still wake
        done.cancel();
        drop(stack);
        drop(device);

        let snap = stats.snapshot();
        log::info!(
            "tun2socks session {} stopped ({} packets in, {} packets out)",
            id,
            snap.packets_in,
            snap.packets_out
        );
        self.emit(BridgeEvent::SessionStopped).await;

        match closed {
            Ok(()) => Ok(()),
            Err(t2s_tun::Error::AlreadyClosed) => {
                log::debug!("{} was already closed", name);
                Ok(())
            }
            Err(e) => {
                let message = format!("{}: {}", name, e);
                log::error!("Failed to close tun device {}", message);
                self.emit(BridgeEvent::Error {
                    message: message.clone(),
                    fatal: true,
                })
                .await;
                Err(Error::CloseFailed(message))
            }
        }
    }

    async fn emit(&self, event: BridgeEvent) {
        self.event_handler.on_event(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::mock::MockStack;
    use std::sync::{Mutex as StdMutex, Weak};
    use t2s_tun::transport::mock::{MockTunDevice, MockTunRegistry};

    /// Opens mock devices, keeping only weak references so that dropping
    /// the session really releases the interface name
    #[derive(Default)]
    struct RegistryOpener {
        registry: MockTunRegistry,
        opened: StdMutex<Vec<Weak<MockTunDevice>>>,
    }

    impl RegistryOpener {
        fn last(&self) -> Option<Arc<MockTunDevice>> {
            self.opened.lock().unwrap().last().and_then(Weak::upgrade)
        }
    }

    #[async_trait]
    impl DeviceOpener for RegistryOpener {
        async fn open(&self, params: &TunParams) -> t2s_tun::Result<Arc<dyn PacketDevice>> {
            let device = Arc::new(self.registry.open(params)?);
            self.opened.lock().unwrap().push(Arc::downgrade(&device));
            Ok(device)
        }
    }

    #[derive(Default)]
    struct Recorder(StdMutex<Vec<BridgeEvent>>);

    #[async_trait]
    impl EventHandler for Recorder {
        async fn on_event(&self, event: BridgeEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn params() -> TunParams {
        TunParams::from_strings("tun9", "240.0.0.2", "240.0.0.1", "8.8.8.8").unwrap()
    }

    fn bridge() -> (Tun2Socks, Arc<RegistryOpener>, Arc<StdMutex<Vec<Arc<MockStack>>>>) {
        let opener = Arc::new(RegistryOpener::default());
        let stacks = Arc::new(StdMutex::new(Vec::new()));
        let made = stacks.clone();
        let factory: StackFactory = Arc::new(move || {
            let stack = Arc::new(MockStack::new());
            made.lock().unwrap().push(stack.clone());
            stack as Arc<dyn NetStack>
        });
        (Tun2Socks::new(opener.clone(), factory), opener, stacks)
    }

    #[tokio::test]
    async fn test_running_flag_follows_lifecycle() {
        let (bridge, _, _) = bridge();
        assert!(!bridge.is_running());

        bridge.start(&params(), "127.0.0.1:1080").await.unwrap();
        assert!(bridge.is_running());

        bridge.stop().await.unwrap();
        assert!(!bridge.is_running());
    }

    #[tokio::test]
    async fn test_start_while_running_is_rejected() {
        let (bridge, opener, _) = bridge();
        bridge.start(&params(), "127.0.0.1:1080").await.unwrap();

        let err = bridge.start(&params(), "127.0.0.1:1080").await.unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning));
        assert_eq!(opener.registry.open_count(), 1);
        assert!(bridge.is_running());

        bridge.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let (bridge, _, _) = bridge();
        let err = bridge.stop().await.unwrap_err();
        assert!(err.is_noop());
        assert!(!bridge.is_running());
    }

    #[tokio::test]
    async fn test_restart_reopens_same_device() {
        let (bridge, opener, _) = bridge();

        bridge.start(&params(), "127.0.0.1:1080").await.unwrap();
        bridge.stop().await.unwrap();
        assert!(!opener.registry.is_held("tun9"));

        bridge.start(&params(), "127.0.0.1:1080").await.unwrap();
        assert_eq!(opener.registry.open_count(), 2);
        bridge.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_proxy_opens_nothing() {
        let (bridge, opener, _) = bridge();
        let err = bridge.start(&params(), "127.0.0.1").await.unwrap_err();
        assert!(matches!(err, Error::InvalidAddress(_)));
        assert_eq!(opener.registry.open_count(), 0);
        assert!(!bridge.is_running());
    }

    #[tokio::test]
    async fn test_device_open_failure_aborts_start() {
        let (bridge, opener, stacks) = bridge();
        let _held = opener.registry.open(&params()).unwrap();

        let err = bridge.start(&params(), "127.0.0.1:1080").await.unwrap_err();
        assert!(matches!(err, Error::DeviceOpenFailed(_)));
        assert!(!bridge.is_running());
        assert!(stacks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stack_wired_before_relay() {
        let (bridge, opener, stacks) = bridge();
        bridge.start(&params(), "127.0.0.1:1080").await.unwrap();

        let stack = stacks.lock().unwrap()[0].clone();
        assert!(stack.is_started());

        let device = opener.last().unwrap();
        device.inject_packet(vec![0x45, 0, 0, 20]);
        stack.emit(&[0x45, 1]).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(stack.inputs(), vec![vec![0x45, 0, 0, 20]]);
        assert_eq!(device.sent_packets(), vec![vec![0x45, 1]]);
        let snap = bridge.stats().await.unwrap();
        assert_eq!(snap.packets_in, 1);
        assert_eq!(snap.packets_out, 1);
        drop(device);

        bridge.stop().await.unwrap();
        assert_eq!(stack.shutdown_count(), 1);
        assert!(bridge.stats().await.is_none());
    }

    #[tokio::test]
    async fn test_close_failure_is_reported() {
        let (bridge, opener, _) = bridge();
        let recorder = Arc::new(Recorder::default());
        let bridge = bridge.with_event_handler(recorder.clone());

        bridge.start(&params(), "127.0.0.1:1080").await.unwrap();
        let device = opener.last().unwrap();
        device.fail_next_close();
        drop(device);

        let err = bridge.stop().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(!bridge.is_running());

        let events = recorder.0.lock().unwrap().clone();
        assert!(events.contains(&BridgeEvent::SessionStopped));
        assert!(events
            .iter()
            .any(|e| matches!(e, BridgeEvent::Error { fatal: true, .. })));

        bridge.start(&params(), "127.0.0.1:1080").await.unwrap();
        bridge.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_returns_after_stop() {
        let (bridge, _, _) = bridge();
        let bridge = Arc::new(bridge);
        bridge.start(&params(), "127.0.0.1:1080").await.unwrap();

        let waiter = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        bridge.stop().await.unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wait_reaps_session_whose_relay_ended() {
        let (bridge, opener, _) = bridge();
        bridge.start(&params(), "127.0.0.1:1080").await.unwrap();

        let device = opener.last().unwrap();
        device.close().unwrap();
        drop(device);

        bridge.wait().await.unwrap();
        assert!(!bridge.is_running());
        assert!(!opener.registry.is_held("tun9"));
    }

    #[tokio::test]
    async fn test_wait_when_idle_returns() {
        let (bridge, _, _) = bridge();
        bridge.wait().await.unwrap();
    }

    /// Stack whose input never completes, pinning the relay task
    struct StuckStack(MockStack);

    #[async_trait]
    impl NetStack for StuckStack {
        fn register_output(&self, output: crate::stack::OutputFn) {
            self.0.register_output(output)
        }

        fn register_tcp_handler(&self, handler: Arc<dyn crate::stack::TcpConnHandler>) {
            self.0.register_tcp_handler(handler)
        }

        fn register_udp_handler(&self, handler: Arc<dyn crate::stack::UdpConnHandler>) {
            self.0.register_udp_handler(handler)
        }

        async fn start(&self) -> Result<()> {
            self.0.start().await
        }

        async fn input(&self, _packet: &[u8]) -> Result<()> {
            std::future::pending().await
        }

        async fn shutdown(&self) {
            self.0.shutdown().await
        }
    }

    #[tokio::test]
    async fn test_wait_returns_when_stop_aborts_relay() {
        let opener = Arc::new(RegistryOpener::default());
        let factory: StackFactory = Arc::new(|| Arc::new(StuckStack(MockStack::new())) as Arc<dyn NetStack>);
        let bridge = Arc::new(
            Tun2Socks::new(opener.clone(), factory).with_join_timeout(Duration::from_millis(100)),
        );
        bridge.start(&params(), "127.0.0.1:1080").await.unwrap();

        let device = opener.last().unwrap();
        device.inject_packet(vec![0x45, 0, 0, 20]);
        drop(device);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiter = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        bridge.stop().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("wait() still blocked after stop")
            .unwrap()
            .unwrap();
        assert!(!bridge.is_running());
        assert!(!opener.registry.is_held("tun9"));
    }
}
