//! Recording stack for testing
//!
//! [`MockStack`] keeps every packet fed to it and lets a test push packets
//! out through the registered output callback or surface a connection to
//! the registered handlers over an in-memory duplex pipe.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::DuplexStream;

use super::{ConnMeta, NetStack, OutputFn, TcpConnHandler, UdpConnHandler, Wiring};
use crate::error::{Error, Result};

/// Stack that records input and replays output on demand
#[derive(Default)]
pub struct MockStack {
    wiring: Mutex<Wiring>,
    started: AtomicBool,
    inputs: Mutex<Vec<Vec<u8>>>,
    shutdowns: AtomicUsize,
}

impl MockStack {
    /// Create an unwired stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Packets fed through `input` so far
    pub fn inputs(&self) -> Vec<Vec<u8>> {
        lock(&self.inputs).clone()
    }

    /// Whether `start` succeeded
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Number of `shutdown` calls
    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Emit a packet through the registered output callback
    pub fn emit(&self, packet: &[u8]) -> Result<usize> {
        let output = lock(&self.wiring)
            .output
            .clone()
            .ok_or(Error::StackNotReady("no output callback"))?;
        Ok(output(packet)?)
    }

    /// Surface a TCP connection; returns the application end of the pipe
    pub fn open_tcp(&self, meta: ConnMeta) -> Result<(DuplexStream, tokio::task::JoinHandle<Result<()>>)> {
        let handler = lock(&self.wiring)
            .tcp
            .clone()
            .ok_or(Error::StackNotReady("no TCP handler"))?;
        let (app, stack) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(async move { handler.handle(Box::new(stack), meta).await });
        Ok((app, task))
    }

    /// Surface a UDP flow; returns the application end of the pipe
    pub fn open_udp(&self, meta: ConnMeta) -> Result<(DuplexStream, tokio::task::JoinHandle<Result<()>>)> {
        let handler = lock(&self.wiring)
            .udp
            .clone()
            .ok_or(Error::StackNotReady("no UDP handler"))?;
        let (app, stack) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(async move { handler.handle(Box::new(stack), meta).await });
        Ok((app, task))
    }
}

#[async_trait]
impl NetStack for MockStack {
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
        lock(&self.wiring).ready()?;
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn input(&self, packet: &[u8]) -> Result<()> {
        if !self.is_started() {
            return Err(Error::StackNotReady("not started"));
        }
        lock(&self.inputs).push(packet.to_vec());
        Ok(())
    }

    async fn shutdown(&self) {
        self.started.store(false, Ordering::SeqCst);
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
