//! Integration tests for t2s-tun
//!
//! # Permission Requirements
//!
//! Tests that open a real tun device need elevated privileges and are
//! marked with `#[ignore]` by default.
//!
//! ## Running Privileged Tests
//!
//! ### Linux
//! ```bash
//! # Option 1: Run as root
//! sudo cargo test -p t2s-tun --test integration -- --ignored
//!
//! # Option 2: Add CAP_NET_ADMIN capability to the test binary
//! cargo test -p t2s-tun --test integration --no-run
//! sudo setcap cap_net_admin+ep target/debug/deps/integration-*
//! cargo test -p t2s-tun --test integration -- --ignored
//! ```
//!
//! ## Test Categories
//!
//! - `test_*` - Basic tests (no privileges required)
//! - `test_privileged_*` - Tests requiring root/admin (marked with `#[ignore]`)

use std::net::Ipv4Addr;
use std::sync::Arc;

use t2s_tun::{Error, PacketDevice, TunDevice, TunParams};

fn params(name: &str) -> TunParams {
    TunParams::builder()
        .name(name)
        .address(Ipv4Addr::new(240, 0, 0, 2))
        .gateway(Ipv4Addr::new(240, 0, 0, 1))
        .dns(Ipv4Addr::new(8, 8, 8, 8))
        .build()
        .unwrap()
}

#[test]
fn test_params_require_gateway_distinct_from_address() {
    let result = TunParams::builder()
        .name("t2s0")
        .address(Ipv4Addr::new(240, 0, 0, 2))
        .gateway(Ipv4Addr::new(240, 0, 0, 2))
        .build();

    assert!(matches!(result, Err(Error::InvalidAddress(_))));
}

#[test]
fn test_params_custom_netmask() {
    let params = TunParams::builder()
        .name("t2s0")
        .address(Ipv4Addr::new(10, 8, 0, 2))
        .gateway(Ipv4Addr::new(10, 8, 0, 1))
        .netmask(Ipv4Addr::new(255, 255, 0, 0))
        .build()
        .unwrap();

    assert_eq!(params.prefix_len().unwrap(), 16);
}

#[tokio::test]
async fn test_open_rejects_invalid_params_without_privileges() {
    let mut bad = params("t2s0");
    bad.netmask = Ipv4Addr::new(255, 0, 255, 0);

    let err = TunDevice::open(&bad).await.unwrap_err();
    assert!(matches!(err, Error::InvalidNetmask(_)));
}

/// Open, close and re-open the same interface name
#[tokio::test]
#[ignore]
async fn test_privileged_reopen_after_close() {
    let _ = env_logger::builder().is_test(true).try_init();

    let params = params("t2s-test0");
    let device = TunDevice::open(&params).await.expect("Failed to open tun device");
    assert_eq!(device.info().dns_servers, vec![Ipv4Addr::new(8, 8, 8, 8)]);

    #[cfg(target_os = "linux")]
    assert!(t2s_tun::linux::interface_exists(device.name()));

    device.close().expect("close failed");
    assert!(matches!(device.close(), Err(Error::AlreadyClosed)));
    drop(device);

    let device = TunDevice::open(&params).await.expect("re-open failed");
    device.close().unwrap();
}

/// Closing takes the link down before the handle is dropped
#[cfg(target_os = "linux")]
#[tokio::test]
#[ignore]
async fn test_privileged_close_brings_link_down() {
    const IFF_UP: u32 = 0x1;

    let device = TunDevice::open(&params("t2s-test2")).await.unwrap();
    let flags_path = format!("/sys/class/net/{}/flags", device.name());
    let flags = || {
        let text = std::fs::read_to_string(&flags_path).unwrap();
        u32::from_str_radix(text.trim().trim_start_matches("0x"), 16).unwrap()
    };
    assert_eq!(flags() & IFF_UP, IFF_UP);

    device.close().unwrap();
    assert_eq!(flags() & IFF_UP, 0);
}

/// A reader blocked in `recv` wakes up when the device is closed
#[tokio::test]
#[ignore]
async fn test_privileged_close_wakes_reader() {
    let device = Arc::new(TunDevice::open(&params("t2s-test1")).await.unwrap());

    let reader = device.clone();
    let task = tokio::spawn(async move {
        let mut buf = vec![0u8; t2s_tun::MTU];
        reader.recv(&mut buf).await
    });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    device.close().unwrap();

    let res = tokio::time::timeout(std::time::Duration::from_secs(2), task)
        .await
        .expect("reader did not wake")
        .unwrap();
    assert!(matches!(res, Err(Error::Closed)));
}
