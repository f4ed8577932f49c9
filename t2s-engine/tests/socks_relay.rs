//! Connection handlers against an in-process SOCKS5 server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use t2s_engine::handler::{register_socks_handlers, SocksUdpHandler};
use t2s_engine::stack::mock::MockStack;
use t2s_engine::stack::{ConnMeta, NetStack, UdpConnHandler};
use t2s_engine::ProxyTarget;

/// Minimal no-auth SOCKS5 server: CONNECT echoes the stream, UDP ASSOCIATE
/// echoes every datagram (header included) back to the sender.
async fn spawn_socks_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (sock, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            tokio::spawn(serve(sock));
        }
    });
    addr
}

async fn serve(mut sock: TcpStream) {
    let mut head = [0u8; 2];
    sock.read_exact(&mut head).await.unwrap();
    let mut methods = vec![0u8; head[1] as usize];
    sock.read_exact(&mut methods).await.unwrap();
    sock.write_all(&[5, 0]).await.unwrap();

    let mut req = [0u8; 4];
    sock.read_exact(&mut req).await.unwrap();
    let addr_len = match req[3] {
        1 => 4,
        4 => 16,
        3 => sock.read_u8().await.unwrap() as usize,
        other => panic!("bad atyp {other}"),
    };
    let mut rest = vec![0u8; addr_len + 2];
    sock.read_exact(&mut rest).await.unwrap();

    match req[1] {
        1 => {
            sock.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
            let (mut r, mut w) = sock.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        }
        3 => {
            let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let port = udp.local_addr().unwrap().port().to_be_bytes();
            sock.write_all(&[5, 0, 0, 1, 127, 0, 0, 1, port[0], port[1]])
                .await
                .unwrap();

            let echo = tokio::spawn(async move {
                let mut buf = vec![0u8; 65536];
                loop {
                    let (n, from) = udp.recv_from(&mut buf).await.unwrap();
                    udp.send_to(&buf[..n], from).await.unwrap();
                }
            });

            let mut sink = [0u8; 16];
            while matches!(sock.read(&mut sink).await, Ok(n) if n > 0) {}
            echo.abort();
        }
        other => panic!("unexpected command {other}"),
    }
}

fn meta(dst: &str) -> ConnMeta {
    ConnMeta {
        src: "10.0.0.2:40000".parse().unwrap(),
        dst: dst.parse().unwrap(),
    }
}

async fn wired_stack(proxy: SocketAddr, udp_idle: Duration) -> Arc<MockStack> {
    let stack = Arc::new(MockStack::new());
    stack.register_output(Arc::new(|p: &[u8]| Ok(p.len())));
    register_socks_handlers(stack.as_ref(), &ProxyTarget::from_addr(proxy), udp_idle);
    stack.start().await.unwrap();
    stack
}

#[tokio::test]
async fn test_tcp_connection_is_spliced_through_proxy() {
    let proxy = spawn_socks_server().await;
    let stack = wired_stack(proxy, Duration::from_secs(60)).await;

    let (mut app, task) = stack.open_tcp(meta("93.184.216.34:80")).unwrap();
    app.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();

    let mut buf = [0u8; 18];
    app.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"GET / HTTP/1.0\r\n\r\n");

    drop(app);
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_udp_datagrams_are_wrapped_and_unwrapped() {
    let proxy = spawn_socks_server().await;
    let stack = wired_stack(proxy, Duration::from_secs(60)).await;

    let (mut app, task) = stack.open_udp(meta("8.8.8.8:53")).unwrap();
    app.write_all(b"dns query").await.unwrap();

    let mut buf = [0u8; 64];
    let n = app.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"dns query");

    drop(app);
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_udp_association_released_when_idle() {
    let proxy = spawn_socks_server().await;
    let handler = SocksUdpHandler::new(proxy, Duration::from_millis(200));
    let (mut app, flow) = tokio::io::duplex(4096);

    let task = tokio::spawn(async move { handler.handle(Box::new(flow), meta("1.1.1.1:53")).await });

    app.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 16];
    let n = app.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ping");

    // no further traffic; the association ends on its own
    let res = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap();
    res.unwrap().unwrap();
}

#[tokio::test]
async fn test_tcp_fails_when_proxy_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    let stack = wired_stack(dead, Duration::from_secs(60)).await;
    let (_app, task) = stack.open_tcp(meta("1.2.3.4:443")).unwrap();
    let res = task.await.unwrap();
    assert!(res.is_err());
}
