//! 进程内的端到端测试：SOCKS5 入站 → 规则 → 出站 → 本地回显服务

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rule_tunnel::config::parse_config;
use rule_tunnel::executor::Executor;
use rule_tunnel::metadata::{InboundType, Metadata, Network};
use rule_tunnel::metrics::Metrics;
use rule_tunnel::socks_addr::{decode_udp_packet, encode_udp_packet, Address};
use rule_tunnel::tunnel::{Snapshot, StreamRequest, Tunnel};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};

async fn start_echo_tcp() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = conn.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

async fn start_echo_udp() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}

/// 按配置启动一个实例，SOCKS 监听在随机端口
async fn start_daemon(config: &str) -> (Executor, SocketAddr) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = parse_config(config).unwrap();
    config.general.socks_addr = Some("127.0.0.1:0".parse().unwrap());

    let executor = Executor::new(Tunnel::new(Snapshot::default(), Metrics::new()));
    executor.apply_config(config, true).await.unwrap();
    let addr = executor.socks_addr().await.unwrap();
    (executor, addr)
}

async fn socks_connect(proxy: SocketAddr, target: Address) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[5, 1, 0]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [5, 0]);

    let mut request = vec![5, 1, 0];
    request.extend_from_slice(&target.to_bytes().unwrap());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..2], &[5, 0]);
    stream
}

async fn assert_echo(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    timeout(Duration::from_secs(3), stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buf, payload);
}

async fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(3), stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !cond() {
        assert!(Instant::now() < deadline, "等待超时");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_suffix_rule_routes_through_upstream_proxy() {
    let echo = start_echo_tcp().await;

    // 上游实例：把 www.example.com 解析到回显服务
    let (upstream, upstream_addr) = start_daemon(
        r#"{
            "dns": { "enable": true, "nameserver": ["127.0.0.1:1"] },
            "hosts": { "www.example.com": "127.0.0.1" },
            "rules": ["MATCH,DIRECT"]
        }"#,
    )
    .await;

    let front_config = format!(
        r#"{{
            "proxies": [
                {{ "name": "proxyA", "type": "socks5", "server": "127.0.0.1", "port": {} }}
            ],
            "rules": ["DOMAIN-SUFFIX,example.com,proxyA", "MATCH,DIRECT"]
        }}"#,
        upstream_addr.port()
    );
    let (front, front_addr) = start_daemon(&front_config).await;

    let mut via_proxy = socks_connect(
        front_addr,
        Address::Domain("www.example.com".to_string(), echo.port()),
    )
    .await;
    assert_echo(&mut via_proxy, b"through proxyA").await;

    let mut direct = socks_connect(front_addr, Address::Ip(echo)).await;
    assert_echo(&mut direct, b"straight out").await;

    let front_stats = front.tunnel().metrics().snapshot();
    assert_eq!(front_stats.socks5_requests, 1);
    assert_eq!(front_stats.direct_requests, 1);
    assert_eq!(upstream.tunnel().metrics().snapshot().direct_requests, 1);

    front.shutdown().await;
    upstream.shutdown().await;
}

#[tokio::test]
async fn test_reject_closes_inbound() {
    let (daemon, addr) = start_daemon(
        r#"{ "rules": ["DOMAIN-KEYWORD,ads,REJECT", "MATCH,DIRECT"] }"#,
    )
    .await;

    let mut stream = socks_connect(addr, Address::Domain("ads.tracker.net".to_string(), 443)).await;
    assert_closed(&mut stream).await;

    let metrics = daemon.tunnel().metrics().clone();
    wait_until(|| metrics.snapshot().reject_requests == 1).await;
}

#[tokio::test]
async fn test_fake_ip_stable_reverse_and_routed_by_domain() {
    let (daemon, addr) = start_daemon(
        r#"{
            "dns": {
                "enable": true,
                "nameserver": ["127.0.0.1:1"],
                "enhanced-mode": "fake-ip",
                "fake-ip-range": "198.18.0.0/16"
            },
            "rules": ["DOMAIN,test.com,REJECT", "MATCH,DIRECT"]
        }"#,
    )
    .await;
    let resolver = daemon.tunnel().resolver().unwrap();

    let first = resolver.resolve("test.com", false).await.unwrap();
    let second = resolver.resolve("test.com", false).await.unwrap();
    assert_eq!(first, second);
    assert!(resolver.is_fake_ip(first));
    assert_eq!(resolver.reverse_host(first).as_deref(), Some("test.com"));

    // 连接 fake-ip 时按还原出的域名匹配规则
    let mut stream = socks_connect(addr, Address::Ip(SocketAddr::new(first, 80))).await;
    assert_closed(&mut stream).await;
    let metrics = daemon.tunnel().metrics().clone();
    wait_until(|| metrics.snapshot().reject_requests == 1).await;

    // 没有映射的 fake-ip 直接丢弃
    let unknown: IpAddr = "198.18.200.200".parse().unwrap();
    let mut stream = socks_connect(addr, Address::Ip(SocketAddr::new(unknown, 80))).await;
    assert_closed(&mut stream).await;
    wait_until(|| metrics.snapshot().resolve_failures == 1).await;
    assert_eq!(metrics.snapshot().direct_requests, 0);
}

#[tokio::test]
async fn test_udp_associate_round_trip_single_session() {
    let echo = start_echo_udp().await;
    let (daemon, addr) = start_daemon(r#"{ "rules": ["MATCH,DIRECT"] }"#).await;

    let mut control = TcpStream::connect(addr).await.unwrap();
    control.write_all(&[5, 1, 0]).await.unwrap();
    let mut method = [0u8; 2];
    control.read_exact(&mut method).await.unwrap();
    control
        .write_all(&[5, 3, 0, 1, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    control.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..4], &[5, 0, 0, 1]);
    let relay = SocketAddr::new(
        IpAddr::from([reply[4], reply[5], reply[6], reply[7]]),
        u16::from_be_bytes([reply[8], reply[9]]),
    );
    assert_eq!(relay, addr);

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut buf = vec![0u8; 2048];
    for i in 0..10u8 {
        let packet = encode_udp_packet(&Address::Ip(echo), &[b'p', i]).unwrap();
        client.send_to(&packet, relay).await.unwrap();

        let (n, _) = timeout(Duration::from_secs(3), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let (from, offset) = decode_udp_packet(&buf[..n]).unwrap();
        assert_eq!(from, Address::Ip(echo));
        assert_eq!(&buf[offset..n], &[b'p', i]);
    }

    let tunnel = Arc::clone(daemon.tunnel());
    assert_eq!(tunnel.nat().len(), 1);
    assert_eq!(tunnel.metrics().snapshot().udp_sessions_total, 1);

    // 关闭监听后会话随之结束
    daemon.shutdown().await;
    wait_until(|| tunnel.nat().is_empty()).await;
    drop(control);
}

#[tokio::test]
async fn test_ssr_dial_failure_releases_both_sides() {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let config = parse_config(&format!(
        r#"{{
            "proxies": [
                {{ "name": "ssr1", "type": "ssr", "server": "127.0.0.1", "port": {},
                   "password": "secret", "cipher": "aes-128-cfb",
                   "protocol": "auth_aes128_md5", "obfs": "http_simple" }}
            ],
            "rules": ["MATCH,ssr1"]
        }}"#,
        server_addr.port()
    ))
    .unwrap();
    let tunnel = Tunnel::new(config.snapshot, Metrics::new());

    // 超过 255 字节的域名无法写进 SSR 目标地址头
    let host = format!("{}.com", "a".repeat(300));
    let metadata = Metadata::new(
        Network::Tcp,
        InboundType::Socks,
        Address::Domain(host, 443),
        None,
    );
    let (client, inbound) = tokio::io::duplex(1024);
    tunnel.add(StreamRequest {
        metadata,
        conn: Box::new(inbound),
    });

    // 远端只看到连接建立后立即关闭
    let (mut peer, _) = timeout(Duration::from_secs(3), server.accept())
        .await
        .unwrap()
        .unwrap();
    let mut buf = [0u8; 64];
    let n = timeout(Duration::from_secs(3), peer.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);

    let mut client = client;
    let n = timeout(Duration::from_secs(3), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);

    let metrics = tunnel.metrics().clone();
    wait_until(|| metrics.snapshot().failed_connections == 1).await;
    assert_eq!(metrics.snapshot().ssr_requests, 1);
    wait_until(|| metrics.get_active_connections() == 0).await;
}
