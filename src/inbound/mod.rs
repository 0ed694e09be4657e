//! 入站监听：SOCKS5（TCP + UDP）和透明代理（REDIR / TPROXY）

pub mod auth;
pub mod redir;
pub mod socks;

pub use auth::{AuthUser, Authenticator, SharedAuthenticator};
pub use redir::{RedirListener, RedirUdpListener};
pub use socks::{SocksListener, SocksUdpListener};

use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::FutureExt;
use log::{debug, error, info};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{watch, Semaphore};

/// ⚡ 大的 backlog（默认 128 → 4096）避免 accept 积压
const LISTEN_BACKLOG: i32 = 4096;

/// 正在运行的监听器
///
/// `close()` 或 drop 时设置 closed 标记并通知 watch，阻塞中的 accept / recv 立即返回。
#[derive(Debug)]
pub struct Listener {
    name: &'static str,
    addr: SocketAddr,
    closed: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

/// 监听任务持有的关闭信号
#[derive(Debug, Clone)]
pub struct ListenerSignal {
    closed: Arc<AtomicBool>,
    rx: watch::Receiver<bool>,
}

impl Listener {
    pub(crate) fn new(name: &'static str, addr: SocketAddr) -> (Self, ListenerSignal) {
        let closed = Arc::new(AtomicBool::new(false));
        let (shutdown, rx) = watch::channel(false);
        let signal = ListenerSignal {
            closed: Arc::clone(&closed),
            rx,
        };
        (
            Self {
                name,
                addr,
                closed,
                shutdown,
            },
            signal,
        )
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.shutdown.send(true);
            info!("🛑 {} 监听已关闭: {}", self.name, self.addr);
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

impl ListenerSignal {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 等待关闭；发送端已经不在也视为关闭
    pub async fn closed(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// 给 UDP 会话使用的关闭通知
    pub fn receiver(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }
}

/// 自适应最大连接数：每核心 500，上限 10000
pub fn default_max_connections() -> usize {
    std::cmp::min(10000, num_cpus::get() * 500)
}

/// 创建 TCP 监听 socket
pub(crate) fn bind_tcp(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    // ⚡ 优化：设置 socket 选项
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }

    socket
        .bind(&addr.into())
        .with_context(|| format!("绑定 TCP 地址 {} 失败", addr))?;
    socket.listen(LISTEN_BACKLOG)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

/// 创建 UDP socket；`transparent` 用于 TPROXY
pub(crate) fn bind_udp(addr: SocketAddr, transparent: bool) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    if transparent {
        redir::set_transparent(&socket, addr).context("设置 IP_TRANSPARENT 失败（需要 CAP_NET_ADMIN）")?;
    }

    socket
        .bind(&addr.into())
        .with_context(|| format!("绑定 UDP 地址 {} 失败", addr))?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

/// TCP accept 循环
///
/// 信号量限制并发连接数；每条连接一个任务，许可一直持有到 `handler` 返回。
pub(crate) fn spawn_accept_loop<F, Fut>(
    name: &'static str,
    listener: TcpListener,
    mut signal: ListenerSignal,
    max_connections: usize,
    handler: F,
) where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(max_connections));
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = signal.closed() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    if signal.is_closed() {
                        break;
                    }
                    error!("接受连接失败: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(p) => p,
                Err(e) => {
                    error!("获取连接许可失败: {}", e);
                    break;
                }
            };
            debug!("{} 接受来自 {} 的新连接", name, peer);

            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                // 持有许可直到连接处理完成
                let _permit = permit;

                let result = AssertUnwindSafe(handler(stream, peer)).catch_unwind().await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("{} 处理 {} 时出错: {:#}", name, peer, e),
                    Err(panic_err) => error!("❌ {} 连接处理任务 panic: {:?}", name, panic_err),
                }
            });
        }
        info!("{} accept 循环退出", name);
    });
}
