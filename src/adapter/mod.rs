mod direct;
mod reject;
mod socks5;
pub mod ssr;

pub use direct::Direct;
pub use reject::Reject;
pub use socks5::{Socks5, Socks5Option};
pub use ssr::{ShadowsocksR, ShadowsocksROption};

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::dns::Resolver;
use crate::error::{DialError, ResolveError};
use crate::metadata::Metadata;
use crate::socks_addr::Address;

/// 出站返回的双向字节流
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ProxyStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn ProxyStream>;

/// 出站返回的报文通道
#[async_trait]
pub trait PacketConn: Send + Sync {
    async fn send_to(&self, payload: &[u8], target: &Address) -> io::Result<usize>;

    /// 返回实际的发送方地址
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

/// 拨号时需要的外部依赖
#[derive(Clone)]
pub struct DialContext {
    pub resolver: Option<Arc<Resolver>>,
    pub connect_timeout: Duration,
}

impl DialContext {
    pub fn new(resolver: Option<Arc<Resolver>>, connect_timeout: Duration) -> Self {
        Self {
            resolver,
            connect_timeout,
        }
    }

    /// 把地址解析成 socket 地址：有解析器走解析器（跳过 Fake-IP），否则交给系统
    pub async fn resolve_address(&self, addr: &Address) -> Result<SocketAddr, DialError> {
        match addr {
            Address::Ip(sa) => Ok(*sa),
            Address::Domain(host, port) => {
                if let Some(resolver) = &self.resolver {
                    let ip = resolver.resolve_ip(host, false).await?;
                    return Ok(SocketAddr::new(ip, *port));
                }
                let mut addrs = tokio::net::lookup_host((host.as_str(), *port))
                    .await
                    .map_err(|e| DialError::Resolve(ResolveError::Io(e)))?;
                addrs.next().ok_or_else(|| {
                    DialError::Resolve(ResolveError::NoAnswer(host.clone()))
                })
            }
        }
    }

    /// 元数据中的目标：已有 IP 直接用，否则解析域名
    pub async fn resolve_target(&self, metadata: &Metadata) -> Result<SocketAddr, DialError> {
        match metadata.dst_socket_addr() {
            Some(addr) => Ok(addr),
            None => self.resolve_address(&metadata.remote_address()).await,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    Direct,
    Reject,
    Socks5,
    ShadowsocksR,
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdapterKind::Direct => "Direct",
            AdapterKind::Reject => "Reject",
            AdapterKind::Socks5 => "Socks5",
            AdapterKind::ShadowsocksR => "ShadowsocksR",
        };
        f.write_str(name)
    }
}

/// 出站适配器
pub enum Adapter {
    Direct(Direct),
    Reject(Reject),
    Socks5(Socks5),
    ShadowsocksR(ShadowsocksR),
}

impl Adapter {
    pub fn name(&self) -> &str {
        match self {
            Adapter::Direct(a) => a.name(),
            Adapter::Reject(a) => a.name(),
            Adapter::Socks5(a) => a.name(),
            Adapter::ShadowsocksR(a) => a.name(),
        }
    }

    pub fn kind(&self) -> AdapterKind {
        match self {
            Adapter::Direct(_) => AdapterKind::Direct,
            Adapter::Reject(_) => AdapterKind::Reject,
            Adapter::Socks5(_) => AdapterKind::Socks5,
            Adapter::ShadowsocksR(_) => AdapterKind::ShadowsocksR,
        }
    }

    pub fn supports_udp(&self) -> bool {
        matches!(self, Adapter::Direct(_) | Adapter::Reject(_))
    }

    /// 建立 TCP 出站，失败时不会留下任何半开的连接
    pub async fn dial(
        &self,
        ctx: &DialContext,
        metadata: &Metadata,
    ) -> Result<BoxedStream, DialError> {
        match self {
            Adapter::Direct(a) => a.dial(ctx, metadata).await,
            Adapter::Reject(a) => a.dial(metadata).await,
            Adapter::Socks5(a) => a.dial(ctx, metadata).await,
            Adapter::ShadowsocksR(a) => a.dial(ctx, metadata).await,
        }
    }

    /// 建立 UDP 出站
    pub async fn dial_packet(
        &self,
        ctx: &DialContext,
        metadata: &Metadata,
    ) -> Result<Box<dyn PacketConn>, DialError> {
        match self {
            Adapter::Direct(a) => a.dial_packet(ctx, metadata).await,
            Adapter::Reject(a) => a.dial_packet(metadata).await,
            _ => Err(DialError::UdpUnsupported(self.name().to_string())),
        }
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind(), self.name())
    }
}

/// 带超时的 TCP 连接
pub(crate) async fn connect_tcp(addr: SocketAddr, limit: Duration) -> Result<TcpStream, DialError> {
    let stream = match timeout(limit, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(DialError::Connect {
                addr: addr.to_string(),
                source: e,
            })
        }
        Err(_) => return Err(DialError::Timeout(addr.to_string())),
    };

    let _ = stream.set_nodelay(true);

    // ⚡ 设置 TCP_QUICKACK（Linux）- 快速 ACK
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let fd = stream.as_raw_fd();
        let quickack: libc::c_int = 1;
        unsafe {
            let _ = libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_QUICKACK,
                &quickack as *const _ as *const libc::c_void,
                std::mem::size_of_val(&quickack) as libc::socklen_t,
            );
        }
    }

    debug!("已连接到 {}", addr);
    Ok(stream)
}
