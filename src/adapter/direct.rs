use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use log::{debug, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use super::{connect_tcp, BoxedStream, DialContext, PacketConn};
use crate::error::DialError;
use crate::metadata::Metadata;
use crate::socks_addr::Address;

/// 直连
#[derive(Debug)]
pub struct Direct {
    name: String,
}

impl Direct {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn dial(&self, ctx: &DialContext, metadata: &Metadata) -> Result<BoxedStream, DialError> {
        let addr = ctx.resolve_target(metadata).await?;
        let stream = connect_tcp(addr, ctx.connect_timeout).await?;
        Ok(Box::new(stream))
    }

    pub async fn dial_packet(
        &self,
        ctx: &DialContext,
        metadata: &Metadata,
    ) -> Result<Box<dyn PacketConn>, DialError> {
        // 同一个会话的目标可能解析成 IPv4 也可能是 IPv6
        let (socket, dual_stack) = match bind_dual_stack() {
            Ok(socket) => (socket, true),
            Err(e) => {
                warn!("无法创建双栈 UDP socket，退回 IPv4: {}", e);
                (UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?, false)
            }
        };
        debug!(
            "直连 UDP 出站 {} 绑定在 {:?}",
            metadata.remote_address(),
            socket.local_addr().ok()
        );
        Ok(Box::new(DirectPacketConn {
            socket,
            dual_stack,
            ctx: ctx.clone(),
        }))
    }
}

fn bind_dual_stack() -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(false)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)).into())?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// 双栈 socket 上的 IPv4 地址以 `::ffff:a.b.c.d` 形式收发
fn to_mapped(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(v4) => SocketAddr::new(v4.ip().to_ipv6_mapped().into(), v4.port()),
        v6 => v6,
    }
}

fn from_mapped(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(v4.into(), v6.port()),
            None => addr,
        },
        v4 => v4,
    }
}

struct DirectPacketConn {
    socket: UdpSocket,
    dual_stack: bool,
    ctx: DialContext,
}

#[async_trait]
impl PacketConn for DirectPacketConn {
    async fn send_to(&self, payload: &[u8], target: &Address) -> io::Result<usize> {
        let addr = self
            .ctx
            .resolve_address(target)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        if self.dual_stack {
            self.socket.send_to(payload, to_mapped(addr)).await
        } else {
            self.socket.send_to(payload, addr).await
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (n, from) = self.socket.recv_from(buf).await?;
        Ok((n, from_mapped(from)))
    }
}
