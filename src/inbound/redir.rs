//! 透明代理入站
//!
//! TCP 通过 `SO_ORIGINAL_DST`（iptables REDIRECT）取原始目标；
//! UDP 走 TPROXY：`IP_RECVORIGDSTADDR` 在控制消息里带回原始目标，
//! 回包用绑定在原始目标地址上的 socket 发出，客户端看到的源地址不变。
//! 只在 Linux 上可用。

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info};
use socket2::Socket;
use tokio::net::{TcpStream, UdpSocket};

use super::{bind_tcp, bind_udp, spawn_accept_loop, Listener};
use crate::metadata::{InboundType, Metadata, Network};
use crate::socks_addr::Address;
use crate::tunnel::{NatKey, PacketReply, PacketRequest, StreamRequest, Tunnel};

/// REDIR TCP 入站
pub struct RedirListener;

impl RedirListener {
    pub fn bind(addr: SocketAddr, tunnel: Arc<Tunnel>, max_connections: usize) -> Result<Listener> {
        if !cfg!(target_os = "linux") {
            anyhow::bail!("REDIR 入站只支持 Linux");
        }
        let listener = bind_tcp(addr)?;
        let local = listener.local_addr()?;
        let (handle, signal) = Listener::new("REDIR", local);

        spawn_accept_loop("REDIR", listener, signal, max_connections, move |stream, peer| {
            let tunnel = Arc::clone(&tunnel);
            async move { handle_redir(stream, peer, tunnel).await }
        });

        info!("✅ REDIR 代理监听于: {}", local);
        Ok(handle)
    }
}

async fn handle_redir(stream: TcpStream, peer: SocketAddr, tunnel: Arc<Tunnel>) -> Result<()> {
    let target = original_dst(&stream)?;
    let _ = stream.set_nodelay(true);
    debug!("REDIR {} 原始目标 {}", peer, target);

    let metadata = Metadata::new(Network::Tcp, InboundType::Redir, Address::Ip(target), Some(peer));
    tunnel
        .process(StreamRequest {
            metadata,
            conn: Box::new(stream),
        })
        .await;
    Ok(())
}

/// 回包 socket：绑定在原始目标地址上，按目标地址缓存
struct RedirReply {
    client: SocketAddr,
    spoof: Mutex<Option<(SocketAddr, Arc<UdpSocket>)>>,
}

impl RedirReply {
    fn new(client: SocketAddr) -> Self {
        Self {
            client,
            spoof: Mutex::new(None),
        }
    }

    fn spoof_socket(&self, from: SocketAddr) -> io::Result<Arc<UdpSocket>> {
        let mut cached = self.spoof.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((addr, socket)) = cached.as_ref() {
            if *addr == from {
                return Ok(Arc::clone(socket));
            }
        }
        let socket = Arc::new(
            bind_udp(from, true).map_err(|e| io::Error::new(io::ErrorKind::Other, format!("{:#}", e)))?,
        );
        *cached = Some((from, Arc::clone(&socket)));
        Ok(socket)
    }
}

#[async_trait]
impl PacketReply for RedirReply {
    async fn write_back(&self, payload: &[u8], from: SocketAddr) -> io::Result<()> {
        let socket = self.spoof_socket(from)?;
        socket.send_to(payload, self.client).await?;
        Ok(())
    }

    fn client_addr(&self) -> SocketAddr {
        self.client
    }
}

/// TPROXY UDP 入站
pub struct RedirUdpListener;

impl RedirUdpListener {
    pub fn bind(addr: SocketAddr, tunnel: Arc<Tunnel>) -> Result<Listener> {
        if !cfg!(target_os = "linux") {
            anyhow::bail!("TPROXY UDP 入站只支持 Linux");
        }
        let socket = Arc::new(bind_udp(addr, true)?);
        set_recv_orig_dst(&socket, addr)?;
        let local = socket.local_addr()?;
        let (handle, mut signal) = Listener::new("REDIR-UDP", local);

        tokio::spawn(async move {
            loop {
                let mut buf = tunnel.buffer_pool().get();
                let received = tokio::select! {
                    _ = signal.closed() => break,
                    received = recv_with_orig_dst(&socket, buf.full_mut()) => received,
                };
                let (n, client, target) = match received {
                    Ok(v) => v,
                    Err(e) => {
                        if signal.is_closed() {
                            break;
                        }
                        debug!("TPROXY UDP 接收失败: {}", e);
                        continue;
                    }
                };
                buf.set_range(0, n);

                let metadata =
                    Metadata::new(Network::Udp, InboundType::Redir, Address::Ip(target), Some(client));
                tunnel.add_packet(PacketRequest {
                    metadata,
                    payload: buf,
                    reply: Arc::new(RedirReply::new(client)),
                    key: NatKey::Flow { client, target },
                    shutdown: signal.receiver(),
                });
            }
            info!("TPROXY UDP 接收循环退出: {}", local);
        });

        info!("✅ TPROXY UDP 监听于: {}", local);
        Ok(handle)
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use std::io;
    use std::mem;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
    use std::os::unix::io::{AsRawFd, RawFd};

    use socket2::Socket;
    use tokio::io::Interest;
    use tokio::net::{TcpStream, UdpSocket};

    /// netfilter 的 `SO_ORIGINAL_DST` / `IP6T_SO_ORIGINAL_DST`
    const SO_ORIGINAL_DST: libc::c_int = 80;

    fn setsockopt_int(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                &value as *const _ as *const libc::c_void,
                mem::size_of_val(&value) as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn set_transparent(socket: &Socket, addr: SocketAddr) -> io::Result<()> {
        let fd = socket.as_raw_fd();
        match addr {
            SocketAddr::V4(_) => setsockopt_int(fd, libc::SOL_IP, libc::IP_TRANSPARENT, 1),
            SocketAddr::V6(_) => {
                setsockopt_int(fd, libc::SOL_IPV6, libc::IPV6_TRANSPARENT, 1)?;
                // 双栈 socket 也要能收 IPv4 的 TPROXY 流量
                setsockopt_int(fd, libc::SOL_IP, libc::IP_TRANSPARENT, 1)
            }
        }
    }

    pub fn set_recv_orig_dst(socket: &UdpSocket, addr: SocketAddr) -> io::Result<()> {
        let fd = socket.as_raw_fd();
        setsockopt_int(fd, libc::SOL_IP, libc::IP_RECVORIGDSTADDR, 1)?;
        if addr.is_ipv6() {
            setsockopt_int(fd, libc::SOL_IPV6, libc::IPV6_RECVORIGDSTADDR, 1)?;
        }
        Ok(())
    }

    pub fn original_dst(stream: &TcpStream) -> io::Result<SocketAddr> {
        let fd = stream.as_raw_fd();
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let level = match stream.local_addr()? {
            SocketAddr::V4(_) => libc::SOL_IP,
            SocketAddr::V6(_) => libc::SOL_IPV6,
        };

        let ret = unsafe {
            libc::getsockopt(
                fd,
                level,
                SO_ORIGINAL_DST,
                &mut storage as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        sockaddr_to_std(&storage)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "无法解析原始目标地址"))
    }

    /// 把 `sockaddr_storage` 转成标准库地址
    pub fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
        match storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
                Some(SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                    u16::from_be(sin.sin_port),
                )))
            }
            libc::AF_INET6 => {
                let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
                let addr = SocketAddrV6::new(
                    Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                );
                // IPv4 映射地址还原成 IPv4
                Some(match addr.ip().to_ipv4_mapped() {
                    Some(v4) => SocketAddr::new(v4.into(), addr.port()),
                    None => SocketAddr::V6(addr),
                })
            }
            _ => None,
        }
    }

    /// 从控制消息里找出 `IP_ORIGDSTADDR` / `IPV6_ORIGDSTADDR`
    fn orig_dst_from_cmsg(msg: &libc::msghdr) -> Option<SocketAddr> {
        let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
        while !cmsg.is_null() {
            let (level, ty) = unsafe { ((*cmsg).cmsg_level, (*cmsg).cmsg_type) };
            let is_v4 = level == libc::SOL_IP && ty == libc::IP_ORIGDSTADDR;
            let is_v6 = level == libc::SOL_IPV6 && ty == libc::IPV6_ORIGDSTADDR;
            if is_v4 || is_v6 {
                let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
                let size = if is_v4 {
                    mem::size_of::<libc::sockaddr_in>()
                } else {
                    mem::size_of::<libc::sockaddr_in6>()
                };
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        libc::CMSG_DATA(cmsg),
                        &mut storage as *mut _ as *mut u8,
                        size,
                    );
                }
                return sockaddr_to_std(&storage);
            }
            cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
        }
        None
    }

    fn recvmsg_once(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, SocketAddr)> {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut control = [0u8; 256];
        let mut source: libc::sockaddr_storage = unsafe { mem::zeroed() };

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = &mut source as *mut _ as *mut libc::c_void;
        msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.len() as _;

        let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let client = sockaddr_to_std(&source)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "无法解析来源地址"))?;
        let target = orig_dst_from_cmsg(&msg)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "报文没有携带原始目标地址"))?;
        Ok((n as usize, client, target))
    }

    pub async fn recv_with_orig_dst(
        socket: &UdpSocket,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddr, SocketAddr)> {
        let fd = socket.as_raw_fd();
        socket
            .async_io(Interest::READABLE, || recvmsg_once(fd, buf))
            .await
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use std::io;
    use std::net::SocketAddr;

    use socket2::Socket;
    use tokio::net::{TcpStream, UdpSocket};

    fn unsupported() -> io::Error {
        io::Error::new(io::ErrorKind::Unsupported, "透明代理只支持 Linux")
    }

    pub fn set_transparent(_socket: &Socket, _addr: SocketAddr) -> io::Result<()> {
        Err(unsupported())
    }

    pub fn set_recv_orig_dst(_socket: &UdpSocket, _addr: SocketAddr) -> io::Result<()> {
        Err(unsupported())
    }

    pub fn original_dst(_stream: &TcpStream) -> io::Result<SocketAddr> {
        Err(unsupported())
    }

    pub async fn recv_with_orig_dst(
        _socket: &UdpSocket,
        _buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddr, SocketAddr)> {
        Err(unsupported())
    }
}

pub(crate) fn set_transparent(socket: &Socket, addr: SocketAddr) -> io::Result<()> {
    sys::set_transparent(socket, addr)
}

fn set_recv_orig_dst(socket: &UdpSocket, addr: SocketAddr) -> io::Result<()> {
    sys::set_recv_orig_dst(socket, addr)
}

pub fn original_dst(stream: &TcpStream) -> io::Result<SocketAddr> {
    sys::original_dst(stream)
}

async fn recv_with_orig_dst(
    socket: &UdpSocket,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr, SocketAddr)> {
    sys::recv_with_orig_dst(socket, buf).await
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn test_sockaddr_v4() {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_port = 53u16.to_be();
        sin.sin_addr.s_addr = u32::from(std::net::Ipv4Addr::new(8, 8, 4, 4)).to_be();

        assert_eq!(
            sys::sockaddr_to_std(&storage),
            Some("8.8.4.4:53".parse().unwrap())
        );
    }

    #[test]
    fn test_sockaddr_v4_mapped() {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
        sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        sin6.sin6_port = 443u16.to_be();
        sin6.sin6_addr.s6_addr = "::ffff:1.2.3.4".parse::<std::net::Ipv6Addr>().unwrap().octets();

        assert_eq!(
            sys::sockaddr_to_std(&storage),
            Some("1.2.3.4:443".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_original_dst_requires_redirect() {
        // 没有经过 iptables REDIRECT 的连接取不到原始目标
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        assert!(original_dst(&server).is_err());
    }
}
