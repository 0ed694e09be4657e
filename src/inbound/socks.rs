use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use log::{debug, info};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use super::auth::{Authenticator, SharedAuthenticator};
use super::{bind_tcp, bind_udp, spawn_accept_loop, Listener, ListenerSignal};
use crate::metadata::{InboundType, Metadata, Network};
use crate::socks_addr::{decode_udp_packet, encode_udp_packet, Address};
use crate::tunnel::{NatKey, PacketReply, PacketRequest, StreamRequest, Tunnel};

const SOCKS_VERSION: u8 = 5;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// 客户端请求的命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    UdpAssociate,
}

/// SOCKS5 服务端握手
///
/// `bind_addr` 是 UDP ASSOCIATE 时告诉客户端的 UDP 地址（与 TCP 监听同一个端口）。
pub async fn server_handshake<S>(
    stream: &mut S,
    auth: Option<&Authenticator>,
    bind_addr: SocketAddr,
) -> Result<(Address, Command)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ============ 步骤 1: 版本和认证方法 ============
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 1 to 255 |
    // +----+----------+----------+
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        bail!("不支持的 SOCKS 版本: {}", header[0]);
    }
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    // ============ 步骤 2: 可选的用户名/密码认证 ============
    match auth {
        Some(auth) => {
            if !methods.contains(&METHOD_USER_PASS) {
                stream.write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE]).await?;
                bail!("客户端不支持用户名/密码认证");
            }
            stream.write_all(&[SOCKS_VERSION, METHOD_USER_PASS]).await?;

            // +----+------+----------+------+----------+
            // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
            // +----+------+----------+------+----------+
            let mut head = [0u8; 2];
            stream.read_exact(&mut head).await?;
            let mut user = vec![0u8; head[1] as usize];
            stream.read_exact(&mut user).await?;
            let plen = stream.read_u8().await? as usize;
            let mut pass = vec![0u8; plen];
            stream.read_exact(&mut pass).await?;

            let user = String::from_utf8_lossy(&user);
            let pass = String::from_utf8_lossy(&pass);
            if !auth.verify(&user, &pass) {
                stream.write_all(&[1, 1]).await?;
                bail!("用户 `{}` 认证失败", user);
            }
            stream.write_all(&[1, 0]).await?;
        }
        None => {
            stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
        }
    }

    // ============ 步骤 3: 请求 ============
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        bail!("无效的 SOCKS5 请求: 版本错误");
    }
    let target = Address::read_from(stream, request[3]).await?;

    let (command, reply_addr) = match request[1] {
        CMD_CONNECT => (
            Command::Connect,
            Address::Ip(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)),
        ),
        CMD_UDP_ASSOCIATE => (Command::UdpAssociate, Address::Ip(bind_addr)),
        other => {
            let mut reply = vec![SOCKS_VERSION, REPLY_COMMAND_NOT_SUPPORTED, 0];
            Address::Ip(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)).write_to(&mut reply)?;
            stream.write_all(&reply).await?;
            bail!("不支持的 SOCKS5 命令: {}", other);
        }
    };

    let mut reply = vec![SOCKS_VERSION, REPLY_SUCCEEDED, 0];
    reply_addr.write_to(&mut reply)?;
    stream.write_all(&reply).await?;
    stream.flush().await?;

    Ok((target, command))
}

/// SOCKS5 TCP 入站
pub struct SocksListener;

impl SocksListener {
    pub fn bind(
        addr: SocketAddr,
        tunnel: Arc<Tunnel>,
        auth: SharedAuthenticator,
        max_connections: usize,
    ) -> Result<Listener> {
        let listener = bind_tcp(addr)?;
        let local = listener.local_addr()?;
        let (handle, signal) = Listener::new("SOCKS", local);

        let conn_signal = signal.clone();
        spawn_accept_loop("SOCKS", listener, signal, max_connections, move |stream, peer| {
            let tunnel = Arc::clone(&tunnel);
            let auth = Arc::clone(&auth);
            let signal = conn_signal.clone();
            async move { handle_socks(stream, peer, tunnel, auth, signal).await }
        });

        info!("✅ SOCKS 代理监听于: {}", local);
        Ok(handle)
    }
}

async fn handle_socks(
    mut stream: TcpStream,
    peer: SocketAddr,
    tunnel: Arc<Tunnel>,
    auth: SharedAuthenticator,
    mut signal: ListenerSignal,
) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let local = stream.local_addr()?;
    let authenticator = auth.load_full();

    let (target, command) = timeout(
        HANDSHAKE_TIMEOUT,
        server_handshake(&mut stream, authenticator.as_deref(), local),
    )
    .await
    .map_err(|_| anyhow!("SOCKS5 握手超时"))??;

    match command {
        Command::Connect => {
            let metadata = Metadata::new(Network::Tcp, InboundType::Socks, target, Some(peer));
            tunnel
                .process(StreamRequest {
                    metadata,
                    conn: Box::new(stream),
                })
                .await;
        }
        Command::UdpAssociate => {
            // UDP 关联在控制连接关闭前一直有效
            debug!("{} 请求 UDP ASSOCIATE", peer);
            let mut sink = tokio::io::sink();
            tokio::select! {
                _ = tokio::io::copy(&mut stream, &mut sink) => {}
                _ = signal.closed() => {}
            }
        }
    }
    Ok(())
}

/// SOCKS5 UDP 回包：加上 SOCKS5 UDP 头部后发回客户端
struct SocksReply {
    socket: Arc<UdpSocket>,
    client: SocketAddr,
}

#[async_trait]
impl PacketReply for SocksReply {
    async fn write_back(&self, payload: &[u8], from: SocketAddr) -> io::Result<()> {
        let packet = encode_udp_packet(&Address::Ip(from), payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.socket.send_to(&packet, self.client).await?;
        Ok(())
    }

    fn client_addr(&self) -> SocketAddr {
        self.client
    }
}

/// SOCKS5 UDP 入站
pub struct SocksUdpListener;

impl SocksUdpListener {
    pub fn bind(addr: SocketAddr, tunnel: Arc<Tunnel>) -> Result<Listener> {
        let socket = Arc::new(bind_udp(addr, false)?);
        let local = socket.local_addr()?;
        let (handle, mut signal) = Listener::new("SOCKS-UDP", local);

        tokio::spawn(async move {
            loop {
                // 任何 continue / break 时缓冲区都会随 drop 归还
                let mut buf = tunnel.buffer_pool().get();
                let received = tokio::select! {
                    _ = signal.closed() => break,
                    received = socket.recv_from(buf.full_mut()) => received,
                };
                let (n, client) = match received {
                    Ok(v) => v,
                    Err(e) => {
                        if signal.is_closed() {
                            break;
                        }
                        debug!("SOCKS UDP 接收失败: {}", e);
                        continue;
                    }
                };

                let (target, offset) = match decode_udp_packet(&buf.full_mut()[..n]) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("丢弃来自 {} 的 SOCKS UDP 报文: {}", client, e);
                        continue;
                    }
                };
                buf.set_range(offset, n);

                let metadata = Metadata::new(Network::Udp, InboundType::Socks, target, Some(client));
                tunnel.add_packet(PacketRequest {
                    metadata,
                    payload: buf,
                    reply: Arc::new(SocksReply {
                        socket: Arc::clone(&socket),
                        client,
                    }),
                    key: NatKey::Client(client),
                    shutdown: signal.receiver(),
                });
            }
            info!("SOCKS UDP 接收循环退出: {}", local);
        });

        info!("✅ SOCKS UDP 监听于: {}", local);
        Ok(handle)
    }
}
