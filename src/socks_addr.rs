use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// 地址类型字节（与 SOCKS5 ATYP 一致）
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 UDP 头部的最大长度：RSV(2) + FRAG(1) + ATYP(1) + 域名(1+255) + 端口(2)
pub const MAX_UDP_HEADER_LEN: usize = 3 + 1 + 1 + 255 + 2;

#[derive(Debug, Error)]
pub enum AddrError {
    #[error("域名过长 ({0} 字节，最多 255)")]
    DomainTooLong(usize),

    #[error("不支持的地址类型: {0}")]
    UnknownType(u8),

    #[error("地址数据不完整")]
    Truncated,

    #[error("域名不是合法的 UTF-8")]
    InvalidDomain,

    #[error("不支持分片的 UDP 报文 (FRAG={0})")]
    Fragmented(u8),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// 目标地址：IP 或者 未解析的域名
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Address::Ip(addr) => addr.ip().to_string(),
            Address::Domain(host, _) => host.clone(),
        }
    }

    /// 序列化后的长度
    pub fn serialized_len(&self) -> usize {
        match self {
            Address::Ip(SocketAddr::V4(_)) => 1 + 4 + 2,
            Address::Ip(SocketAddr::V6(_)) => 1 + 16 + 2,
            Address::Domain(host, _) => 1 + 1 + host.len() + 2,
        }
    }

    /// 按 `类型 + 地址 + 大端端口` 写入缓冲区
    ///
    /// 域名超过 255 字节时返回错误，缓冲区保持不变
    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<(), AddrError> {
        match self {
            Address::Ip(SocketAddr::V4(addr)) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&addr.ip().octets());
                buf.extend_from_slice(&addr.port().to_be_bytes());
            }
            Address::Ip(SocketAddr::V6(addr)) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&addr.ip().octets());
                buf.extend_from_slice(&addr.port().to_be_bytes());
            }
            Address::Domain(host, port) => {
                if host.len() > 255 {
                    return Err(AddrError::DomainTooLong(host.len()));
                }
                buf.push(ATYP_DOMAIN);
                buf.push(host.len() as u8);
                buf.extend_from_slice(host.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, AddrError> {
        let mut buf = Vec::with_capacity(self.serialized_len());
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    /// 从字节切片解析地址，返回地址和消耗的字节数
    pub fn parse(buf: &[u8]) -> Result<(Address, usize), AddrError> {
        let atyp = *buf.first().ok_or(AddrError::Truncated)?;
        match atyp {
            ATYP_IPV4 => {
                if buf.len() < 7 {
                    return Err(AddrError::Truncated);
                }
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok((Address::Ip(SocketAddr::new(IpAddr::V4(ip), port)), 7))
            }
            ATYP_IPV6 => {
                if buf.len() < 19 {
                    return Err(AddrError::Truncated);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok((
                    Address::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)),
                    19,
                ))
            }
            ATYP_DOMAIN => {
                let len = *buf.get(1).ok_or(AddrError::Truncated)? as usize;
                if buf.len() < 2 + len + 2 {
                    return Err(AddrError::Truncated);
                }
                let host = std::str::from_utf8(&buf[2..2 + len])
                    .map_err(|_| AddrError::InvalidDomain)?
                    .to_string();
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                Ok((Address::Domain(host, port), 2 + len + 2))
            }
            other => Err(AddrError::UnknownType(other)),
        }
    }

    /// 从流中读取地址（已知地址类型字节）
    pub async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
        atyp: u8,
    ) -> Result<Address, AddrError> {
        match atyp {
            ATYP_IPV4 => {
                let mut data = [0u8; 6];
                reader.read_exact(&mut data).await?;
                let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
                let port = u16::from_be_bytes([data[4], data[5]]);
                Ok(Address::Ip(SocketAddr::new(IpAddr::V4(ip), port)))
            }
            ATYP_IPV6 => {
                let mut data = [0u8; 18];
                reader.read_exact(&mut data).await?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[..16]);
                let port = u16::from_be_bytes([data[16], data[17]]);
                Ok(Address::Ip(SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(octets)),
                    port,
                )))
            }
            ATYP_DOMAIN => {
                let len = reader.read_u8().await? as usize;
                let mut data = vec![0u8; len + 2];
                reader.read_exact(&mut data).await?;
                let port = u16::from_be_bytes([data[len], data[len + 1]]);
                data.truncate(len);
                let host = String::from_utf8(data).map_err(|_| AddrError::InvalidDomain)?;
                Ok(Address::Domain(host, port))
            }
            other => Err(AddrError::UnknownType(other)),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Ip(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// 解析 SOCKS5 UDP 报文：
/// +----+------+------+----------+----------+----------+
/// |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
/// +----+------+------+----------+----------+----------+
/// | 2  |  1   |  1   | Variable |    2     | Variable |
/// +----+------+------+----------+----------+----------+
///
/// 返回目标地址和负载在 `buf` 中的起始偏移
pub fn decode_udp_packet(buf: &[u8]) -> Result<(Address, usize), AddrError> {
    if buf.len() < 4 {
        return Err(AddrError::Truncated);
    }
    if buf[2] != 0 {
        return Err(AddrError::Fragmented(buf[2]));
    }
    let (addr, used) = Address::parse(&buf[3..])?;
    Ok((addr, 3 + used))
}

/// 构造 SOCKS5 UDP 报文（不分片）
pub fn encode_udp_packet(addr: &Address, payload: &[u8]) -> Result<Vec<u8>, AddrError> {
    let mut buf = Vec::with_capacity(3 + addr.serialized_len() + payload.len());
    buf.extend_from_slice(&[0, 0, 0]);
    addr.write_to(&mut buf)?;
    buf.extend_from_slice(payload);
    Ok(buf)
}
