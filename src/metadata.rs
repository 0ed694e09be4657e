use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::socks_addr::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => f.write_str("tcp"),
            Network::Udp => f.write_str("udp"),
        }
    }
}

/// 入站类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundType {
    Socks,
    Redir,
}

impl fmt::Display for InboundType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboundType::Socks => f.write_str("socks"),
            InboundType::Redir => f.write_str("redir"),
        }
    }
}

/// 一条流的元数据
///
/// 创建后只有两处会被修改：规则匹配时按需填入的 `dst_ip`，
/// 以及从 fake-ip / redir-host 记录中恢复出的 `host`。
#[derive(Debug, Clone)]
pub struct Metadata {
    pub network: Network,
    pub inbound: InboundType,
    pub src_addr: Option<SocketAddr>,
    /// 目标域名（统一为小写，不含末尾的点）
    pub host: Option<String>,
    pub dst_ip: Option<IpAddr>,
    pub dst_port: u16,
    /// 发起连接的进程名（入站能取到时才有）
    pub process: Option<String>,
}

impl Metadata {
    pub fn new(
        network: Network,
        inbound: InboundType,
        target: Address,
        src_addr: Option<SocketAddr>,
    ) -> Self {
        let (host, dst_ip, dst_port) = match target {
            Address::Ip(addr) => (None, Some(addr.ip()), addr.port()),
            Address::Domain(host, port) => match host.parse::<IpAddr>() {
                Ok(ip) => (None, Some(ip), port),
                Err(_) => (Some(normalize_host(&host)), None, port),
            },
        };

        Self {
            network,
            inbound,
            src_addr,
            host,
            dst_ip,
            dst_port,
            process: None,
        }
    }

    pub fn with_process(mut self, process: Option<String>) -> Self {
        self.process = process;
        self
    }

    #[inline]
    pub fn resolved(&self) -> bool {
        self.dst_ip.is_some()
    }

    pub fn src_ip(&self) -> Option<IpAddr> {
        self.src_addr.map(|addr| addr.ip())
    }

    pub fn src_port(&self) -> Option<u16> {
        self.src_addr.map(|addr| addr.port())
    }

    /// 交给出站的目标地址：有域名时优先用域名，让远端解析
    pub fn remote_address(&self) -> Address {
        match (&self.host, self.dst_ip) {
            (Some(host), _) => Address::Domain(host.clone(), self.dst_port),
            (None, Some(ip)) => Address::Ip(SocketAddr::new(ip, self.dst_port)),
            (None, None) => Address::Domain(String::new(), self.dst_port),
        }
    }

    /// 已解析的目标 socket 地址
    pub fn dst_socket_addr(&self) -> Option<SocketAddr> {
        self.dst_ip.map(|ip| SocketAddr::new(ip, self.dst_port))
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.host, self.dst_ip) {
            (Some(host), _) => write!(f, "{}:{}", host, self.dst_port),
            (None, Some(ip)) => write!(f, "{}", SocketAddr::new(ip, self.dst_port)),
            (None, None) => write!(f, "<unknown>:{}", self.dst_port),
        }
    }
}

pub fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}
