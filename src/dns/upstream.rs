use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::error::{ConfigError, ResolveError};

/// 上游 DNS 服务器
#[async_trait]
pub trait Upstream: Send + Sync {
    /// 用于日志的名字
    fn name(&self) -> &str;

    async fn exchange(&self, query: &Message) -> Result<Message, ResolveError>;
}

/// 解析 `8.8.8.8`、`8.8.8.8:53`、`udp://1.1.1.1`、`tcp://1.1.1.1:53`
pub fn parse_upstream(addr: &str, query_timeout: Duration) -> Result<Arc<dyn Upstream>, ConfigError> {
    let addr = addr.trim();
    let (is_tcp, rest) = if let Some(rest) = addr.strip_prefix("tcp://") {
        (true, rest)
    } else {
        (false, addr.strip_prefix("udp://").unwrap_or(addr))
    };

    let socket_addr = match rest.parse::<SocketAddr>() {
        Ok(sa) => sa,
        Err(_) => {
            let ip = rest
                .trim_start_matches('[')
                .trim_end_matches(']')
                .parse::<IpAddr>()
                .map_err(|_| ConfigError::InvalidAddress(addr.to_string()))?;
            SocketAddr::new(ip, 53)
        }
    };

    Ok(if is_tcp {
        Arc::new(TcpUpstream::new(socket_addr, query_timeout))
    } else {
        Arc::new(UdpUpstream::new(socket_addr, query_timeout))
    })
}

/// UDP 上游
pub struct UdpUpstream {
    addr: SocketAddr,
    timeout: Duration,
    name: String,
}

impl UdpUpstream {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            addr,
            timeout,
            name: format!("udp://{}", addr),
        }
    }

    async fn exchange_inner(&self, query: &Message) -> Result<Message, ResolveError> {
        let bind = if self.addr.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(self.addr).await?;
        socket.send(&query.to_vec()?).await?;

        let mut buf = vec![0u8; 4096];
        loop {
            let n = socket.recv(&mut buf).await?;
            let response = match Message::from_vec(&buf[..n]) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("{} 返回了无法解析的报文: {}", self.name, e);
                    continue;
                }
            };
            // 丢弃 ID 不匹配的迟到响应
            if response.id() == query.id() {
                return Ok(response);
            }
        }
    }
}

#[async_trait]
impl Upstream for UdpUpstream {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exchange(&self, query: &Message) -> Result<Message, ResolveError> {
        match timeout(self.timeout, self.exchange_inner(query)).await {
            Ok(result) => result,
            Err(_) => Err(ResolveError::Timeout(self.name.clone())),
        }
    }
}

/// TCP 上游（2 字节长度前缀）
pub struct TcpUpstream {
    addr: SocketAddr,
    timeout: Duration,
    name: String,
}

impl TcpUpstream {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            addr,
            timeout,
            name: format!("tcp://{}", addr),
        }
    }

    async fn exchange_inner(&self, query: &Message) -> Result<Message, ResolveError> {
        let mut stream = TcpStream::connect(self.addr).await?;
        let data = query.to_vec()?;

        let mut request = Vec::with_capacity(2 + data.len());
        request.extend_from_slice(&(data.len() as u16).to_be_bytes());
        request.extend_from_slice(&data);
        stream.write_all(&request).await?;

        let len = stream.read_u16().await? as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;
        Ok(Message::from_vec(&buf)?)
    }
}

#[async_trait]
impl Upstream for TcpUpstream {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exchange(&self, query: &Message) -> Result<Message, ResolveError> {
        match timeout(self.timeout, self.exchange_inner(query)).await {
            Ok(result) => result,
            Err(_) => Err(ResolveError::Timeout(self.name.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};

    #[test]
    fn test_parse_upstream() {
        let t = Duration::from_secs(1);
        assert_eq!(parse_upstream("8.8.8.8", t).unwrap().name(), "udp://8.8.8.8:53");
        assert_eq!(parse_upstream("udp://1.1.1.1:5353", t).unwrap().name(), "udp://1.1.1.1:5353");
        assert_eq!(parse_upstream("tcp://1.1.1.1", t).unwrap().name(), "tcp://1.1.1.1:53");
        assert_eq!(parse_upstream("[2001:db8::1]", t).unwrap().name(), "udp://[2001:db8::1]:53");
        assert!(parse_upstream("dns.google", t).is_err());
    }

    #[tokio::test]
    async fn test_udp_exchange() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            let query = Message::from_vec(&buf[..n]).unwrap();
            let mut response = Message::new();
            response.set_id(query.id());
            response.set_message_type(MessageType::Response);
            response.add_query(query.queries()[0].clone());
            response.add_answer(Record::from_rdata(
                query.queries()[0].name().clone(),
                300,
                RData::A(A(Ipv4Addr::new(1, 2, 3, 4))),
            ));
            server.send_to(&response.to_vec().unwrap(), peer).await.unwrap();
        });

        let upstream = UdpUpstream::new(server_addr, Duration::from_secs(2));
        let mut query = Message::new();
        query.set_id(4242);
        query.add_query(Query::query(Name::from_ascii("example.com.").unwrap(), RecordType::A));

        let response = upstream.exchange(&query).await.unwrap();
        assert_eq!(response.id(), 4242);
        assert_eq!(response.answers().len(), 1);
    }

    #[tokio::test]
    async fn test_udp_timeout() {
        // 只绑定不回应
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream = UdpUpstream::new(silent.local_addr().unwrap(), Duration::from_millis(50));
        let mut query = Message::new();
        query.add_query(Query::query(Name::from_ascii("example.com.").unwrap(), RecordType::A));

        assert!(matches!(upstream.exchange(&query).await, Err(ResolveError::Timeout(_))));
    }
}
