use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use log::{debug, error, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::watch;

use super::Resolver;

/// DNS 前端（UDP）
///
/// 地址不变时重载只替换解析器，地址变化时才重新监听。
pub struct DnsServer {
    address: SocketAddr,
    resolver: Arc<ArcSwap<Resolver>>,
    shutdown_tx: watch::Sender<bool>,
}

impl DnsServer {
    pub async fn bind(address: SocketAddr, resolver: Arc<Resolver>) -> Result<Self> {
        let socket = UdpSocket::bind(address)
            .await
            .with_context(|| format!("DNS 服务监听 {} 失败", address))?;
        let local = socket.local_addr()?;
        let resolver = Arc::new(ArcSwap::new(resolver));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(serve(Arc::new(socket), Arc::clone(&resolver), shutdown_rx));
        info!("✅ DNS 服务启动在 {}", local);

        Ok(Self {
            address: local,
            resolver,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// 替换解析器，正在处理的请求继续使用旧的
    pub fn set_resolver(&self, resolver: Arc<Resolver>) {
        self.resolver.store(resolver);
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for DnsServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve(
    socket: Arc<UdpSocket>,
    resolver: Arc<ArcSwap<Resolver>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("🛑 DNS 服务 {:?} 已关闭", socket.local_addr().ok());
                return;
            }
            result = socket.recv_from(&mut buf) => {
                let (n, peer) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        error!("DNS 服务接收失败: {}", e);
                        continue;
                    }
                };
                let request = match Message::from_vec(&buf[..n]) {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!("丢弃来自 {} 的无效 DNS 报文: {}", peer, e);
                        continue;
                    }
                };

                let socket = Arc::clone(&socket);
                let resolver = resolver.load_full();
                tokio::spawn(async move {
                    let response = handle(&resolver, &request).await;
                    match response.to_vec() {
                        Ok(data) => {
                            if let Err(e) = socket.send_to(&data, peer).await {
                                debug!("DNS 应答发送到 {} 失败: {}", peer, e);
                            }
                        }
                        Err(e) => warn!("DNS 应答编码失败: {}", e),
                    }
                });
            }
        }
    }
}

async fn handle(resolver: &Resolver, request: &Message) -> Message {
    if request.queries().is_empty() {
        return failed(request);
    }
    match resolver.exchange(request).await {
        Ok(response) => response,
        Err(e) => {
            debug!("DNS 请求处理失败: {}", e);
            failed(request)
        }
    }
}

/// SERVFAIL 应答
fn failed(request: &Message) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.set_response_code(ResponseCode::ServFail);
    for query in request.queries() {
        response.add_query(query.clone());
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{EnhancedMode, ResolverConfig, Upstream};
    use crate::error::ResolveError;
    use crate::fakeip::FakeIpPool;
    use async_trait::async_trait;
    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RData, RecordType};
    use std::time::Duration;

    struct Unreachable;

    #[async_trait]
    impl Upstream for Unreachable {
        fn name(&self) -> &str {
            "unreachable"
        }

        async fn exchange(&self, _query: &Message) -> Result<Message, ResolveError> {
            Err(ResolveError::Timeout("unreachable".to_string()))
        }
    }

    fn fake_ip_resolver() -> Arc<Resolver> {
        let pool = FakeIpPool::new("198.18.0.0/16".parse().unwrap(), Duration::from_secs(60)).unwrap();
        Arc::new(
            Resolver::new(ResolverConfig {
                main: vec![Arc::new(Unreachable)],
                enhanced_mode: EnhancedMode::FakeIp,
                fake_pool: Some(Arc::new(pool)),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    async fn ask(server: SocketAddr, request: &Message) -> Message {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&request.to_vec().unwrap(), server).await.unwrap();
        let mut buf = [0u8; 1024];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        Message::from_vec(&buf[..n]).unwrap()
    }

    #[tokio::test]
    async fn test_fake_ip_answer() {
        let server = DnsServer::bind("127.0.0.1:0".parse().unwrap(), fake_ip_resolver())
            .await
            .unwrap();

        let mut request = Message::new();
        request.set_id(7);
        request.add_query(Query::query(Name::from_ascii("example.com.").unwrap(), RecordType::A));

        let response = ask(server.local_addr(), &request).await;
        assert_eq!(response.id(), 7);
        assert_eq!(response.response_code(), ResponseCode::NoError);
        match response.answers()[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0.octets(), [198, 18, 0, 2]),
            other => panic!("unexpected answer: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_question_servfail() {
        let server = DnsServer::bind("127.0.0.1:0".parse().unwrap(), fake_ip_resolver())
            .await
            .unwrap();

        let mut request = Message::new();
        request.set_id(9);
        let response = ask(server.local_addr(), &request).await;
        assert_eq!(response.id(), 9);
        assert_eq!(response.response_code(), ResponseCode::ServFail);
    }

    #[tokio::test]
    async fn test_upstream_failure_servfail() {
        let server = DnsServer::bind("127.0.0.1:0".parse().unwrap(), fake_ip_resolver())
            .await
            .unwrap();

        // 非 A/AAAA 直接转发给上游，上游不可用时返回 SERVFAIL
        let mut request = Message::new();
        request.add_query(Query::query(Name::from_ascii("example.com.").unwrap(), RecordType::TXT));
        let response = ask(server.local_addr(), &request).await;
        assert_eq!(response.response_code(), ResponseCode::ServFail);
    }
}
