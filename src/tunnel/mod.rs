//! 调度核心：分类 → 匹配规则 → 选择出站 → 转发

pub mod nat;
mod relay;

pub use nat::{NatKey, NatSession, NatTable};
pub use relay::relay;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use async_trait::async_trait;
use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::time::timeout;

use crate::adapter::{Adapter, BoxedStream, DialContext, Direct};
use crate::dns::{EnhancedMode, Resolver};
use crate::error::{ConfigError, ResolveError, TunnelError};
use crate::metadata::{InboundType, Metadata};
use crate::metrics::{ConnectionGuard, Metrics, SessionGuard};
use crate::pool::{BufferPool, PooledBuf, UDP_BUFFER_SIZE};
use crate::proxy::{Proxy, DIRECT, GLOBAL};
use crate::rules::RuleSet;

pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const BUFFER_POOL_CACHED: usize = 256;

/// 运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelMode {
    #[default]
    Rule,
    Global,
    Direct,
}

impl TunnelMode {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => TunnelMode::Global,
            2 => TunnelMode::Direct,
            _ => TunnelMode::Rule,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            TunnelMode::Rule => 0,
            TunnelMode::Global => 1,
            TunnelMode::Direct => 2,
        }
    }
}

impl FromStr for TunnelMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "rule" => Ok(TunnelMode::Rule),
            "global" => Ok(TunnelMode::Global),
            "direct" => Ok(TunnelMode::Direct),
            _ => Err(ConfigError::InvalidGroup {
                group: "mode".to_string(),
                reason: format!("未知的运行模式 `{}`", s),
            }),
        }
    }
}

impl fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelMode::Rule => "rule",
            TunnelMode::Global => "global",
            TunnelMode::Direct => "direct",
        };
        f.write_str(name)
    }
}

/// 入站交给调度器的 TCP 连接
pub struct StreamRequest {
    pub metadata: Metadata,
    pub conn: BoxedStream,
}

/// 入站负责把回包写回客户端
#[async_trait]
pub trait PacketReply: Send + Sync {
    /// `from` 是客户端应该看到的源地址
    async fn write_back(&self, payload: &[u8], from: SocketAddr) -> io::Result<()>;

    fn client_addr(&self) -> SocketAddr;
}

/// 入站交给调度器的 UDP 报文
pub struct PacketRequest {
    pub metadata: Metadata,
    pub payload: PooledBuf,
    pub reply: Arc<dyn PacketReply>,
    pub key: NatKey,
    /// 入站关闭时结束会话
    pub shutdown: watch::Receiver<bool>,
}

/// 规则和代理的快照，重载时整体替换
pub struct Snapshot {
    pub rules: Arc<RuleSet>,
    pub proxies: Arc<HashMap<String, Proxy>>,
    /// global 模式下没有 GLOBAL 时使用的代理
    pub global_fallback: String,
}

impl Snapshot {
    /// 规则引用的代理必须存在
    pub fn new(rules: RuleSet, proxies: HashMap<String, Proxy>) -> Result<Self, ConfigError> {
        for rule in rules.iter() {
            if !proxies.contains_key(rule.target()) {
                return Err(ConfigError::UnknownProxy(rule.target().to_string()));
            }
        }
        Ok(Self {
            rules: Arc::new(rules),
            proxies: Arc::new(proxies),
            global_fallback: DIRECT.to_string(),
        })
    }

    /// 配置中声明的第一个代理
    pub fn with_global_fallback(mut self, name: impl Into<String>) -> Result<Self, ConfigError> {
        let name = name.into();
        if !self.proxies.contains_key(&name) {
            return Err(ConfigError::UnknownProxy(name));
        }
        self.global_fallback = name;
        Ok(self)
    }
}

/// 加载配置之前使用：所有流量走 DIRECT
impl Default for Snapshot {
    fn default() -> Self {
        let mut proxies = HashMap::new();
        proxies.insert(
            DIRECT.to_string(),
            Proxy::single(Adapter::Direct(Direct::new(DIRECT))),
        );
        Self {
            rules: Arc::new(RuleSet::final_only(DIRECT)),
            proxies: Arc::new(proxies),
            global_fallback: DIRECT.to_string(),
        }
    }
}

/// 路由结果
pub struct Route {
    pub adapter: Arc<Adapter>,
    pub proxy: String,
    pub rule: String,
}

pub struct Tunnel {
    snapshot: ArcSwap<Snapshot>,
    resolver: ArcSwapOption<Resolver>,
    mode: AtomicU8,
    ignore_resolve_fail: AtomicBool,
    udp_timeout_ms: AtomicU64,
    connect_timeout: Duration,
    nat: NatTable,
    metrics: Metrics,
    pool: Arc<BufferPool>,
}

impl Tunnel {
    pub fn new(snapshot: Snapshot, metrics: Metrics) -> Arc<Self> {
        Arc::new(Self {
            snapshot: ArcSwap::from_pointee(snapshot),
            resolver: ArcSwapOption::empty(),
            mode: AtomicU8::new(TunnelMode::Rule.as_u8()),
            ignore_resolve_fail: AtomicBool::new(false),
            udp_timeout_ms: AtomicU64::new(DEFAULT_UDP_TIMEOUT.as_millis() as u64),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            nat: NatTable::new(),
            metrics,
            pool: BufferPool::new(UDP_BUFFER_SIZE, BUFFER_POOL_CACHED),
        })
    }

    /// 替换规则和代理，进行中的连接继续使用已选中的出站
    pub fn update_snapshot(&self, snapshot: Snapshot) {
        info!(
            "✅ 规则与代理已更新: {} 条规则, {} 个代理",
            snapshot.rules.len(),
            snapshot.proxies.len()
        );
        self.snapshot.store(Arc::new(snapshot));
    }

    pub fn rules(&self) -> Arc<RuleSet> {
        Arc::clone(&self.snapshot.load().rules)
    }

    pub fn proxies(&self) -> Arc<HashMap<String, Proxy>> {
        Arc::clone(&self.snapshot.load().proxies)
    }

    pub fn set_resolver(&self, resolver: Option<Arc<Resolver>>) {
        self.resolver.store(resolver);
    }

    pub fn resolver(&self) -> Option<Arc<Resolver>> {
        self.resolver.load_full()
    }

    pub fn mode(&self) -> TunnelMode {
        TunnelMode::from_u8(self.mode.load(Ordering::Relaxed))
    }

    pub fn set_mode(&self, mode: TunnelMode) {
        self.mode.store(mode.as_u8(), Ordering::Relaxed);
        info!("运行模式: {}", mode);
    }

    pub fn set_ignore_resolve_fail(&self, ignore: bool) {
        self.ignore_resolve_fail.store(ignore, Ordering::Relaxed);
    }

    pub fn udp_timeout(&self) -> Duration {
        Duration::from_millis(self.udp_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_udp_timeout(&self, timeout: Duration) {
        self.udp_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn nat(&self) -> &NatTable {
        &self.nat
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn dial_context(&self) -> DialContext {
        DialContext::new(self.resolver(), self.connect_timeout)
    }

    /// 接收一条 TCP 连接，每条连接一个任务
    pub fn add(self: &Arc<Self>, request: StreamRequest) {
        let tunnel = Arc::clone(self);
        tokio::spawn(async move {
            // 捕获 panic 以防止任务崩溃
            let result = AssertUnwindSafe(tunnel.process(request))
                .catch_unwind()
                .await;

            if let Err(panic_err) = result {
                error!("❌ 连接处理任务 panic: {:?}", panic_err);
                tunnel.metrics.inc_failed_connections();
            }
        });
    }

    /// 在当前任务中处理一条 TCP 连接，直到转发结束
    pub async fn process(&self, request: StreamRequest) {
        let _guard = ConnectionGuard::new(self.metrics.clone());
        if let Err(e) = self.handle_tcp(request).await {
            self.record_failure(&e);
            debug!("处理连接时出错: {}", e);
        }
    }

    /// 接收一个 UDP 报文
    pub fn add_packet(self: &Arc<Self>, request: PacketRequest) {
        let tunnel = Arc::clone(self);
        tokio::spawn(async move {
            let result = AssertUnwindSafe(Arc::clone(&tunnel).handle_packet(request))
                .catch_unwind()
                .await;

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tunnel.record_failure(&e);
                    debug!("处理 UDP 报文时出错: {}", e);
                }
                Err(panic_err) => {
                    error!("❌ UDP 处理任务 panic: {:?}", panic_err);
                }
            }
        });
    }

    fn record_failure(&self, e: &TunnelError) {
        match e {
            TunnelError::Relay(_) => {}
            TunnelError::NoRuleMatched(_) => {
                self.metrics.inc_rule_misses();
                self.metrics.inc_failed_connections();
            }
            TunnelError::Resolve(_) => {
                self.metrics.inc_resolve_failures();
                self.metrics.inc_failed_connections();
            }
            _ => self.metrics.inc_failed_connections(),
        }
    }

    async fn handle_tcp(&self, request: StreamRequest) -> Result<(), TunnelError> {
        let StreamRequest { mut metadata, conn } = request;
        self.pre_handle(&mut metadata)?;

        let route = self.route(&mut metadata).await?;
        info!(
            "{} --> {} 匹配 {} 使用 {}",
            metadata.src_addr.map(|a| a.to_string()).unwrap_or_default(),
            metadata.remote_address(),
            route.rule,
            route.proxy
        );
        self.metrics.inc_adapter_requests(route.adapter.kind());

        // 拨号失败时 conn 随之关闭
        let outbound = route.adapter.dial(&self.dial_context(), &metadata).await?;
        relay(conn, outbound, self.metrics.clone()).await?;
        Ok(())
    }

    async fn handle_packet(self: Arc<Self>, request: PacketRequest) -> Result<(), TunnelError> {
        let PacketRequest {
            mut metadata,
            payload,
            reply,
            key,
            shutdown,
        } = request;

        let original = metadata.dst_socket_addr();
        let fake = self.pre_handle(&mut metadata)?;
        let target = metadata.remote_address();

        let (session, created) = self
            .nat
            .get_or_create(&key, || {
                self.create_session(metadata.clone(), original, fake)
            })
            .await?;

        if created {
            let tunnel = Arc::clone(&self);
            let session = Arc::clone(&session);
            tokio::spawn(tunnel.reply_loop(key, session, reply, shutdown));
        }

        let n = session.send(&payload, &target).await?;
        self.metrics.add_bytes_up(n as u64);
        Ok(())
    }

    async fn create_session(
        &self,
        mut metadata: Metadata,
        original: Option<SocketAddr>,
        fake: bool,
    ) -> Result<Arc<NatSession>, TunnelError> {
        let route = self.route(&mut metadata).await?;
        info!(
            "[UDP] {} --> {} 匹配 {} 使用 {}",
            metadata.src_addr.map(|a| a.to_string()).unwrap_or_default(),
            metadata.remote_address(),
            route.rule,
            route.proxy
        );
        self.metrics.inc_adapter_requests(route.adapter.kind());

        let conn = route
            .adapter
            .dial_packet(&self.dial_context(), &metadata)
            .await?;

        // fake-ip 会话期间钉住地址，避免被回收给别的域名
        let lease = match (fake, original, self.resolver()) {
            (true, Some(addr), Some(resolver)) => resolver
                .fake_pool()
                .and_then(|pool| pool.pin(addr.ip())),
            _ => None,
        };
        let spoof_from = if fake || metadata.inbound == InboundType::Redir {
            original
        } else {
            None
        };

        Ok(Arc::new(NatSession::new(
            Arc::from(conn),
            route.adapter.name(),
            spoof_from,
            lease,
            SessionGuard::new(self.metrics.clone()),
        )))
    }

    /// 出站回包写回客户端，空闲超时或入站关闭时结束
    async fn reply_loop(
        self: Arc<Self>,
        key: NatKey,
        session: Arc<NatSession>,
        reply: Arc<dyn PacketReply>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut buf = self.pool.get();
        let idle = self.udp_timeout();
        debug!("UDP 会话 {} 建立 ({})", key, session.adapter);

        loop {
            let wait = idle.saturating_sub(session.idle_for());
            if wait.is_zero() {
                debug!("UDP 会话 {} 空闲超时", key);
                break;
            }

            let received = tokio::select! {
                result = timeout(wait, session.conn.recv_from(buf.full_mut())) => result,
                _ = shutdown.changed() => {
                    debug!("UDP 会话 {} 随入站关闭", key);
                    break;
                }
            };

            match received {
                Err(_) => continue,
                Ok(Ok((n, from))) => {
                    session.touch();
                    let from = session.reply_from(from);
                    if let Err(e) = reply.write_back(&buf.full_mut()[..n], from).await {
                        debug!("UDP 回包写回 {} 失败: {}", reply.client_addr(), e);
                        break;
                    }
                    self.metrics.add_bytes_down(n as u64);
                }
                Ok(Err(e)) => {
                    debug!("UDP 会话 {} 出站读取失败: {}", key, e);
                    break;
                }
            }
        }

        session.close();
        self.nat.remove_session(&key, &session);
        debug!("UDP 会话 {} 已移除", key);
    }

    /// 从 fake-ip / redir-host 记录中恢复域名，返回目标是否为 fake-ip
    fn pre_handle(&self, metadata: &mut Metadata) -> Result<bool, TunnelError> {
        let (Some(resolver), Some(ip)) = (self.resolver(), metadata.dst_ip) else {
            return Ok(false);
        };
        if metadata.host.is_some() {
            return Ok(false);
        }

        if resolver.is_fake_ip(ip) {
            return match resolver.reverse_host(ip) {
                Some(host) => {
                    debug!("fake-ip {} -> {}", ip, host);
                    metadata.host = Some(host);
                    metadata.dst_ip = None;
                    Ok(true)
                }
                None => Err(TunnelError::Resolve(ResolveError::NoAnswer(format!(
                    "fake-ip {} 没有对应的域名",
                    ip
                )))),
            };
        }

        if resolver.enhanced_mode() == EnhancedMode::RedirHost {
            if let Some(host) = resolver.reverse_host(ip) {
                debug!("redir-host {} -> {}", ip, host);
                metadata.host = Some(host);
            }
        }
        Ok(false)
    }

    /// 选择出站；rule 模式下遇到第一条需要 IP 的规则时才解析域名
    pub async fn route(&self, metadata: &mut Metadata) -> Result<Route, TunnelError> {
        let snapshot = self.snapshot.load_full();
        let proxies = &snapshot.proxies;

        let fixed = match self.mode() {
            TunnelMode::Direct => Some(proxies.get(DIRECT).ok_or_else(|| {
                TunnelError::ProxyNotFound(DIRECT.to_string())
            })?),
            TunnelMode::Global => Some(
                proxies
                    .get(GLOBAL)
                    .or_else(|| proxies.get(&snapshot.global_fallback))
                    .ok_or_else(|| TunnelError::ProxyNotFound(GLOBAL.to_string()))?,
            ),
            TunnelMode::Rule => None,
        };
        if let Some(proxy) = fixed {
            return Ok(Route {
                adapter: proxy.select(metadata),
                proxy: proxy.name().to_string(),
                rule: self.mode().to_string(),
            });
        }

        let mut resolved = metadata.dst_ip.is_some();
        let mut skip_ip_rules = false;

        for rule in snapshot.rules.iter() {
            if rule.should_resolve_ip() && !resolved {
                resolved = true;
                if let Some(host) = metadata.host.clone() {
                    match self.resolve_host(&host).await {
                        Ok(ip) => {
                            debug!("[解析] {} --> {}", host, ip);
                            metadata.dst_ip = Some(ip);
                        }
                        Err(e) if self.ignore_resolve_fail.load(Ordering::Relaxed) => {
                            debug!("[解析] {} 失败，跳过 IP 规则: {}", host, e);
                            self.metrics.inc_resolve_failures();
                            skip_ip_rules = true;
                        }
                        Err(e) => {
                            warn!("[解析] {} 失败: {}", host, e);
                            return Err(e.into());
                        }
                    }
                }
            }
            if skip_ip_rules && rule.should_resolve_ip() {
                continue;
            }

            if rule.matches(metadata) {
                let proxy = proxies
                    .get(rule.target())
                    .ok_or_else(|| TunnelError::ProxyNotFound(rule.target().to_string()))?;
                return Ok(Route {
                    adapter: proxy.select(metadata),
                    proxy: proxy.name().to_string(),
                    rule: rule.to_string(),
                });
            }
        }

        Err(TunnelError::NoRuleMatched(metadata.to_string()))
    }

    async fn resolve_host(&self, host: &str) -> Result<IpAddr, ResolveError> {
        if let Some(resolver) = self.resolver() {
            return resolver.resolve_ip(host, false).await;
        }
        let mut addrs = tokio::net::lookup_host((host, 0)).await?;
        addrs
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| ResolveError::NoAnswer(host.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Direct, Reject};
    use crate::dns::{ResolverConfig, Upstream};
    use crate::fakeip::FakeIpPool;
    use crate::geoip::{CidrGeoIp, GeoIpDb};
    use crate::metadata::Network;
    use crate::socks_addr::Address;
    use hickory_proto::op::Message;

    struct DeadUpstream;

    #[async_trait]
    impl Upstream for DeadUpstream {
        fn name(&self) -> &str {
            "dead"
        }

        async fn exchange(&self, _query: &Message) -> Result<Message, ResolveError> {
            Err(ResolveError::Timeout("dead".to_string()))
        }
    }

    fn proxies() -> HashMap<String, Proxy> {
        let mut map = HashMap::new();
        map.insert(DIRECT.to_string(), Proxy::single(Adapter::Direct(Direct::new(DIRECT))));
        map.insert("REJECT".to_string(), Proxy::single(Adapter::Reject(Reject::new("REJECT"))));
        map.insert("proxyA".to_string(), Proxy::single(Adapter::Direct(Direct::new("proxyA"))));
        map
    }

    fn tunnel(rules: &[&str]) -> Arc<Tunnel> {
        let geoip: Arc<dyn GeoIpDb> = Arc::new(CidrGeoIp::new(&HashMap::new()).unwrap());
        let rules = RuleSet::parse(rules, &geoip).unwrap();
        Tunnel::new(Snapshot::new(rules, proxies()).unwrap(), Metrics::new())
    }

    fn meta(target: Address) -> Metadata {
        Metadata::new(Network::Tcp, InboundType::Socks, target, None)
    }

    fn fake_resolver() -> Arc<Resolver> {
        let pool = FakeIpPool::new("198.18.0.0/16".parse().unwrap(), Duration::from_secs(60)).unwrap();
        Arc::new(
            Resolver::new(ResolverConfig {
                main: vec![Arc::new(DeadUpstream)],
                enhanced_mode: EnhancedMode::FakeIp,
                fake_pool: Some(Arc::new(pool)),
                timeout: Duration::from_millis(50),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    #[test]
    fn test_snapshot_rejects_unknown_target() {
        let geoip: Arc<dyn GeoIpDb> = Arc::new(CidrGeoIp::new(&HashMap::new()).unwrap());
        let rules = RuleSet::parse(&["DOMAIN,a.com,missing", "MATCH,DIRECT"], &geoip).unwrap();
        assert!(matches!(
            Snapshot::new(rules, proxies()),
            Err(ConfigError::UnknownProxy(_))
        ));
    }

    #[tokio::test]
    async fn test_route_by_suffix() {
        let t = tunnel(&["DOMAIN-SUFFIX,example.com,proxyA", "MATCH,DIRECT"]);

        let mut m = meta(Address::Domain("www.example.com".to_string(), 443));
        assert_eq!(t.route(&mut m).await.unwrap().proxy, "proxyA");

        let mut m = meta(Address::Domain("other.com".to_string(), 443));
        assert_eq!(t.route(&mut m).await.unwrap().proxy, DIRECT);
        // 没有 IP 规则时不会解析
        assert!(m.dst_ip.is_none());
    }

    #[tokio::test]
    async fn test_modes() {
        let t = tunnel(&["MATCH,REJECT"]);
        let mut m = meta(Address::Domain("a.com".to_string(), 80));

        t.set_mode(TunnelMode::Direct);
        assert_eq!(t.route(&mut m).await.unwrap().proxy, DIRECT);

        // 没有 GLOBAL 时使用第一个代理
        t.set_mode(TunnelMode::Global);
        assert_eq!(t.route(&mut m).await.unwrap().proxy, DIRECT);

        t.set_mode(TunnelMode::Rule);
        assert_eq!(t.route(&mut m).await.unwrap().proxy, "REJECT");
        assert_eq!("GLOBAL".parse::<TunnelMode>().unwrap(), TunnelMode::Global);
    }

    #[tokio::test]
    async fn test_resolve_failure_drops_or_skips() {
        let t = tunnel(&["IP-CIDR,10.0.0.0/8,proxyA", "MATCH,DIRECT"]);
        t.set_resolver(Some(fake_resolver()));

        let mut m = meta(Address::Domain("unresolvable.test".to_string(), 80));
        assert!(matches!(t.route(&mut m).await, Err(TunnelError::Resolve(_))));

        t.set_ignore_resolve_fail(true);
        let mut m = meta(Address::Domain("unresolvable.test".to_string(), 80));
        assert_eq!(t.route(&mut m).await.unwrap().proxy, DIRECT);
    }

    #[tokio::test]
    async fn test_pre_handle_fake_ip() {
        let t = tunnel(&["MATCH,DIRECT"]);
        let resolver = fake_resolver();
        t.set_resolver(Some(Arc::clone(&resolver)));

        let ip = resolver.resolve("test.com", false).await.unwrap();
        let mut m = meta(Address::Ip(SocketAddr::new(ip, 443)));
        assert!(t.pre_handle(&mut m).unwrap());
        assert_eq!(m.host.as_deref(), Some("test.com"));
        assert!(m.dst_ip.is_none());

        // 网段内但没有映射
        let mut m = meta(Address::Ip("198.18.200.1:443".parse().unwrap()));
        assert!(t.pre_handle(&mut m).is_err());

        // 普通地址不受影响
        let mut m = meta(Address::Ip("1.1.1.1:443".parse().unwrap()));
        assert!(!t.pre_handle(&mut m).unwrap());
        assert!(m.host.is_none());
    }

    struct DiscardReply {
        client: SocketAddr,
    }

    #[async_trait]
    impl PacketReply for DiscardReply {
        async fn write_back(&self, _payload: &[u8], _from: SocketAddr) -> io::Result<()> {
            Ok(())
        }

        fn client_addr(&self) -> SocketAddr {
            self.client
        }
    }

    fn packet(t: &Arc<Tunnel>, target: SocketAddr, shutdown: watch::Receiver<bool>) -> PacketRequest {
        let client: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let mut payload = t.buffer_pool().get();
        payload.full_mut()[..4].copy_from_slice(b"ping");
        payload.set_range(0, 4);
        PacketRequest {
            metadata: Metadata::new(Network::Udp, InboundType::Socks, Address::Ip(target), Some(client)),
            payload,
            reply: Arc::new(DiscardReply { client }),
            key: NatKey::Client(client),
            shutdown,
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("条件始终不满足");
    }

    #[tokio::test(start_paused = true)]
    async fn test_udp_session_idle_timeout() {
        let sink = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sink_addr = sink.local_addr().unwrap();

        // fake-ip 的域名经 hosts 指向本地的接收端
        let mut hosts = crate::trie::AddressTrie::new();
        hosts.insert("udp.test", sink_addr.ip()).unwrap();
        let pool = Arc::new(
            FakeIpPool::new("198.18.0.0/16".parse().unwrap(), Duration::from_secs(60)).unwrap(),
        );
        let resolver = Resolver::new(ResolverConfig {
            main: vec![Arc::new(DeadUpstream)],
            enhanced_mode: EnhancedMode::FakeIp,
            fake_pool: Some(Arc::clone(&pool)),
            hosts,
            ..Default::default()
        })
        .unwrap();

        let t = tunnel(&["MATCH,DIRECT"]);
        t.set_resolver(Some(Arc::new(resolver)));
        t.set_udp_timeout(Duration::from_secs(120));
        let (_close, shutdown) = watch::channel(false);

        let fake = IpAddr::V4(pool.lookup("udp.test").unwrap());
        t.add_packet(packet(&t, SocketAddr::new(fake, sink_addr.port()), shutdown.clone()));

        let mut buf = [0u8; 16];
        let (n, _) = sink.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(t.nat().len(), 1);

        // 映射已过期，但会话还钉着这个地址
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(t.nat().len(), 1);
        assert_eq!(pool.cleanup(), 0);
        assert!(pool.exist(fake));

        // 空闲超时后会话移除，租约随之释放
        tokio::time::sleep(Duration::from_secs(40)).await;
        wait_for(|| t.nat().is_empty()).await;
        wait_for(|| t.metrics().get_active_udp_sessions() == 0).await;
        assert_eq!(pool.cleanup(), 1);
        assert!(!pool.exist(fake));

        // 之后的报文重新建会话
        let fake = IpAddr::V4(pool.lookup("udp.test").unwrap());
        t.add_packet(packet(&t, SocketAddr::new(fake, sink_addr.port()), shutdown));
        let (n, _) = sink.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(t.nat().len(), 1);
        assert_eq!(t.metrics().snapshot().udp_sessions_total, 2);
    }

    #[tokio::test]
    async fn test_update_snapshot_keeps_mode() {
        let t = tunnel(&["MATCH,DIRECT"]);
        let geoip: Arc<dyn GeoIpDb> = Arc::new(CidrGeoIp::new(&HashMap::new()).unwrap());
        let rules = RuleSet::parse(&["MATCH,proxyA"], &geoip).unwrap();
        let snapshot = Snapshot::new(rules, proxies())
            .unwrap()
            .with_global_fallback("proxyA")
            .unwrap();
        t.update_snapshot(snapshot);

        let mut m = meta(Address::Domain("a.com".to_string(), 80));
        assert_eq!(t.route(&mut m).await.unwrap().proxy, "proxyA");
        assert_eq!(t.mode(), TunnelMode::Rule);

        t.set_mode(TunnelMode::Global);
        assert_eq!(t.route(&mut m).await.unwrap().proxy, "proxyA");
    }
}
