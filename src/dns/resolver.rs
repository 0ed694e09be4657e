use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::select_ok;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use log::{debug, info, warn};
use lru::LruCache;
use tokio::time::{timeout, Instant};

use super::upstream::Upstream;
use super::EnhancedMode;
use crate::error::{ConfigError, ResolveError};
use crate::fakeip::FakeIpPool;
use crate::geoip::GeoIpDb;
use crate::ip_matcher::IpMatcher;
use crate::trie::AddressTrie;

/// 真实解析结果的默认 TTL
const DEFAULT_TTL: u32 = 600;
/// Fake-IP 应答的 TTL，让客户端尽快回来重新查询
const FAKE_IP_TTL: u32 = 1;

const DEFAULT_CACHE_SIZE: usize = 4096;

/// fallback 过滤器：判断主 DNS 的结果是否可疑
pub struct FallbackFilter {
    geoip: bool,
    geoip_code: String,
    ipcidr: IpMatcher,
    db: Option<Arc<dyn GeoIpDb>>,
}

impl Default for FallbackFilter {
    fn default() -> Self {
        Self {
            geoip: false,
            geoip_code: "CN".to_string(),
            ipcidr: IpMatcher::default(),
            db: None,
        }
    }
}

impl FallbackFilter {
    pub fn new(
        geoip: bool,
        geoip_code: &str,
        ipcidr: IpMatcher,
        db: Option<Arc<dyn GeoIpDb>>,
    ) -> Self {
        Self {
            geoip,
            geoip_code: geoip_code.to_ascii_uppercase(),
            ipcidr,
            db,
        }
    }

    /// 落在可疑网段内，或者国家不是信任的国家
    pub fn is_suspect(&self, ip: IpAddr) -> bool {
        if self.ipcidr.matches(ip) {
            return true;
        }
        if self.geoip {
            if let Some(db) = &self.db {
                return db.lookup_country(ip) != Some(self.geoip_code.as_str());
            }
        }
        false
    }
}

/// fallback 服务器的查询方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackStrategy {
    /// 与主服务器同时发出查询
    #[default]
    Race,
    /// 主服务器失败或结果可疑后才查询
    Sequential,
}

pub struct ResolverConfig {
    pub main: Vec<Arc<dyn Upstream>>,
    pub fallback: Vec<Arc<dyn Upstream>>,
    pub fallback_filter: FallbackFilter,
    pub fallback_strategy: FallbackStrategy,
    pub ipv6: bool,
    pub enhanced_mode: EnhancedMode,
    pub fake_pool: Option<Arc<FakeIpPool>>,
    pub hosts: AddressTrie<IpAddr>,
    /// 每一组上游（主 / fallback）的查询超时
    pub timeout: Duration,
    pub cache_size: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            main: Vec::new(),
            fallback: Vec::new(),
            fallback_filter: FallbackFilter::default(),
            fallback_strategy: FallbackStrategy::default(),
            ipv6: false,
            enhanced_mode: EnhancedMode::Normal,
            fake_pool: None,
            hosts: AddressTrie::new(),
            timeout: Duration::from_secs(5),
            cache_size: DEFAULT_CACHE_SIZE,
        }
    }
}

struct CacheEntry {
    ips: Vec<IpAddr>,
    expires_at: Instant,
}

/// DNS 解析器
pub struct Resolver {
    main: Vec<Arc<dyn Upstream>>,
    fallback: Vec<Arc<dyn Upstream>>,
    filter: FallbackFilter,
    strategy: FallbackStrategy,
    ipv6: bool,
    mode: EnhancedMode,
    fake_pool: Option<Arc<FakeIpPool>>,
    hosts: AddressTrie<IpAddr>,
    timeout: Duration,
    cache: tokio::sync::Mutex<LruCache<(String, RecordType), CacheEntry>>,
    /// redir-host 模式下记录的 IP -> 域名
    redir_hosts: Mutex<LruCache<IpAddr, String>>,
}

impl Resolver {
    pub fn new(config: ResolverConfig) -> Result<Self, ConfigError> {
        if config.main.is_empty() {
            return Err(ConfigError::InvalidAddress("dns.nameserver 不能为空".to_string()));
        }
        if config.enhanced_mode == EnhancedMode::FakeIp && config.fake_pool.is_none() {
            return Err(ConfigError::InvalidCidr("fake-ip 模式需要 fake-ip-range".to_string()));
        }

        let cache_size = NonZeroUsize::new(config.cache_size)
            .unwrap_or(NonZeroUsize::MIN);

        info!(
            "DNS 解析器: 模式 {}, 主服务器 {} 个, fallback {} 个, IPv6 {}",
            config.enhanced_mode,
            config.main.len(),
            config.fallback.len(),
            if config.ipv6 { "启用" } else { "禁用" }
        );

        Ok(Self {
            main: config.main,
            fallback: config.fallback,
            filter: config.fallback_filter,
            strategy: config.fallback_strategy,
            ipv6: config.ipv6,
            mode: config.enhanced_mode,
            fake_pool: config.fake_pool,
            hosts: config.hosts,
            timeout: config.timeout,
            cache: tokio::sync::Mutex::new(LruCache::new(cache_size)),
            redir_hosts: Mutex::new(LruCache::new(cache_size)),
        })
    }

    pub fn enhanced_mode(&self) -> EnhancedMode {
        self.mode
    }

    pub fn fake_pool(&self) -> Option<&Arc<FakeIpPool>> {
        self.fake_pool.as_ref()
    }

    /// 地址是否属于 Fake-IP 网段
    pub fn is_fake_ip(&self, ip: IpAddr) -> bool {
        self.fake_pool.as_ref().map_or(false, |pool| pool.contains(ip))
    }

    /// 从 Fake-IP 或 redir-host 记录中找回域名
    pub fn reverse_host(&self, ip: IpAddr) -> Option<String> {
        if let Some(pool) = &self.fake_pool {
            if pool.contains(ip) {
                return pool.reverse(ip);
            }
        }
        if self.mode == EnhancedMode::RedirHost {
            return self
                .redir_hosts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&ip)
                .cloned();
        }
        None
    }

    /// 解析域名，fake-ip 模式下返回 Fake-IP
    pub async fn resolve(&self, host: &str, want_ipv6: bool) -> Result<IpAddr, ResolveError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        if let Some(result) = self.search_hosts(host, want_ipv6) {
            return result;
        }

        if self.mode == EnhancedMode::FakeIp {
            if want_ipv6 {
                return Err(ResolveError::NoAnswer(format!("{} (fake-ip 模式不支持 AAAA)", host)));
            }
            let pool = self.fake_pool.as_ref().ok_or(ResolveError::Disabled)?;
            return Ok(IpAddr::V4(pool.lookup(host)?));
        }

        self.resolve_real(host, want_ipv6).await
    }

    /// 解析出真实 IP，不经过 Fake-IP
    pub async fn resolve_ip(&self, host: &str, want_ipv6: bool) -> Result<IpAddr, ResolveError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        if let Some(result) = self.search_hosts(host, want_ipv6) {
            return result;
        }
        self.resolve_real(host, want_ipv6).await
    }

    fn search_hosts(&self, host: &str, want_ipv6: bool) -> Option<Result<IpAddr, ResolveError>> {
        let ip = *self.hosts.search(host)?;
        debug!("hosts 命中: {} -> {}", host, ip);
        if want_ipv6 && !ip.is_ipv6() {
            return Some(Err(ResolveError::NoAnswer(host.to_string())));
        }
        Some(Ok(ip))
    }

    async fn resolve_real(&self, host: &str, want_ipv6: bool) -> Result<IpAddr, ResolveError> {
        let ips = if want_ipv6 {
            if !self.ipv6 {
                return Err(ResolveError::NoAnswer(format!("{} (IPv6 未启用)", host)));
            }
            self.lookup(host, RecordType::AAAA).await?
        } else {
            match self.lookup(host, RecordType::A).await {
                Ok(ips) => ips,
                Err(ResolveError::NoAnswer(_)) if self.ipv6 => {
                    self.lookup(host, RecordType::AAAA).await?
                }
                Err(e) => return Err(e),
            }
        };

        ips.first()
            .copied()
            .ok_or_else(|| ResolveError::NoAnswer(host.to_string()))
    }

    /// 查询某个记录类型的全部地址（带缓存）
    pub async fn lookup(&self, host: &str, qtype: RecordType) -> Result<Vec<IpAddr>, ResolveError> {
        let key = (host.to_ascii_lowercase(), qtype);

        // 1. 检查缓存
        {
            let mut cache = self.cache.lock().await;
            let now = Instant::now();
            match cache.get(&key).map(|entry| (entry.expires_at > now, entry.ips.clone())) {
                Some((true, ips)) => {
                    debug!("DNS 缓存命中: {} {} -> {:?}", host, qtype, ips);
                    return Ok(ips);
                }
                Some((false, _)) => {
                    cache.pop(&key);
                }
                None => {}
            }
        }

        // 2. 执行 DNS 查询
        debug!("DNS 查询: {} {}", host, qtype);
        let request = build_query(host, qtype)?;
        let response = self.exchange_with_policy(host, &request).await?;
        let (ips, ttl) = extract_ips(&response, qtype);
        if ips.is_empty() {
            return Err(ResolveError::NoAnswer(host.to_string()));
        }

        if self.mode == EnhancedMode::RedirHost {
            let mut redir_hosts = self.redir_hosts.lock().unwrap_or_else(PoisonError::into_inner);
            for ip in &ips {
                redir_hosts.put(*ip, key.0.clone());
            }
        }

        // 3. 缓存结果
        if ttl > 0 {
            let mut cache = self.cache.lock().await;
            cache.put(
                key,
                CacheEntry {
                    ips: ips.clone(),
                    expires_at: Instant::now() + Duration::from_secs(u64::from(ttl)),
                },
            );
        }

        Ok(ips)
    }

    /// 主服务器 + fallback 策略
    async fn exchange_with_policy(&self, host: &str, request: &Message) -> Result<Message, ResolveError> {
        if self.fallback.is_empty() {
            return batch_exchange(&self.main, request, self.timeout).await;
        }

        let race = match self.strategy {
            FallbackStrategy::Race => {
                let upstreams = self.fallback.clone();
                let request = request.clone();
                let limit = self.timeout;
                Some(tokio::spawn(async move {
                    batch_exchange(&upstreams, &request, limit).await
                }))
            }
            FallbackStrategy::Sequential => None,
        };

        match batch_exchange(&self.main, request, self.timeout).await {
            Ok(response) => match first_ip(&response) {
                Some(ip) if !self.filter.is_suspect(ip) => {
                    if let Some(task) = race {
                        task.abort();
                    }
                    return Ok(response);
                }
                Some(ip) => debug!("主 DNS 对 {} 的结果 {} 可疑，改用 fallback", host, ip),
                None => debug!("主 DNS 对 {} 没有返回地址，改用 fallback", host),
            },
            Err(e) => debug!("主 DNS 查询 {} 失败: {}，改用 fallback", host, e),
        }

        let fallback = match race {
            Some(task) => task
                .await
                .map_err(|e| ResolveError::NoAnswer(format!("fallback 查询任务异常: {}", e)))?,
            None => batch_exchange(&self.fallback, request, self.timeout).await,
        };

        let response = fallback?;
        if let Some(ip) = first_ip(&response) {
            if self.filter.is_suspect(ip) {
                warn!("fallback DNS 对 {} 的结果 {} 也被过滤", host, ip);
                return Err(ResolveError::Filtered {
                    host: host.to_string(),
                    ip,
                });
            }
        }
        Ok(response)
    }

    /// DNS 前端调用：A/AAAA 走 resolve，其他类型直接转发给主服务器
    pub async fn exchange(&self, request: &Message) -> Result<Message, ResolveError> {
        let query = request
            .queries()
            .first()
            .cloned()
            .ok_or_else(|| ResolveError::NoAnswer("请求没有 question".to_string()))?;
        let qtype = query.query_type();

        if qtype != RecordType::A && qtype != RecordType::AAAA {
            let mut response = batch_exchange(&self.main, request, self.timeout).await?;
            response.set_id(request.id());
            return Ok(response);
        }

        let name = query.name().clone();
        let host = name.to_utf8();
        let host = host.trim_end_matches('.');

        let mut response = Message::new();
        response.set_id(request.id());
        response.set_message_type(MessageType::Response);
        response.set_op_code(request.op_code());
        response.set_recursion_desired(request.recursion_desired());
        response.set_recursion_available(true);
        response.set_response_code(ResponseCode::NoError);
        response.add_query(query);

        let ips = match self.answer_ips(host, qtype).await {
            Ok(ips) => ips,
            // 没有结果时回一个空的 NOERROR
            Err(ResolveError::NoAnswer(reason)) => {
                debug!("{} {} 没有结果: {}", host, qtype, reason);
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        for ip in ips {
            let ttl = if self.is_fake_ip(ip) { FAKE_IP_TTL } else { DEFAULT_TTL };
            let rdata = match (qtype, ip) {
                (RecordType::A, IpAddr::V4(v4)) => RData::A(A(v4)),
                (RecordType::AAAA, IpAddr::V6(v6)) => RData::AAAA(AAAA(v6)),
                _ => continue,
            };
            response.add_answer(Record::from_rdata(name.clone(), ttl, rdata));
        }

        Ok(response)
    }

    async fn answer_ips(&self, host: &str, qtype: RecordType) -> Result<Vec<IpAddr>, ResolveError> {
        let want_ipv6 = qtype == RecordType::AAAA;
        if host.parse::<IpAddr>().is_ok()
            || self.hosts.search(host).is_some()
            || self.mode == EnhancedMode::FakeIp
        {
            return self.resolve(host, want_ipv6).await.map(|ip| vec![ip]);
        }
        if want_ipv6 && !self.ipv6 {
            return Ok(Vec::new());
        }
        self.lookup(host, qtype).await
    }

    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
        info!("DNS 缓存已清除");
    }

    pub async fn cache_len(&self) -> usize {
        self.cache.lock().await.len()
    }
}

fn build_query(host: &str, qtype: RecordType) -> Result<Message, ResolveError> {
    let mut name = Name::from_ascii(host)?;
    name.set_fqdn(true);

    let mut request = Message::new();
    request.set_id(rand::random());
    request.set_message_type(MessageType::Query);
    request.set_op_code(OpCode::Query);
    request.set_recursion_desired(true);
    request.add_query(Query::query(name, qtype));
    Ok(request)
}

/// 并发查询一组上游，第一个成功的结果胜出
async fn batch_exchange(
    upstreams: &[Arc<dyn Upstream>],
    request: &Message,
    limit: Duration,
) -> Result<Message, ResolveError> {
    if upstreams.is_empty() {
        return Err(ResolveError::NoAnswer("没有配置上游服务器".to_string()));
    }

    let queries = upstreams.iter().map(|upstream| upstream.exchange(request));
    match timeout(limit, select_ok(queries)).await {
        Ok(Ok((response, _))) => Ok(response),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ResolveError::Timeout(
            upstreams
                .iter()
                .map(|u| u.name())
                .collect::<Vec<_>>()
                .join(","),
        )),
    }
}

fn first_ip(response: &Message) -> Option<IpAddr> {
    response.answers().iter().find_map(|record| match record.data() {
        Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
        Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
        _ => None,
    })
}

/// 取出指定类型的地址以及最小 TTL
fn extract_ips(response: &Message, qtype: RecordType) -> (Vec<IpAddr>, u32) {
    let mut ttl = u32::MAX;
    let ips: Vec<IpAddr> = response
        .answers()
        .iter()
        .filter_map(|record| {
            let ip = match (qtype, record.data()) {
                (RecordType::A, Some(RData::A(a))) => IpAddr::V4(a.0),
                (RecordType::AAAA, Some(RData::AAAA(aaaa))) => IpAddr::V6(aaaa.0),
                _ => return None,
            };
            ttl = ttl.min(record.ttl());
            Some(ip)
        })
        .collect();

    if ips.is_empty() {
        (ips, 0)
    } else {
        (ips, ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 固定应答的上游
    struct MockUpstream {
        name: String,
        answer: Option<IpAddr>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl MockUpstream {
        fn new(name: &str, answer: Option<&str>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                answer: answer.map(|a| a.parse().unwrap()),
                delay,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Upstream for MockUpstream {
        fn name(&self) -> &str {
            &self.name
        }

        async fn exchange(&self, query: &Message) -> Result<Message, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;

            let ip = self
                .answer
                .ok_or_else(|| ResolveError::NoAnswer(self.name.clone()))?;
            let mut response = Message::new();
            response.set_id(query.id());
            response.set_message_type(MessageType::Response);
            let q = query.queries()[0].clone();
            let rdata = match ip {
                IpAddr::V4(v4) => RData::A(A(v4)),
                IpAddr::V6(v6) => RData::AAAA(AAAA(v6)),
            };
            response.add_answer(Record::from_rdata(q.name().clone(), 60, rdata));
            response.add_query(q);
            Ok(response)
        }
    }

    fn upstreams(list: &[&Arc<MockUpstream>]) -> Vec<Arc<dyn Upstream>> {
        list.iter().map(|u| Arc::clone(*u) as Arc<dyn Upstream>).collect()
    }

    fn suspect_filter(cidr: &str) -> FallbackFilter {
        FallbackFilter::new(false, "CN", IpMatcher::new([cidr]).unwrap(), None)
    }

    #[tokio::test]
    async fn test_hosts_bypass_upstream() {
        let main = MockUpstream::new("main", Some("1.1.1.1"), Duration::ZERO);
        let mut hosts = AddressTrie::new();
        hosts.insert("router.lan", "192.168.1.1".parse().unwrap()).unwrap();

        let resolver = Resolver::new(ResolverConfig {
            main: upstreams(&[&main]),
            hosts,
            ..Default::default()
        })
        .unwrap();

        assert_eq!(
            resolver.resolve_ip("router.lan", false).await.unwrap(),
            "192.168.1.1".parse::<IpAddr>().unwrap()
        );
        assert_eq!(main.calls(), 0);
    }

    #[tokio::test]
    async fn test_cache_hit() {
        let main = MockUpstream::new("main", Some("93.184.216.34"), Duration::ZERO);
        let resolver = Resolver::new(ResolverConfig {
            main: upstreams(&[&main]),
            ..Default::default()
        })
        .unwrap();

        let first = resolver.resolve_ip("example.com", false).await.unwrap();
        let second = resolver.resolve_ip("EXAMPLE.com", false).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(main.calls(), 1);
        assert_eq!(resolver.cache_len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fake_ip_mode() {
        let main = MockUpstream::new("main", Some("93.184.216.34"), Duration::ZERO);
        let pool = Arc::new(
            FakeIpPool::new("198.18.0.0/16".parse().unwrap(), Duration::from_secs(60)).unwrap(),
        );
        let resolver = Resolver::new(ResolverConfig {
            main: upstreams(&[&main]),
            enhanced_mode: EnhancedMode::FakeIp,
            fake_pool: Some(pool),
            ..Default::default()
        })
        .unwrap();

        let ip = resolver.resolve("example.com", false).await.unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(198, 18, 0, 2)));
        assert_eq!(resolver.resolve("example.com", false).await.unwrap(), ip);
        assert!(resolver.is_fake_ip(ip));
        assert_eq!(resolver.reverse_host(ip).as_deref(), Some("example.com"));
        assert!(matches!(
            resolver.resolve("example.com", true).await,
            Err(ResolveError::NoAnswer(_))
        ));

        // resolve_ip 跳过 Fake-IP
        let real = resolver.resolve_ip("example.com", false).await.unwrap();
        assert_eq!(real, "93.184.216.34".parse::<IpAddr>().unwrap());
        assert_eq!(main.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_answer_filtered() {
        // 主服务器超时，fallback 的结果落在可疑网段
        let main = MockUpstream::new("main", Some("1.1.1.1"), Duration::from_secs(3600));
        let fallback = MockUpstream::new("fallback", Some("10.0.0.1"), Duration::ZERO);

        let resolver = Resolver::new(ResolverConfig {
            main: upstreams(&[&main]),
            fallback: upstreams(&[&fallback]),
            fallback_filter: suspect_filter("10.0.0.0/8"),
            timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .unwrap();

        let result = resolver.resolve_ip("example.com", false).await;
        assert!(matches!(result, Err(ResolveError::Filtered { .. })));
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspect_main_uses_fallback() {
        let main = MockUpstream::new("main", Some("10.0.0.1"), Duration::ZERO);
        let fallback = MockUpstream::new("fallback", Some("8.8.4.4"), Duration::ZERO);

        let resolver = Resolver::new(ResolverConfig {
            main: upstreams(&[&main]),
            fallback: upstreams(&[&fallback]),
            fallback_filter: suspect_filter("10.0.0.0/8"),
            fallback_strategy: FallbackStrategy::Sequential,
            ..Default::default()
        })
        .unwrap();

        assert_eq!(
            resolver.resolve_ip("example.com", false).await.unwrap(),
            "8.8.4.4".parse::<IpAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_sequential_skips_fallback_when_main_clean() {
        let main = MockUpstream::new("main", Some("8.8.8.8"), Duration::ZERO);
        let fallback = MockUpstream::new("fallback", Some("8.8.4.4"), Duration::ZERO);

        let resolver = Resolver::new(ResolverConfig {
            main: upstreams(&[&main]),
            fallback: upstreams(&[&fallback]),
            fallback_filter: suspect_filter("10.0.0.0/8"),
            fallback_strategy: FallbackStrategy::Sequential,
            ..Default::default()
        })
        .unwrap();

        assert_eq!(
            resolver.resolve_ip("example.com", false).await.unwrap(),
            "8.8.8.8".parse::<IpAddr>().unwrap()
        );
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn test_first_success_wins() {
        let broken = MockUpstream::new("broken", None, Duration::ZERO);
        let good = MockUpstream::new("good", Some("8.8.8.8"), Duration::from_millis(10));

        let resolver = Resolver::new(ResolverConfig {
            main: upstreams(&[&broken, &good]),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(
            resolver.resolve_ip("example.com", false).await.unwrap(),
            "8.8.8.8".parse::<IpAddr>().unwrap()
        );
        assert_eq!(broken.calls(), 1);
    }

    #[tokio::test]
    async fn test_redir_host_reverse() {
        let main = MockUpstream::new("main", Some("93.184.216.34"), Duration::ZERO);
        let resolver = Resolver::new(ResolverConfig {
            main: upstreams(&[&main]),
            enhanced_mode: EnhancedMode::RedirHost,
            ..Default::default()
        })
        .unwrap();

        let ip = resolver.resolve("example.com", false).await.unwrap();
        assert_eq!(resolver.reverse_host(ip).as_deref(), Some("example.com"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exchange_fake_ip_answer() {
        let main = MockUpstream::new("main", Some("93.184.216.34"), Duration::ZERO);
        let pool = Arc::new(
            FakeIpPool::new("198.18.0.0/16".parse().unwrap(), Duration::from_secs(60)).unwrap(),
        );
        let resolver = Resolver::new(ResolverConfig {
            main: upstreams(&[&main]),
            enhanced_mode: EnhancedMode::FakeIp,
            fake_pool: Some(pool),
            ..Default::default()
        })
        .unwrap();

        let request = build_query("example.com", RecordType::A).unwrap();
        let response = resolver.exchange(&request).await.unwrap();
        assert_eq!(response.id(), request.id());
        assert_eq!(response.answers().len(), 1);
        assert_eq!(response.answers()[0].ttl(), FAKE_IP_TTL);

        let request = build_query("example.com", RecordType::AAAA).unwrap();
        let response = resolver.exchange(&request).await.unwrap();
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.answers().is_empty());

        assert!(resolver.exchange(&Message::new()).await.is_err());
    }

    #[test]
    fn test_new_requires_nameserver() {
        assert!(Resolver::new(ResolverConfig::default()).is_err());
    }
}
