use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::timeout;

use crate::adapter::{Adapter, DialContext};
use crate::error::ConfigError;
use crate::metadata::{InboundType, Metadata, Network};
use crate::socks_addr::Address;

/// 内置代理名
pub const DIRECT: &str = "DIRECT";
pub const REJECT: &str = "REJECT";
pub const GLOBAL: &str = "GLOBAL";

const DELAY_UNKNOWN: u64 = u64::MAX;
const DELAY_DEAD: u64 = u64::MAX - 1;

/// 代理或代理组
#[derive(Clone)]
pub enum Proxy {
    Single(Arc<Adapter>),
    Group(Arc<ProxyGroup>),
}

impl Proxy {
    pub fn single(adapter: Adapter) -> Self {
        Proxy::Single(Arc::new(adapter))
    }

    pub fn name(&self) -> &str {
        match self {
            Proxy::Single(adapter) => adapter.name(),
            Proxy::Group(group) => group.name(),
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            Proxy::Single(adapter) => adapter.kind().to_string(),
            Proxy::Group(group) => group.kind().to_string(),
        }
    }

    /// 为一条新的流选出具体的出站，组会按策略递归选择
    pub fn select(&self, metadata: &Metadata) -> Arc<Adapter> {
        match self {
            Proxy::Single(adapter) => Arc::clone(adapter),
            Proxy::Group(group) => group.pick(metadata).select(metadata),
        }
    }

    pub fn as_group(&self) -> Option<&Arc<ProxyGroup>> {
        match self {
            Proxy::Group(group) => Some(group),
            Proxy::Single(_) => None,
        }
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.type_name(), self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    /// 手动选择
    Select,
    /// 延迟最低
    UrlTest,
    /// 按顺序第一个可用的
    Fallback,
    /// 按目标地址一致性哈希
    LoadBalance,
}

impl FromStr for GroupKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "select" => Ok(GroupKind::Select),
            "url-test" => Ok(GroupKind::UrlTest),
            "fallback" => Ok(GroupKind::Fallback),
            "load-balance" => Ok(GroupKind::LoadBalance),
            _ => Err(ConfigError::UnknownProxyType(s.to_string())),
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GroupKind::Select => "Selector",
            GroupKind::UrlTest => "URLTest",
            GroupKind::Fallback => "Fallback",
            GroupKind::LoadBalance => "LoadBalance",
        };
        f.write_str(name)
    }
}

/// 成员的健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// 还没有检测过，按可用处理
    Unknown,
    /// 可用，附带延迟（毫秒）
    Alive(u64),
    Dead,
}

impl Health {
    pub fn is_usable(&self) -> bool {
        !matches!(self, Health::Dead)
    }
}

struct Member {
    proxy: Proxy,
    delay: AtomicU64,
}

impl Member {
    fn health(&self) -> Health {
        match self.delay.load(Ordering::Relaxed) {
            DELAY_UNKNOWN => Health::Unknown,
            DELAY_DEAD => Health::Dead,
            ms => Health::Alive(ms),
        }
    }
}

/// 健康检查参数
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub url: String,
    pub interval: Duration,
    /// url-test 切换的容差（毫秒）
    pub tolerance: u64,
    pub timeout: Duration,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            url: "http://www.gstatic.com/generate_204".to_string(),
            interval: Duration::from_secs(300),
            tolerance: 150,
            timeout: Duration::from_secs(5),
        }
    }
}

/// 代理组
///
/// 成员只能引用先声明的代理或组，因此不会出现环。
pub struct ProxyGroup {
    name: String,
    kind: GroupKind,
    members: Vec<Member>,
    selected: AtomicUsize,
    check: HealthCheck,
}

impl ProxyGroup {
    pub fn new(
        name: impl Into<String>,
        kind: GroupKind,
        members: Vec<Proxy>,
        check: HealthCheck,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if members.is_empty() {
            return Err(ConfigError::InvalidGroup {
                group: name,
                reason: "至少需要一个成员".to_string(),
            });
        }
        let members = members
            .into_iter()
            .map(|proxy| Member {
                proxy,
                delay: AtomicU64::new(DELAY_UNKNOWN),
            })
            .collect();

        Ok(Self {
            name,
            kind,
            members,
            selected: AtomicUsize::new(0),
            check,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    pub fn health_check(&self) -> &HealthCheck {
        &self.check
    }

    pub fn member_names(&self) -> Vec<String> {
        self.members.iter().map(|m| m.proxy.name().to_string()).collect()
    }

    pub fn health(&self, name: &str) -> Option<Health> {
        self.members
            .iter()
            .find(|m| m.proxy.name() == name)
            .map(Member::health)
    }

    /// 当前选中的成员名
    pub fn now(&self) -> &str {
        let idx = self.selected.load(Ordering::Relaxed);
        self.members[idx.min(self.members.len() - 1)].proxy.name()
    }

    /// 切换 select 组的当前成员
    pub fn set_selected(&self, name: &str) -> Result<(), ConfigError> {
        if self.kind != GroupKind::Select {
            return Err(ConfigError::InvalidGroup {
                group: self.name.clone(),
                reason: format!("{} 组不能手动切换", self.kind),
            });
        }
        let idx = self
            .members
            .iter()
            .position(|m| m.proxy.name() == name)
            .ok_or_else(|| ConfigError::UnknownProxy(name.to_string()))?;
        self.selected.store(idx, Ordering::Relaxed);
        info!("代理组 {} 切换到 {}", self.name, name);
        Ok(())
    }

    /// 记录一次探测结果，`None` 表示不可用
    pub fn update_delay(&self, name: &str, delay: Option<Duration>) {
        if let Some(member) = self.members.iter().find(|m| m.proxy.name() == name) {
            let value = match delay {
                Some(d) => (d.as_millis() as u64).min(DELAY_DEAD - 1),
                None => DELAY_DEAD,
            };
            member.delay.store(value, Ordering::Relaxed);
        }
    }

    fn pick(&self, metadata: &Metadata) -> &Proxy {
        let idx = match self.kind {
            GroupKind::Select => self.selected.load(Ordering::Relaxed).min(self.members.len() - 1),
            GroupKind::UrlTest => self.pick_fastest(),
            GroupKind::Fallback => self
                .members
                .iter()
                .position(|m| m.health().is_usable())
                .unwrap_or(0),
            GroupKind::LoadBalance => self.pick_by_hash(metadata),
        };
        &self.members[idx].proxy
    }

    /// 最快的成员比当前成员快出容差以上时才切换
    fn pick_fastest(&self) -> usize {
        let current = self.selected.load(Ordering::Relaxed).min(self.members.len() - 1);
        let fastest = self
            .members
            .iter()
            .enumerate()
            .filter_map(|(i, m)| match m.health() {
                Health::Alive(ms) => Some((i, ms)),
                _ => None,
            })
            .min_by_key(|&(_, ms)| ms);

        let Some((best, best_ms)) = fastest else {
            return current;
        };
        let keep = match self.members[current].health() {
            Health::Alive(ms) => ms <= best_ms.saturating_add(self.check.tolerance),
            _ => false,
        };
        if keep {
            return current;
        }
        if best != current {
            debug!("代理组 {} 切换到 {} ({}ms)", self.name, self.members[best].proxy.name(), best_ms);
            self.selected.store(best, Ordering::Relaxed);
        }
        best
    }

    fn pick_by_hash(&self, metadata: &Metadata) -> usize {
        let usable: Vec<usize> = self
            .members
            .iter()
            .enumerate()
            .filter(|(_, m)| m.health().is_usable())
            .map(|(i, _)| i)
            .collect();
        let candidates: Vec<usize> = if usable.is_empty() {
            (0..self.members.len()).collect()
        } else {
            usable
        };

        let mut hasher = DefaultHasher::new();
        match (&metadata.host, metadata.dst_ip) {
            (Some(host), _) => host.hash(&mut hasher),
            (None, Some(ip)) => ip.hash(&mut hasher),
            (None, None) => metadata.dst_port.hash(&mut hasher),
        }
        candidates[(hasher.finish() % candidates.len() as u64) as usize]
    }

    /// 并发探测所有成员
    pub async fn check_health(&self, ctx: &DialContext) {
        let probes = self.members.iter().map(|m| async move {
            let result = probe(&m.proxy, ctx, &self.check).await;
            (m.proxy.name().to_string(), result)
        });
        for (name, result) in join_all(probes).await {
            match result {
                Ok(delay) => {
                    debug!("代理组 {} 成员 {} 延迟 {}ms", self.name, name, delay.as_millis());
                    self.update_delay(&name, Some(delay));
                }
                Err(e) => {
                    debug!("代理组 {} 成员 {} 不可用: {}", self.name, name, e);
                    self.update_delay(&name, None);
                }
            }
        }
    }

    /// 周期性健康检查，配置替换时通过 shutdown 结束
    pub fn spawn_health_check(
        self: &Arc<Self>,
        ctx: DialContext,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if self.kind == GroupKind::Select || self.check.interval.is_zero() {
            return;
        }
        let group = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(group.check.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => group.check_health(&ctx).await,
                    _ = shutdown.changed() => {
                        debug!("代理组 {} 停止健康检查", group.name);
                        return;
                    }
                }
            }
        });
    }
}

impl fmt::Debug for ProxyGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyGroup")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("members", &self.member_names())
            .finish()
    }
}

/// 拆分 http://host[:port][/path]
fn parse_http_url(url: &str) -> Option<(Address, String)> {
    let rest = url.strip_prefix("http://")?;
    let (authority, path) = match rest.find('/') {
        Some(pos) => (&rest[..pos], &rest[pos..]),
        None => (rest, "/"),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().ok()?),
        None => (authority, 80),
    };
    if host.is_empty() {
        return None;
    }
    let address = match host.parse() {
        Ok(ip) => Address::Ip(std::net::SocketAddr::new(ip, port)),
        Err(_) => Address::Domain(host.to_string(), port),
    };
    Some((address, path.to_string()))
}

/// 通过成员发一个 HEAD 请求，返回收到首字节的耗时
async fn probe(proxy: &Proxy, ctx: &DialContext, check: &HealthCheck) -> anyhow::Result<Duration> {
    let (target, path) =
        parse_http_url(&check.url).ok_or_else(|| anyhow::anyhow!("无效的检测地址 {}", check.url))?;
    let host = target.host();
    let metadata = Metadata::new(Network::Tcp, InboundType::Socks, target, None);
    let adapter = proxy.select(&metadata);

    let start = Instant::now();
    let result = timeout(check.timeout, async {
        let mut stream = adapter.dial(ctx, &metadata).await?;
        let request = format!(
            "HEAD {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, host
        );
        stream.write_all(request.as_bytes()).await?;
        let mut first = [0u8; 1];
        let n = stream.read(&mut first).await?;
        if n == 0 {
            anyhow::bail!("连接被关闭");
        }
        Ok::<_, anyhow::Error>(())
    })
    .await;

    match result {
        Ok(Ok(())) => Ok(start.elapsed()),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            warn!("健康检查 {} 超时", adapter.name());
            Err(anyhow::anyhow!("超时"))
        }
    }
}
