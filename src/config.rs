//! 配置文件（JSON）解析
//!
//! 原始结构体只负责反序列化，`parse_config` 把它们转换成运行时使用的类型，
//! 所有校验都在这里完成：任何一处出错整份配置都会被拒绝。

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::adapter::{Adapter, Direct, Reject, ShadowsocksR, ShadowsocksROption, Socks5, Socks5Option};
use crate::dns::{parse_upstream, EnhancedMode, FallbackFilter, FallbackStrategy, Upstream};
use crate::error::ConfigError;
use crate::geoip::{CidrGeoIp, GeoIpDb};
use crate::inbound::{default_max_connections, AuthUser};
use crate::ip_matcher::{IpCidr, IpMatcher};
use crate::logger::LogSettings;
use crate::proxy::{GroupKind, HealthCheck, Proxy, ProxyGroup, DIRECT, GLOBAL, REJECT};
use crate::rules::RuleSet;
use crate::socks_addr::Address;
use crate::trie::AddressTrie;
use crate::tunnel::{Snapshot, TunnelMode, DEFAULT_UDP_TIMEOUT};

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RawConfig {
    #[serde(default)]
    pub general: RawGeneral,
    /// `user:pass`
    #[serde(default)]
    pub authentication: Vec<String>,
    #[serde(default)]
    pub proxies: Vec<RawProxy>,
    #[serde(default)]
    pub proxy_groups: Vec<RawProxyGroup>,
    #[serde(default)]
    pub rules: Vec<String>,
    #[serde(default)]
    pub dns: RawDns,
    /// 域名 → IP，支持 `*.` 和 `+.` 通配
    #[serde(default)]
    pub hosts: HashMap<String, String>,
    #[serde(default)]
    pub experimental: RawExperimental,
    /// 国家代码 → CIDR 列表，供 GEOIP 规则和 fallback-filter 使用
    #[serde(default)]
    pub geoip: HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RawGeneral {
    /// 0 表示不开启
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
    #[serde(default)]
    pub redir_port: u16,
    /// allow-lan 为 true 时生效，`*` 表示所有地址
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default)]
    pub allow_lan: bool,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub log: LogSettings,
    pub max_connections: Option<usize>,
}

fn default_socks_port() -> u16 {
    7891
}

fn default_bind_address() -> String {
    "*".to_string()
}

fn default_mode() -> String {
    "rule".to_string()
}

impl Default for RawGeneral {
    fn default() -> Self {
        Self {
            socks_port: default_socks_port(),
            redir_port: 0,
            bind_address: default_bind_address(),
            allow_lan: false,
            mode: default_mode(),
            log: LogSettings::default(),
            max_connections: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RawProxy {
    pub name: String,
    /// socks5 / ssr
    #[serde(rename = "type")]
    pub kind: String,
    pub server: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub cipher: Option<String>,
    pub protocol: Option<String>,
    pub protocol_param: Option<String>,
    pub obfs: Option<String>,
    pub obfs_param: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RawProxyGroup {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub proxies: Vec<String>,
    pub url: Option<String>,
    /// 健康检查间隔（秒）
    pub interval: Option<u64>,
    /// url-test 容差（毫秒）
    pub tolerance: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RawDns {
    #[serde(default)]
    pub enable: bool,
    /// 为空时不启动 DNS 服务端
    #[serde(default)]
    pub listen: String,
    #[serde(default)]
    pub ipv6: bool,
    #[serde(default)]
    pub nameserver: Vec<String>,
    #[serde(default)]
    pub fallback: Vec<String>,
    #[serde(default)]
    pub fallback_filter: RawFallbackFilter,
    #[serde(default)]
    pub enhanced_mode: String,
    #[serde(default = "default_fake_ip_range")]
    pub fake_ip_range: String,
    /// fake-ip 映射的有效期（秒）
    #[serde(default = "default_fake_ip_ttl")]
    pub fake_ip_ttl: u64,
    /// race / sequential
    #[serde(default)]
    pub fallback_strategy: String,
    /// 查询超时（毫秒）
    #[serde(default = "default_dns_timeout")]
    pub timeout: u64,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

fn default_fake_ip_range() -> String {
    "198.18.0.1/16".to_string()
}

fn default_fake_ip_ttl() -> u64 {
    600
}

fn default_dns_timeout() -> u64 {
    5000
}

fn default_cache_size() -> usize {
    4096
}

impl Default for RawDns {
    fn default() -> Self {
        Self {
            enable: false,
            listen: String::new(),
            ipv6: false,
            nameserver: Vec::new(),
            fallback: Vec::new(),
            fallback_filter: RawFallbackFilter::default(),
            enhanced_mode: String::new(),
            fake_ip_range: default_fake_ip_range(),
            fake_ip_ttl: default_fake_ip_ttl(),
            fallback_strategy: String::new(),
            timeout: default_dns_timeout(),
            cache_size: default_cache_size(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RawFallbackFilter {
    #[serde(default = "default_true")]
    pub geoip: bool,
    #[serde(default = "default_geoip_code")]
    pub geoip_code: String,
    #[serde(default)]
    pub ipcidr: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_geoip_code() -> String {
    "CN".to_string()
}

impl Default for RawFallbackFilter {
    fn default() -> Self {
        Self {
            geoip: true,
            geoip_code: default_geoip_code(),
            ipcidr: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RawExperimental {
    #[serde(default)]
    pub ignore_resolve_fail: bool,
    /// UDP 会话空闲超时（秒）
    #[serde(default = "default_udp_timeout")]
    pub udp_timeout: u64,
}

fn default_udp_timeout() -> u64 {
    DEFAULT_UDP_TIMEOUT.as_secs()
}

impl Default for RawExperimental {
    fn default() -> Self {
        Self {
            ignore_resolve_fail: false,
            udp_timeout: default_udp_timeout(),
        }
    }
}

/// 监听与运行模式
#[derive(Debug, Clone, PartialEq)]
pub struct General {
    pub socks_addr: Option<SocketAddr>,
    pub redir_addr: Option<SocketAddr>,
    pub mode: TunnelMode,
    pub log: LogSettings,
    pub max_connections: usize,
}

pub struct DnsConfig {
    pub enable: bool,
    pub listen: Option<SocketAddr>,
    pub ipv6: bool,
    pub main: Vec<Arc<dyn Upstream>>,
    pub fallback: Vec<Arc<dyn Upstream>>,
    pub fallback_filter: FallbackFilter,
    pub fallback_strategy: FallbackStrategy,
    pub enhanced_mode: EnhancedMode,
    pub fake_ip_range: IpCidr,
    pub fake_ip_ttl: Duration,
    pub timeout: Duration,
    pub cache_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Experimental {
    pub ignore_resolve_fail: bool,
    pub udp_timeout: Duration,
}

/// 校验通过的完整配置
pub struct Config {
    pub general: General,
    pub users: Vec<AuthUser>,
    /// 规则 + 代理（含内置的 DIRECT / REJECT / GLOBAL）
    pub snapshot: Snapshot,
    /// 代理和代理组的声明顺序
    pub proxy_names: Vec<String>,
    pub dns: DnsConfig,
    pub hosts: AddressTrie<IpAddr>,
    pub experimental: Experimental,
}

impl Config {
    /// 需要健康检查的代理组
    pub fn groups(&self) -> Vec<Arc<ProxyGroup>> {
        self.proxy_names
            .iter()
            .filter_map(|name| self.snapshot.proxies.get(name))
            .filter_map(|proxy| proxy.as_group().cloned())
            .collect()
    }
}

/// 读取并解析配置文件
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("无法读取配置文件: {}", path.display()))?;
    parse_config(&content).with_context(|| format!("配置文件无效: {}", path.display()))
}

pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = serde_json::from_str(content)?;
    build_config(raw)
}

pub fn build_config(raw: RawConfig) -> Result<Config, ConfigError> {
    let geoip: Arc<dyn GeoIpDb> = Arc::new(CidrGeoIp::new(&raw.geoip)?);

    let general = parse_general(&raw.general)?;
    let users = parse_users(&raw.authentication)?;
    let (proxies, proxy_names) = parse_proxies(&raw.proxies, &raw.proxy_groups)?;
    let rules = RuleSet::parse(&raw.rules, &geoip)?;

    let global_fallback = proxy_names
        .first()
        .cloned()
        .unwrap_or_else(|| DIRECT.to_string());
    let snapshot = Snapshot::new(rules, proxies)?.with_global_fallback(global_fallback)?;

    let dns = parse_dns(&raw.dns, &geoip)?;
    let hosts = parse_hosts(&raw.hosts)?;
    let experimental = Experimental {
        ignore_resolve_fail: raw.experimental.ignore_resolve_fail,
        udp_timeout: if raw.experimental.udp_timeout == 0 {
            DEFAULT_UDP_TIMEOUT
        } else {
            Duration::from_secs(raw.experimental.udp_timeout)
        },
    };

    Ok(Config {
        general,
        users,
        snapshot,
        proxy_names,
        dns,
        hosts,
        experimental,
    })
}

fn parse_general(raw: &RawGeneral) -> Result<General, ConfigError> {
    let bind_ip: IpAddr = if !raw.allow_lan {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else if raw.bind_address == "*" || raw.bind_address.is_empty() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        raw.bind_address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(raw.bind_address.clone()))?
    };
    let listen = |port: u16| (port != 0).then(|| SocketAddr::new(bind_ip, port));

    Ok(General {
        socks_addr: listen(raw.socks_port),
        redir_addr: listen(raw.redir_port),
        mode: raw.mode.parse()?,
        log: raw.log.clone(),
        max_connections: raw
            .max_connections
            .filter(|n| *n > 0)
            .unwrap_or_else(default_max_connections),
    })
}

fn parse_users(lines: &[String]) -> Result<Vec<AuthUser>, ConfigError> {
    lines
        .iter()
        .map(|line| AuthUser::parse(line).ok_or_else(|| ConfigError::InvalidUser(line.clone())))
        .collect()
}

fn parse_proxy(raw: &RawProxy) -> Result<Adapter, ConfigError> {
    match raw.kind.as_str() {
        "socks5" => {
            let server = match raw.server.parse::<IpAddr>() {
                Ok(ip) => Address::Ip(SocketAddr::new(ip, raw.port)),
                Err(_) => Address::Domain(raw.server.clone(), raw.port),
            };
            Ok(Adapter::Socks5(Socks5::new(Socks5Option {
                name: raw.name.clone(),
                server,
                username: raw.username.clone(),
                password: raw.password.clone(),
            })))
        }
        "ssr" => {
            let option = ShadowsocksROption {
                name: raw.name.clone(),
                server: raw.server.clone(),
                port: raw.port,
                password: raw.password.clone().unwrap_or_default(),
                cipher: raw.cipher.clone().unwrap_or_default(),
                protocol: raw.protocol.clone().unwrap_or_else(|| "origin".to_string()),
                protocol_param: raw.protocol_param.clone().unwrap_or_default(),
                obfs: raw.obfs.clone().unwrap_or_else(|| "plain".to_string()),
                obfs_param: raw.obfs_param.clone().unwrap_or_default(),
            };
            Ok(Adapter::ShadowsocksR(ShadowsocksR::new(option)?))
        }
        other => Err(ConfigError::UnknownProxyType(other.to_string())),
    }
}

/// 解析代理和代理组，组成员只能引用在它之前声明的名字
fn parse_proxies(
    raw_proxies: &[RawProxy],
    raw_groups: &[RawProxyGroup],
) -> Result<(HashMap<String, Proxy>, Vec<String>), ConfigError> {
    let mut proxies: HashMap<String, Proxy> = HashMap::new();
    proxies.insert(DIRECT.to_string(), Proxy::single(Adapter::Direct(Direct::new(DIRECT))));
    proxies.insert(REJECT.to_string(), Proxy::single(Adapter::Reject(Reject::new(REJECT))));

    let reserved: HashSet<&str> = [DIRECT, REJECT, GLOBAL].into_iter().collect();
    let mut names = Vec::with_capacity(raw_proxies.len() + raw_groups.len());

    for raw in raw_proxies {
        if reserved.contains(raw.name.as_str()) || proxies.contains_key(&raw.name) {
            return Err(ConfigError::DuplicateProxy(raw.name.clone()));
        }
        let proxy = Proxy::single(parse_proxy(raw)?);
        names.push(raw.name.clone());
        proxies.insert(raw.name.clone(), proxy);
    }

    for raw in raw_groups {
        if reserved.contains(raw.name.as_str()) || proxies.contains_key(&raw.name) {
            return Err(ConfigError::DuplicateProxy(raw.name.clone()));
        }
        let kind: GroupKind = raw.kind.parse()?;
        let members = raw
            .proxies
            .iter()
            .map(|name| {
                proxies
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ConfigError::UnknownProxy(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let defaults = HealthCheck::default();
        let check = HealthCheck {
            url: raw.url.clone().unwrap_or(defaults.url),
            interval: raw.interval.map(Duration::from_secs).unwrap_or(defaults.interval),
            tolerance: raw.tolerance.unwrap_or(defaults.tolerance),
            timeout: defaults.timeout,
        };
        let group = ProxyGroup::new(raw.name.clone(), kind, members, check)?;
        names.push(raw.name.clone());
        proxies.insert(raw.name.clone(), Proxy::Group(Arc::new(group)));
    }

    // GLOBAL：覆盖所有代理的 select 组，默认选中第一个声明的代理
    let global_members = names
        .iter()
        .chain([DIRECT.to_string(), REJECT.to_string()].iter())
        .filter_map(|name| proxies.get(name).cloned())
        .collect();
    let global = ProxyGroup::new(GLOBAL, GroupKind::Select, global_members, HealthCheck::default())?;
    proxies.insert(GLOBAL.to_string(), Proxy::Group(Arc::new(global)));

    Ok((proxies, names))
}

/// `0.0.0.0:53`、`:53`、`[::]:53`
fn parse_listen(listen: &str) -> Result<Option<SocketAddr>, ConfigError> {
    let listen = listen.trim();
    if listen.is_empty() {
        return Ok(None);
    }
    let full = if listen.starts_with(':') {
        format!("0.0.0.0{}", listen)
    } else {
        listen.to_string()
    };
    full.parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidAddress(listen.to_string()))
}

fn parse_dns(raw: &RawDns, geoip: &Arc<dyn GeoIpDb>) -> Result<DnsConfig, ConfigError> {
    let timeout = Duration::from_millis(raw.timeout.max(1));
    let upstreams = |list: &[String]| {
        list.iter()
            .map(|addr| parse_upstream(addr, timeout))
            .collect::<Result<Vec<_>, _>>()
    };

    let main = upstreams(&raw.nameserver)?;
    let fallback = upstreams(&raw.fallback)?;
    if raw.enable && main.is_empty() {
        return Err(ConfigError::InvalidDns("启用 DNS 时 nameserver 不能为空".to_string()));
    }

    let enhanced_mode: EnhancedMode = raw.enhanced_mode.parse().map_err(ConfigError::InvalidDns)?;
    let fallback_strategy = match raw.fallback_strategy.to_ascii_lowercase().as_str() {
        "" | "race" => FallbackStrategy::Race,
        "sequential" => FallbackStrategy::Sequential,
        other => {
            return Err(ConfigError::InvalidDns(format!(
                "未知的 fallback-strategy `{}`",
                other
            )))
        }
    };

    let fake_ip_range: IpCidr = raw.fake_ip_range.parse()?;
    if !fake_ip_range.is_ipv4() {
        return Err(ConfigError::InvalidCidr(raw.fake_ip_range.clone()));
    }

    let filter = &raw.fallback_filter;
    let fallback_filter = FallbackFilter::new(
        filter.geoip,
        &filter.geoip_code,
        IpMatcher::new(filter.ipcidr.iter())?,
        Some(Arc::clone(geoip)),
    );

    Ok(DnsConfig {
        enable: raw.enable,
        listen: parse_listen(&raw.listen)?,
        ipv6: raw.ipv6,
        main,
        fallback,
        fallback_filter,
        fallback_strategy,
        enhanced_mode,
        fake_ip_range,
        fake_ip_ttl: Duration::from_secs(raw.fake_ip_ttl.max(1)),
        timeout,
        cache_size: raw.cache_size,
    })
}

fn parse_hosts(raw: &HashMap<String, String>) -> Result<AddressTrie<IpAddr>, ConfigError> {
    let mut trie = AddressTrie::new();
    for (domain, ip) in raw {
        let ip: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(ip.clone()))?;
        trie.insert(domain, ip)?;
    }
    Ok(trie)
}
