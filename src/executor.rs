//! 应用配置：启动时整份应用，重载时替换除监听端口以外的部分
//!
//! 会失败的步骤（构造解析器）放在最前面，失败时运行状态保持不变。

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::sync::{watch, Mutex};

use crate::config::{Config, DnsConfig, Experimental, General};
use crate::dns::{DnsServer, EnhancedMode, Resolver, ResolverConfig};
use crate::fakeip::FakeIpPool;
use crate::inbound::auth::{shared_authenticator, update_authenticator};
use crate::inbound::{
    AuthUser, Listener, RedirListener, RedirUdpListener, SharedAuthenticator, SocksListener,
    SocksUdpListener,
};
use crate::ip_matcher::IpCidr;
use crate::logger;
use crate::proxy::ProxyGroup;
use crate::trie::AddressTrie;
use crate::tunnel::{Snapshot, Tunnel};

#[derive(Default)]
struct State {
    general: Option<General>,
    socks: Option<Listener>,
    socks_udp: Option<Listener>,
    redir: Option<Listener>,
    redir_udp: Option<Listener>,
    dns_server: Option<DnsServer>,
    dns_listen: Option<SocketAddr>,
    fake_pool: Option<Arc<FakeIpPool>>,
    health_shutdown: Option<watch::Sender<bool>>,
}

pub struct Executor {
    tunnel: Arc<Tunnel>,
    auth: SharedAuthenticator,
    state: Mutex<State>,
}

impl Executor {
    pub fn new(tunnel: Arc<Tunnel>) -> Self {
        Self {
            tunnel,
            auth: shared_authenticator(),
            state: Mutex::new(State::default()),
        }
    }

    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }

    pub fn authenticator(&self) -> &SharedAuthenticator {
        &self.auth
    }

    /// SOCKS 监听的实际地址（端口为 0 时由系统分配）
    pub async fn socks_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.socks.as_ref().map(Listener::local_addr)
    }

    pub async fn dns_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.dns_server.as_ref().map(DnsServer::local_addr)
    }

    /// 应用配置
    ///
    /// `force` 为 false 时（热重载）不改动监听端口、运行模式和日志级别。
    pub async fn apply_config(&self, config: Config, force: bool) -> Result<()> {
        let mut state = self.state.lock().await;

        let Config {
            general,
            users,
            snapshot,
            proxy_names: _,
            dns,
            hosts,
            experimental,
        } = config;
        let groups: Vec<Arc<ProxyGroup>> = snapshot
            .proxies
            .values()
            .filter_map(|proxy| proxy.as_group().cloned())
            .collect();

        let dns_listen = dns.listen.filter(|_| dns.enable);
        let resolver = build_resolver(dns, hosts, state.fake_pool.as_ref())
            .context("DNS 配置无效")?
            .map(Arc::new);

        if force {
            self.update_general(&mut state, general)?;
        }
        self.update_users(&users);
        self.tunnel.set_resolver(resolver.clone());
        self.update_proxies(&mut state, snapshot, groups);
        self.update_dns(&mut state, resolver, dns_listen).await;
        self.update_experimental(experimental);

        info!("✅ 配置已应用");
        Ok(())
    }

    fn update_users(&self, users: &[AuthUser]) {
        update_authenticator(&self.auth, users);
        if !users.is_empty() {
            info!("SOCKS 认证已启用: {} 个用户", users.len());
        }
    }

    /// 新监听全部绑定成功后才替换旧的；任何一个失败时旧监听、模式和日志级别都不变
    fn update_general(&self, state: &mut State, general: General) -> Result<()> {
        let previous = state.general.as_ref();
        let rebind_socks =
            state.socks.is_none() || previous.and_then(|g| g.socks_addr) != general.socks_addr;
        let rebind_redir =
            state.redir.is_none() || previous.and_then(|g| g.redir_addr) != general.redir_addr;

        let socks = if rebind_socks {
            Some(self.bind_socks(&general)?)
        } else {
            None
        };
        let redir = if rebind_redir {
            Some(self.bind_redir(&general)?)
        } else {
            None
        };

        if let Some((tcp, udp)) = socks {
            state.socks = tcp;
            state.socks_udp = udp;
        }
        if let Some((tcp, udp)) = redir {
            state.redir = tcp;
            state.redir_udp = udp;
        }

        logger::set_level(general.log.level());
        self.tunnel.set_mode(general.mode);
        state.general = Some(general);
        Ok(())
    }

    fn bind_socks(&self, general: &General) -> Result<(Option<Listener>, Option<Listener>)> {
        let Some(addr) = general.socks_addr else {
            return Ok((None, None));
        };
        let tcp = SocksListener::bind(
            addr,
            Arc::clone(&self.tunnel),
            Arc::clone(&self.auth),
            general.max_connections,
        )?;
        // UDP 与 TCP 共用端口，端口为 0 时跟随 TCP 实际分配的端口
        let udp_addr = tcp.local_addr();
        let udp = match SocksUdpListener::bind(udp_addr, Arc::clone(&self.tunnel)) {
            Ok(listener) => Some(listener),
            Err(e) => {
                warn!("SOCKS UDP 监听 {} 失败: {:#}", udp_addr, e);
                None
            }
        };
        Ok((Some(tcp), udp))
    }

    fn bind_redir(&self, general: &General) -> Result<(Option<Listener>, Option<Listener>)> {
        let Some(addr) = general.redir_addr else {
            return Ok((None, None));
        };
        let tcp = RedirListener::bind(addr, Arc::clone(&self.tunnel), general.max_connections)?;
        let udp = match RedirUdpListener::bind(addr, Arc::clone(&self.tunnel)) {
            Ok(listener) => Some(listener),
            Err(e) => {
                warn!("REDIR UDP 监听 {} 失败: {:#}", addr, e);
                None
            }
        };
        Ok((Some(tcp), udp))
    }

    fn update_proxies(&self, state: &mut State, snapshot: Snapshot, groups: Vec<Arc<ProxyGroup>>) {
        if let Some(old) = state.health_shutdown.take() {
            let _ = old.send(true);
        }
        self.tunnel.update_snapshot(snapshot);

        let (tx, rx) = watch::channel(false);
        let ctx = self.tunnel.dial_context();
        for group in &groups {
            group.spawn_health_check(ctx.clone(), rx.clone());
        }
        state.health_shutdown = Some(tx);
    }

    async fn update_dns(
        &self,
        state: &mut State,
        resolver: Option<Arc<Resolver>>,
        listen: Option<SocketAddr>,
    ) {
        state.fake_pool = resolver.as_ref().and_then(|r| r.fake_pool().cloned());

        let (resolver, listen) = match (resolver, listen) {
            (Some(resolver), Some(listen)) => (resolver, listen),
            _ => {
                if state.dns_server.take().is_some() {
                    info!("DNS 服务已停止");
                }
                state.dns_listen = None;
                return;
            }
        };

        if state.dns_listen == Some(listen) {
            if let Some(server) = &state.dns_server {
                server.set_resolver(resolver);
                return;
            }
        }

        // 先释放旧端口再重新监听
        state.dns_server = None;
        state.dns_listen = None;
        match DnsServer::bind(listen, resolver).await {
            Ok(server) => {
                state.dns_server = Some(server);
                state.dns_listen = Some(listen);
            }
            Err(e) => error!("启动 DNS 服务失败: {:#}", e),
        }
    }

    fn update_experimental(&self, experimental: Experimental) {
        self.tunnel
            .set_ignore_resolve_fail(experimental.ignore_resolve_fail);
        self.tunnel.set_udp_timeout(experimental.udp_timeout);
    }

    /// 关闭所有监听、DNS 服务和健康检查
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        for listener in [
            state.socks.take(),
            state.socks_udp.take(),
            state.redir.take(),
            state.redir_udp.take(),
        ]
        .into_iter()
        .flatten()
        {
            listener.close();
        }
        if let Some(server) = state.dns_server.take() {
            server.shutdown();
        }
        state.dns_listen = None;
        if let Some(tx) = state.health_shutdown.take() {
            let _ = tx.send(true);
        }
    }
}

/// DNS 未启用时返回 None；fake-ip 网段不变时沿用原来的地址池，已分配的映射保持有效
fn build_resolver(
    dns: DnsConfig,
    hosts: AddressTrie<std::net::IpAddr>,
    previous_pool: Option<&Arc<FakeIpPool>>,
) -> Result<Option<Resolver>> {
    if !dns.enable {
        if !hosts.is_empty() {
            warn!("DNS 未启用，hosts 配置不会生效");
        }
        return Ok(None);
    }

    let fake_pool = if dns.enhanced_mode == EnhancedMode::FakeIp {
        Some(fake_pool_for(dns.fake_ip_range, dns.fake_ip_ttl, previous_pool)?)
    } else {
        None
    };

    let resolver = Resolver::new(ResolverConfig {
        main: dns.main,
        fallback: dns.fallback,
        fallback_filter: dns.fallback_filter,
        fallback_strategy: dns.fallback_strategy,
        ipv6: dns.ipv6,
        enhanced_mode: dns.enhanced_mode,
        fake_pool,
        hosts,
        timeout: dns.timeout,
        cache_size: dns.cache_size,
    })?;
    Ok(Some(resolver))
}

fn fake_pool_for(
    range: IpCidr,
    ttl: std::time::Duration,
    previous: Option<&Arc<FakeIpPool>>,
) -> Result<Arc<FakeIpPool>> {
    if let Some(pool) = previous {
        if pool.cidr() == range {
            return Ok(Arc::clone(pool));
        }
    }
    Ok(Arc::new(FakeIpPool::new(range, ttl)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::metrics::Metrics;
    use crate::tunnel::TunnelMode;
    use std::time::Duration;

    fn new_executor() -> Executor {
        let config = parse_config(r#"{ "rules": ["MATCH,DIRECT"] }"#).unwrap();
        Executor::new(Tunnel::new(config.snapshot, Metrics::new()))
    }

    const FAKE_IP: &str = r#"{
        "general": { "mode": "global" },
        "authentication": ["alice:secret"],
        "rules": ["DOMAIN-SUFFIX,example.com,REJECT", "MATCH,DIRECT"],
        "dns": {
            "enable": true,
            "nameserver": ["127.0.0.1:53"],
            "enhanced-mode": "fake-ip",
            "fake-ip-range": "198.18.0.0/24"
        },
        "experimental": { "udp-timeout": 5 }
    }"#;

    #[tokio::test]
    async fn test_apply_and_reload() {
        let executor = new_executor();
        let tunnel = Arc::clone(executor.tunnel());

        let mut config = parse_config(FAKE_IP).unwrap();
        config.general.socks_addr = Some("127.0.0.1:0".parse().unwrap());
        executor.apply_config(config, true).await.unwrap();

        assert_eq!(tunnel.mode(), TunnelMode::Global);
        assert_eq!(tunnel.rules().len(), 2);
        assert_eq!(tunnel.udp_timeout(), Duration::from_secs(5));
        assert!(executor.authenticator().load().is_some());
        assert!(executor.socks_addr().await.is_some());
        let pool = Arc::clone(tunnel.resolver().unwrap().fake_pool().unwrap());
        let ip = pool.lookup("kept.example").unwrap();

        // 热重载：监听和模式不变，fake-ip 地址池沿用
        let mut reload = parse_config(FAKE_IP).unwrap();
        reload.general.socks_addr = Some("127.0.0.1:1".parse().unwrap());
        reload.general.mode = TunnelMode::Direct;
        reload.users.clear();
        let socks = executor.socks_addr().await;
        executor.apply_config(reload, false).await.unwrap();

        assert_eq!(tunnel.mode(), TunnelMode::Global);
        assert_eq!(executor.socks_addr().await, socks);
        assert!(executor.authenticator().load().is_none());
        let new_pool = tunnel.resolver().unwrap().fake_pool().cloned().unwrap();
        assert!(Arc::ptr_eq(&pool, &new_pool));
        assert_eq!(new_pool.reverse(ip.into()).as_deref(), Some("kept.example"));

        executor.shutdown().await;
        assert!(executor.socks_addr().await.is_none());
    }

    #[tokio::test]
    async fn test_failed_rebind_keeps_listeners() {
        let executor = new_executor();
        let mut config = parse_config(r#"{ "rules": ["MATCH,DIRECT"] }"#).unwrap();
        config.general.socks_addr = Some("127.0.0.1:0".parse().unwrap());
        executor.apply_config(config, true).await.unwrap();
        let socks = executor.socks_addr().await.unwrap();

        // 目标端口已被占用
        let busy = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = parse_config(
            r#"{ "general": { "mode": "direct" }, "rules": ["MATCH,DIRECT"] }"#,
        )
        .unwrap();
        config.general.socks_addr = Some(busy.local_addr().unwrap());
        assert!(executor.apply_config(config, true).await.is_err());

        assert_eq!(executor.socks_addr().await, Some(socks));
        assert_eq!(executor.tunnel().mode(), TunnelMode::Rule);
        assert!(tokio::net::TcpStream::connect(socks).await.is_ok());

        // 记录的监听配置没有被失败的那次覆盖，同样的地址不会重新绑定
        let mut config = parse_config(r#"{ "rules": ["MATCH,DIRECT"] }"#).unwrap();
        config.general.socks_addr = Some("127.0.0.1:0".parse().unwrap());
        executor.apply_config(config, true).await.unwrap();
        assert_eq!(executor.socks_addr().await, Some(socks));

        executor.shutdown().await;
    }

    #[tokio::test]
    async fn test_disable_dns() {
        let executor = new_executor();
        executor
            .apply_config(parse_config(FAKE_IP).unwrap(), false)
            .await
            .unwrap();
        assert!(executor.tunnel().resolver().is_some());

        let plain = parse_config(r#"{ "rules": ["MATCH,DIRECT"] }"#).unwrap();
        executor.apply_config(plain, false).await.unwrap();
        assert!(executor.tunnel().resolver().is_none());
        assert!(executor.dns_addr().await.is_none());
    }

    #[tokio::test]
    async fn test_dns_server_rebinds_on_listen_change() {
        let executor = new_executor();
        let with_listen = FAKE_IP.replace(
            r#""enable": true,"#,
            r#""enable": true, "listen": "127.0.0.1:0","#,
        );
        executor
            .apply_config(parse_config(&with_listen).unwrap(), false)
            .await
            .unwrap();
        let first = executor.dns_addr().await.unwrap();
        assert_ne!(first.port(), 0);

        // 同一个监听地址只替换解析器
        executor
            .apply_config(parse_config(&with_listen).unwrap(), false)
            .await
            .unwrap();
        assert_eq!(executor.dns_addr().await, Some(first));

        executor
            .apply_config(parse_config(FAKE_IP).unwrap(), false)
            .await
            .unwrap();
        assert!(executor.dns_addr().await.is_none());
    }
}
