use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::adapter::AdapterKind;

/// 调度层的运行指标
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    // 连接统计
    total_connections: AtomicU64,
    active_connections: AtomicUsize,
    failed_connections: AtomicU64,

    // 流量统计（上行：客户端 → 出站）
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,

    // 按出站类型统计
    direct_requests: AtomicU64,
    reject_requests: AtomicU64,
    socks5_requests: AtomicU64,
    ssr_requests: AtomicU64,

    // 调度错误
    rule_misses: AtomicU64,
    resolve_failures: AtomicU64,

    // UDP 会话
    udp_sessions_total: AtomicU64,
    udp_sessions_active: AtomicUsize,

    start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                total_connections: AtomicU64::new(0),
                active_connections: AtomicUsize::new(0),
                failed_connections: AtomicU64::new(0),
                bytes_up: AtomicU64::new(0),
                bytes_down: AtomicU64::new(0),
                direct_requests: AtomicU64::new(0),
                reject_requests: AtomicU64::new(0),
                socks5_requests: AtomicU64::new(0),
                ssr_requests: AtomicU64::new(0),
                rule_misses: AtomicU64::new(0),
                resolve_failures: AtomicU64::new(0),
                udp_sessions_total: AtomicU64::new(0),
                udp_sessions_active: AtomicUsize::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn inc_failed_connections(&self) {
        self.inner.failed_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_up(&self, bytes: u64) {
        self.inner.bytes_up.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_down(&self, bytes: u64) {
        self.inner.bytes_down.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_adapter_requests(&self, kind: AdapterKind) {
        let counter = match kind {
            AdapterKind::Direct => &self.inner.direct_requests,
            AdapterKind::Reject => &self.inner.reject_requests,
            AdapterKind::Socks5 => &self.inner.socks5_requests,
            AdapterKind::ShadowsocksR => &self.inner.ssr_requests,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rule_misses(&self) {
        self.inner.rule_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_resolve_failures(&self) {
        self.inner.resolve_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_connections(&self) -> u64 {
        self.inner.total_connections.load(Ordering::Relaxed)
    }

    pub fn get_active_connections(&self) -> usize {
        self.inner.active_connections.load(Ordering::Relaxed)
    }

    pub fn get_active_udp_sessions(&self) -> usize {
        self.inner.udp_sessions_active.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        MetricsSnapshot {
            total_connections: inner.total_connections.load(Ordering::Relaxed),
            active_connections: inner.active_connections.load(Ordering::Relaxed),
            failed_connections: inner.failed_connections.load(Ordering::Relaxed),
            bytes_up: inner.bytes_up.load(Ordering::Relaxed),
            bytes_down: inner.bytes_down.load(Ordering::Relaxed),
            direct_requests: inner.direct_requests.load(Ordering::Relaxed),
            reject_requests: inner.reject_requests.load(Ordering::Relaxed),
            socks5_requests: inner.socks5_requests.load(Ordering::Relaxed),
            ssr_requests: inner.ssr_requests.load(Ordering::Relaxed),
            rule_misses: inner.rule_misses.load(Ordering::Relaxed),
            resolve_failures: inner.resolve_failures.load(Ordering::Relaxed),
            udp_sessions_total: inner.udp_sessions_total.load(Ordering::Relaxed),
            udp_sessions_active: inner.udp_sessions_active.load(Ordering::Relaxed),
            uptime: inner.start_time.elapsed(),
        }
    }

    pub fn print_summary(&self) {
        let snapshot = self.snapshot();
        log::info!("=== 运行指标 ===");
        log::info!("运行时间: {:?}", snapshot.uptime);
        log::info!(
            "连接: 总数 {} | 活跃 {} | 失败 {}",
            snapshot.total_connections,
            snapshot.active_connections,
            snapshot.failed_connections
        );
        log::info!(
            "出站请求: DIRECT {} | REJECT {} | SOCKS5 {} | SSR {}",
            snapshot.direct_requests,
            snapshot.reject_requests,
            snapshot.socks5_requests,
            snapshot.ssr_requests
        );
        log::info!("上行流量: {} MB", snapshot.bytes_up / 1024 / 1024);
        log::info!("下行流量: {} MB", snapshot.bytes_down / 1024 / 1024);
        log::info!(
            "UDP 会话: 总数 {} | 活跃 {}",
            snapshot.udp_sessions_total,
            snapshot.udp_sessions_active
        );
        log::info!("规则未命中: {}", snapshot.rule_misses);
        log::info!("解析失败: {}", snapshot.resolve_failures);
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub total_connections: u64,
    pub active_connections: usize,
    pub failed_connections: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub direct_requests: u64,
    pub reject_requests: u64,
    pub socks5_requests: u64,
    pub ssr_requests: u64,
    pub rule_misses: u64,
    pub resolve_failures: u64,
    pub udp_sessions_total: u64,
    pub udp_sessions_active: usize,
    pub uptime: Duration,
}

/// RAII 风格的连接计数器
pub struct ConnectionGuard {
    metrics: Metrics,
}

impl ConnectionGuard {
    pub fn new(metrics: Metrics) -> Self {
        metrics.inner.total_connections.fetch_add(1, Ordering::Relaxed);
        metrics.inner.active_connections.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "📊 新连接建立 | 总连接数: {} | 活跃连接: {}",
            metrics.get_total_connections(),
            metrics.get_active_connections()
        );
        Self { metrics }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.metrics.inner.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::debug!(
            "📊 连接关闭 | 总连接数: {} | 活跃连接: {}",
            self.metrics.get_total_connections(),
            self.metrics.get_active_connections()
        );
    }
}

/// UDP 会话计数，和会话同生命周期
pub struct SessionGuard {
    metrics: Metrics,
}

impl SessionGuard {
    pub fn new(metrics: Metrics) -> Self {
        metrics.inner.udp_sessions_total.fetch_add(1, Ordering::Relaxed);
        metrics.inner.udp_sessions_active.fetch_add(1, Ordering::Relaxed);
        Self { metrics }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.metrics.inner.udp_sessions_active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guards() {
        let metrics = Metrics::new();
        {
            let _conn = ConnectionGuard::new(metrics.clone());
            let _session = SessionGuard::new(metrics.clone());
            assert_eq!(metrics.get_active_connections(), 1);
            assert_eq!(metrics.get_active_udp_sessions(), 1);
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_connections, 1);
        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.udp_sessions_total, 1);
        assert_eq!(snapshot.udp_sessions_active, 0);
    }

    #[test]
    fn test_adapter_counters() {
        let metrics = Metrics::new();
        metrics.inc_adapter_requests(AdapterKind::ShadowsocksR);
        metrics.inc_adapter_requests(AdapterKind::Direct);
        metrics.inc_adapter_requests(AdapterKind::Direct);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.ssr_requests, 1);
        assert_eq!(snapshot.direct_requests, 2);
        assert_eq!(snapshot.socks5_requests, 0);
    }
}
