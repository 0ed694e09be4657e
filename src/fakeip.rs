use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::debug;
use thiserror::Error;
use tokio::time::Instant;

use crate::error::ConfigError;
use crate::ip_matcher::IpCidr;
use crate::metadata::normalize_host;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FakeIpError {
    #[error("Fake-IP 地址池已耗尽")]
    PoolExhausted,
}

#[derive(Debug)]
struct Entry {
    domain: String,
    expires_at: Instant,
    /// 正在使用该地址的 UDP 会话数
    pins: usize,
}

impl Entry {
    fn reclaimable(&self, now: Instant) -> bool {
        self.pins == 0 && self.expires_at <= now
    }
}

#[derive(Debug, Default)]
struct Inner {
    /// 下一次分配的偏移（相对第一个可用地址）
    cursor: u32,
    by_domain: HashMap<String, u32>,
    by_ip: HashMap<u32, Entry>,
}

/// Fake-IP 地址池
///
/// 网络地址和网关（network + 1）保留，广播地址不分配，
/// 所以第一个分配出去的地址总是 network + 2。
#[derive(Debug)]
pub struct FakeIpPool {
    cidr: IpCidr,
    first: u32,
    size: u32,
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl FakeIpPool {
    pub fn new(cidr: IpCidr, ttl: Duration) -> Result<Self, ConfigError> {
        let (network, prefix_len) = match cidr {
            IpCidr::V4 {
                network, prefix_len, ..
            } => (network, prefix_len),
            IpCidr::V6 { .. } => {
                return Err(ConfigError::InvalidCidr(format!("{}（fake-ip 只支持 IPv4）", cidr)))
            }
        };
        if prefix_len > 29 {
            return Err(ConfigError::InvalidCidr(format!("{}（fake-ip 网段太小）", cidr)));
        }

        let total = 1u64 << (32 - prefix_len);
        // 去掉网络地址、网关、广播地址
        let size = (total - 3) as u32;

        Ok(Self {
            cidr,
            first: network + 2,
            size,
            ttl,
            inner: Mutex::new(Inner::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 为域名分配（或复用）一个 Fake-IP
    pub fn lookup(&self, domain: &str) -> Result<Ipv4Addr, FakeIpError> {
        let domain = normalize_host(domain);
        let now = Instant::now();
        let mut guard = self.lock();
        let inner = &mut *guard;

        // 已有映射（哪怕已过期但还没被回收）直接续期
        if let Some(&ip) = inner.by_domain.get(&domain) {
            if let Some(entry) = inner.by_ip.get_mut(&ip) {
                entry.expires_at = now + self.ttl;
                return Ok(Ipv4Addr::from(ip));
            }
        }

        for _ in 0..self.size {
            let ip = self.first + inner.cursor;
            inner.cursor = (inner.cursor + 1) % self.size;

            if let Some(entry) = inner.by_ip.get(&ip) {
                if !entry.reclaimable(now) {
                    continue;
                }
                // 回收：两边索引都要清掉
                if let Some(old) = inner.by_ip.remove(&ip) {
                    debug!("回收 Fake-IP {} ({})", Ipv4Addr::from(ip), old.domain);
                    inner.by_domain.remove(&old.domain);
                }
            }

            inner.by_domain.insert(domain.clone(), ip);
            inner.by_ip.insert(
                ip,
                Entry {
                    domain,
                    expires_at: now + self.ttl,
                    pins: 0,
                },
            );
            return Ok(Ipv4Addr::from(ip));
        }

        Err(FakeIpError::PoolExhausted)
    }

    /// 根据 Fake-IP 找回域名，命中时刷新过期时间
    pub fn reverse(&self, ip: IpAddr) -> Option<String> {
        let key = self.offset_of(ip)?;
        let mut inner = self.lock();
        let entry = inner.by_ip.get_mut(&key)?;
        entry.expires_at = Instant::now() + self.ttl;
        Some(entry.domain.clone())
    }

    /// 地址当前是否有映射
    pub fn exist(&self, ip: IpAddr) -> bool {
        match self.offset_of(ip) {
            Some(key) => self.lock().by_ip.contains_key(&key),
            None => false,
        }
    }

    /// 地址是否在 Fake-IP 网段内
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.cidr.contains(ip)
    }

    /// 钉住一个已分配的地址，租约存在期间该地址不会被回收
    pub fn pin(self: &Arc<Self>, ip: IpAddr) -> Option<FakeIpLease> {
        let key = self.offset_of(ip)?;
        let mut inner = self.lock();
        let entry = inner.by_ip.get_mut(&key)?;
        entry.pins += 1;
        Some(FakeIpLease {
            pool: Arc::clone(self),
            key,
        })
    }

    /// 清理已过期且没有被钉住的映射，返回清理的数量
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.lock();
        let inner = &mut *guard;

        let expired: Vec<u32> = inner
            .by_ip
            .iter()
            .filter(|(_, entry)| entry.reclaimable(now))
            .map(|(ip, _)| *ip)
            .collect();

        for ip in &expired {
            if let Some(entry) = inner.by_ip.remove(ip) {
                inner.by_domain.remove(&entry.domain);
            }
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.lock().by_ip.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.size as usize
    }

    pub fn cidr(&self) -> IpCidr {
        self.cidr
    }

    fn offset_of(&self, ip: IpAddr) -> Option<u32> {
        let v4 = match ip {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(v6) => v6.to_ipv4_mapped()?,
        };
        let raw = u32::from(v4);
        (raw >= self.first && raw - self.first < self.size).then_some(raw)
    }

    fn unpin(&self, key: u32) {
        let mut inner = self.lock();
        if let Some(entry) = inner.by_ip.get_mut(&key) {
            entry.pins = entry.pins.saturating_sub(1);
        }
    }
}

/// Fake-IP 租约，drop 时释放
#[derive(Debug)]
pub struct FakeIpLease {
    pool: Arc<FakeIpPool>,
    key: u32,
}

impl FakeIpLease {
    pub fn addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.key)
    }
}

impl Drop for FakeIpLease {
    fn drop(&mut self) {
        self.pool.unpin(self.key);
    }
}
