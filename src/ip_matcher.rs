use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::error::ConfigError;

/// 一个 CIDR 网段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpCidr {
    V4 { network: u32, mask: u32, prefix_len: u8 },
    V6 { network: u128, mask: u128, prefix_len: u8 },
}

impl IpCidr {
    pub fn new(ip: IpAddr, prefix_len: u8) -> Result<Self, ConfigError> {
        match ip {
            IpAddr::V4(ip) => {
                if prefix_len > 32 {
                    return Err(ConfigError::InvalidCidr(format!("{}/{}", ip, prefix_len)));
                }
                let mask = if prefix_len == 0 {
                    0
                } else {
                    !0u32 << (32 - prefix_len)
                };
                Ok(IpCidr::V4 {
                    network: u32::from(ip) & mask,
                    mask,
                    prefix_len,
                })
            }
            IpAddr::V6(ip) => {
                if prefix_len > 128 {
                    return Err(ConfigError::InvalidCidr(format!("{}/{}", ip, prefix_len)));
                }
                let mask = if prefix_len == 0 {
                    0
                } else {
                    !0u128 << (128 - prefix_len)
                };
                Ok(IpCidr::V6 {
                    network: u128::from(ip) & mask,
                    mask,
                    prefix_len,
                })
            }
        }
    }

    /// 检查 IP 是否落在网段内，IPv4 映射的 IPv6 地址按 IPv4 处理
    #[inline]
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self, canonical(ip)) {
            (IpCidr::V4 { network, mask, .. }, IpAddr::V4(ip)) => u32::from(ip) & mask == *network,
            (IpCidr::V6 { network, mask, .. }, IpAddr::V6(ip)) => u128::from(ip) & mask == *network,
            _ => false,
        }
    }

    pub fn prefix_len(&self) -> u8 {
        match self {
            IpCidr::V4 { prefix_len, .. } | IpCidr::V6 { prefix_len, .. } => *prefix_len,
        }
    }

    pub fn network_addr(&self) -> IpAddr {
        match self {
            IpCidr::V4 { network, .. } => IpAddr::V4(Ipv4Addr::from(*network)),
            IpCidr::V6 { network, .. } => IpAddr::V6(Ipv6Addr::from(*network)),
        }
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self, IpCidr::V4 { .. })
    }
}

impl FromStr for IpCidr {
    type Err = ConfigError;

    /// 接受 `192.168.1.0/24`、`2001:db8::/32`，不带前缀时视为单个主机
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || ConfigError::InvalidCidr(s.to_string());

        match s.split_once('/') {
            Some((ip_str, prefix_str)) => {
                let ip = ip_str.trim().parse::<IpAddr>().map_err(|_| invalid())?;
                let prefix_len = prefix_str.trim().parse::<u8>().map_err(|_| invalid())?;
                IpCidr::new(ip, prefix_len).map_err(|_| invalid())
            }
            None => {
                let ip = s.parse::<IpAddr>().map_err(|_| invalid())?;
                let prefix_len = if ip.is_ipv4() { 32 } else { 128 };
                IpCidr::new(ip, prefix_len)
            }
        }
    }
}

impl fmt::Display for IpCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network_addr(), self.prefix_len())
    }
}

/// IP 集合匹配器：精确地址 + CIDR 网段
///
/// fallback-filter 的可疑网段和 GeoIP 的国家网段都用它表示。
#[derive(Debug, Clone, Default)]
pub struct IpMatcher {
    /// 精确匹配的 IP 地址
    exact_ips: HashSet<IpAddr>,
    /// CIDR 网段
    networks: Vec<IpCidr>,
}

impl IpMatcher {
    /// 从模式列表创建匹配器，任何一个模式无效都返回错误
    ///
    /// # 参数
    /// * `patterns` - 单个 IP（`192.168.1.1`、`::1`）或 CIDR（`10.0.0.0/8`）
    pub fn new<I, S>(patterns: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut matcher = Self::default();
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            matcher.insert(pattern)?;
        }
        Ok(matcher)
    }

    pub fn insert(&mut self, pattern: &str) -> Result<(), ConfigError> {
        if pattern.contains('/') {
            let cidr = pattern.parse::<IpCidr>()?;
            // /32 与 /128 直接放进精确集合
            match cidr {
                IpCidr::V4 { prefix_len: 32, .. } | IpCidr::V6 { prefix_len: 128, .. } => {
                    self.exact_ips.insert(cidr.network_addr());
                }
                _ => self.networks.push(cidr),
            }
        } else {
            let ip = pattern
                .parse::<IpAddr>()
                .map_err(|_| ConfigError::InvalidCidr(pattern.to_string()))?;
            self.exact_ips.insert(canonical(ip));
        }
        Ok(())
    }

    /// 检查 IP 是否命中
    #[inline]
    pub fn matches(&self, ip: IpAddr) -> bool {
        let ip = canonical(ip);
        // 先检查精确匹配（O(1)）
        if self.exact_ips.contains(&ip) {
            return true;
        }
        self.networks.iter().any(|cidr| cidr.contains(ip))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.exact_ips.is_empty() && self.networks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.exact_ips.len() + self.networks.len()
    }
}

#[inline]
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        v4 => v4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_parse() {
        let cidr: IpCidr = "192.168.1.77/24".parse().unwrap();
        assert_eq!(cidr.to_string(), "192.168.1.0/24");
        assert!(cidr.contains("192.168.1.255".parse().unwrap()));
        assert!(!cidr.contains("192.168.2.1".parse().unwrap()));

        let host: IpCidr = "10.0.0.1".parse().unwrap();
        assert_eq!(host.prefix_len(), 32);
    }

    #[test]
    fn test_cidr_invalid() {
        assert!("192.168.1.0/33".parse::<IpCidr>().is_err());
        assert!("2001:db8::/129".parse::<IpCidr>().is_err());
        assert!("invalid/8".parse::<IpCidr>().is_err());
        assert!("10.0.0.0/x".parse::<IpCidr>().is_err());
    }

    #[test]
    fn test_ipv6_cidr_match() {
        let matcher = IpMatcher::new(["2001:db8::/32", "fe80::/10"]).unwrap();

        assert!(matcher.matches("2001:db8::1".parse().unwrap()));
        assert!(matcher.matches("2001:db8:ffff:ffff:ffff:ffff:ffff:ffff".parse().unwrap()));
        assert!(!matcher.matches("2001:db9::1".parse().unwrap()));

        // fe80::/10 (link-local)
        assert!(matcher.matches("febf:ffff:ffff:ffff:ffff:ffff:ffff:ffff".parse().unwrap()));
        assert!(!matcher.matches("fec0::1".parse().unwrap()));
    }

    #[test]
    fn test_mixed_exact_and_cidr() {
        let matcher =
            IpMatcher::new(["192.168.1.1", "192.168.2.0/24", "::1", "10.1.1.1/32"]).unwrap();

        assert!(matcher.matches("192.168.1.1".parse().unwrap()));
        assert!(matcher.matches("192.168.2.100".parse().unwrap()));
        assert!(matcher.matches("::1".parse().unwrap()));
        assert!(matcher.matches("10.1.1.1".parse().unwrap()));

        assert!(!matcher.matches("192.168.1.2".parse().unwrap()));
        assert!(!matcher.matches("::2".parse().unwrap()));
        assert_eq!(matcher.len(), 4);
    }

    #[test]
    fn test_ipv4_mapped() {
        let matcher = IpMatcher::new(["198.18.0.0/16"]).unwrap();
        assert!(matcher.matches("::ffff:198.18.3.4".parse().unwrap()));
    }

    #[test]
    fn test_cidr_all() {
        let matcher = IpMatcher::new(["0.0.0.0/0"]).unwrap();
        assert!(matcher.matches("8.8.8.8".parse().unwrap()));
        assert!(!matcher.matches("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_invalid_pattern_is_error() {
        // 配置里的网段写错要直接报错，不能静默忽略
        assert!(IpMatcher::new(["10.0.0.0/8", "192.168.1.1.1"]).is_err());
        assert!(IpMatcher::new(Vec::<String>::new()).unwrap().is_empty());
    }
}
