use std::collections::HashMap;
use std::net::IpAddr;

use log::info;

use crate::error::ConfigError;
use crate::ip_matcher::IpMatcher;

/// 私有地址对应的伪国家代码，`GEOIP,LAN,DIRECT` 用
pub const LAN_CODE: &str = "LAN";

/// GeoIP 查询接口
pub trait GeoIpDb: Send + Sync {
    /// 返回 IP 所属国家的 ISO 代码（大写）
    fn lookup_country(&self, ip: IpAddr) -> Option<&str>;
}

/// 基于 CIDR 列表的 GeoIP 数据库
///
/// 配置格式：`{ "CN": ["1.0.1.0/24", ...], "US": [...] }`
#[derive(Debug, Default)]
pub struct CidrGeoIp {
    countries: Vec<(String, IpMatcher)>,
}

impl CidrGeoIp {
    pub fn new(table: &HashMap<String, Vec<String>>) -> Result<Self, ConfigError> {
        let mut countries = Vec::with_capacity(table.len());
        for (code, cidrs) in table {
            let matcher = IpMatcher::new(cidrs)?;
            info!("加载 GeoIP 国家 {}: {} 条网段", code.to_ascii_uppercase(), matcher.len());
            countries.push((code.to_ascii_uppercase(), matcher));
        }
        // 保证多次加载同一份配置时查询顺序一致
        countries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Self { countries })
    }
}

impl GeoIpDb for CidrGeoIp {
    fn lookup_country(&self, ip: IpAddr) -> Option<&str> {
        if is_lan(ip) {
            return Some(LAN_CODE);
        }
        self.countries
            .iter()
            .find(|(_, matcher)| matcher.matches(ip))
            .map(|(code, _)| code.as_str())
    }
}

fn is_lan(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00 // fc00::/7
                || (first & 0xffc0) == 0xfe80 // fe80::/10
        }
    }
}
