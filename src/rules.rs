use std::fmt;
use std::sync::Arc;

use log::debug;

use crate::error::{ConfigError, TunnelError};
use crate::geoip::GeoIpDb;
use crate::ip_matcher::IpCidr;
use crate::metadata::Metadata;
use crate::trie::AddressTrie;

const NO_RESOLVE: &str = "no-resolve";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleType {
    Domain,
    DomainSuffix,
    DomainKeyword,
    IpCidr,
    SrcIpCidr,
    GeoIp,
    SrcPort,
    DstPort,
    ProcessName,
    Match,
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuleType::Domain => "DOMAIN",
            RuleType::DomainSuffix => "DOMAIN-SUFFIX",
            RuleType::DomainKeyword => "DOMAIN-KEYWORD",
            RuleType::IpCidr => "IP-CIDR",
            RuleType::SrcIpCidr => "SRC-IP-CIDR",
            RuleType::GeoIp => "GEOIP",
            RuleType::SrcPort => "SRC-PORT",
            RuleType::DstPort => "DST-PORT",
            RuleType::ProcessName => "PROCESS-NAME",
            RuleType::Match => "MATCH",
        };
        f.write_str(name)
    }
}

/// 匹配器
pub enum Matcher {
    Domain(String),
    DomainSuffix { suffix: String, trie: AddressTrie<()> },
    DomainKeyword(String),
    IpCidr { cidr: IpCidr, no_resolve: bool },
    SrcIpCidr(IpCidr),
    GeoIp {
        country: String,
        db: Arc<dyn GeoIpDb>,
        no_resolve: bool,
    },
    SrcPort(u16),
    DstPort(u16),
    ProcessName(String),
    Final,
}

impl Matcher {
    fn rule_type(&self) -> RuleType {
        match self {
            Matcher::Domain(_) => RuleType::Domain,
            Matcher::DomainSuffix { .. } => RuleType::DomainSuffix,
            Matcher::DomainKeyword(_) => RuleType::DomainKeyword,
            Matcher::IpCidr { .. } => RuleType::IpCidr,
            Matcher::SrcIpCidr(_) => RuleType::SrcIpCidr,
            Matcher::GeoIp { .. } => RuleType::GeoIp,
            Matcher::SrcPort(_) => RuleType::SrcPort,
            Matcher::DstPort(_) => RuleType::DstPort,
            Matcher::ProcessName(_) => RuleType::ProcessName,
            Matcher::Final => RuleType::Match,
        }
    }

    /// 只看元数据，不做任何解析
    fn matches(&self, metadata: &Metadata) -> bool {
        match self {
            Matcher::Domain(domain) => metadata.host.as_deref() == Some(domain.as_str()),
            Matcher::DomainSuffix { trie, .. } => metadata
                .host
                .as_deref()
                .map_or(false, |host| trie.search(host).is_some()),
            Matcher::DomainKeyword(keyword) => metadata
                .host
                .as_deref()
                .map_or(false, |host| host.contains(keyword.as_str())),
            Matcher::IpCidr { cidr, .. } => metadata.dst_ip.map_or(false, |ip| cidr.contains(ip)),
            Matcher::SrcIpCidr(cidr) => metadata.src_ip().map_or(false, |ip| cidr.contains(ip)),
            Matcher::GeoIp { country, db, .. } => metadata
                .dst_ip
                .and_then(|ip| db.lookup_country(ip))
                .map_or(false, |code| code.eq_ignore_ascii_case(country)),
            Matcher::SrcPort(port) => metadata.src_port() == Some(*port),
            Matcher::DstPort(port) => metadata.dst_port == *port,
            Matcher::ProcessName(name) => metadata
                .process
                .as_deref()
                .map_or(false, |process| process.eq_ignore_ascii_case(name)),
            Matcher::Final => true,
        }
    }

    fn payload(&self) -> String {
        match self {
            Matcher::Domain(domain) => domain.clone(),
            Matcher::DomainSuffix { suffix, .. } => suffix.clone(),
            Matcher::DomainKeyword(keyword) => keyword.clone(),
            Matcher::IpCidr { cidr, .. } | Matcher::SrcIpCidr(cidr) => cidr.to_string(),
            Matcher::GeoIp { country, .. } => country.clone(),
            Matcher::SrcPort(port) | Matcher::DstPort(port) => port.to_string(),
            Matcher::ProcessName(name) => name.clone(),
            Matcher::Final => String::new(),
        }
    }
}

/// 一条规则：匹配器 + 目标代理名
pub struct Rule {
    matcher: Matcher,
    target: String,
}

impl Rule {
    pub fn new(matcher: Matcher, target: impl Into<String>) -> Self {
        Self {
            matcher,
            target: target.into(),
        }
    }

    /// 解析 `TYPE,payload,target[,no-resolve]` 格式的规则，`MATCH` 没有 payload
    pub fn parse(line: &str, geoip: &Arc<dyn GeoIpDb>) -> Result<Rule, ConfigError> {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        let rule_type = parts[0].to_ascii_uppercase();

        if rule_type == "MATCH" || rule_type == "FINAL" {
            return match parts.as_slice() {
                [_, target] if !target.is_empty() => Ok(Rule::new(Matcher::Final, *target)),
                _ => Err(ConfigError::invalid_rule(line, "格式应为 MATCH,代理名")),
            };
        }

        let (payload, target, params) = match parts.as_slice() {
            [_, payload, target, params @ ..] if !payload.is_empty() && !target.is_empty() => {
                (*payload, *target, params)
            }
            _ => return Err(ConfigError::invalid_rule(line, "格式应为 类型,内容,代理名")),
        };

        let no_resolve = params.iter().any(|p| p.eq_ignore_ascii_case(NO_RESOLVE));
        let parse_port = |s: &str| {
            s.parse::<u16>()
                .map_err(|_| ConfigError::invalid_rule(line, format!("无效的端口 `{}`", s)))
        };

        let matcher = match rule_type.as_str() {
            "DOMAIN" => Matcher::Domain(payload.trim_end_matches('.').to_ascii_lowercase()),
            "DOMAIN-SUFFIX" => {
                let suffix = payload.trim_start_matches('.').to_ascii_lowercase();
                let mut trie = AddressTrie::new();
                trie.insert(&format!("+.{}", suffix), ())?;
                Matcher::DomainSuffix { suffix, trie }
            }
            "DOMAIN-KEYWORD" => Matcher::DomainKeyword(payload.to_ascii_lowercase()),
            "IP-CIDR" | "IP-CIDR6" => Matcher::IpCidr {
                cidr: payload.parse()?,
                no_resolve,
            },
            "SRC-IP-CIDR" => Matcher::SrcIpCidr(payload.parse()?),
            "GEOIP" => Matcher::GeoIp {
                country: payload.to_ascii_uppercase(),
                db: geoip.clone(),
                no_resolve,
            },
            "SRC-PORT" => Matcher::SrcPort(parse_port(payload)?),
            "DST-PORT" => Matcher::DstPort(parse_port(payload)?),
            "PROCESS-NAME" => Matcher::ProcessName(payload.to_string()),
            other => {
                return Err(ConfigError::invalid_rule(
                    line,
                    format!("未知的规则类型 `{}`", other),
                ))
            }
        };

        Ok(Rule::new(matcher, target))
    }

    #[inline]
    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.matcher.matches(metadata)
    }

    pub fn rule_type(&self) -> RuleType {
        self.matcher.rule_type()
    }

    pub fn payload(&self) -> String {
        self.matcher.payload()
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// 这条规则是否需要目标 IP（IP-CIDR / GEOIP 且没有 no-resolve）
    pub fn should_resolve_ip(&self) -> bool {
        match &self.matcher {
            Matcher::IpCidr { no_resolve, .. } | Matcher::GeoIp { no_resolve, .. } => !no_resolve,
            _ => false,
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.matcher {
            Matcher::Final => write!(f, "MATCH"),
            _ => write!(f, "{}({})", self.rule_type(), self.payload()),
        }
    }
}

/// 有序规则集，末尾必须且只能有一条 MATCH
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// 只有一条 `MATCH,target`
    pub fn final_only(target: impl Into<String>) -> Self {
        Self {
            rules: vec![Rule::new(Matcher::Final, target)],
        }
    }

    pub fn new(rules: Vec<Rule>) -> Result<Self, ConfigError> {
        let last = rules.len().checked_sub(1).ok_or(ConfigError::MissingFinalRule)?;
        if let Some(pos) = rules.iter().position(|r| r.rule_type() == RuleType::Match) {
            if pos != last {
                return Err(ConfigError::MisplacedFinalRule(pos + 1));
            }
        } else {
            return Err(ConfigError::MissingFinalRule);
        }
        Ok(Self { rules })
    }

    /// 按配置中的字符串逐条解析
    pub fn parse<S: AsRef<str>>(
        lines: &[S],
        geoip: &Arc<dyn GeoIpDb>,
    ) -> Result<Self, ConfigError> {
        let rules = lines
            .iter()
            .map(|line| Rule::parse(line.as_ref(), geoip))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(rules)
    }

    /// 第一条命中的规则
    ///
    /// 不会触发解析：需要 IP 的规则在 `dst_ip` 为空时直接不命中。
    pub fn match_metadata(&self, metadata: &Metadata) -> Result<&Rule, TunnelError> {
        for rule in &self.rules {
            if rule.matches(metadata) {
                debug!("{} 命中规则 {} -> {}", metadata, rule, rule.target());
                return Ok(rule);
            }
        }
        Err(TunnelError::NoRuleMatched(metadata.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
