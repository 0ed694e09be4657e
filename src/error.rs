use std::io;
use std::net::IpAddr;

use thiserror::Error;

use crate::fakeip::FakeIpError;
use crate::trie::TrieError;

/// 配置错误：加载或热重载时出现，出现后拒绝整份配置
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("无效的规则 `{rule}`: {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("规则集缺少 MATCH 规则")]
    MissingFinalRule,

    #[error("MATCH 规则必须位于规则集末尾（当前位于第 {0} 条）")]
    MisplacedFinalRule(usize),

    #[error("无效的 CIDR `{0}`")]
    InvalidCidr(String),

    #[error("无效的域名 `{0}`")]
    InvalidDomain(String),

    #[error("无效的地址 `{0}`")]
    InvalidAddress(String),

    #[error("引用了不存在的代理 `{0}`")]
    UnknownProxy(String),

    #[error("代理名称重复 `{0}`")]
    DuplicateProxy(String),

    #[error("代理组 `{group}` 无效: {reason}")]
    InvalidGroup { group: String, reason: String },

    #[error("不支持的加密方式 `{0}`")]
    UnknownCipher(String),

    #[error("不支持的混淆插件 `{0}`")]
    UnknownObfs(String),

    #[error("不支持的协议插件 `{0}`")]
    UnknownProtocol(String),

    #[error("不支持的代理类型 `{0}`")]
    UnknownProxyType(String),

    #[error("DNS 配置无效: {0}")]
    InvalidDns(String),

    #[error("无效的认证用户 `{0}`，格式应为 user:pass")]
    InvalidUser(String),

    #[error("{0}")]
    Trie(#[from] TrieError),

    #[error("配置解析失败: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn invalid_rule(rule: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidRule {
            rule: rule.to_string(),
            reason: reason.into(),
        }
    }
}

/// 域名解析错误，按连接处理
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("DNS 查询超时: {0}")]
    Timeout(String),

    #[error("没有可用的解析结果: {0}")]
    NoAnswer(String),

    #[error("{host} 的解析结果 {ip} 被 fallback-filter 过滤")]
    Filtered { host: String, ip: IpAddr },

    #[error("{0}")]
    FakeIp(#[from] FakeIpError),

    #[error("DNS 未启用")]
    Disabled,

    #[error("DNS 报文错误: {0}")]
    Proto(#[from] hickory_proto::error::ProtoError),

    #[error("DNS I/O 错误: {0}")]
    Io(#[from] io::Error),
}

/// 出站连接错误，按连接处理，不会自动换代理重试
#[derive(Debug, Error)]
pub enum DialError {
    #[error("连接 {addr} 失败: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("连接 {0} 超时")]
    Timeout(String),

    #[error("握手失败: {0}")]
    Handshake(String),

    #[error("远端拒绝连接: {0}")]
    Refused(String),

    #[error("出站 `{0}` 不支持 UDP")]
    UdpUnsupported(String),

    #[error("连接被 REJECT 拒绝")]
    Rejected,

    #[error("无法解析目标地址: {0}")]
    Resolve(#[from] ResolveError),

    #[error("I/O 错误: {0}")]
    Io(#[from] io::Error),
}

impl DialError {
    pub fn handshake(reason: impl Into<String>) -> Self {
        DialError::Handshake(reason.into())
    }
}

/// 调度层错误
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("没有匹配的规则: {0}")]
    NoRuleMatched(String),

    #[error("代理 `{0}` 不存在")]
    ProxyNotFound(String),

    #[error("{0}")]
    Resolve(#[from] ResolveError),

    #[error("{0}")]
    Dial(#[from] DialError),

    #[error("转发中断: {0}")]
    Relay(#[from] io::Error),
}
