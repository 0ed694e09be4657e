mod resolver;
mod server;
mod upstream;

pub use resolver::{FallbackFilter, FallbackStrategy, Resolver, ResolverConfig};
pub use server::DnsServer;
pub use upstream::{parse_upstream, TcpUpstream, UdpUpstream, Upstream};

use std::fmt;
use std::str::FromStr;

/// 增强模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnhancedMode {
    #[default]
    Normal,
    FakeIp,
    RedirHost,
}

impl FromStr for EnhancedMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "normal" => Ok(EnhancedMode::Normal),
            "fake-ip" => Ok(EnhancedMode::FakeIp),
            "redir-host" => Ok(EnhancedMode::RedirHost),
            other => Err(format!("未知的 enhanced-mode `{}`", other)),
        }
    }
}

impl fmt::Display for EnhancedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnhancedMode::Normal => f.write_str("normal"),
            EnhancedMode::FakeIp => f.write_str("fake-ip"),
            EnhancedMode::RedirHost => f.write_str("redir-host"),
        }
    }
}
