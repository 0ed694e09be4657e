//! rule-tunnel：按规则分流的本地代理
//!
//! 入站（SOCKS5 / REDIR）把连接交给 [`tunnel::Tunnel`]，由规则选出出站后转发。

pub mod adapter;
pub mod config;
pub mod dns;
pub mod error;
pub mod executor;
pub mod fakeip;
pub mod geoip;
pub mod inbound;
pub mod ip_matcher;
pub mod logger;
pub mod metadata;
pub mod metrics;
pub mod pool;
pub mod proxy;
pub mod rules;
pub mod socks_addr;
pub mod trie;
pub mod tunnel;

pub use config::{load_config, parse_config, Config};
pub use error::{ConfigError, DialError, ResolveError, TunnelError};
pub use executor::Executor;
pub use tunnel::Tunnel;
