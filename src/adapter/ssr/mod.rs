//! ShadowsocksR 出站：流加密 + obfs 插件 + protocol 插件

mod cipher;
mod obfs;
mod protocol;
mod stream;

pub use cipher::{CipherKind, SsrCipher};
pub use obfs::ObfsKind;
pub use protocol::ProtocolKind;
pub use stream::{SsrCodec, SsrStream};

use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info};
use tokio::io::AsyncWriteExt;

use super::{connect_tcp, BoxedStream, DialContext};
use crate::error::{ConfigError, DialError};
use crate::metadata::Metadata;
use crate::socks_addr::Address;

use obfs::{Obfs, ObfsShared};
use protocol::{Protocol, SharedAuth};

const TCP_MSS: usize = 1460;
/// 目标地址长度未知时使用的默认头部长度
const DEFAULT_HEAD_LEN: usize = 30;

#[derive(Debug, Clone, Default)]
pub struct ShadowsocksROption {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub password: String,
    pub cipher: String,
    pub protocol: String,
    pub protocol_param: String,
    pub obfs: String,
    pub obfs_param: String,
}

/// 插件需要的服务端信息
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub host: String,
    pub port: u16,
    pub tcp_mss: usize,
    pub param: String,
    /// 客户端 IV
    pub iv: Vec<u8>,
    pub key: Vec<u8>,
    pub iv_len: usize,
    /// 首包中目标地址的长度
    pub head_len: usize,
}

/// 插件状态，第一次拨号成功后保存，之后所有连接共享
#[derive(Clone)]
struct SharedData {
    obfs: Arc<ObfsShared>,
    protocol: SharedAuth,
}

pub struct ShadowsocksR {
    name: String,
    server: Address,
    cipher: SsrCipher,
    obfs: ObfsKind,
    obfs_param: String,
    protocol: ProtocolKind,
    protocol_param: String,
    shared: Mutex<Option<SharedData>>,
}

impl ShadowsocksR {
    /// 加密方式和插件名在这里校验，未知名称直接拒绝整份配置
    pub fn new(option: ShadowsocksROption) -> Result<Self, ConfigError> {
        let cipher = SsrCipher::new(&option.cipher, &option.password)?;
        let obfs = ObfsKind::from_name(strip_compatible(&option.obfs))?;
        let protocol = ProtocolKind::from_name(strip_compatible(&option.protocol))?;

        let server = match option.server.parse() {
            Ok(ip) => Address::Ip(std::net::SocketAddr::new(ip, option.port)),
            Err(_) if !option.server.is_empty() => Address::Domain(option.server.clone(), option.port),
            Err(_) => return Err(ConfigError::InvalidAddress(option.server.clone())),
        };

        Ok(Self {
            name: option.name,
            server,
            cipher,
            obfs,
            obfs_param: option.obfs_param,
            protocol,
            protocol_param: option.protocol_param,
            shared: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn dial(&self, ctx: &DialContext, metadata: &Metadata) -> Result<BoxedStream, DialError> {
        let target = metadata.remote_address();
        let server = ctx.resolve_address(&self.server).await?;
        let conn = connect_tcp(server, ctx.connect_timeout).await?;

        // 目标地址序列化失败时 conn 随之释放
        let head = target
            .to_bytes()
            .map_err(|e| DialError::handshake(format!("无法编码目标地址 {}: {}", target, e)))?;

        let shared = self.shared_data();
        let iv = self.cipher.random_iv();
        let info = ServerInfo {
            host: server.ip().to_string(),
            port: server.port(),
            tcp_mss: TCP_MSS,
            param: String::new(),
            iv: iv.clone(),
            key: self.cipher.key().to_vec(),
            iv_len: self.cipher.iv_len(),
            head_len: DEFAULT_HEAD_LEN,
        };

        let obfs = Obfs::new(
            self.obfs,
            ServerInfo {
                param: self.obfs_param.clone(),
                head_len: head_size(&head),
                ..info.clone()
            },
            &shared.obfs,
        );
        let protocol = Protocol::new(
            self.protocol,
            ServerInfo {
                param: self.protocol_param.clone(),
                ..info
            },
            Arc::clone(&shared.protocol),
        );
        let codec = SsrCodec::new(self.cipher.clone(), iv, obfs, protocol)?;
        let mut stream = SsrStream::new(conn, codec);

        stream.write_all(&head).await?;
        stream.flush().await?;
        self.commit_shared(shared);

        debug!("SSR {} -> {} 已发送目标地址", self.name, target);
        info!("✅ 通过 SSR {} 连接到 {}", self.name, target);
        Ok(Box::new(stream))
    }

    /// 已有共享状态时复用，否则给本次拨号准备一份新的，成功后才保存
    fn shared_data(&self) -> SharedData {
        let guard = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(data) => data.clone(),
            None => SharedData {
                obfs: Arc::new(ObfsShared::new()),
                protocol: SharedAuth::default(),
            },
        }
    }

    fn commit_shared(&self, data: SharedData) {
        let mut guard = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(data);
        }
    }
}

impl std::fmt::Debug for ShadowsocksR {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowsocksR")
            .field("name", &self.name)
            .field("server", &self.server)
            .field("cipher", &self.cipher.kind())
            .field("obfs", &self.obfs)
            .field("protocol", &self.protocol)
            .finish()
    }
}

fn strip_compatible(name: &str) -> &str {
    name.strip_suffix("_compatible").unwrap_or(name)
}

/// 按地址类型计算头部长度
fn head_size(head: &[u8]) -> usize {
    if head.len() < 2 {
        return DEFAULT_HEAD_LEN;
    }
    match head[0] & 0x07 {
        1 => 7,
        4 => 19,
        3 => 4 + head[1] as usize,
        _ => DEFAULT_HEAD_LEN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{InboundType, Network};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn option(server: &str, port: u16) -> ShadowsocksROption {
        ShadowsocksROption {
            name: "ssr".to_string(),
            server: server.to_string(),
            port,
            password: "secret".to_string(),
            cipher: "aes-128-cfb".to_string(),
            protocol: "origin".to_string(),
            obfs: "plain".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_new_validates_names() {
        let mut opt = option("127.0.0.1", 8388);
        opt.obfs = "http_simple_compatible".to_string();
        opt.protocol = "auth_aes128_md5_compatible".to_string();
        let ssr = ShadowsocksR::new(opt).unwrap();
        assert_eq!(ssr.obfs, ObfsKind::HttpSimple);
        assert_eq!(ssr.protocol, ProtocolKind::AuthAes128Md5);

        let mut opt = option("127.0.0.1", 8388);
        opt.cipher = "rc4".to_string();
        assert!(matches!(ShadowsocksR::new(opt), Err(ConfigError::UnknownCipher(_))));

        let mut opt = option("127.0.0.1", 8388);
        opt.obfs = "tls1.2_ticket_auth".to_string();
        assert!(matches!(ShadowsocksR::new(opt), Err(ConfigError::UnknownObfs(_))));

        let mut opt = option("127.0.0.1", 8388);
        opt.protocol = "auth_chain_a".to_string();
        assert!(matches!(ShadowsocksR::new(opt), Err(ConfigError::UnknownProtocol(_))));
    }

    #[test]
    fn test_head_size() {
        assert_eq!(head_size(&[1, 1, 2, 3, 4, 0, 80]), 7);
        assert_eq!(head_size(&[3, 11]), 15);
        assert_eq!(head_size(&[4; 19]), 19);
        assert_eq!(head_size(&[]), DEFAULT_HEAD_LEN);
    }

    #[tokio::test]
    async fn test_dial_sends_encrypted_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let ssr = ShadowsocksR::new(option("127.0.0.1", port)).unwrap();

        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut wire = vec![0u8; 16 + 1 + 1 + 11 + 2];
            conn.read_exact(&mut wire).await.unwrap();
            wire
        });

        let ctx = DialContext::new(None, Duration::from_secs(2));
        let meta = Metadata::new(
            Network::Tcp,
            InboundType::Socks,
            Address::Domain("example.com".to_string(), 443),
            None,
        );
        let _stream = ssr.dial(&ctx, &meta).await.unwrap();

        let mut wire = server.await.unwrap();
        let cipher = SsrCipher::new("aes-128-cfb", "secret").unwrap();
        let (iv, body) = wire.split_at_mut(16);
        cipher.decryptor(iv).unwrap().apply(body);
        assert_eq!(body[0], 3);
        assert_eq!(body[1], 11);
        assert_eq!(&body[2..13], b"example.com");
        assert_eq!(&body[13..], &443u16.to_be_bytes());

        assert!(ssr.shared.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_shared_data_saved_after_successful_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let ssr = ShadowsocksR::new(option("127.0.0.1", port)).unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((conn, _)) = listener.accept().await {
                held.push(conn);
            }
        });

        let ctx = DialContext::new(None, Duration::from_secs(2));
        let meta = |host: String| Metadata::new(Network::Tcp, InboundType::Socks, Address::Domain(host, 443), None);

        // TCP 已连上，但目标地址写不出去
        let long = format!("{}.com", "a".repeat(300));
        assert!(ssr.dial(&ctx, &meta(long)).await.is_err());
        assert!(ssr.shared.lock().unwrap().is_none());

        let _first = ssr.dial(&ctx, &meta("example.com".to_string())).await.unwrap();
        let saved = ssr.shared.lock().unwrap().clone().unwrap();

        let _second = ssr.dial(&ctx, &meta("example.org".to_string())).await.unwrap();
        let again = ssr.shared.lock().unwrap().clone().unwrap();
        assert!(Arc::ptr_eq(&saved.obfs, &again.obfs));
        assert!(Arc::ptr_eq(&saved.protocol, &again.protocol));
    }

    #[tokio::test]
    async fn test_dial_failure_keeps_shared_empty() {
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let ssr = ShadowsocksR::new(option("127.0.0.1", addr.port())).unwrap();
        let ctx = DialContext::new(None, Duration::from_secs(2));
        let meta = Metadata::new(Network::Tcp, InboundType::Socks, Address::Ip(addr), None);
        assert!(ssr.dial(&ctx, &meta).await.is_err());
        assert!(ssr.shared.lock().unwrap().is_none());
    }
}
