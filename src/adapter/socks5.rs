use std::future::Future;
use std::io;
use std::time::Duration;

use log::{debug, info};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use super::{connect_tcp, BoxedStream, DialContext};
use crate::error::DialError;
use crate::metadata::Metadata;
use crate::socks_addr::Address;

/// SOCKS5 出站配置
#[derive(Debug, Clone)]
pub struct Socks5Option {
    pub name: String,
    /// SOCKS5 服务器地址（可以是域名）
    pub server: Address,
    /// 用户名（可选）
    pub username: Option<String>,
    /// 密码（可选）
    pub password: Option<String>,
}

/// SOCKS5 出站，只支持 CONNECT
#[derive(Debug)]
pub struct Socks5 {
    option: Socks5Option,
}

impl Socks5 {
    pub fn new(option: Socks5Option) -> Self {
        Self { option }
    }

    pub fn name(&self) -> &str {
        &self.option.name
    }

    /// 直接把域名交给 SOCKS5 服务器，由服务器端解析
    pub async fn dial(&self, ctx: &DialContext, metadata: &Metadata) -> Result<BoxedStream, DialError> {
        let target = metadata.remote_address();
        info!("通过 SOCKS5 {} 连接到 {}", self.option.server, target);

        // ============ 步骤 1: 连接到 SOCKS5 服务器 ============
        let server = ctx.resolve_address(&self.option.server).await?;
        let mut stream = connect_tcp(server, ctx.connect_timeout).await?;

        // ============ 步骤 2: 握手 + 认证 + CONNECT ============
        let auth = match (&self.option.username, &self.option.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        };
        handshake(&mut stream, &target, auth, ctx.connect_timeout).await?;

        info!("✅ 通过 SOCKS5 成功连接到 {}", target);
        Ok(Box::new(stream))
    }
}

async fn step<T, F>(limit: Duration, what: &str, fut: F) -> Result<T, DialError>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout(limit, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(DialError::handshake(format!("{}失败: {}", what, e))),
        Err(_) => Err(DialError::Timeout(what.to_string())),
    }
}

/// 客户端侧的 SOCKS5 握手
pub(crate) async fn handshake<S>(
    stream: &mut S,
    target: &Address,
    auth: Option<(&str, &str)>,
    limit: Duration,
) -> Result<(), DialError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // 版本识别：
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 1 to 255 |
    // +----+----------+----------+
    // 有用户名密码时用 0x02，否则用无认证 0x00
    let method = if auth.is_some() { 2u8 } else { 0u8 };
    step(limit, "写入 SOCKS5 握手请求", stream.write_all(&[5, 1, method])).await?;

    let mut response = [0u8; 2];
    step(limit, "读取 SOCKS5 握手响应", stream.read_exact(&mut response)).await?;
    if response[0] != 5 {
        return Err(DialError::handshake("无效的 SOCKS5 响应: 版本错误"));
    }
    debug!("SOCKS5 握手成功，选择的认证方法: {}", response[1]);

    match (response[1], auth) {
        (0, _) => {}
        (2, Some((username, password))) => {
            if username.len() > 255 || password.len() > 255 {
                return Err(DialError::handshake("SOCKS5 用户名或密码过长"));
            }
            let mut request = Vec::with_capacity(3 + username.len() + password.len());
            request.push(1u8);
            request.push(username.len() as u8);
            request.extend_from_slice(username.as_bytes());
            request.push(password.len() as u8);
            request.extend_from_slice(password.as_bytes());
            step(limit, "发送认证请求", stream.write_all(&request)).await?;

            let mut auth_response = [0u8; 2];
            step(limit, "读取认证响应", stream.read_exact(&mut auth_response)).await?;
            if auth_response[1] != 0 {
                return Err(DialError::Refused("SOCKS5 认证失败".to_string()));
            }
            debug!("SOCKS5 认证成功");
        }
        (method, _) => {
            return Err(DialError::handshake(format!("不支持的认证方法: {}", method)));
        }
    }

    // 连接请求：
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    let mut request = vec![5u8, 1, 0];
    target
        .write_to(&mut request)
        .map_err(|e| DialError::handshake(e.to_string()))?;
    step(limit, "发送 SOCKS5 连接请求", stream.write_all(&request)).await?;

    let mut response = [0u8; 3];
    step(limit, "读取 SOCKS5 连接响应", stream.read_exact(&mut response)).await?;
    if response[0] != 5 {
        return Err(DialError::handshake("无效的 SOCKS5 响应: 版本错误"));
    }

    match response[1] {
        0 => debug!("SOCKS5 连接成功"),
        code => return Err(DialError::Refused(reply_message(code))),
    }

    // 读掉 BND.ADDR / BND.PORT
    let atyp = step(limit, "读取地址类型", stream.read_u8()).await?;
    let bound = match timeout(limit, Address::read_from(stream, atyp)).await {
        Ok(Ok(addr)) => addr,
        Ok(Err(e)) => return Err(DialError::handshake(format!("读取绑定地址失败: {}", e))),
        Err(_) => return Err(DialError::Timeout("读取绑定地址".to_string())),
    };
    debug!("SOCKS5 连接响应 - 绑定地址: {}", bound);

    Ok(())
}

fn reply_message(code: u8) -> String {
    let reason = match code {
        1 => "一般 SOCKS 服务器故障",
        2 => "连接规则集不允许的连接",
        3 => "网络无法访问",
        4 => "主机无法访问",
        5 => "连接被拒绝",
        6 => "TTL 过期",
        7 => "不支持的命令",
        8 => "不支持的地址类型",
        _ => return format!("SOCKS5: 未知错误代码 {}", code),
    };
    format!("SOCKS5: {}", reason)
}
