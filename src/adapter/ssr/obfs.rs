use std::fmt::Write as _;
use std::io;

use rand::Rng;

use super::ServerInfo;
use crate::error::ConfigError;

/// 收到的 HTTP 应答头超过这个长度仍未结束就视为错误
const MAX_RESPONSE_HEAD: usize = 64 * 1024;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:115.0) Gecko/20100101 Firefox/115.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/119.0",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObfsKind {
    Plain,
    HttpSimple,
    HttpPost,
}

impl ObfsKind {
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name {
            "" | "plain" => Ok(ObfsKind::Plain),
            "http_simple" => Ok(ObfsKind::HttpSimple),
            "http_post" => Ok(ObfsKind::HttpPost),
            _ => Err(ConfigError::UnknownObfs(name.to_string())),
        }
    }
}

/// 同一个出站的所有连接共享的混淆数据
#[derive(Debug)]
pub struct ObfsShared {
    pub user_agent: &'static str,
}

impl ObfsShared {
    pub fn new() -> Self {
        let idx = rand::thread_rng().gen_range(0..USER_AGENTS.len());
        Self {
            user_agent: USER_AGENTS[idx],
        }
    }
}

impl Default for ObfsShared {
    fn default() -> Self {
        Self::new()
    }
}

pub enum Obfs {
    Plain,
    Http(HttpObfs),
}

impl Obfs {
    pub fn new(kind: ObfsKind, info: ServerInfo, shared: &ObfsShared) -> Self {
        match kind {
            ObfsKind::Plain => Obfs::Plain,
            ObfsKind::HttpSimple => Obfs::Http(HttpObfs::new(false, info, shared.user_agent)),
            ObfsKind::HttpPost => Obfs::Http(HttpObfs::new(true, info, shared.user_agent)),
        }
    }

    pub fn encode(&mut self, data: Vec<u8>) -> Vec<u8> {
        match self {
            Obfs::Plain => data,
            Obfs::Http(http) => http.encode(data),
        }
    }

    /// 返回去掉混淆后的数据，可能为空（应答头还没收完）
    pub fn decode(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Obfs::Plain => Ok(data.to_vec()),
            Obfs::Http(http) => http.decode(data),
        }
    }
}

/// http_simple / http_post：第一个包伪装成 HTTP 请求，
/// 请求头部分字节以 %xx 形式放进 URL
pub struct HttpObfs {
    post: bool,
    info: ServerInfo,
    user_agent: &'static str,
    header_sent: bool,
    header_received: bool,
    pending: Vec<u8>,
}

impl HttpObfs {
    fn new(post: bool, info: ServerInfo, user_agent: &'static str) -> Self {
        Self {
            post,
            info,
            user_agent,
            header_sent: false,
            header_received: false,
            pending: Vec::new(),
        }
    }

    fn encode(&mut self, data: Vec<u8>) -> Vec<u8> {
        if self.header_sent {
            return data;
        }
        self.header_sent = true;

        let mut rng = rand::thread_rng();
        let head_size = self.info.iv_len + self.info.head_len;
        let head_len = if data.len() > head_size + 64 {
            head_size + rng.gen_range(0..64)
        } else {
            data.len()
        };

        let (host, custom_head) = self.pick_host(&mut rng);
        let method = if self.post { "POST" } else { "GET" };

        let mut out = String::with_capacity(head_len * 3 + 512);
        out.push_str(method);
        out.push_str(" /");
        for b in &data[..head_len] {
            let _ = write!(out, "%{:02x}", b);
        }
        out.push_str(" HTTP/1.1\r\n");
        if self.info.port == 80 {
            let _ = write!(out, "Host: {}\r\n", host);
        } else {
            let _ = write!(out, "Host: {}:{}\r\n", host, self.info.port);
        }

        match custom_head {
            Some(custom) => {
                out.push_str(&custom.replace("\\n", "\r\n"));
                out.push_str("\r\n\r\n");
            }
            None => {
                let _ = write!(out, "User-Agent: {}\r\n", self.user_agent);
                out.push_str("Accept: text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8\r\n");
                out.push_str("Accept-Language: en-US,en;q=0.8\r\n");
                out.push_str("Accept-Encoding: gzip, deflate\r\n");
                if self.post {
                    let _ = write!(
                        out,
                        "Content-Type: multipart/form-data; boundary={}\r\n",
                        boundary(&mut rng)
                    );
                }
                out.push_str("DNT: 1\r\n");
                out.push_str("Connection: keep-alive\r\n\r\n");
            }
        }

        let mut encoded = out.into_bytes();
        encoded.extend_from_slice(&data[head_len..]);
        encoded
    }

    /// 参数格式：`host1,host2#自定义头`
    fn pick_host<R: Rng>(&self, rng: &mut R) -> (String, Option<String>) {
        let param = self.info.param.as_str();
        if param.is_empty() {
            return (self.info.host.clone(), None);
        }
        let (hosts, custom) = match param.split_once('#') {
            Some((hosts, custom)) => (hosts, Some(custom.to_string())),
            None => (param, None),
        };
        let candidates: Vec<&str> = hosts
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .collect();
        let host = if candidates.is_empty() {
            self.info.host.clone()
        } else {
            candidates[rng.gen_range(0..candidates.len())].to_string()
        };
        (host, custom)
    }

    fn decode(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        if self.header_received {
            return Ok(data.to_vec());
        }
        self.pending.extend_from_slice(data);
        match find_header_end(&self.pending) {
            Some(pos) => {
                self.header_received = true;
                let body = self.pending.split_off(pos + 4);
                self.pending = Vec::new();
                Ok(body)
            }
            None if self.pending.len() > MAX_RESPONSE_HEAD => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "http 混淆应答头过长",
            )),
            None => Ok(Vec::new()),
        }
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn boundary<R: Rng>(rng: &mut R) -> String {
    const SET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    (0..32)
        .map(|_| SET[rng.gen_range(0..SET.len())] as char)
        .collect()
}
