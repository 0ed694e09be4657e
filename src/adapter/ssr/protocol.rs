use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::{Rng, RngCore};

use super::cipher::evp_bytes_to_key;
use super::ServerInfo;
use crate::error::ConfigError;

type HmacMd5 = Hmac<Md5>;

const AUTH_SALT: &str = "auth_aes128_md5";
/// 认证包最多携带的数据
const AUTH_DATA_LIMIT: usize = 1200;
/// 后续数据包的最大分片
const PACK_UNIT_SIZE: usize = 4096;
/// 服务端数据帧的最大长度
const MAX_FRAME_LEN: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Origin,
    AuthAes128Md5,
}

impl ProtocolKind {
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name {
            "" | "origin" => Ok(ProtocolKind::Origin),
            "auth_aes128_md5" => Ok(ProtocolKind::AuthAes128Md5),
            _ => Err(ConfigError::UnknownProtocol(name.to_string())),
        }
    }
}

/// 同一个出站的所有连接共享：客户端 ID + 递增的连接 ID
#[derive(Debug, Default)]
pub struct AuthShared {
    client_id: [u8; 4],
    connection_id: u32,
    initialized: bool,
}

impl AuthShared {
    fn next(&mut self) -> ([u8; 4], u32) {
        self.connection_id = self.connection_id.wrapping_add(1);
        if self.connection_id > 0xFF00_0000 {
            self.initialized = false;
        }
        if !self.initialized {
            let mut rng = rand::thread_rng();
            rng.fill_bytes(&mut self.client_id);
            self.connection_id = rng.gen::<u32>() & 0x00FF_FFFF;
            self.initialized = true;
        }
        (self.client_id, self.connection_id)
    }
}

pub type SharedAuth = Arc<Mutex<AuthShared>>;

pub enum Protocol {
    Origin,
    AuthAes128Md5(AuthAes128),
}

impl Protocol {
    pub fn new(kind: ProtocolKind, info: ServerInfo, shared: SharedAuth) -> Self {
        match kind {
            ProtocolKind::Origin => Protocol::Origin,
            ProtocolKind::AuthAes128Md5 => Protocol::AuthAes128Md5(AuthAes128::new(info, shared)),
        }
    }

    pub fn pre_encrypt(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Protocol::Origin => Ok(data.to_vec()),
            Protocol::AuthAes128Md5(auth) => auth.pre_encrypt(data),
        }
    }

    /// 输入可以是任意切片，不完整的帧留到下次
    pub fn post_decrypt(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Protocol::Origin => Ok(data.to_vec()),
            Protocol::AuthAes128Md5(auth) => auth.post_decrypt(data),
        }
    }
}

pub struct AuthAes128 {
    info: ServerInfo,
    shared: SharedAuth,
    user_key: Vec<u8>,
    uid: [u8; 4],
    header_sent: bool,
    pack_id: u32,
    recv_id: u32,
    recv_buf: Vec<u8>,
}

impl AuthAes128 {
    fn new(info: ServerInfo, shared: SharedAuth) -> Self {
        let mut uid = [0u8; 4];
        let mut user_key = None;

        // 参数格式 `uid:password`，否则使用随机 uid + 加密密钥
        if let Some((id, key)) = info.param.split_once(':') {
            if let Ok(id) = id.trim().parse::<u32>() {
                uid = id.to_le_bytes();
                user_key = Some(Md5::digest(key.as_bytes()).to_vec());
            }
        }
        let user_key = match user_key {
            Some(key) => key,
            None => {
                rand::thread_rng().fill_bytes(&mut uid);
                info.key.clone()
            }
        };

        Self {
            info,
            shared,
            user_key,
            uid,
            header_sent: false,
            pack_id: 1,
            recv_id: 1,
            recv_buf: Vec::new(),
        }
    }

    fn pre_encrypt(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() + 1024);
        let mut rest = data;

        if !rest.is_empty() && !self.header_sent {
            let n = rest.len().min(AUTH_DATA_LIMIT);
            out.extend_from_slice(&self.pack_auth_data(&rest[..n])?);
            self.header_sent = true;
            rest = &rest[n..];
        }
        while !rest.is_empty() {
            let n = rest.len().min(PACK_UNIT_SIZE);
            out.extend_from_slice(&self.pack_data(&rest[..n])?);
            rest = &rest[n..];
        }
        Ok(out)
    }

    /// 认证包：
    /// +------+--------+------------------------+--------+------+------+
    /// | rand | hmac 6 | uid + aes(16) + hmac 4 | random | data | hmac |
    /// +------+--------+------------------------+--------+------+------+
    fn pack_auth_data(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut rng = rand::thread_rng();
        let rand_len: usize = if data.len() > 400 {
            rng.gen_range(0..512)
        } else {
            rng.gen_range(0..1024)
        };
        let data_offset = rand_len + 16 + 4 + 4 + 7;
        let out_len = data_offset + data.len() + 4;

        let (client_id, connection_id) = self
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next();

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        let mut encrypt = [0u8; 24];
        encrypt[0..4].copy_from_slice(&now.to_le_bytes());
        encrypt[4..8].copy_from_slice(&client_id);
        encrypt[8..12].copy_from_slice(&connection_id.to_le_bytes());
        encrypt[12..14].copy_from_slice(&(out_len as u16).to_le_bytes());
        encrypt[14..16].copy_from_slice(&(rand_len as u16).to_le_bytes());

        let aes_key = evp_bytes_to_key(
            format!("{}{}", STANDARD.encode(&self.user_key), AUTH_SALT).as_bytes(),
            16,
        );
        let block_cipher = Aes128::new_from_slice(&aes_key).map_err(invalid_key)?;
        let mut block = aes::Block::clone_from_slice(&encrypt[0..16]);
        block_cipher.encrypt_block(&mut block);
        encrypt[4..20].copy_from_slice(&block);
        encrypt[0..4].copy_from_slice(&self.uid);

        let mut mac_key = self.info.iv.clone();
        mac_key.extend_from_slice(&self.info.key);
        let mac = hmac_md5(&mac_key, &encrypt[0..20])?;
        encrypt[20..24].copy_from_slice(&mac[..4]);

        let mut out = vec![0u8; out_len];
        out[0] = rng.gen();
        let mac = hmac_md5(&mac_key, &out[0..1])?;
        out[1..7].copy_from_slice(&mac[..6]);
        out[7..31].copy_from_slice(&encrypt);
        rng.fill_bytes(&mut out[31..data_offset]);
        out[data_offset..data_offset + data.len()].copy_from_slice(data);

        let mac = hmac_md5(&self.user_key, &out[..out_len - 4])?;
        out[out_len - 4..].copy_from_slice(&mac[..4]);
        Ok(out)
    }

    /// 数据包：
    /// +-----+--------+----------------+------+------+
    /// | len | hmac 2 | rand(含长度)   | data | hmac |
    /// +-----+--------+----------------+------+------+
    fn pack_data(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut rng = rand::thread_rng();
        let mut rand_len = 1usize;
        if data.len() <= AUTH_DATA_LIMIT {
            rand_len += if self.pack_id > 4 {
                rng.gen_range(0..32)
            } else if data.len() > 900 {
                rng.gen_range(0..128)
            } else {
                rng.gen_range(0..512)
            };
        }
        let out_len = rand_len + data.len() + 8;

        let mut out = vec![0u8; out_len];
        out[0..2].copy_from_slice(&(out_len as u16).to_le_bytes());
        let mac = hmac_md5(&self.frame_key(self.pack_id), &out[0..2])?;
        out[2..4].copy_from_slice(&mac[..2]);

        rng.fill_bytes(&mut out[4..4 + rand_len]);
        if rand_len < 128 {
            out[4] = rand_len as u8;
        } else {
            out[4] = 0xFF;
            out[5..7].copy_from_slice(&(rand_len as u16).to_le_bytes());
        }
        out[4 + rand_len..4 + rand_len + data.len()].copy_from_slice(data);
        self.pack_id = self.pack_id.wrapping_add(1);

        let mac = hmac_md5(&self.user_key, &out[..out_len - 4])?;
        out[out_len - 4..].copy_from_slice(&mac[..4]);
        Ok(out)
    }

    fn post_decrypt(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        self.recv_buf.extend_from_slice(data);
        let mut out = Vec::new();
        let mut offset = 0;

        while self.recv_buf.len() - offset > 4 {
            let frame = &self.recv_buf[offset..];
            let mac = hmac_md5(&self.frame_key(self.recv_id), &frame[0..2])?;
            if mac[..2] != frame[2..4] {
                return Err(protocol_error("auth_aes128_md5 长度校验失败"));
            }
            let len = u16::from_le_bytes([frame[0], frame[1]]) as usize;
            if !(8..MAX_FRAME_LEN).contains(&len) {
                return Err(protocol_error("auth_aes128_md5 数据长度错误"));
            }
            if len > frame.len() {
                break;
            }

            let mac = hmac_md5(&self.user_key, &frame[..len - 4])?;
            if mac[..4] != frame[len - 4..len] {
                return Err(protocol_error("auth_aes128_md5 数据校验失败"));
            }
            let pos = if frame[4] < 255 {
                frame[4] as usize + 4
            } else {
                u16::from_le_bytes([frame[5], frame[6]]) as usize + 4
            };
            if pos > len - 4 {
                return Err(protocol_error("auth_aes128_md5 随机填充长度错误"));
            }
            out.extend_from_slice(&frame[pos..len - 4]);
            self.recv_id = self.recv_id.wrapping_add(1);
            offset += len;
        }

        self.recv_buf.drain(..offset);
        Ok(out)
    }

    fn frame_key(&self, id: u32) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.user_key.len() + 4);
        key.extend_from_slice(&self.user_key);
        key.extend_from_slice(&id.to_le_bytes());
        key
    }
}

fn hmac_md5(key: &[u8], data: &[u8]) -> io::Result<[u8; 16]> {
    let mut mac = <HmacMd5 as Mac>::new_from_slice(key).map_err(invalid_key)?;
    mac.update(data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn invalid_key<E: std::fmt::Display>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("密钥长度错误: {}", e))
}

fn protocol_error(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}
