use aes::cipher::{InvalidLength, KeyIvInit, StreamCipher};
use aes::{Aes128, Aes192, Aes256};
use cfb_mode::{BufDecryptor, BufEncryptor};
use chacha20::ChaCha20;
use ctr::Ctr128BE;
use md5::{Digest, Md5};
use rand::RngCore;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    None,
    Aes128Ctr,
    Aes192Ctr,
    Aes256Ctr,
    Aes128Cfb,
    Aes192Cfb,
    Aes256Cfb,
    Chacha20Ietf,
}

impl CipherKind {
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        let kind = match name.to_ascii_lowercase().as_str() {
            "none" | "dummy" => CipherKind::None,
            "aes-128-ctr" => CipherKind::Aes128Ctr,
            "aes-192-ctr" => CipherKind::Aes192Ctr,
            "aes-256-ctr" => CipherKind::Aes256Ctr,
            "aes-128-cfb" => CipherKind::Aes128Cfb,
            "aes-192-cfb" => CipherKind::Aes192Cfb,
            "aes-256-cfb" => CipherKind::Aes256Cfb,
            "chacha20-ietf" => CipherKind::Chacha20Ietf,
            _ => return Err(ConfigError::UnknownCipher(name.to_string())),
        };
        Ok(kind)
    }

    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::None | CipherKind::Aes128Ctr | CipherKind::Aes128Cfb => 16,
            CipherKind::Aes192Ctr | CipherKind::Aes192Cfb => 24,
            CipherKind::Aes256Ctr | CipherKind::Aes256Cfb | CipherKind::Chacha20Ietf => 32,
        }
    }

    pub fn iv_len(&self) -> usize {
        match self {
            CipherKind::None => 0,
            CipherKind::Chacha20Ietf => 12,
            _ => 16,
        }
    }
}

/// OpenSSL 的 EVP_BytesToKey（MD5，一轮迭代，无盐）
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password);
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }
    key.truncate(key_len);
    key
}

/// 流加密的参数：算法 + 由密码派生的密钥
#[derive(Debug, Clone)]
pub struct SsrCipher {
    kind: CipherKind,
    key: Vec<u8>,
}

impl SsrCipher {
    pub fn new(name: &str, password: &str) -> Result<Self, ConfigError> {
        let kind = CipherKind::from_name(name)?;
        let key = evp_bytes_to_key(password.as_bytes(), kind.key_len());
        Ok(Self { kind, key })
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn iv_len(&self) -> usize {
        self.kind.iv_len()
    }

    pub fn random_iv(&self) -> Vec<u8> {
        let mut iv = vec![0u8; self.iv_len()];
        rand::thread_rng().fill_bytes(&mut iv);
        iv
    }

    pub fn encryptor(&self, iv: &[u8]) -> Result<Crypter, InvalidLength> {
        let key = self.key.as_slice();
        let crypter = match self.kind {
            CipherKind::None => Crypter::Plain,
            CipherKind::Aes128Ctr => Crypter::Aes128Ctr(Ctr128BE::new_from_slices(key, iv)?),
            CipherKind::Aes192Ctr => Crypter::Aes192Ctr(Ctr128BE::new_from_slices(key, iv)?),
            CipherKind::Aes256Ctr => Crypter::Aes256Ctr(Ctr128BE::new_from_slices(key, iv)?),
            CipherKind::Aes128Cfb => Crypter::Aes128CfbEnc(BufEncryptor::new_from_slices(key, iv)?),
            CipherKind::Aes192Cfb => Crypter::Aes192CfbEnc(BufEncryptor::new_from_slices(key, iv)?),
            CipherKind::Aes256Cfb => Crypter::Aes256CfbEnc(BufEncryptor::new_from_slices(key, iv)?),
            CipherKind::Chacha20Ietf => Crypter::ChaCha20(ChaCha20::new_from_slices(key, iv)?),
        };
        Ok(crypter)
    }

    pub fn decryptor(&self, iv: &[u8]) -> Result<Crypter, InvalidLength> {
        let key = self.key.as_slice();
        let crypter = match self.kind {
            CipherKind::Aes128Cfb => Crypter::Aes128CfbDec(BufDecryptor::new_from_slices(key, iv)?),
            CipherKind::Aes192Cfb => Crypter::Aes192CfbDec(BufDecryptor::new_from_slices(key, iv)?),
            CipherKind::Aes256Cfb => Crypter::Aes256CfbDec(BufDecryptor::new_from_slices(key, iv)?),
            // CTR 和 ChaCha20 加解密对称
            _ => return self.encryptor(iv),
        };
        Ok(crypter)
    }
}

/// 单方向的加密/解密状态
pub enum Crypter {
    Plain,
    Aes128Ctr(Ctr128BE<Aes128>),
    Aes192Ctr(Ctr128BE<Aes192>),
    Aes256Ctr(Ctr128BE<Aes256>),
    Aes128CfbEnc(BufEncryptor<Aes128>),
    Aes192CfbEnc(BufEncryptor<Aes192>),
    Aes256CfbEnc(BufEncryptor<Aes256>),
    Aes128CfbDec(BufDecryptor<Aes128>),
    Aes192CfbDec(BufDecryptor<Aes192>),
    Aes256CfbDec(BufDecryptor<Aes256>),
    ChaCha20(ChaCha20),
}

impl Crypter {
    pub fn apply(&mut self, data: &mut [u8]) {
        match self {
            Crypter::Plain => {}
            Crypter::Aes128Ctr(c) => c.apply_keystream(data),
            Crypter::Aes192Ctr(c) => c.apply_keystream(data),
            Crypter::Aes256Ctr(c) => c.apply_keystream(data),
            Crypter::Aes128CfbEnc(c) => c.encrypt(data),
            Crypter::Aes192CfbEnc(c) => c.encrypt(data),
            Crypter::Aes256CfbEnc(c) => c.encrypt(data),
            Crypter::Aes128CfbDec(c) => c.decrypt(data),
            Crypter::Aes192CfbDec(c) => c.decrypt(data),
            Crypter::Aes256CfbDec(c) => c.decrypt(data),
            Crypter::ChaCha20(c) => c.apply_keystream(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evp_bytes_to_key() {
        // md5("foobar") = 3858f62230ac3c915f300c664312c63f
        let key = evp_bytes_to_key(b"foobar", 16);
        assert_eq!(
            key,
            vec![
                0x38, 0x58, 0xf6, 0x22, 0x30, 0xac, 0x3c, 0x91, 0x5f, 0x30, 0x0c, 0x66, 0x43,
                0x12, 0xc6, 0x3f
            ]
        );

        // 长密钥的前 16 字节与短密钥相同
        let long = evp_bytes_to_key(b"foobar", 32);
        assert_eq!(long.len(), 32);
        assert_eq!(&long[..16], key.as_slice());
    }

    #[test]
    fn test_unknown_cipher() {
        assert!(matches!(
            SsrCipher::new("rc4-md5-6", "pwd"),
            Err(ConfigError::UnknownCipher(_))
        ));
        assert_eq!(CipherKind::from_name("AES-256-CFB").unwrap(), CipherKind::Aes256Cfb);
    }

    #[test]
    fn test_cfb_chunked_decrypt() {
        let cipher = SsrCipher::new("aes-128-cfb", "password").unwrap();
        let iv = cipher.random_iv();
        let plain = b"the quick brown fox jumps over the lazy dog".to_vec();

        let mut data = plain.clone();
        cipher.encryptor(&iv).unwrap().apply(&mut data);
        assert_ne!(data, plain);

        // 按任意边界分片解密结果不变
        let mut dec = cipher.decryptor(&iv).unwrap();
        let (a, b) = data.split_at_mut(7);
        dec.apply(a);
        dec.apply(b);
        assert_eq!(data, plain);
    }

    #[test]
    fn test_iv_lengths() {
        for (name, iv_len) in [("aes-128-ctr", 16), ("chacha20-ietf", 12), ("none", 0)] {
            let cipher = SsrCipher::new(name, "password").unwrap();
            assert_eq!(cipher.random_iv().len(), iv_len);
            let iv = cipher.random_iv();
            let mut data = b"payload".to_vec();
            cipher.encryptor(&iv).unwrap().apply(&mut data);
            cipher.decryptor(&iv).unwrap().apply(&mut data);
            assert_eq!(&data, b"payload");
        }
    }
}
