use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::cipher::{Crypter, SsrCipher};
use super::obfs::Obfs;
use super::protocol::Protocol;

const READ_CHUNK: usize = 16 * 1024;

/// 写方向：protocol → 加密（首包带 IV）→ obfs
/// 读方向：obfs → 解密（首包取服务端 IV）→ protocol
pub struct SsrCodec {
    cipher: SsrCipher,
    iv: Vec<u8>,
    iv_sent: bool,
    encryptor: Crypter,
    decryptor: Option<Crypter>,
    server_iv: Vec<u8>,
    obfs: Obfs,
    protocol: Protocol,
}

impl SsrCodec {
    pub fn new(cipher: SsrCipher, iv: Vec<u8>, obfs: Obfs, protocol: Protocol) -> io::Result<Self> {
        let encryptor = cipher.encryptor(&iv).map_err(key_error)?;
        Ok(Self {
            cipher,
            iv,
            iv_sent: false,
            encryptor,
            decryptor: None,
            server_iv: Vec::new(),
            obfs,
            protocol,
        })
    }

    pub fn encode(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut payload = self.protocol.pre_encrypt(data)?;
        self.encryptor.apply(&mut payload);
        if !self.iv_sent {
            self.iv_sent = true;
            let mut with_iv = Vec::with_capacity(self.iv.len() + payload.len());
            with_iv.extend_from_slice(&self.iv);
            with_iv.extend_from_slice(&payload);
            payload = with_iv;
        }
        Ok(self.obfs.encode(payload))
    }

    pub fn decode(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut payload = self.obfs.decode(data)?;

        if self.decryptor.is_none() {
            let iv_len = self.cipher.iv_len();
            let need = iv_len - self.server_iv.len();
            let take = need.min(payload.len());
            self.server_iv.extend(payload.drain(..take));
            if self.server_iv.len() < iv_len {
                return Ok(Vec::new());
            }
            self.decryptor = Some(self.cipher.decryptor(&self.server_iv).map_err(key_error)?);
        }

        if payload.is_empty() {
            return Ok(payload);
        }
        if let Some(decryptor) = self.decryptor.as_mut() {
            decryptor.apply(&mut payload);
        }
        self.protocol.post_decrypt(&payload)
    }
}

fn key_error<E: std::fmt::Display>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("加密参数错误: {}", e))
}

/// 在任意字节流上叠加 SSR 编解码
pub struct SsrStream<S> {
    inner: S,
    codec: SsrCodec,
    write_buf: Vec<u8>,
    write_pos: usize,
    read_buf: Vec<u8>,
    read_pos: usize,
    scratch: Vec<u8>,
    eof: bool,
}

impl<S> SsrStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(inner: S, codec: SsrCodec) -> Self {
        Self {
            inner,
            codec,
            write_buf: Vec::new(),
            write_pos: 0,
            read_buf: Vec::new(),
            read_pos: 0,
            scratch: vec![0u8; READ_CHUNK],
            eof: false,
        }
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.write_pos < self.write_buf.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.write_buf[self.write_pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_pos += n;
        }
        self.write_buf.clear();
        self.write_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncRead for SsrStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.read_pos < this.read_buf.len() {
                let n = buf.remaining().min(this.read_buf.len() - this.read_pos);
                buf.put_slice(&this.read_buf[this.read_pos..this.read_pos + n]);
                this.read_pos += n;
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }

            let mut raw = ReadBuf::new(&mut this.scratch);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut raw))?;
            let n = raw.filled().len();
            if n == 0 {
                this.eof = true;
                continue;
            }
            this.read_buf = this.codec.decode(&this.scratch[..n])?;
            this.read_pos = 0;
        }
    }
}

impl<S> AsyncWrite for SsrStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        this.write_buf = this.codec.encode(buf)?;
        this.write_pos = 0;
        // 已经编码的数据必须完整写出，这里尽量先写，剩下的留给下次 poll
        match this.poll_drain(cx) {
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            _ => Poll::Ready(Ok(buf.len())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
