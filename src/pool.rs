use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

/// UDP 报文缓冲区大小
pub const UDP_BUFFER_SIZE: usize = 64 * 1024;

/// 缓冲区池
///
/// 取出的 `PooledBuf` 在 drop 时自动归还，任何退出路径都不会泄漏。
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    buf_size: usize,
    max_cached: usize,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_cached: usize) -> Arc<Self> {
        Arc::new(Self {
            buffers: Mutex::new(Vec::new()),
            buf_size,
            max_cached,
        })
    }

    pub fn get(self: &Arc<Self>) -> PooledBuf {
        let buf = self
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buf_size]);
        let len = buf.len();
        PooledBuf {
            buf: Some(buf),
            start: 0,
            end: len,
            pool: Arc::clone(self),
        }
    }

    /// 当前池中空闲的缓冲区数量
    pub fn available(&self) -> usize {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn put(&self, buf: Vec<u8>) {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        if buffers.len() < self.max_cached {
            buffers.push(buf);
        }
    }
}

/// 从池中借出的缓冲区
///
/// 解引用得到的是 `start..end` 这一段有效数据；新取出时是整个缓冲区。
#[derive(Debug)]
pub struct PooledBuf {
    buf: Option<Vec<u8>>,
    start: usize,
    end: usize,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    /// 把有效数据限定到 `start..end`（相对整个缓冲区）
    pub fn set_range(&mut self, start: usize, end: usize) {
        let cap = self.buf.as_ref().map_or(0, Vec::len);
        self.end = end.min(cap);
        self.start = start.min(self.end);
    }

    /// 整个底层缓冲区，用于接收数据
    pub fn full_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.buf {
            Some(buf) => &buf[self.start..self.end],
            None => &[],
        }
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        let (start, end) = (self.start, self.end);
        match &mut self.buf {
            Some(buf) => &mut buf[start..end],
            None => &mut [],
        }
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}
