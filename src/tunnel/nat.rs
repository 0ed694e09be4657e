use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::OnceCell;
use tokio::time::Instant;

use crate::adapter::PacketConn;
use crate::error::TunnelError;
use crate::fakeip::FakeIpLease;
use crate::metrics::SessionGuard;
use crate::socks_addr::Address;

/// UDP 会话的键，由入站决定
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NatKey {
    /// SOCKS：一个客户端地址一个会话，目标写在每个报文里
    Client(SocketAddr),
    /// REDIR：客户端地址 + 原始目标
    Flow { client: SocketAddr, target: SocketAddr },
}

impl fmt::Display for NatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NatKey::Client(client) => write!(f, "{}", client),
            NatKey::Flow { client, target } => write!(f, "{} -> {}", client, target),
        }
    }
}

/// 一个 UDP 会话：固定的出站报文通道 + 回包时需要的信息
pub struct NatSession {
    pub conn: Arc<dyn PacketConn>,
    pub adapter: String,
    /// 回包时伪装成的源地址（fake-ip 或透明代理时为原始目标）
    pub spoof_from: Option<SocketAddr>,
    created: Instant,
    last_active_ms: AtomicU64,
    closed: AtomicBool,
    _lease: Option<FakeIpLease>,
    _guard: SessionGuard,
}

impl NatSession {
    pub fn new(
        conn: Arc<dyn PacketConn>,
        adapter: impl Into<String>,
        spoof_from: Option<SocketAddr>,
        lease: Option<FakeIpLease>,
        guard: SessionGuard,
    ) -> Self {
        Self {
            conn,
            adapter: adapter.into(),
            spoof_from,
            created: Instant::now(),
            last_active_ms: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            _lease: lease,
            _guard: guard,
        }
    }

    pub fn touch(&self) {
        let ms = self.created.elapsed().as_millis() as u64;
        self.last_active_ms.store(ms, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_active_ms.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }

    /// 回包任务退出前调用，之后到达的报文会另建会话
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 回包的源地址
    pub fn reply_from(&self, from: SocketAddr) -> SocketAddr {
        self.spoof_from.unwrap_or(from)
    }

    pub async fn send(&self, payload: &[u8], target: &Address) -> std::io::Result<usize> {
        self.touch();
        self.conn.send_to(payload, target).await
    }
}

type Slot = Arc<OnceCell<Arc<NatSession>>>;

/// NAT 表：同一个键并发的首包只会创建一个会话
#[derive(Default)]
pub struct NatTable {
    slots: Mutex<HashMap<NatKey, Slot>>,
}

impl NatTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NatKey, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 取出或创建会话，返回值的第二项表示是否由本次调用创建
    ///
    /// 创建过程不持有表锁；失败时移除占位，下一个报文会重新尝试。
    /// 已关闭但还没移出表的会话会被替换成新会话。
    pub async fn get_or_create<F, Fut>(
        &self,
        key: &NatKey,
        init: F,
    ) -> Result<(Arc<NatSession>, bool), TunnelError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Arc<NatSession>, TunnelError>>,
    {
        loop {
            let slot = Arc::clone(
                self.lock()
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            );

            let mut created = false;
            let result = slot
                .get_or_try_init(|| {
                    created = true;
                    init()
                })
                .await;

            match result {
                Ok(session) if !created && session.is_closed() => {
                    let stale = Arc::clone(session);
                    self.remove_session(key, &stale);
                }
                Ok(session) => return Ok((Arc::clone(session), created)),
                Err(e) => {
                    let mut slots = self.lock();
                    if slots.get(key).map_or(false, |s| Arc::ptr_eq(s, &slot)) && slot.get().is_none() {
                        slots.remove(key);
                    }
                    return Err(e);
                }
            }
        }
    }

    pub fn get(&self, key: &NatKey) -> Option<Arc<NatSession>> {
        self.lock().get(key).and_then(|slot| slot.get().cloned())
    }

    /// 只在表中仍是同一个会话时才移除
    pub fn remove_session(&self, key: &NatKey, session: &Arc<NatSession>) -> bool {
        let mut slots = self.lock();
        let same = slots
            .get(key)
            .and_then(|slot| slot.get())
            .map_or(false, |current| Arc::ptr_eq(current, session));
        if same {
            slots.remove(key);
        }
        same
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use async_trait::async_trait;
    use std::io;
    use std::sync::atomic::AtomicUsize;

    struct NullConn;

    #[async_trait]
    impl PacketConn for NullConn {
        async fn send_to(&self, payload: &[u8], _target: &Address) -> io::Result<usize> {
            Ok(payload.len())
        }

        async fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            std::future::pending().await
        }
    }

    fn session(metrics: &Metrics) -> Arc<NatSession> {
        Arc::new(NatSession::new(
            Arc::new(NullConn),
            "DIRECT",
            None,
            None,
            SessionGuard::new(metrics.clone()),
        ))
    }

    #[tokio::test]
    async fn test_concurrent_first_packets_create_once() {
        let table = Arc::new(NatTable::new());
        let metrics = Metrics::new();
        let dials = Arc::new(AtomicUsize::new(0));
        let key = NatKey::Client("127.0.0.1:5000".parse().unwrap());

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let table = Arc::clone(&table);
            let dials = Arc::clone(&dials);
            let metrics = metrics.clone();
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                table
                    .get_or_create(&key, || async {
                        dials.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(session(&metrics))
                    })
                    .await
                    .map(|(s, created)| (Arc::as_ptr(&s) as usize, created))
            }));
        }

        let mut created = 0;
        let mut ptrs = Vec::new();
        for task in tasks {
            let (ptr, was_created) = task.await.unwrap().unwrap();
            ptrs.push(ptr);
            created += was_created as usize;
        }
        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert_eq!(created, 1);
        assert!(ptrs.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(table.len(), 1);
        assert_eq!(metrics.get_active_udp_sessions(), 1);
    }

    #[tokio::test]
    async fn test_failed_init_leaves_no_slot() {
        let table = NatTable::new();
        let key = NatKey::Client("127.0.0.1:5001".parse().unwrap());
        let result = table
            .get_or_create(&key, || async {
                Err(TunnelError::ProxyNotFound("nope".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_remove_only_same_session() {
        let table = NatTable::new();
        let metrics = Metrics::new();
        let key = NatKey::Flow {
            client: "127.0.0.1:5002".parse().unwrap(),
            target: "8.8.8.8:53".parse().unwrap(),
        };
        let (first, _) = table
            .get_or_create(&key, || async { Ok(session(&metrics)) })
            .await
            .unwrap();

        let other = session(&metrics);
        assert!(!table.remove_session(&key, &other));
        assert!(table.remove_session(&key, &first));
        assert!(table.get(&key).is_none());

        drop(first);
        drop(other);
        assert_eq!(metrics.get_active_udp_sessions(), 0);
    }

    #[tokio::test]
    async fn test_closed_session_is_replaced() {
        let table = NatTable::new();
        let metrics = Metrics::new();
        let key = NatKey::Client("127.0.0.1:5003".parse().unwrap());
        let (first, created) = table
            .get_or_create(&key, || async { Ok(session(&metrics)) })
            .await
            .unwrap();
        assert!(created);

        // 回包任务已经退出，但还没来得及移出表
        first.close();
        let (second, created) = table
            .get_or_create(&key, || async { Ok(session(&metrics)) })
            .await
            .unwrap();
        assert!(created);
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_closed());
        assert_eq!(table.len(), 1);

        // 旧会话的清理不影响新会话
        assert!(!table.remove_session(&key, &first));
        assert!(Arc::ptr_eq(&table.get(&key).unwrap(), &second));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_tracking() {
        let metrics = Metrics::new();
        let s = session(&metrics);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(s.idle_for() >= Duration::from_secs(30));
        s.touch();
        assert!(s.idle_for() < Duration::from_secs(1));
        assert_eq!(s.reply_from("1.1.1.1:53".parse().unwrap()), "1.1.1.1:53".parse().unwrap());
    }
}
