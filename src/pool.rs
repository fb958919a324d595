//! 연결 풀
//!
//! 같은 주소로 연 여러 연결을 워커들에게 라운드로빈으로 나눠준다.
//! 워커 수가 연결 수보다 많으면 한 연결을 여러 워커가 공유하며, 이때
//! 요청/응답 한 쌍은 연결 잠금 아래에서 통째로 직렬화된다.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::{Config, Connection, Error, Result};

/// 풀 안의 연결 하나
struct Slot<S> {
    id: usize,
    conn: Mutex<Connection<S>>,
    active: AtomicBool,
}

impl<S> Slot<S> {
    /// 비활성화. 처음 내린 경우에만 true
    fn retire(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }
}

/// 요청/응답 한 쌍이 진행 중인 연결
///
/// 응답까지 받기 전에 버려지면 (태스크 abort 등) 응답 프레임이 소켓에
/// 남아 다음 교환과 어긋나므로, 연결을 닫힌 것으로 표시하고 풀에서 뺀다.
struct InFlight<'a, S> {
    slot: &'a Slot<S>,
    conn: MutexGuard<'a, Connection<S>>,
    settled: bool,
}

impl<S> Drop for InFlight<'_, S> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.conn.abandon();
        if self.slot.retire() {
            warn!("연결 {} 비활성화: 응답 수신 전에 교환이 중단됨", self.slot.id);
        }
    }
}

/// 연결 풀
pub struct ConnectionPool<S = TcpStream> {
    slots: Vec<Slot<S>>,
    counter: AtomicU64,
}

impl ConnectionPool<TcpStream> {
    /// `addr`로 연결 `count`개 수립 (하나라도 실패하면 에러)
    pub async fn connect(addr: &str, count: usize, config: &Config) -> Result<Self> {
        let mut conns = Vec::with_capacity(count.max(1));
        for _ in 0..count.max(1) {
            conns.push(Connection::connect(addr, config).await?);
        }

        info!("Connection pool ready: {} x {}", conns.len(), addr);
        Ok(Self::from_connections(conns))
    }
}

impl<S> ConnectionPool<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn from_connections(conns: Vec<Connection<S>>) -> Self {
        let slots = conns
            .into_iter()
            .enumerate()
            .map(|(id, conn)| Slot {
                id,
                active: AtomicBool::new(!conn.is_closed()),
                conn: Mutex::new(conn),
            })
            .collect();

        Self {
            slots,
            counter: AtomicU64::new(0),
        }
    }

    /// 다음 활성 연결 선택 (라운드로빈)
    fn select(&self) -> Option<&Slot<S>> {
        if self.slots.is_empty() {
            return None;
        }

        let start = self.counter.fetch_add(1, Ordering::Relaxed) as usize;
        (0..self.slots.len())
            .map(|i| &self.slots[(start + i) % self.slots.len()])
            .find(|slot| slot.active.load(Ordering::Acquire))
    }

    /// 요청 프레임 하나를 보내고 응답 프레임 하나를 받는다
    ///
    /// 연결 치명적 에러가 나면 해당 연결은 풀에서 빠진다. 요청을 다른
    /// 연결로 다시 보내지는 않는다.
    pub async fn exchange(&self, request: &[u8]) -> Result<Bytes> {
        loop {
            let slot = self.select().ok_or(Error::NoConnection)?;
            let conn = slot.conn.lock().await;

            // 잠금을 기다리는 동안 다른 워커가 죽인 연결
            if conn.is_closed() {
                self.deactivate(slot);
                continue;
            }

            let mut flight = InFlight {
                slot,
                conn,
                settled: false,
            };
            let result = match flight.conn.send(request).await {
                Ok(()) => flight.conn.receive().await,
                Err(e) => Err(e),
            };
            flight.settled = true;
            drop(flight);

            if let Err(e) = &result {
                if e.is_connection_fatal() {
                    self.deactivate(slot);
                }
            }
            return result;
        }
    }

    fn deactivate(&self, slot: &Slot<S>) {
        if slot.retire() {
            warn!(
                "연결 {} 비활성화 (남은 연결 {})",
                slot.id,
                self.active_count()
            );
        }
    }

    /// 전체 연결 수
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// 활성 연결 수
    pub fn active_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.active.load(Ordering::Acquire))
            .count()
    }

    /// 모든 연결 종료
    pub async fn close_all(&self) {
        for slot in &self.slots {
            slot.retire();
            slot.conn.lock().await.close().await;
        }
        debug!("Connection pool closed ({} connections)", self.slots.len());
    }
}
