//! 동시성 제어
//!
//! - 방향별 전역 동시 작업 수 제한 (FIFO 대기)
//! - 요청자당 진행 중인 작업 1개
//! - 요청자 ID로 협조적 취소
//!
//! 승인되면 [`AdmissionGuard`]를 받으며, 가드가 drop되는 순간 슬롯과
//! 요청자 등록이 함께 풀린다. 성공/실패/취소/타임아웃 어느 경로든 정확히
//! 한 번 해제된다.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::plan::Direction;
use crate::scheduler::TransferOutcome;
use crate::{Config, Error, Result};

/// 요청자 식별자
pub type RequesterId = u64;

#[derive(Debug)]
struct ActiveJob {
    ticket: u64,
    direction: Direction,
    cancelled: Arc<AtomicBool>,
}

struct Inner {
    downloads: Arc<Semaphore>,
    uploads: Arc<Semaphore>,
    active: DashMap<RequesterId, ActiveJob>,
    next_ticket: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    failed: AtomicU64,
    bytes_transferred: AtomicU64,
}

impl Inner {
    fn semaphore(&self, direction: Direction) -> &Arc<Semaphore> {
        match direction {
            Direction::Download => &self.downloads,
            Direction::Upload => &self.uploads,
        }
    }
}

/// 전역 동시성 제어기 (복제해서 공유)
#[derive(Clone)]
pub struct Governor {
    inner: Arc<Inner>,
}

/// 승인 결과
pub enum Admission {
    /// 바로 실행 가능
    Admitted(AdmissionGuard),

    /// 슬롯이 없어 대기해야 함. 대기 중에도 요청자 등록은 유지된다
    Queued(PendingAdmission),
}

/// 제어기 통계
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GovernorStats {
    pub active: usize,
    pub completed: u64,
    pub cancelled: u64,
    pub failed: u64,
    pub bytes_transferred: u64,
}

impl Governor {
    pub fn new(config: &Config) -> Self {
        Self::with_limits(config.max_concurrent_downloads, config.max_concurrent_uploads)
    }

    pub fn with_limits(max_downloads: usize, max_uploads: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                downloads: Arc::new(Semaphore::new(max_downloads)),
                uploads: Arc::new(Semaphore::new(max_uploads)),
                active: DashMap::new(),
                next_ticket: AtomicU64::new(1),
                completed: AtomicU64::new(0),
                cancelled: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                bytes_transferred: AtomicU64::new(0),
            }),
        }
    }

    /// 작업 승인 시도
    ///
    /// 같은 요청자의 작업이 이미 있으면(대기 중 포함) 즉시
    /// [`Error::AlreadyActive`].
    pub fn try_admit(&self, requester: RequesterId, direction: Direction) -> Result<Admission> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);

        match self.inner.active.entry(requester) {
            Entry::Occupied(_) => return Err(Error::AlreadyActive { requester }),
            Entry::Vacant(slot) => {
                slot.insert(ActiveJob {
                    ticket,
                    direction,
                    cancelled: cancelled.clone(),
                });
            }
        }

        let reservation = Reservation {
            inner: self.inner.clone(),
            requester,
            ticket,
            direction,
            cancelled,
        };

        let semaphore = self.inner.semaphore(direction).clone();
        match semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                debug!("Admitted {} for requester {}", direction, requester);
                Ok(Admission::Admitted(AdmissionGuard {
                    reservation,
                    _permit: permit,
                }))
            }
            Err(_) => {
                info!("{} queue full, requester {} waiting", direction, requester);
                Ok(Admission::Queued(PendingAdmission {
                    reservation,
                    semaphore,
                }))
            }
        }
    }

    /// 승인될 때까지 대기
    pub async fn admit(&self, requester: RequesterId, direction: Direction) -> Result<AdmissionGuard> {
        match self.try_admit(requester, direction)? {
            Admission::Admitted(guard) => Ok(guard),
            Admission::Queued(pending) => pending.wait().await,
        }
    }

    /// 요청자의 작업에 취소 신호. 작업이 없으면 false
    pub fn cancel(&self, requester: RequesterId) -> bool {
        match self.inner.active.get(&requester) {
            Some(job) => {
                job.cancelled.store(true, Ordering::Release);
                info!("Cancel requested: requester {} ({})", requester, job.direction);
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, requester: RequesterId) -> bool {
        self.inner.active.contains_key(&requester)
    }

    /// 등록된 작업 수 (대기 중 포함)
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    /// 남은 슬롯 수
    pub fn available(&self, direction: Direction) -> usize {
        self.inner.semaphore(direction).available_permits()
    }

    /// 끝난 작업 결과 집계
    pub fn record(&self, outcome: &TransferOutcome) {
        let counter = match outcome {
            TransferOutcome::Completed(_) => &self.inner.completed,
            TransferOutcome::Cancelled(_) => &self.inner.cancelled,
            TransferOutcome::Failed { .. } => &self.inner.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_transferred
            .fetch_add(outcome.stats().bytes_done, Ordering::Relaxed);
    }

    pub fn stats(&self) -> GovernorStats {
        GovernorStats {
            active: self.active_count(),
            completed: self.inner.completed.load(Ordering::Relaxed),
            cancelled: self.inner.cancelled.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            bytes_transferred: self.inner.bytes_transferred.load(Ordering::Relaxed),
        }
    }
}

/// 요청자 등록. drop 시 자기 것일 때만 지운다
struct Reservation {
    inner: Arc<Inner>,
    requester: RequesterId,
    ticket: u64,
    direction: Direction,
    cancelled: Arc<AtomicBool>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let ticket = self.ticket;
        if self
            .inner
            .active
            .remove_if(&self.requester, |_, job| job.ticket == ticket)
            .is_some()
        {
            debug!("Released requester {} ({})", self.requester, self.direction);
        }
    }
}

/// 슬롯 대기 중인 승인
pub struct PendingAdmission {
    reservation: Reservation,
    semaphore: Arc<Semaphore>,
}

impl PendingAdmission {
    pub fn requester(&self) -> RequesterId {
        self.reservation.requester
    }

    /// 슬롯이 날 때까지 대기 (도착 순서대로)
    pub async fn wait(self) -> Result<AdmissionGuard> {
        let permit = self
            .semaphore
            .acquire_owned()
            .await
            .map_err(|_| Error::AdmissionClosed)?;

        debug!("Queued requester {} admitted", self.reservation.requester);
        Ok(AdmissionGuard {
            reservation: self.reservation,
            _permit: permit,
        })
    }
}

/// 승인된 작업의 슬롯
pub struct AdmissionGuard {
    reservation: Reservation,
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGuard {
    pub fn requester(&self) -> RequesterId {
        self.reservation.requester
    }

    pub fn direction(&self) -> Direction {
        self.reservation.direction
    }

    /// 이 작업의 취소 플래그
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.reservation.cancelled.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.reservation.cancelled.load(Ordering::Acquire)
    }

    /// 명시적 해제 (drop과 같음)
    pub fn release(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn admitted(admission: Admission) -> AdmissionGuard {
        match admission {
            Admission::Admitted(guard) => guard,
            Admission::Queued(_) => panic!("expected immediate admission"),
        }
    }

    #[tokio::test]
    async fn test_capacity_per_direction() {
        let governor = Governor::with_limits(1, 1);

        let first = admitted(governor.try_admit(1, Direction::Download).unwrap());
        let queued = match governor.try_admit(2, Direction::Download).unwrap() {
            Admission::Queued(pending) => pending,
            Admission::Admitted(_) => panic!("download capacity exceeded"),
        };

        // 업로드 슬롯은 별개
        let upload = admitted(governor.try_admit(3, Direction::Upload).unwrap());
        assert_eq!(governor.active_count(), 3);

        let waiter = tokio::spawn(queued.wait());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        first.release();
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.requester(), 2);
        assert_eq!(governor.available(Direction::Download), 0);

        drop(second);
        drop(upload);
        assert_eq!(governor.active_count(), 0);
        assert_eq!(governor.available(Direction::Download), 1);
        assert_eq!(governor.available(Direction::Upload), 1);
    }

    #[tokio::test]
    async fn test_one_job_per_requester() {
        let governor = Governor::with_limits(4, 4);
        let guard = governor.admit(7, Direction::Download).await.unwrap();

        // 방향이 달라도 같은 요청자는 거부
        assert!(matches!(
            governor.try_admit(7, Direction::Upload),
            Err(Error::AlreadyActive { requester: 7 })
        ));

        guard.release();
        assert!(!governor.is_active(7));
        assert!(governor.try_admit(7, Direction::Upload).is_ok());
    }

    #[tokio::test]
    async fn test_queued_requester_still_exclusive() {
        let governor = Governor::with_limits(1, 1);
        let _running = governor.admit(1, Direction::Upload).await.unwrap();
        let pending = governor.try_admit(2, Direction::Upload).unwrap();

        assert!(matches!(
            governor.try_admit(2, Direction::Upload),
            Err(Error::AlreadyActive { .. })
        ));

        // 대기를 포기하면 등록도 풀린다
        drop(pending);
        assert!(!governor.is_active(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admission_is_exclusive() {
        let governor = Governor::with_limits(64, 64);
        let barrier = Arc::new(tokio::sync::Barrier::new(32));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let governor = governor.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                governor.try_admit(99, Direction::Download)
            }));
        }

        // 결과를 모두 모을 때까지 승자의 가드는 살아 있다
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        let winners: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
        assert_eq!(winners.len(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, Error::AlreadyActive { requester: 99 })));
        assert_eq!(governor.available(Direction::Download), 63);

        drop(results);
        assert!(!governor.is_active(99));
        assert_eq!(governor.available(Direction::Download), 64);
    }

    #[tokio::test]
    async fn test_cancel_sets_flag() {
        let governor = Governor::with_limits(1, 1);
        assert!(!governor.cancel(5));

        let guard = governor.admit(5, Direction::Download).await.unwrap();
        assert!(!guard.is_cancelled());
        assert!(governor.cancel(5));
        assert!(guard.is_cancelled());
        assert!(guard.cancel_flag().load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_cancel_while_queued() {
        let governor = Governor::with_limits(1, 1);
        let running = governor.admit(1, Direction::Download).await.unwrap();
        let pending = match governor.try_admit(2, Direction::Download).unwrap() {
            Admission::Queued(pending) => pending,
            Admission::Admitted(_) => panic!("should queue"),
        };

        assert!(governor.cancel(2));
        drop(running);
        let guard = pending.wait().await.unwrap();
        assert!(guard.is_cancelled());
    }
}
