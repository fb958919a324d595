//! 병렬 청크 전송 스케줄러
//!
//! 작업 하나를 크기에 맞는 수의 워커로 나눠 실행한다. 워커들은 공유
//! 카운터에서 다음 청크 인덱스를 가져가고, 청크를 시작하기 직전에만 취소
//! 플래그를 확인한다. 진행 중인 청크는 중간에 끊지 않는다.
//!
//! 피어가 워커 수 파라미터를 거부하면 협상 단계에서 한 번만 단일 스트림으로
//! 다시 시도한다.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::governor::RequesterId;
use crate::plan::{ChunkRange, Direction, TransferPlan};
use crate::progress::{format_size, ProgressTracker};
use crate::remote::RemoteObject;
use crate::stats::TransferStats;
use crate::target::{ChunkSink, ChunkSource};
use crate::{Error, Result};

/// 외부 취소 조건 (호출자가 폴링 대상으로 넘김)
pub type CancelCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// 전송 작업 하나의 상태
pub struct TransferJob {
    requester: RequesterId,
    direction: Direction,
    total_size: u64,
    chunk_size: usize,
    worker_count: AtomicUsize,
    bytes_done: AtomicU64,
    chunks_done: AtomicU64,
    fell_back: AtomicBool,
    cancelled: Arc<AtomicBool>,
    cancel_check: Option<CancelCheck>,
}

impl TransferJob {
    pub fn new(requester: RequesterId, direction: Direction, total_size: u64) -> Self {
        let plan = TransferPlan::for_size(total_size, direction);
        Self {
            requester,
            direction,
            total_size,
            chunk_size: plan.chunk_size,
            worker_count: AtomicUsize::new(plan.worker_count),
            bytes_done: AtomicU64::new(0),
            chunks_done: AtomicU64::new(0),
            fell_back: AtomicBool::new(false),
            cancelled: Arc::new(AtomicBool::new(false)),
            cancel_check: None,
        }
    }

    /// 외부에서 관리하는 취소 플래그 사용
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancelled = flag;
        self
    }

    pub fn with_cancel_check(mut self, check: CancelCheck) -> Self {
        self.cancel_check = Some(check);
        self
    }

    pub fn requester(&self) -> RequesterId {
        self.requester
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn plan(&self) -> TransferPlan {
        TransferPlan {
            worker_count: self.worker_count.load(Ordering::Acquire),
            chunk_size: self.chunk_size,
        }
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done.load(Ordering::Acquire)
    }

    pub fn fell_back(&self) -> bool {
        self.fell_back.load(Ordering::Acquire)
    }

    /// 취소 요청. 이미 시작한 청크는 끝까지 간다
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
            || self.cancel_check.as_ref().is_some_and(|check| check())
    }

    /// 완료된 청크 기록, 누적 바이트 반환
    fn record_chunk(&self, len: u32) -> u64 {
        self.chunks_done.fetch_add(1, Ordering::AcqRel);
        self.bytes_done.fetch_add(len as u64, Ordering::AcqRel) + len as u64
    }

    fn fall_back(&self) {
        let serial = self.plan().serial();
        self.worker_count.store(serial.worker_count, Ordering::Release);
        self.fell_back.store(true, Ordering::Release);
    }

    pub(crate) fn stats(&self, elapsed: std::time::Duration) -> TransferStats {
        let plan = self.plan();
        TransferStats {
            direction: self.direction,
            total_bytes: self.total_size,
            bytes_done: self.bytes_done(),
            total_chunks: plan.chunk_count(self.total_size),
            completed_chunks: self.chunks_done.load(Ordering::Acquire),
            workers: plan.worker_count,
            chunk_size: plan.chunk_size,
            fell_back: self.fell_back(),
            elapsed,
        }
    }
}

/// 작업 결과
#[derive(Debug)]
pub enum TransferOutcome {
    Completed(TransferStats),
    Cancelled(TransferStats),
    Failed { error: Error, stats: TransferStats },
}

impl TransferOutcome {
    pub fn stats(&self) -> &TransferStats {
        match self {
            TransferOutcome::Completed(stats) | TransferOutcome::Cancelled(stats) => stats,
            TransferOutcome::Failed { stats, .. } => stats,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TransferOutcome::Completed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferOutcome::Cancelled(_))
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            TransferOutcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

enum RunEnd {
    Completed,
    Cancelled,
}

enum WorkerExit {
    Drained,
    Cancelled,
}

/// 전송 스케줄러
#[derive(Debug, Clone, Copy, Default)]
pub struct Scheduler;

impl Scheduler {
    pub fn new() -> Self {
        Self
    }

    /// 원격 객체를 `sink`로 내려받기
    pub async fn download<R, W>(
        &self,
        job: Arc<TransferJob>,
        remote: Arc<R>,
        sink: Arc<W>,
        tracker: Arc<ProgressTracker>,
    ) -> TransferOutcome
    where
        R: RemoteObject,
        W: ChunkSink,
    {
        let reader = remote.clone();
        let op = move |range: ChunkRange| {
            let reader = reader.clone();
            let sink = sink.clone();
            async move {
                let data = reader.read_chunk(range).await?;
                sink.write_at(range.offset, data).await
            }
        };

        self.execute(job, remote, tracker, op).await
    }

    /// `source`를 원격 객체로 올리기
    pub async fn upload<L, R>(
        &self,
        job: Arc<TransferJob>,
        source: Arc<L>,
        remote: Arc<R>,
        tracker: Arc<ProgressTracker>,
    ) -> TransferOutcome
    where
        L: ChunkSource,
        R: RemoteObject,
    {
        let writer = remote.clone();
        let op = move |range: ChunkRange| {
            let writer = writer.clone();
            let source = source.clone();
            async move {
                let data = source.read_at(range.offset, range.len).await?;
                writer.write_chunk(range, data).await
            }
        };

        self.execute(job, remote, tracker, op).await
    }

    async fn execute<R, F, Fut>(
        &self,
        job: Arc<TransferJob>,
        remote: Arc<R>,
        tracker: Arc<ProgressTracker>,
        op: F,
    ) -> TransferOutcome
    where
        R: RemoteObject,
        F: Fn(ChunkRange) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let started = Instant::now();
        let result = self.run(&job, remote.as_ref(), &tracker, op).await;
        let stats = job.stats(started.elapsed());

        match result {
            Ok(RunEnd::Completed) => {
                info!("Transfer complete: {}", stats.summary());
                TransferOutcome::Completed(stats)
            }
            Ok(RunEnd::Cancelled) => {
                info!(
                    "Transfer cancelled: requester {} after {}",
                    job.requester(),
                    format_size(stats.bytes_done as f64)
                );
                TransferOutcome::Cancelled(stats)
            }
            Err(error) => {
                warn!("전송 실패 (requester {}): {}", job.requester(), error);
                TransferOutcome::Failed { error, stats }
            }
        }
    }

    async fn run<R, F, Fut>(
        &self,
        job: &Arc<TransferJob>,
        remote: &R,
        tracker: &Arc<ProgressTracker>,
        op: F,
    ) -> Result<RunEnd>
    where
        R: RemoteObject,
        F: Fn(ChunkRange) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if job.is_cancelled() {
            return Ok(RunEnd::Cancelled);
        }

        negotiate(job, remote).await?;

        let plan = job.plan();
        let total_chunks = plan.chunk_count(job.total_size());
        let workers = (plan.worker_count as u64).min(total_chunks) as usize;
        info!(
            "Transfer start: {} {} ({} chunks x {}, {} workers)",
            job.direction(),
            format_size(job.total_size() as f64),
            total_chunks,
            format_size(plan.chunk_size as f64),
            workers
        );

        let op = Arc::new(op);
        let next = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let mut set = JoinSet::new();
        for _ in 0..workers {
            set.spawn(worker(
                job.clone(),
                tracker.clone(),
                op.clone(),
                next.clone(),
                stop.clone(),
                total_chunks,
            ));
        }

        let mut cancelled = false;
        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(WorkerExit::Drained)) => {}
                Ok(Ok(WorkerExit::Cancelled)) => cancelled = true,
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    } else {
                        debug!("추가 워커 에러: {}", e);
                    }
                }
                Err(e) => {
                    first_error.get_or_insert(Error::Worker(e.to_string()));
                }
            }
        }

        // 취소가 관측됐으면 에러보다 우선
        if cancelled {
            return Ok(RunEnd::Cancelled);
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        // 크기 0 작업은 여기서 유일한 스냅샷이 나간다
        tracker.on_bytes(job.bytes_done());
        remote.finish().await?;
        Ok(RunEnd::Completed)
    }
}

/// 워커 수를 지정해 협상, 거부되면 지정 없이 한 번 더
async fn negotiate<R: RemoteObject>(job: &TransferJob, remote: &R) -> Result<()> {
    let workers = job.plan().worker_count;
    match remote
        .begin(job.direction(), job.total_size(), Some(workers))
        .await
    {
        Err(Error::WorkerParamRejected { workers }) => {
            warn!("피어가 워커 수 {} 거부, 단일 스트림으로 재시도", workers);
            job.fall_back();
            remote.begin(job.direction(), job.total_size(), None).await
        }
        other => other,
    }
}

async fn worker<F, Fut>(
    job: Arc<TransferJob>,
    tracker: Arc<ProgressTracker>,
    op: Arc<F>,
    next: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    total_chunks: u64,
) -> Result<WorkerExit>
where
    F: Fn(ChunkRange) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let chunk_size = job.plan().chunk_size;
    loop {
        if stop.load(Ordering::Acquire) {
            return Ok(WorkerExit::Drained);
        }

        let index = next.fetch_add(1, Ordering::AcqRel);
        if index >= total_chunks {
            return Ok(WorkerExit::Drained);
        }

        // 청크를 가져왔지만 시작 전
        if job.is_cancelled() {
            return Ok(WorkerExit::Cancelled);
        }

        let Some(range) = ChunkRange::nth(job.total_size(), chunk_size, index) else {
            return Ok(WorkerExit::Drained);
        };

        if let Err(e) = op(range).await {
            stop.store(true, Ordering::Release);
            return Err(e);
        }

        let done = job.record_chunk(range.len);
        tracker.on_bytes(done);
    }
}
