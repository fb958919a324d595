//! 전송 서비스
//!
//! 승인 → 계획 → 실행 → 해제를 한 번에 처리하는 진입점.
//! 작업 전체에 타임아웃을 걸고, 어떤 경로로 끝나든 승인 슬롯을 돌려준다.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::governor::{Admission, AdmissionGuard, Governor, RequesterId};
use crate::plan::Direction;
use crate::progress::{ProgressCallback, ProgressTracker};
use crate::remote::RemoteObject;
use crate::scheduler::{CancelCheck, Scheduler, TransferJob, TransferOutcome};
use crate::stats::TransferStats;
use crate::target::{ChunkSink, ChunkSource};
use crate::{Config, Error, Result};

/// 대기열 진입 알림
pub type QueueNotice = Box<dyn FnOnce(RequesterId) + Send>;

/// 전송 요청
pub struct TransferRequest {
    requester: RequesterId,
    progress: Option<ProgressCallback>,
    cancel_check: Option<CancelCheck>,
    on_queued: Option<QueueNotice>,
}

impl TransferRequest {
    pub fn new(requester: RequesterId) -> Self {
        Self {
            requester,
            progress: None,
            cancel_check: None,
            on_queued: None,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// 청크를 시작할 때마다 확인할 취소 조건
    pub fn with_cancel_check(mut self, check: CancelCheck) -> Self {
        self.cancel_check = Some(check);
        self
    }

    /// 슬롯이 없어 대기하게 되면 한 번 호출
    pub fn on_queued(mut self, notice: impl FnOnce(RequesterId) + Send + 'static) -> Self {
        self.on_queued = Some(Box::new(notice));
        self
    }

    pub fn requester(&self) -> RequesterId {
        self.requester
    }
}

/// 전송 서비스
pub struct TransferService {
    config: Config,
    governor: Governor,
    scheduler: Scheduler,
}

impl TransferService {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            governor: Governor::new(&config),
            scheduler: Scheduler::new(),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    /// 요청자의 진행 중(또는 대기 중) 작업 취소
    pub fn cancel(&self, requester: RequesterId) -> bool {
        self.governor.cancel(requester)
    }

    /// 원격 객체 다운로드
    ///
    /// 같은 요청자의 작업이 이미 있으면 [`Error::AlreadyActive`]. 그 외의
    /// 실패는 [`TransferOutcome::Failed`]로 돌아온다.
    pub async fn download<R, W>(
        &self,
        mut request: TransferRequest,
        remote: Arc<R>,
        sink: Arc<W>,
    ) -> Result<TransferOutcome>
    where
        R: RemoteObject,
        W: ChunkSink,
    {
        let guard = self.admit(&mut request, Direction::Download).await?;

        let outcome = match remote.stat().await {
            Ok(total) => {
                let (job, tracker) = self.prepare(&request, &guard, Direction::Download, total);
                let run = self
                    .scheduler
                    .download(job.clone(), remote, sink, tracker);
                self.with_timeout(&job, run).await
            }
            Err(error) => failed_early(Direction::Download, error),
        };

        Ok(self.finish(guard, outcome))
    }

    /// 로컬 원본 업로드
    pub async fn upload<L, R>(
        &self,
        mut request: TransferRequest,
        source: Arc<L>,
        remote: Arc<R>,
    ) -> Result<TransferOutcome>
    where
        L: ChunkSource,
        R: RemoteObject,
    {
        let guard = self.admit(&mut request, Direction::Upload).await?;

        let total = source.size();
        let (job, tracker) = self.prepare(&request, &guard, Direction::Upload, total);
        let run = self.scheduler.upload(job.clone(), source, remote, tracker);
        let outcome = self.with_timeout(&job, run).await;

        Ok(self.finish(guard, outcome))
    }

    async fn admit(
        &self,
        request: &mut TransferRequest,
        direction: Direction,
    ) -> Result<AdmissionGuard> {
        match self.governor.try_admit(request.requester, direction)? {
            Admission::Admitted(guard) => Ok(guard),
            Admission::Queued(pending) => {
                if let Some(notice) = request.on_queued.take() {
                    notice(request.requester);
                }
                pending.wait().await
            }
        }
    }

    fn prepare(
        &self,
        request: &TransferRequest,
        guard: &AdmissionGuard,
        direction: Direction,
        total: u64,
    ) -> (Arc<TransferJob>, Arc<ProgressTracker>) {
        let mut job =
            TransferJob::new(request.requester, direction, total).with_cancel_flag(guard.cancel_flag());
        if let Some(check) = &request.cancel_check {
            job = job.with_cancel_check(check.clone());
        }

        let tracker = ProgressTracker::new(total, self.config.progress_interval, request.progress.clone());
        (Arc::new(job), Arc::new(tracker))
    }

    async fn with_timeout(
        &self,
        job: &Arc<TransferJob>,
        run: impl std::future::Future<Output = TransferOutcome>,
    ) -> TransferOutcome {
        let started = Instant::now();
        match tokio::time::timeout(self.config.job_timeout, run).await {
            Ok(outcome) => outcome,
            Err(_) => {
                job.cancel();
                let limit = self.config.job_timeout;
                warn!("작업 타임아웃 (requester {}): {:?}", job.requester(), limit);
                TransferOutcome::Failed {
                    error: Error::JobTimeout { limit },
                    stats: job.stats(started.elapsed()),
                }
            }
        }
    }

    fn finish(&self, guard: AdmissionGuard, outcome: TransferOutcome) -> TransferOutcome {
        self.governor.record(&outcome);
        info!(
            "Requester {} {} finished: {}",
            guard.requester(),
            guard.direction(),
            match &outcome {
                TransferOutcome::Completed(_) => "completed",
                TransferOutcome::Cancelled(_) => "cancelled",
                TransferOutcome::Failed { .. } => "failed",
            }
        );
        guard.release();
        outcome
    }
}

fn failed_early(direction: Direction, error: Error) -> TransferOutcome {
    warn!("{} 준비 실패: {}", direction, error);
    TransferOutcome::Failed {
        error,
        stats: TransferStats::new(direction, 0),
    }
}
