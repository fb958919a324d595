//! 진행률 추적
//!
//! 워커들이 누적 바이트 수를 보고하면 일정 간격 이상 벌어졌을 때만
//! 스냅샷을 만들어 콜백으로 넘긴다. 마지막(완료) 스냅샷은 간격과 무관하게
//! 정확히 한 번 나간다.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::Result;

/// 스냅샷 전달 콜백. 실패해도 전송에는 영향 없음
pub type ProgressCallback = Arc<dyn Fn(&ProgressSnapshot) -> Result<()> + Send + Sync>;

/// 진행률 스냅샷
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub bytes_done: u64,
    pub total: u64,
    pub elapsed: Duration,

    /// 평균 속도 (bytes/sec)
    pub speed: f64,

    /// 남은 시간 추정
    pub eta: Duration,
}

impl ProgressSnapshot {
    fn compute(bytes_done: u64, total: u64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let speed = if secs > 0.0 {
            bytes_done as f64 / secs
        } else {
            0.0
        };
        let eta = if speed > 0.0 {
            Duration::from_secs_f64(total.saturating_sub(bytes_done) as f64 / speed)
        } else {
            Duration::ZERO
        };

        Self {
            bytes_done,
            total,
            elapsed,
            speed,
            eta,
        }
    }

    /// 진행률 (0.0 ~ 100.0). 크기 0인 작업은 100
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.bytes_done as f64 * 100.0 / self.total as f64
    }

    pub fn is_final(&self) -> bool {
        self.bytes_done >= self.total
    }

    /// 사람이 읽는 진행 상황
    pub fn status_text(&self, label: &str) -> String {
        let percentage = self.percentage();
        let filled = ((percentage / 10.0) as usize).min(10);
        let bar = "█".repeat(filled) + &"░".repeat(10 - filled);

        format!(
            "{label}\n[{bar}] {percentage:.1}%\nSpeed: {}/s\nETA: {}\nSize: {} / {}",
            format_size(self.speed),
            format_duration(self.eta),
            format_size(self.bytes_done as f64),
            format_size(self.total as f64),
        )
    }

    /// 완료 메시지
    pub fn completion_text(&self, label: &str) -> String {
        format!("{label} Completed!\nTotal Size: {}", format_size(self.total as f64))
    }
}

/// 1024 단위 크기 표기 (예: `1.50 MB`)
pub fn format_size(bytes: f64) -> String {
    let mut size = bytes;
    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{size:.2} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.2} TB")
}

/// `1h 2m 3s` 형식. 0 이하는 `0s`
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    if total == 0 {
        return "0s".to_string();
    }

    let (hours, rest) = (total / 3600, total % 3600);
    let (minutes, seconds) = (rest / 60, rest % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[derive(Debug)]
struct TrackerState {
    last_emit: Option<Instant>,
    last_bytes: u64,
    emitted: u64,
    finished: bool,
}

/// 작업 하나의 진행률 추적기
pub struct ProgressTracker {
    total: u64,
    interval: Duration,
    started: Instant,
    callback: Option<ProgressCallback>,
    state: Mutex<TrackerState>,
}

impl ProgressTracker {
    pub fn new(total: u64, interval: Duration, callback: Option<ProgressCallback>) -> Self {
        Self {
            total,
            interval,
            started: Instant::now(),
            callback,
            state: Mutex::new(TrackerState {
                last_emit: None,
                last_bytes: 0,
                emitted: 0,
                finished: false,
            }),
        }
    }

    /// 콜백 없는 추적기
    pub fn silent(total: u64) -> Self {
        Self::new(total, Duration::ZERO, None)
    }

    /// 스냅샷을 채널로 보내는 추적기
    ///
    /// 받는 쪽이 닫혀도 전송은 계속된다.
    pub fn with_channel(
        total: u64,
        interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ProgressSnapshot>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: ProgressCallback = Arc::new(move |snapshot: &ProgressSnapshot| {
            tx.send(snapshot.clone())
                .map_err(|_| crate::Error::Worker("progress receiver dropped".into()))
        });
        (Self::new(total, interval, Some(callback)), rx)
    }

    /// 누적 바이트 수 보고. 스냅샷이 나갔으면 반환
    ///
    /// 이전 보고보다 작은 값은 무시한다.
    pub fn on_bytes(&self, bytes_done: u64) -> Option<ProgressSnapshot> {
        let mut state = self.state.lock();
        if state.finished || bytes_done < state.last_bytes {
            return None;
        }
        state.last_bytes = bytes_done;

        let now = Instant::now();
        let is_final = bytes_done >= self.total;
        if !is_final {
            if let Some(last) = state.last_emit {
                if now.duration_since(last) < self.interval {
                    return None;
                }
            }
        }

        let snapshot =
            ProgressSnapshot::compute(bytes_done, self.total, now.duration_since(self.started));
        state.last_emit = Some(now);
        state.emitted += 1;
        state.finished = is_final;

        // 잠금을 쥔 채로 전달해 콜백 호출 순서를 보장
        if let Some(callback) = &self.callback {
            if let Err(e) = callback(&snapshot) {
                debug!("진행률 전달 실패 (무시): {}", e);
            }
        }
        Some(snapshot)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// 마지막으로 받은 누적 바이트 수
    pub fn bytes_done(&self) -> u64 {
        self.state.lock().last_bytes
    }

    /// 지금까지 나간 스냅샷 수
    pub fn emitted(&self) -> u64 {
        self.state.lock().emitted
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }
}
