//! 전송 통계

use std::time::Duration;

use crate::plan::Direction;
use crate::progress::{format_duration, format_size};

/// 작업 하나의 전송 결과 통계
#[derive(Debug, Clone, PartialEq)]
pub struct TransferStats {
    pub direction: Direction,

    /// 전체 크기
    pub total_bytes: u64,

    /// 실제로 옮긴 바이트
    pub bytes_done: u64,

    /// 총 청크 수
    pub total_chunks: u64,

    /// 완료된 청크 수
    pub completed_chunks: u64,

    /// 계획된 워커 수 (전환 시 1)
    pub workers: usize,

    pub chunk_size: usize,

    /// 워커 수 거부로 단일 스트림으로 전환했는지
    pub fell_back: bool,

    /// 경과 시간
    pub elapsed: Duration,
}

impl TransferStats {
    pub fn new(direction: Direction, total_bytes: u64) -> Self {
        Self {
            direction,
            total_bytes,
            bytes_done: 0,
            total_chunks: 0,
            completed_chunks: 0,
            workers: 0,
            chunk_size: 0,
            fell_back: false,
            elapsed: Duration::ZERO,
        }
    }

    /// 평균 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes_done as f64 / secs
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_done == self.total_bytes && self.completed_chunks == self.total_chunks
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "{} | Chunks: {}/{} | Bytes: {} / {} | Workers: {}{} | Elapsed: {} | Throughput: {}/s",
            self.direction,
            self.completed_chunks,
            self.total_chunks,
            format_size(self.bytes_done as f64),
            format_size(self.total_bytes as f64),
            self.workers,
            if self.fell_back { " (fallback)" } else { "" },
            format_duration(self.elapsed),
            format_size(self.throughput()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_and_throughput() {
        let stats = TransferStats {
            bytes_done: 2 * 1024 * 1024,
            total_chunks: 4,
            completed_chunks: 4,
            workers: 1,
            chunk_size: 512 * 1024,
            fell_back: true,
            elapsed: Duration::from_secs(2),
            ..TransferStats::new(Direction::Upload, 2 * 1024 * 1024)
        };

        assert!(stats.is_complete());
        assert_eq!(stats.throughput(), 1024.0 * 1024.0);

        let summary = stats.summary();
        assert!(summary.starts_with("upload | Chunks: 4/4"));
        assert!(summary.contains("Workers: 1 (fallback)"));
        assert!(summary.contains("Throughput: 1.00 MB/s"));
    }

    #[test]
    fn test_zero_elapsed() {
        let stats = TransferStats::new(Direction::Download, 0);
        assert_eq!(stats.throughput(), 0.0);
        assert!(stats.is_complete());
    }
}
