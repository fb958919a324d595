//! 전송 계획: 워커 수, 청크 크기, 청크 범위 분할

use serde::{Deserialize, Serialize};

use crate::{MAX_CHUNK_SIZE, MIB, SMALL_CHUNK_SIZE};

/// 전송 방향
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Download,
    Upload,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Download => f.write_str("download"),
            Direction::Upload => f.write_str("upload"),
        }
    }
}

/// 크기 구간 경계 (5MB, 50MB, 200MB)
const SIZE_BANDS: [u64; 3] = [5 * MIB, 50 * MIB, 200 * MIB];

/// 구간별 다운로드 워커 수
const DOWNLOAD_WORKERS: [usize; 4] = [8, 16, 24, 32];

/// 구간별 업로드 워커 수 (업로드 비용이 더 커서 더 많이 띄움)
const UPLOAD_WORKERS: [usize; 4] = [16, 24, 32, 48];

/// 워커 수와 청크 크기
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPlan {
    pub worker_count: usize,
    pub chunk_size: usize,
}

impl TransferPlan {
    /// 페이로드 크기에 따른 계획
    pub fn for_size(total_size: u64, direction: Direction) -> Self {
        let band = SIZE_BANDS
            .iter()
            .position(|&limit| total_size < limit)
            .unwrap_or(SIZE_BANDS.len());

        let worker_count = match direction {
            Direction::Download => DOWNLOAD_WORKERS[band],
            Direction::Upload => UPLOAD_WORKERS[band],
        };

        Self {
            worker_count,
            chunk_size: chunk_size_for(total_size),
        }
    }

    /// 워커 수 지정 없이 단일 스트림으로 보내는 계획
    pub fn serial(self) -> Self {
        Self {
            worker_count: 1,
            ..self
        }
    }

    /// 총 청크 수
    pub fn chunk_count(&self, total_size: u64) -> u64 {
        total_size.div_ceil(self.chunk_size as u64)
    }
}

/// 다운로드 방향 계획 (워커 수, 청크 크기)
pub fn plan(total_size: u64) -> (usize, usize) {
    let p = TransferPlan::for_size(total_size, Direction::Download);
    (p.worker_count, p.chunk_size)
}

/// 5MB 미만은 256KB, 그 외에는 프로토콜 최대치 512KB
pub fn chunk_size_for(total_size: u64) -> usize {
    if total_size < SIZE_BANDS[0] {
        SMALL_CHUNK_SIZE
    } else {
        MAX_CHUNK_SIZE
    }
}

/// 연속된 청크 바이트 범위
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    /// 청크 인덱스 (0부터)
    pub index: u64,

    /// 객체 내 시작 오프셋
    pub offset: u64,

    /// 길이 (마지막 청크만 짧을 수 있음)
    pub len: u32,
}

impl ChunkRange {
    pub fn end(&self) -> u64 {
        self.offset + self.len as u64
    }

    /// `index`번째 청크 범위, 범위를 벗어나면 None
    pub fn nth(total_size: u64, chunk_size: usize, index: u64) -> Option<Self> {
        let offset = index.checked_mul(chunk_size as u64)?;
        if offset >= total_size {
            return None;
        }
        let len = (total_size - offset).min(chunk_size as u64) as u32;
        Some(Self { index, offset, len })
    }
}

/// [0, total_size)를 chunk_size 단위로 분할
pub fn partition(total_size: u64, chunk_size: usize) -> impl Iterator<Item = ChunkRange> {
    let count = total_size.div_ceil(chunk_size as u64);
    (0..count).filter_map(move |index| ChunkRange::nth(total_size, chunk_size, index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_table() {
        assert_eq!(plan(4_000_000), (8, 256 * 1024));
        assert_eq!(plan(5_000_000), (16, 512 * 1024));
        assert_eq!(plan(300_000_000), (32, 512 * 1024));
        assert_eq!(plan(0), (8, 256 * 1024));
    }

    #[test]
    fn test_band_edges() {
        let down = |n| TransferPlan::for_size(n, Direction::Download).worker_count;
        let up = |n| TransferPlan::for_size(n, Direction::Upload).worker_count;

        assert_eq!(down(5 * MIB - 1), 8);
        assert_eq!(down(5 * MIB), 16);
        assert_eq!(down(50 * MIB - 1), 16);
        assert_eq!(down(50 * MIB), 24);
        assert_eq!(down(200 * MIB - 1), 24);
        assert_eq!(down(200 * MIB), 32);

        assert_eq!(up(1), 16);
        assert_eq!(up(5 * MIB), 24);
        assert_eq!(up(50 * MIB), 32);
        assert_eq!(up(200 * MIB), 48);
        assert_eq!(up(u64::MAX), 48);
    }

    #[test]
    fn test_upload_chunk_size_matches_download() {
        for size in [1, 5 * MIB - 1, 5 * MIB, 300 * MIB] {
            assert_eq!(
                TransferPlan::for_size(size, Direction::Upload).chunk_size,
                TransferPlan::for_size(size, Direction::Download).chunk_size
            );
        }
    }

    #[test]
    fn test_partition_covers_exactly() {
        let ranges: Vec<_> = partition(10, 4).collect();
        assert_eq!(
            ranges,
            vec![
                ChunkRange { index: 0, offset: 0, len: 4 },
                ChunkRange { index: 1, offset: 4, len: 4 },
                ChunkRange { index: 2, offset: 8, len: 2 },
            ]
        );

        let total = 3 * MAX_CHUNK_SIZE as u64 + 17;
        let ranges: Vec<_> = partition(total, MAX_CHUNK_SIZE).collect();
        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges.iter().map(|r| r.len as u64).sum::<u64>(), total);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end(), pair[1].offset);
        }
    }

    #[test]
    fn test_partition_empty_and_exact() {
        assert_eq!(partition(0, 4).count(), 0);
        let exact: Vec<_> = partition(8, 4).collect();
        assert_eq!(exact.len(), 2);
        assert_eq!(exact[1].len, 4);
        assert!(ChunkRange::nth(8, 4, 2).is_none());
    }

    #[test]
    fn test_serial_plan() {
        let p = TransferPlan::for_size(100 * MIB, Direction::Upload).serial();
        assert_eq!(p.worker_count, 1);
        assert_eq!(p.chunk_size, MAX_CHUNK_SIZE);
        assert_eq!(p.chunk_count(100 * MIB), 200);
    }
}
