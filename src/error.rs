//! 에러 타입 정의

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// 프레임 손상 원인
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFault {
    /// CRC32 불일치
    Checksum { expected: u32, got: u32 },

    /// 길이 필드가 허용 범위를 벗어남
    Length(u32),
}

impl fmt::Display for FrameFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameFault::Checksum { expected, got } => {
                write!(f, "CRC 불일치: expected {expected:08X}, got {got:08X}")
            }
            FrameFault::Length(len) => write!(f, "유효하지 않은 프레임 길이: {len}"),
        }
    }
}

/// mtpipe 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("연결 실패: {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("연결 타임아웃: {addr}")]
    ConnectTimeout { addr: String },

    #[error("IO 타임아웃")]
    IoTimeout,

    #[error("프레임 손상: {0}")]
    CorruptFrame(FrameFault),

    #[error("시퀀스 불일치: expected {expected}, got {got}")]
    SequenceMismatch { expected: u32, got: u32 },

    #[error("연결 종료")]
    ConnectionClosed,

    #[error("사용 가능한 연결 없음")]
    NoConnection,

    #[error("워커 수 파라미터 거부: workers={workers}")]
    WorkerParamRejected { workers: usize },

    #[error("메시지 타입 불일치: expected {expected}, got {got}")]
    UnexpectedMessage { expected: String, got: String },

    #[error("원격 에러: {0}")]
    Remote(String),

    #[error("청크 길이 부족: offset={offset}, expected {expected}, got {got}")]
    ShortChunk { offset: u64, expected: u64, got: u64 },

    #[error("이미 진행 중인 전송이 있음: requester={requester}")]
    AlreadyActive { requester: u64 },

    #[error("작업 타임아웃: {limit:?} 초과")]
    JobTimeout { limit: Duration },

    #[error("동시성 제어기가 닫힘")]
    AdmissionClosed,

    #[error("워커 태스크 실패: {0}")]
    Worker(String),

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// 이 에러 이후 해당 연결을 더 이상 쓸 수 없는지 여부
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::IoTimeout
                | Error::CorruptFrame(_)
                | Error::SequenceMismatch { .. }
                | Error::ConnectionClosed
        )
    }

    pub fn is_corrupt_frame(&self) -> bool {
        matches!(self, Error::CorruptFrame(_))
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_fatal_classification() {
        assert!(Error::ConnectionClosed.is_connection_fatal());
        assert!(Error::CorruptFrame(FrameFault::Length(3)).is_connection_fatal());
        assert!(!Error::Remote("nope".into()).is_connection_fatal());
        assert!(!Error::WorkerParamRejected { workers: 8 }.is_connection_fatal());
    }

    #[test]
    fn test_fault_display() {
        let err = Error::CorruptFrame(FrameFault::Checksum {
            expected: 0xDEADBEEF,
            got: 0x01,
        });
        assert!(err.to_string().contains("DEADBEEF"));

        let timeout = Error::JobTimeout {
            limit: Duration::from_millis(450),
        };
        assert!(timeout.to_string().contains("450ms"));
    }
}
