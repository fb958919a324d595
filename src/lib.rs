//! # mtpipe
//!
//! 길이 + 시퀀스 + CRC32 프레이밍 위에 올린 적응형 병렬 청크 전송 파이프라인
//!
//! ## 구성 요소
//! - **Frame Codec**: 바이트 스트림을 무결성 검증된 프레임으로 분할
//! - **Connection**: 소켓 하나 + 코덱, 손상/종료 시 즉시 폐기
//! - **Transfer Scheduler**: 크기 기반 워커 수/청크 크기 결정, 병렬 청크 전송
//! - **Progress Tracker**: 스로틀된 속도/ETA 스냅샷
//! - **Concurrency Governor**: 방향별 전역 동시성 제한, 요청자당 1개 작업, 협조적 취소

pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod governor;
pub mod message;
pub mod plan;
pub mod pool;
pub mod progress;
pub mod remote;
pub mod scheduler;
pub mod service;
pub mod stats;
pub mod target;

pub use config::Config;
pub use connection::Connection;
pub use error::{Error, FrameFault, Result};
pub use frame::{Frame, FrameDecoder, FrameEncoder};
pub use governor::{Admission, AdmissionGuard, Governor, PendingAdmission, RequesterId};
pub use plan::{ChunkRange, Direction, TransferPlan};
pub use pool::ConnectionPool;
pub use progress::{ProgressCallback, ProgressSnapshot, ProgressTracker};
pub use remote::{FramedRemote, MemoryStore, PeerPolicy, RemoteObject};
pub use scheduler::{Scheduler, TransferJob, TransferOutcome};
pub use service::{TransferRequest, TransferService};
pub use stats::TransferStats;
pub use target::{ChunkSink, ChunkSource, FileTarget, MemoryBuffer};

/// 1 MiB
pub const MIB: u64 = 1024 * 1024;

/// 프레임당 고정 오버헤드 (길이 4 + 시퀀스 4 + CRC 4)
pub const FRAME_OVERHEAD: usize = 12;

/// 프로토콜이 허용하는 최대 청크 크기 (512KB)
pub const MAX_CHUNK_SIZE: usize = 512 * 1024;

/// 작은 페이로드용 청크 크기 (256KB)
pub const SMALL_CHUNK_SIZE: usize = 256 * 1024;

/// 기본 송신 스크래치 버퍼 크기 (512KB + 헤더 여유분)
pub const DEFAULT_SCRATCH_SIZE: usize = MAX_CHUNK_SIZE + 64;
