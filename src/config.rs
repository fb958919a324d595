//! 전송 설정

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Error, Result, DEFAULT_SCRATCH_SIZE};

/// 파이프라인 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// 동시 다운로드 최대 수 (프로세스 전체)
    pub max_concurrent_downloads: usize,

    /// 동시 업로드 최대 수 (프로세스 전체)
    pub max_concurrent_uploads: usize,

    /// 연결별 송신 스크래치 버퍼 크기
    /// 이보다 큰 프레임은 별도 할당으로 인코딩
    pub scratch_buffer_size: usize,

    /// 수신 허용 최대 프레임 길이 (헤더 포함)
    pub max_frame_size: u32,

    /// TCP 연결 타임아웃
    pub connect_timeout: Duration,

    /// 프레임 단위 송수신 타임아웃
    pub io_timeout: Duration,

    /// 작업 전체 타임아웃 (호출자가 execute를 감싸서 적용)
    pub job_timeout: Duration,

    /// 진행률 스냅샷 최소 간격
    pub progress_interval: Duration,

    /// 전송 하나당 물리 연결 수
    pub connections_per_transfer: usize,

    /// 수신 프레임의 시퀀스 번호 검증 여부 (기본: 끔)
    pub strict_sequence: bool,

    /// 서버가 받아들이는 업로드 객체 최대 크기
    pub max_object_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 24,
            max_concurrent_uploads: 24,
            scratch_buffer_size: DEFAULT_SCRATCH_SIZE,
            max_frame_size: 16 * 1024 * 1024,           // 16MB
            connect_timeout: Duration::from_secs(10),
            io_timeout: Duration::from_secs(60),
            job_timeout: Duration::from_secs(20 * 60),  // 20분
            progress_interval: Duration::from_secs(4),
            connections_per_transfer: 4,
            strict_sequence: false,
            max_object_size: crate::remote::DEFAULT_MAX_OBJECT_SIZE,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 저사양 기기용 설정
    pub fn low_spec() -> Self {
        Self {
            max_concurrent_downloads: 4,
            max_concurrent_uploads: 4,
            scratch_buffer_size: 256 * 1024 + 64,
            max_frame_size: 4 * 1024 * 1024,
            connections_per_transfer: 2,
            ..Self::default()
        }
    }

    /// 고성능 기기용 설정
    pub fn high_performance() -> Self {
        Self {
            max_concurrent_downloads: 64,
            max_concurrent_uploads: 64,
            connections_per_transfer: 8,
            io_timeout: Duration::from_secs(30),
            ..Self::default()
        }
    }

    /// 기본값 위에 환경 변수를 덮어쓴 설정
    ///
    /// - `MAX_CONCURRENT_DOWNLOADS`, `MAX_CONCURRENT_UPLOADS`
    /// - `MTPIPE_PROGRESS_INTERVAL_SECS`, `MTPIPE_JOB_TIMEOUT_SECS`
    /// - `MTPIPE_CONNECTIONS`, `MTPIPE_MAX_OBJECT_SIZE`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, "MAX_CONCURRENT_DOWNLOADS")? {
            config.max_concurrent_downloads = v as usize;
        }
        if let Some(v) = parse_var(&lookup, "MAX_CONCURRENT_UPLOADS")? {
            config.max_concurrent_uploads = v as usize;
        }
        if let Some(v) = parse_var(&lookup, "MTPIPE_PROGRESS_INTERVAL_SECS")? {
            config.progress_interval = Duration::from_secs(v);
        }
        if let Some(v) = parse_var(&lookup, "MTPIPE_JOB_TIMEOUT_SECS")? {
            config.job_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_var(&lookup, "MTPIPE_CONNECTIONS")? {
            config.connections_per_transfer = v as usize;
        }
        if let Some(v) = parse_var(&lookup, "MTPIPE_MAX_OBJECT_SIZE")? {
            config.max_object_size = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// 설정 값 검증
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 || self.max_concurrent_uploads == 0 {
            return Err(Error::InvalidConfig("동시 전송 수는 1 이상이어야 함".into()));
        }
        if self.connections_per_transfer == 0 {
            return Err(Error::InvalidConfig("연결 수는 1 이상이어야 함".into()));
        }
        if (self.max_frame_size as usize) < crate::FRAME_OVERHEAD + crate::MAX_CHUNK_SIZE {
            return Err(Error::InvalidConfig(format!(
                "max_frame_size {}가 최대 청크 프레임보다 작음",
                self.max_frame_size
            )));
        }
        if self.progress_interval.is_zero() {
            warn!("progress_interval이 0: 모든 진행률 갱신이 전달됨");
        }
        Ok(())
    }
}

fn parse_var<F>(lookup: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| Error::InvalidConfig(format!("{key}={raw}: {e}"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_concurrent_downloads, 24);
        assert_eq!(config.progress_interval, Duration::from_secs(4));
        assert_eq!(config.job_timeout, Duration::from_secs(1200));
        assert!(Config::low_spec().validate().is_ok());
        assert!(Config::high_performance().validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("MAX_CONCURRENT_DOWNLOADS", "3"),
            ("MAX_CONCURRENT_UPLOADS", " 5 "),
            ("MTPIPE_PROGRESS_INTERVAL_SECS", "1"),
            ("MTPIPE_MAX_OBJECT_SIZE", "1048576"),
        ]))
        .unwrap();

        assert_eq!(config.max_concurrent_downloads, 3);
        assert_eq!(config.max_concurrent_uploads, 5);
        assert_eq!(config.progress_interval, Duration::from_secs(1));
        assert_eq!(config.connections_per_transfer, 4);
        assert_eq!(config.max_object_size, 1024 * 1024);
    }

    #[test]
    fn test_env_rejects_garbage_and_zero() {
        let bad = Config::from_lookup(lookup_from(&[("MAX_CONCURRENT_DOWNLOADS", "many")]));
        assert!(matches!(bad, Err(Error::InvalidConfig(_))));

        let zero = Config::from_lookup(lookup_from(&[("MTPIPE_CONNECTIONS", "0")]));
        assert!(matches!(zero, Err(Error::InvalidConfig(_))));
    }
}
