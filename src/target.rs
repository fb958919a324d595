//! 로컬 쪽 청크 입출력
//!
//! 다운로드는 [`ChunkSink`]에 오프셋 단위로 쓰고, 업로드는 [`ChunkSource`]에서
//! 오프셋 단위로 읽는다. 청크들은 순서 없이 동시에 들어온다.

use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::{Error, Result};

/// 다운로드 대상
pub trait ChunkSink: Send + Sync + 'static {
    /// `offset` 위치에 `data` 기록
    fn write_at(&self, offset: u64, data: Bytes) -> impl Future<Output = Result<()>> + Send;
}

/// 업로드 원본
pub trait ChunkSource: Send + Sync + 'static {
    /// 전체 크기
    fn size(&self) -> u64;

    /// `offset`부터 정확히 `len` 바이트 읽기
    fn read_at(&self, offset: u64, len: u32) -> impl Future<Output = Result<Bytes>> + Send;
}

/// 메모리 버퍼
#[derive(Debug, Clone, Default)]
pub struct MemoryBuffer {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemoryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 크기를 미리 잡아둔 빈 버퍼
    pub fn with_size(size: usize) -> Self {
        Self::from_vec(vec![0u8; size])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(data)),
        }
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    /// 현재 내용 복사본
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    fn store(&self, offset: u64, data: &[u8]) {
        let start = offset as usize;
        let end = start + data.len();
        let mut buf = self.data.lock();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(data);
    }

    fn load(&self, offset: u64, len: u32) -> Result<Bytes> {
        let buf = self.data.lock();
        let start = offset as usize;
        let end = start.saturating_add(len as usize);
        if end > buf.len() {
            return Err(Error::ShortChunk {
                offset,
                expected: len as u64,
                got: buf.len().saturating_sub(start) as u64,
            });
        }
        Ok(Bytes::copy_from_slice(&buf[start..end]))
    }
}

impl ChunkSink for MemoryBuffer {
    fn write_at(&self, offset: u64, data: Bytes) -> impl Future<Output = Result<()>> + Send {
        self.store(offset, &data);
        std::future::ready(Ok(()))
    }
}

impl ChunkSource for MemoryBuffer {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    fn read_at(&self, offset: u64, len: u32) -> impl Future<Output = Result<Bytes>> + Send {
        std::future::ready(self.load(offset, len))
    }
}

/// 파일 대상
///
/// 핸들 하나를 잠금으로 공유하므로 seek + 읽기/쓰기가 한 단위로 묶인다.
pub struct FileTarget {
    file: tokio::sync::Mutex<File>,
    path: PathBuf,
    size: u64,
}

impl FileTarget {
    /// 다운로드용 파일 생성 (기존 내용 삭제)
    pub async fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.set_len(size).await?;

        debug!("Created {} ({} bytes)", path.display(), size);
        Ok(Self {
            file: tokio::sync::Mutex::new(file),
            path,
            size,
        })
    }

    /// 업로드용 파일 열기
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        let size = file.metadata().await?.len();

        Ok(Self {
            file: tokio::sync::Mutex::new(file),
            path,
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 버퍼된 쓰기를 디스크에 반영
    pub async fn sync(&self) -> Result<()> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
}

impl ChunkSink for FileTarget {
    async fn write_at(&self, offset: u64, data: Bytes) -> Result<()> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&data).await?;
        Ok(())
    }
}

impl ChunkSource for FileTarget {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&self, offset: u64, len: u32) -> Result<Bytes> {
        let mut buf = vec![0u8; len as usize];
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(Error::ShortChunk {
                    offset,
                    expected: len as u64,
                    got: filled as u64,
                });
            }
            filled += n;
        }
        Ok(Bytes::from(buf))
    }
}
