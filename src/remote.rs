//! 원격 객체 접근
//!
//! 클라이언트 쪽은 [`RemoteObject`] 트레이트 뒤에서 메시지를 주고받고,
//! 서버 쪽은 [`FrameServer`]가 연결마다 요청 루프를 돌며 [`MemoryStore`]에
//! 읽고 쓴다.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::message::{ObjectId, Request, Response};
use crate::plan::{ChunkRange, Direction};
use crate::pool::ConnectionPool;
use crate::{Config, Connection, Error, Result};

/// 청크 단위로 읽고 쓸 수 있는 원격 객체
pub trait RemoteObject: Send + Sync + 'static {
    /// 객체 크기 조회
    fn stat(&self) -> impl Future<Output = Result<u64>> + Send;

    /// 전송 시작 협상
    ///
    /// 피어가 워커 수 파라미터를 지원하지 않으면
    /// [`Error::WorkerParamRejected`]를 돌려준다.
    fn begin(
        &self,
        direction: Direction,
        total_size: u64,
        workers: Option<usize>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// 청크 하나 읽기. 반환 길이는 항상 `range.len`
    fn read_chunk(&self, range: ChunkRange) -> impl Future<Output = Result<Bytes>> + Send;

    /// 청크 하나 쓰기
    fn write_chunk(&self, range: ChunkRange, data: Bytes) -> impl Future<Output = Result<()>> + Send;

    /// 전송 종료 통지
    fn finish(&self) -> impl Future<Output = Result<()>> + Send;
}

/// 연결 풀 위의 원격 객체
pub struct FramedRemote<S = TcpStream> {
    pool: Arc<ConnectionPool<S>>,
    object_id: ObjectId,
}

impl<S> FramedRemote<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(pool: Arc<ConnectionPool<S>>, object_id: ObjectId) -> Self {
        Self { pool, object_id }
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<S>> {
        &self.pool
    }

    async fn call(&self, request: Request) -> Result<Response> {
        let payload = self.pool.exchange(&request.to_bytes()?).await?;
        Response::from_bytes(&payload)?.into_result()
    }
}

impl<S> RemoteObject for FramedRemote<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn stat(&self) -> Result<u64> {
        match self.call(Request::Stat { object_id: self.object_id }).await? {
            Response::Info { total_size } => Ok(total_size),
            other => Err(other.unexpected("Info")),
        }
    }

    async fn begin(&self, direction: Direction, total_size: u64, workers: Option<usize>) -> Result<()> {
        let request = Request::Begin {
            object_id: self.object_id,
            direction,
            total_size,
            workers: workers.map(|w| w as u32),
        };

        match self.call(request).await? {
            Response::Ready => Ok(()),
            Response::WorkersUnsupported { workers } => Err(Error::WorkerParamRejected {
                workers: workers as usize,
            }),
            other => Err(other.unexpected("Ready")),
        }
    }

    async fn read_chunk(&self, range: ChunkRange) -> Result<Bytes> {
        let request = Request::GetPart {
            object_id: self.object_id,
            offset: range.offset,
            limit: range.len,
        };

        match self.call(request).await? {
            Response::Part { offset, data } if offset == range.offset => {
                if data.len() != range.len as usize {
                    return Err(Error::ShortChunk {
                        offset,
                        expected: range.len as u64,
                        got: data.len() as u64,
                    });
                }
                Ok(data)
            }
            other => Err(other.unexpected("Part")),
        }
    }

    async fn write_chunk(&self, range: ChunkRange, data: Bytes) -> Result<()> {
        let request = Request::SavePart {
            object_id: self.object_id,
            offset: range.offset,
            data,
        };

        match self.call(request).await? {
            Response::Saved { offset, len } if offset == range.offset && len == range.len => Ok(()),
            other => Err(other.unexpected("Saved")),
        }
    }

    async fn finish(&self) -> Result<()> {
        match self.call(Request::Close { object_id: self.object_id }).await? {
            Response::Closed => Ok(()),
            other => Err(other.unexpected("Closed")),
        }
    }
}

/// 서버가 워커 수 파라미터를 다루는 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerPolicy {
    /// false면 워커 수가 지정된 Begin을 거부 (구버전 피어 흉내)
    pub accepts_workers: bool,
}

impl PeerPolicy {
    pub fn modern() -> Self {
        Self { accepts_workers: true }
    }

    pub fn legacy() -> Self {
        Self { accepts_workers: false }
    }
}

impl Default for PeerPolicy {
    fn default() -> Self {
        Self::modern()
    }
}

/// 업로드 객체 크기 기본 상한 (4GB)
pub const DEFAULT_MAX_OBJECT_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// 메모리 객체 저장소
#[derive(Debug)]
pub struct MemoryStore {
    objects: DashMap<ObjectId, Vec<u8>>,

    /// 업로드 진행 중인 객체
    uploads: DashMap<ObjectId, ()>,

    /// 업로드가 닫히면 `<id>.bin`으로 저장할 디렉토리
    persist_dir: Option<PathBuf>,

    /// 업로드 Begin이 요구할 수 있는 최대 크기
    max_object_size: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            objects: DashMap::new(),
            uploads: DashMap::new(),
            persist_dir: None,
            max_object_size: DEFAULT_MAX_OBJECT_SIZE,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 업로드 크기 상한 지정
    pub fn with_max_object_size(mut self, limit: u64) -> Self {
        self.max_object_size = limit;
        self
    }

    pub fn with_persist_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            persist_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn insert(&self, id: ObjectId, data: Vec<u8>) {
        self.objects.insert(id, data);
    }

    pub fn get(&self, id: ObjectId) -> Option<Vec<u8>> {
        self.objects.get(&id).map(|data| data.clone())
    }

    pub fn size(&self, id: ObjectId) -> Option<u64> {
        self.objects.get(&id).map(|data| data.len() as u64)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// 요청 하나 처리
    pub async fn handle(&self, request: Request, policy: PeerPolicy) -> Response {
        let kind = request.kind();
        match self.dispatch(request, policy).await {
            Ok(response) => response,
            Err(e) => {
                debug!("{} 요청 실패: {}", kind, e);
                Response::Error {
                    message: e.to_string(),
                }
            }
        }
    }

    async fn dispatch(&self, request: Request, policy: PeerPolicy) -> Result<Response> {
        match request {
            Request::Stat { object_id } => Ok(Response::Info {
                total_size: self.size(object_id).ok_or_else(|| missing(object_id))?,
            }),

            Request::Begin {
                workers: Some(workers),
                ..
            } if !policy.accepts_workers => {
                debug!("Begin rejected: workers={}", workers);
                Ok(Response::WorkersUnsupported { workers })
            }

            Request::Begin {
                object_id,
                direction: Direction::Download,
                total_size,
                ..
            } => {
                let size = self.size(object_id).ok_or_else(|| missing(object_id))?;
                if size != total_size {
                    return Err(Error::Remote(format!(
                        "object {object_id}: size {size}, requested {total_size}"
                    )));
                }
                Ok(Response::Ready)
            }

            Request::Begin {
                object_id,
                direction: Direction::Upload,
                total_size,
                ..
            } => {
                let buffer = self.allocate(object_id, total_size)?;
                self.objects.insert(object_id, buffer);
                self.uploads.insert(object_id, ());
                Ok(Response::Ready)
            }

            Request::GetPart {
                object_id,
                offset,
                limit,
            } => {
                let data = self.objects.get(&object_id).ok_or_else(|| missing(object_id))?;
                let start = offset as usize;
                if start > data.len() {
                    return Err(out_of_range(object_id, offset, data.len()));
                }
                let end = start.saturating_add(limit as usize).min(data.len());
                Ok(Response::Part {
                    offset,
                    data: Bytes::copy_from_slice(&data[start..end]),
                })
            }

            Request::SavePart {
                object_id,
                offset,
                data,
            } => {
                let mut object = self
                    .objects
                    .get_mut(&object_id)
                    .ok_or_else(|| missing(object_id))?;
                let start = offset as usize;
                let end = start.saturating_add(data.len());
                if end > object.len() {
                    return Err(out_of_range(object_id, offset, object.len()));
                }
                object[start..end].copy_from_slice(&data);
                Ok(Response::Saved {
                    offset,
                    len: data.len() as u32,
                })
            }

            Request::Close { object_id } => {
                if self.uploads.remove(&object_id).is_some() {
                    self.persist(object_id).await?;
                }
                Ok(Response::Closed)
            }
        }
    }

    async fn persist(&self, id: ObjectId) -> Result<()> {
        let Some(dir) = &self.persist_dir else {
            return Ok(());
        };
        let data = self.get(id).ok_or_else(|| missing(id))?;
        let path = dir.join(format!("{id}.bin"));
        tokio::fs::write(&path, &data).await?;

        info!("Saved object {} ({} bytes) to {}", id, data.len(), path.display());
        Ok(())
    }
}

impl MemoryStore {
    /// 업로드 버퍼 확보. 상한을 넘거나 할당에 실패하면 에러 응답으로 끝난다
    fn allocate(&self, id: ObjectId, total_size: u64) -> Result<Vec<u8>> {
        if total_size > self.max_object_size {
            warn!(
                "Upload {} rejected: {} bytes exceeds limit {}",
                id, total_size, self.max_object_size
            );
            return Err(Error::Remote(format!(
                "object {id}: size {total_size} exceeds limit {}",
                self.max_object_size
            )));
        }

        let len = usize::try_from(total_size)
            .map_err(|_| Error::Remote(format!("object {id}: size {total_size} not addressable")))?;
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(len)
            .map_err(|e| Error::Remote(format!("object {id}: {e}")))?;
        buffer.resize(len, 0);
        Ok(buffer)
    }
}

fn missing(id: ObjectId) -> Error {
    Error::Remote(format!("object {id} not found"))
}

fn out_of_range(id: ObjectId, offset: u64, len: usize) -> Error {
    Error::Remote(format!("object {id}: offset {offset} out of range (size {len})"))
}

/// 연결 하나의 요청 루프
///
/// 피어가 연결을 닫으면 `Ok(())`로 끝난다.
pub async fn serve_connection<S>(
    mut conn: Connection<S>,
    store: Arc<MemoryStore>,
    policy: PeerPolicy,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let payload = match conn.receive_idle().await {
            Ok(payload) => payload,
            Err(Error::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e),
        };

        let response = match Request::from_bytes(&payload) {
            Ok(request) => store.handle(request, policy).await,
            Err(e) => Response::Error {
                message: e.to_string(),
            },
        };
        conn.send(&response.to_bytes()?).await?;
    }
}

/// TCP 서버
pub struct FrameServer {
    config: Config,
    store: Arc<MemoryStore>,
    policy: PeerPolicy,
    shutdown: Notify,
}

impl FrameServer {
    pub fn new(config: Config, store: Arc<MemoryStore>, policy: PeerPolicy) -> Self {
        Self {
            config,
            store,
            policy,
            shutdown: Notify::new(),
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// [`stop`](Self::stop)이 불릴 때까지 연결 수락
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(
            "Frame server listening on {} ({:?})",
            listener.local_addr()?,
            self.policy
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("accept 에러: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("set_nodelay 실패 ({}): {}", peer, e);
                    }

                    let conn = Connection::from_stream(stream, peer.to_string(), &self.config);
                    let store = self.store.clone();
                    let policy = self.policy;
                    tokio::spawn(async move {
                        debug!("Accepted {}", peer);
                        if let Err(e) = serve_connection(conn, store, policy).await {
                            warn!("연결 처리 에러 ({}): {}", peer, e);
                        }
                    });
                }
                _ = self.shutdown.notified() => break,
            }
        }

        info!("Frame server stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.notify_one();
    }
}
