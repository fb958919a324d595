//! 루프백 TCP 위의 종단 간 전송 테스트

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use mtpipe::frame;
use mtpipe::message::Request;
use mtpipe::remote::FrameServer;
use mtpipe::{
    ChunkRange, Config, Connection, ConnectionPool, Direction, Error, FileTarget, FramedRemote,
    MemoryBuffer, MemoryStore, PeerPolicy, ProgressSnapshot, ProgressTracker, RemoteObject,
    Scheduler, TransferJob, TransferRequest, TransferService, MIB,
};
use rand::RngCore;

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

struct TestServer {
    addr: String,
    server: Arc<FrameServer>,
    handle: tokio::task::JoinHandle<mtpipe::Result<()>>,
}

impl TestServer {
    async fn start(store: MemoryStore, policy: PeerPolicy) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = Arc::new(FrameServer::new(Config::default(), Arc::new(store), policy));

        let handle = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        Self {
            addr,
            server,
            handle,
        }
    }

    async fn remote(&self, object_id: u64) -> Arc<FramedRemote> {
        let config = Config::default();
        let pool = ConnectionPool::connect(&self.addr, config.connections_per_transfer, &config)
            .await
            .unwrap();
        Arc::new(FramedRemote::new(Arc::new(pool), object_id))
    }

    async fn stop(self) {
        self.server.stop();
        self.handle.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn download_over_tcp() {
    let payload = random_bytes(7 * MIB as usize + 4321);
    let store = MemoryStore::new();
    store.insert(1, payload.clone());
    let server = TestServer::start(store, PeerPolicy::modern()).await;

    let service = TransferService::new(Config::default()).unwrap();
    let (tracker_tx, mut tracker_rx) = tokio::sync::mpsc::unbounded_channel();
    let progress = move |snapshot: &ProgressSnapshot| -> mtpipe::Result<()> {
        tracker_tx.send(snapshot.bytes_done).ok();
        Ok(())
    };
    let request = TransferRequest::new(1).with_progress(Arc::new(progress));

    let sink = Arc::new(MemoryBuffer::new());
    let outcome = service
        .download(request, server.remote(1).await, sink.clone())
        .await
        .unwrap();

    assert!(outcome.is_completed(), "{outcome:?}");
    let stats = outcome.stats();
    assert_eq!(stats.workers, 16);
    assert_eq!(stats.chunk_size, 512 * 1024);
    assert_eq!(stats.completed_chunks, 15);
    assert_eq!(sink.to_vec(), payload);

    // 첫 보고와 완료 보고는 반드시 나간다
    let mut reports = Vec::new();
    while let Ok(done) = tracker_rx.try_recv() {
        reports.push(done);
    }
    assert!(reports.len() >= 2);
    assert_eq!(reports.last().copied(), Some(payload.len() as u64));

    server.stop().await;
}

#[tokio::test]
async fn upload_over_tcp_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let payload = random_bytes(3 * MIB as usize + 1);
    let input = dir.path().join("input.bin");
    tokio::fs::write(&input, &payload).await.unwrap();

    let saved_dir = dir.path().join("uploads");
    tokio::fs::create_dir_all(&saved_dir).await.unwrap();
    let store = MemoryStore::with_persist_dir(&saved_dir);
    let server = TestServer::start(store, PeerPolicy::modern()).await;

    let service = TransferService::new(Config::default()).unwrap();
    let source = Arc::new(FileTarget::open(&input).await.unwrap());
    let outcome = service
        .upload(TransferRequest::new(2), source, server.remote(7).await)
        .await
        .unwrap();

    assert!(outcome.is_completed(), "{outcome:?}");
    assert_eq!(outcome.stats().workers, 16);

    let saved = tokio::fs::read(saved_dir.join("7.bin")).await.unwrap();
    assert_eq!(saved, payload);

    server.stop().await;
}

#[tokio::test]
async fn legacy_server_falls_back_to_single_stream() {
    let payload = random_bytes(MIB as usize);
    let store = MemoryStore::new();
    store.insert(1, payload.clone());
    let server = TestServer::start(store, PeerPolicy::legacy()).await;

    let service = TransferService::new(Config::default()).unwrap();
    let sink = Arc::new(MemoryBuffer::new());
    let outcome = service
        .download(TransferRequest::new(1), server.remote(1).await, sink.clone())
        .await
        .unwrap();

    assert!(outcome.is_completed(), "{outcome:?}");
    assert!(outcome.stats().fell_back);
    assert_eq!(outcome.stats().workers, 1);
    assert_eq!(sink.to_vec(), payload);

    server.stop().await;
}

#[tokio::test]
async fn download_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let payload = random_bytes(600 * 1024);
    let store = MemoryStore::new();
    store.insert(3, payload.clone());
    let server = TestServer::start(store, PeerPolicy::modern()).await;

    let remote = server.remote(3).await;
    let size = remote.stat().await.unwrap();
    let path = dir.path().join("out.bin");
    let sink = Arc::new(FileTarget::create(&path, size).await.unwrap());

    let job = Arc::new(TransferJob::new(1, Direction::Download, size));
    let tracker = Arc::new(ProgressTracker::silent(size));
    let outcome = Scheduler::new()
        .download(job, remote, sink.clone(), tracker)
        .await;
    sink.sync().await.unwrap();

    assert!(outcome.is_completed());
    assert_eq!(tokio::fs::read(&path).await.unwrap(), payload);

    server.stop().await;
}

#[tokio::test]
async fn corrupt_response_fails_job() {
    // 요청을 받으면 CRC가 깨진 응답을 돌려주는 서버
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut conn = Connection::from_stream(stream, "client", &Config::default());
                let _ = conn.receive_idle().await;
                let mut stream_bytes = frame::encode(0, b"not a real response");
                let last = stream_bytes.len() - 1;
                stream_bytes[last] ^= 0x01;
                // 코덱을 거치지 않고 직접 쓴다
                let mut raw = conn.into_inner();
                raw.write_all(&stream_bytes).await.ok();
                tokio::time::sleep(Duration::from_secs(1)).await;
            });
        }
    });

    let config = Config::default();
    let pool = Arc::new(ConnectionPool::connect(&addr, 1, &config).await.unwrap());
    let remote = FramedRemote::new(pool.clone(), 1);

    let err = remote.stat().await.unwrap_err();
    assert!(err.is_corrupt_frame(), "{err}");
    assert_eq!(pool.active_count(), 0);
    assert!(matches!(remote.stat().await, Err(Error::NoConnection)));
}

#[tokio::test]
async fn service_reports_missing_object_as_failure() {
    let server = TestServer::start(MemoryStore::new(), PeerPolicy::modern()).await;
    let service = TransferService::new(Config::default()).unwrap();

    let outcome = service
        .download(TransferRequest::new(5), server.remote(404).await, Arc::new(MemoryBuffer::new()))
        .await
        .unwrap();

    assert!(matches!(outcome.error(), Some(Error::Remote(m)) if m.contains("404")));
    assert!(!service.governor().is_active(5));

    server.stop().await;
}

/// GetPart 응답만 `delay`만큼 늦게 돌려주는 서버
async fn slow_part_server(store: Arc<MemoryStore>, delay: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let store = store.clone();
            tokio::spawn(async move {
                let mut conn = Connection::from_stream(stream, "client", &Config::default());
                while let Ok(payload) = conn.receive_idle().await {
                    let request = Request::from_bytes(&payload).unwrap();
                    if matches!(request, Request::GetPart { .. }) {
                        tokio::time::sleep(delay).await;
                    }
                    let response = store.handle(request, PeerPolicy::modern()).await;
                    if conn.send(&response.to_bytes().unwrap()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn remote_is_reusable_after_job_timeout() {
    let payload = random_bytes(1000);
    let store = Arc::new(MemoryStore::new());
    store.insert(1, payload.clone());
    let addr = slow_part_server(store, Duration::from_millis(700)).await;

    let config = Config {
        job_timeout: Duration::from_millis(450),
        connections_per_transfer: 3,
        ..Config::default()
    };
    let pool = Arc::new(ConnectionPool::connect(&addr, 3, &config).await.unwrap());
    let remote = Arc::new(FramedRemote::new(pool.clone(), 1));
    let service = TransferService::new(config).unwrap();

    // Stat, Begin은 바로 끝나고 단일 청크 GetPart가 응답 전에 끊긴다
    let outcome = service
        .download(TransferRequest::new(9), remote.clone(), Arc::new(MemoryBuffer::new()))
        .await
        .unwrap();
    assert!(matches!(
        outcome.error(),
        Some(Error::JobTimeout { limit }) if *limit == Duration::from_millis(450)
    ));

    // 모든 연결을 한 바퀴 이상 돌아도 응답이 어긋나지 않는다
    for _ in 0..4 {
        assert_eq!(remote.stat().await.unwrap(), 1000);
    }
    let range = ChunkRange {
        index: 0,
        offset: 0,
        len: 1000,
    };
    assert_eq!(remote.read_chunk(range).await.unwrap().as_ref(), &payload[..]);
    assert_eq!(pool.active_count(), 2);
}
