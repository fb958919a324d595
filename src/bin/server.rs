//! mtpipe 서버
//!
//! 파일 하나를 객체로 내보내고, 업로드된 객체는 메모리에 받았다가 닫힐 때
//! 디렉토리에 저장한다.
//!
//! 사용법:
//!   cargo run --release --bin mtpipe-server -- [OPTIONS]
//!
//! 예시:
//!   # data.bin을 객체 1로 제공
//!   cargo run --release --bin mtpipe-server -- --bind 0.0.0.0:9000 --file data.bin
//!
//!   # 업로드 저장 + 워커 수 파라미터를 모르는 구버전 피어 흉내
//!   cargo run --release --bin mtpipe-server -- --output-dir ./uploads --legacy

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mtpipe::message::ObjectId;
use mtpipe::remote::FrameServer;
use mtpipe::{Config, MemoryStore, PeerPolicy};

#[derive(Parser)]
#[command(name = "mtpipe-server")]
#[command(about = "Serve objects over the mtpipe framed transport")]
struct Cli {
    /// 바인드 주소
    #[arg(short, long, default_value = "0.0.0.0:9000")]
    bind: String,

    /// 제공할 파일
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// 제공 파일의 객체 ID
    #[arg(long, default_value_t = 1)]
    object_id: ObjectId,

    /// 업로드 저장 디렉토리
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// 워커 수가 지정된 요청 거부
    #[arg(long)]
    legacy: bool,

    /// 수신 프레임 시퀀스 검증
    #[arg(long)]
    strict_sequence: bool,

    /// 디버그 로그
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // 로깅 설정 (RUST_LOG 우선)
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut config = Config::from_env()?;
    config.strict_sequence = cli.strict_sequence;

    let store = match &cli.output_dir {
        Some(dir) => {
            tokio::fs::create_dir_all(dir).await?;
            MemoryStore::with_persist_dir(dir)
        }
        None => MemoryStore::new(),
    }
    .with_max_object_size(config.max_object_size);

    if let Some(path) = &cli.file {
        let data = tokio::fs::read(path).await?;
        info!(
            "Serving {} as object {} ({} bytes)",
            path.display(),
            cli.object_id,
            data.len()
        );
        store.insert(cli.object_id, data);
    }

    let policy = if cli.legacy {
        PeerPolicy::legacy()
    } else {
        PeerPolicy::modern()
    };

    let listener = TcpListener::bind(&cli.bind).await?;
    let server = Arc::new(FrameServer::new(config, Arc::new(store), policy));

    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    server.stop();
    serving.await??;

    Ok(())
}
