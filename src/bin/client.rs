//! mtpipe 클라이언트
//!
//! 사용법:
//!   cargo run --release --bin mtpipe-client -- <COMMAND> [OPTIONS]
//!
//! 예시:
//!   # 객체 1을 out.bin으로 다운로드
//!   cargo run --release --bin mtpipe-client -- download --server 127.0.0.1:9000 out.bin
//!
//!   # data.bin을 객체 7로 업로드
//!   cargo run --release --bin mtpipe-client -- upload --object-id 7 data.bin

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mtpipe::message::ObjectId;
use mtpipe::progress::ProgressSnapshot;
use mtpipe::{
    Config, ConnectionPool, FileTarget, FramedRemote, ProgressCallback, RemoteObject,
    TransferOutcome, TransferRequest, TransferService,
};

#[derive(Parser)]
#[command(name = "mtpipe-client")]
#[command(about = "Parallel chunked transfers over the mtpipe framed transport")]
struct Cli {
    /// 서버 주소
    #[arg(short, long, global = true, default_value = "127.0.0.1:9000")]
    server: String,

    /// 원격 객체 ID
    #[arg(long, global = true, default_value_t = 1)]
    object_id: ObjectId,

    /// 전송당 연결 수 (기본: 설정값)
    #[arg(short, long, global = true)]
    connections: Option<usize>,

    /// 디버그 로그
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 객체를 파일로 다운로드
    Download {
        /// 저장할 파일
        output: PathBuf,
    },

    /// 파일을 객체로 업로드
    Upload {
        /// 올릴 파일
        input: PathBuf,
    },
}

fn print_progress(label: &'static str) -> ProgressCallback {
    Arc::new(move |snapshot: &ProgressSnapshot| -> mtpipe::Result<()> {
        if snapshot.is_final() {
            println!("{}", snapshot.completion_text(label));
        } else {
            println!("{}", snapshot.status_text(label));
        }
        Ok(())
    })
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
    if let Some(connections) = cli.connections {
        config.connections_per_transfer = connections;
    }

    let service = Arc::new(TransferService::new(config.clone())?);
    let pool = ConnectionPool::connect(&cli.server, config.connections_per_transfer, &config).await?;
    let pool = Arc::new(pool);
    let remote = Arc::new(FramedRemote::new(pool.clone(), cli.object_id));

    // Ctrl+C는 진행 중인 작업 취소
    let requester = std::process::id() as u64;
    {
        let service = service.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                service.cancel(requester);
            }
        });
    }

    let request = TransferRequest::new(requester)
        .on_queued(|id| info!("Queue full, requester {} waiting for a slot", id));

    let outcome = match &cli.command {
        Commands::Download { output } => {
            let size = remote.stat().await?;
            let sink = Arc::new(FileTarget::create(output, size).await?);
            let outcome = service
                .download(request.with_progress(print_progress("Download")), remote, sink.clone())
                .await?;
            sink.sync().await?;
            outcome
        }
        Commands::Upload { input } => {
            let source = Arc::new(FileTarget::open(input).await?);
            service
                .upload(request.with_progress(print_progress("Upload")), source, remote)
                .await?
        }
    };

    pool.close_all().await;

    match outcome {
        TransferOutcome::Completed(stats) => {
            info!("{}", stats.summary());
            Ok(())
        }
        TransferOutcome::Cancelled(stats) => {
            info!("Cancelled: {}", stats.summary());
            Ok(())
        }
        TransferOutcome::Failed { error, stats } => {
            error!("Transfer failed: {} ({})", error, stats.summary());
            Err(error.into())
        }
    }
}
