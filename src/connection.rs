//! 프레임 단위 연결
//!
//! 소켓 하나를 소유하고 [`FrameEncoder`]/[`FrameDecoder`]로 송수신한다.
//! IO 에러나 프레임 손상이 한 번이라도 나면 연결은 닫히고 이후 모든 호출은
//! [`Error::ConnectionClosed`]로 실패한다.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::frame::{Frame, FrameDecoder, FrameEncoder};
use crate::{Config, Error, Result};

/// 프레임 연결
pub struct Connection<S = TcpStream> {
    stream: S,
    encoder: FrameEncoder,
    decoder: FrameDecoder,
    io_timeout: Duration,
    peer: String,
    closed: bool,
}

impl Connection<TcpStream> {
    /// TCP 연결 수립
    pub async fn connect(addr: &str, config: &Config) -> Result<Self> {
        let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(Error::Connect {
                    addr: addr.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(Error::ConnectTimeout {
                    addr: addr.to_string(),
                })
            }
        };
        stream.set_nodelay(true)?;

        info!("Connected to {}", addr);
        Ok(Self::from_stream(stream, addr, config))
    }
}

impl<S> Connection<S> {
    /// 스트림 상태를 알 수 없게 된 연결을 닫힌 것으로 표시 (shutdown 없이)
    pub(crate) fn abandon(&mut self) {
        if !self.closed {
            self.closed = true;
            debug!("Connection abandoned mid-exchange: {}", self.peer);
        }
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// 이미 열린 스트림으로 연결 생성 (시퀀스 번호는 0부터)
    pub fn from_stream(stream: S, peer: impl Into<String>, config: &Config) -> Self {
        Self {
            stream,
            encoder: FrameEncoder::new(config.scratch_buffer_size),
            decoder: FrameDecoder::new(config.max_frame_size, config.strict_sequence),
            io_timeout: config.io_timeout,
            peer: peer.into(),
            closed: false,
        }
    }

    /// 페이로드 하나를 프레임으로 전송
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }

        let io_timeout = self.io_timeout;
        let stream = &mut self.stream;
        let frame = self.encoder.encode_next(payload);
        let write = async move {
            stream.write_all(&frame).await?;
            stream.flush().await
        };
        let result = match tokio::time::timeout(io_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Err(Error::IoTimeout),
        };

        result.map_err(|e| self.fail(e))
    }

    /// 프레임 하나 수신 (IO 타임아웃 적용)
    pub async fn receive(&mut self) -> Result<Bytes> {
        self.receive_frame().await.map(|frame| frame.payload)
    }

    /// 시퀀스 번호까지 포함한 프레임 수신
    pub async fn receive_frame(&mut self) -> Result<Frame> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }

        let read = self.decoder.read_frame(&mut self.stream);
        let result = match tokio::time::timeout(self.io_timeout, read).await {
            Ok(result) => result,
            Err(_) => Err(Error::IoTimeout),
        };

        result.map_err(|e| self.fail(e))
    }

    /// 요청 대기용 수신 (타임아웃 없음)
    pub async fn receive_idle(&mut self) -> Result<Bytes> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }

        let result = self.decoder.read_frame(&mut self.stream).await;
        result.map(|frame| frame.payload).map_err(|e| self.fail(e))
    }

    /// 연결 종료
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.stream.shutdown().await {
            debug!("shutdown 실패 ({}): {}", self.peer, e);
        }
        debug!("Connection closed: {}", self.peer);
    }

    /// 코덱을 떼어낸 원본 스트림
    pub fn into_inner(self) -> S {
        self.stream
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// 지금까지 보낸 프레임 수
    pub fn frames_sent(&self) -> u32 {
        self.encoder.next_seq()
    }

    /// 지금까지 받은 프레임 수
    pub fn frames_received(&self) -> u32 {
        self.decoder.frames_received()
    }

    fn fail(&mut self, err: Error) -> Error {
        if err.is_connection_fatal() {
            if !self.closed {
                match &err {
                    Error::ConnectionClosed => debug!("Peer closed connection: {}", self.peer),
                    other => warn!("연결 폐기 ({}): {}", self.peer, other),
                }
            }
            self.closed = true;
        }
        err
    }
}
