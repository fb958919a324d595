//! 프레임 코덱
//!
//! ```text
//! [4 bytes LE: total_len = payload_len + 12]
//! [4 bytes LE: sequence]
//! [payload_len bytes: payload]
//! [4 bytes LE: CRC32(total_len ‖ sequence ‖ payload)]
//! ```
//!
//! 시퀀스 번호는 방향별로 0부터 1씩 증가한다. 2^32 프레임 이후는 정의하지 않음
//! (카운터는 wrap 된다).

use std::borrow::Cow;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Error, FrameFault, Result, FRAME_OVERHEAD};

/// 길이 필드 크기
const LEN_SIZE: usize = 4;

/// 길이 + 시퀀스 헤더 크기
const HEADER_SIZE: usize = 8;

/// 수신된 프레임
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// 송신측 시퀀스 번호 (진단용)
    pub seq: u32,

    /// 헤더와 체크섬이 제거된 페이로드
    pub payload: Bytes,
}

/// 프레임 하나를 새 버퍼로 인코딩
pub fn encode(seq: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; payload.len() + FRAME_OVERHEAD];
    write_frame(&mut buf, seq, payload);
    buf
}

/// 완전한 프레임 하나가 담긴 버퍼를 디코딩
///
/// 길이 필드가 버퍼 길이와 다르면 손상으로 간주
pub fn decode(buf: &[u8]) -> Result<Frame> {
    if buf.len() < FRAME_OVERHEAD {
        return Err(Error::CorruptFrame(FrameFault::Length(buf.len() as u32)));
    }
    let total_len = read_u32(&buf[..LEN_SIZE]);
    if total_len as usize != buf.len() {
        return Err(Error::CorruptFrame(FrameFault::Length(total_len)));
    }
    verify(Bytes::copy_from_slice(buf))
}

/// `dst`는 정확히 `payload.len() + FRAME_OVERHEAD` 바이트여야 함
fn write_frame(dst: &mut [u8], seq: u32, payload: &[u8]) {
    let total_len = dst.len();
    let body_end = HEADER_SIZE + payload.len();

    dst[..LEN_SIZE].copy_from_slice(&(total_len as u32).to_le_bytes());
    dst[LEN_SIZE..HEADER_SIZE].copy_from_slice(&seq.to_le_bytes());
    dst[HEADER_SIZE..body_end].copy_from_slice(payload);

    let checksum = crc32fast::hash(&dst[..body_end]);
    dst[body_end..total_len].copy_from_slice(&checksum.to_le_bytes());
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(raw)
}

/// 길이 필드까지 포함된 전체 프레임의 CRC 검증 후 페이로드 분리
fn verify(frame: Bytes) -> Result<Frame> {
    let body_end = frame.len() - 4;
    let expected = read_u32(&frame[body_end..]);
    let got = crc32fast::hash(&frame[..body_end]);
    if expected != got {
        return Err(Error::CorruptFrame(FrameFault::Checksum { expected, got }));
    }

    Ok(Frame {
        seq: read_u32(&frame[LEN_SIZE..HEADER_SIZE]),
        payload: frame.slice(HEADER_SIZE..body_end),
    })
}

/// 송신측 인코더
///
/// 연결마다 하나씩 두며 스크래치 버퍼를 재사용한다.
#[derive(Debug)]
pub struct FrameEncoder {
    scratch: Vec<u8>,
    next_seq: u32,
}

impl FrameEncoder {
    pub fn new(scratch_size: usize) -> Self {
        Self {
            scratch: vec![0u8; scratch_size],
            next_seq: 0,
        }
    }

    /// 다음 프레임에 쓰일 시퀀스 번호
    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    /// 스크래치 버퍼 용량
    pub fn scratch_capacity(&self) -> usize {
        self.scratch.len()
    }

    /// 다음 시퀀스 번호로 프레임 인코딩
    ///
    /// 스크래치 버퍼에 들어가면 빌려주고, 넘치면 새로 할당한다.
    /// 어느 쪽이든 출력 바이트는 동일.
    pub fn encode_next(&mut self, payload: &[u8]) -> Cow<'_, [u8]> {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        let total_len = payload.len() + FRAME_OVERHEAD;
        if total_len <= self.scratch.len() {
            let dst = &mut self.scratch[..total_len];
            write_frame(dst, seq, payload);
            Cow::Borrowed(&self.scratch[..total_len])
        } else {
            Cow::Owned(encode(seq, payload))
        }
    }
}

/// 수신측 디코더
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: u32,
    expected_seq: u32,
    strict_sequence: bool,
}

impl FrameDecoder {
    pub fn new(max_frame_size: u32, strict_sequence: bool) -> Self {
        Self {
            max_frame_size,
            expected_seq: 0,
            strict_sequence,
        }
    }

    /// 지금까지 수신한 프레임 수 (wrap)
    pub fn frames_received(&self) -> u32 {
        self.expected_seq
    }

    /// 스트림에서 프레임 하나 읽기
    ///
    /// 읽는 도중 스트림이 닫히면 [`Error::ConnectionClosed`],
    /// 길이/CRC가 맞지 않으면 [`Error::CorruptFrame`].
    pub async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Frame>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_bytes = [0u8; LEN_SIZE];
        read_exact_or_closed(reader, &mut len_bytes).await?;

        let total_len = u32::from_le_bytes(len_bytes);
        if (total_len as usize) < FRAME_OVERHEAD || total_len > self.max_frame_size {
            return Err(Error::CorruptFrame(FrameFault::Length(total_len)));
        }

        let mut buf = BytesMut::zeroed(total_len as usize);
        buf[..LEN_SIZE].copy_from_slice(&len_bytes);
        read_exact_or_closed(reader, &mut buf[LEN_SIZE..]).await?;

        let frame = verify(buf.freeze())?;

        if self.strict_sequence && frame.seq != self.expected_seq {
            return Err(Error::SequenceMismatch {
                expected: self.expected_seq,
                got: frame.seq,
            });
        }
        self.expected_seq = self.expected_seq.wrapping_add(1);

        Ok(frame)
    }
}

async fn read_exact_or_closed<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::ConnectionClosed),
        Err(e) => Err(Error::Io(e)),
    }
}
