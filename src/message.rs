//! 프레임 페이로드로 오가는 전송 메시지
//!
//! 요청 하나에 응답 하나. 상관 ID는 없으며, 연결을 잠근 상태에서
//! 요청 프레임 → 응답 프레임 순서로만 주고받는다.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::plan::Direction;
use crate::{Error, Result};

/// 원격 객체 ID
pub type ObjectId = u64;

/// 클라이언트 → 서버
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// 객체 크기 조회
    Stat { object_id: ObjectId },

    /// 전송 시작 알림. `workers`가 None이면 단일 스트림
    Begin {
        object_id: ObjectId,
        direction: Direction,
        total_size: u64,
        workers: Option<u32>,
    },

    /// 청크 읽기
    GetPart {
        object_id: ObjectId,
        offset: u64,
        limit: u32,
    },

    /// 청크 쓰기
    SavePart {
        object_id: ObjectId,
        offset: u64,
        data: Bytes,
    },

    /// 전송 종료
    Close { object_id: ObjectId },
}

/// 서버 → 클라이언트
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Info { total_size: u64 },
    Ready,
    Part { offset: u64, data: Bytes },
    Saved { offset: u64, len: u32 },
    WorkersUnsupported { workers: u32 },
    Closed,
    Error { message: String },
}

impl Request {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// 로그용 이름
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Stat { .. } => "Stat",
            Request::Begin { .. } => "Begin",
            Request::GetPart { .. } => "GetPart",
            Request::SavePart { .. } => "SavePart",
            Request::Close { .. } => "Close",
        }
    }
}

impl Response {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Response::Info { .. } => "Info",
            Response::Ready => "Ready",
            Response::Part { .. } => "Part",
            Response::Saved { .. } => "Saved",
            Response::WorkersUnsupported { .. } => "WorkersUnsupported",
            Response::Closed => "Closed",
            Response::Error { .. } => "Error",
        }
    }

    /// 원격 에러 응답을 [`Error`]로 변환, 그 외에는 그대로
    pub fn into_result(self) -> Result<Self> {
        match self {
            Response::Error { message } => Err(Error::Remote(message)),
            other => Ok(other),
        }
    }

    /// 기대한 응답이 아닐 때의 에러
    pub fn unexpected(&self, expected: &str) -> Error {
        Error::UnexpectedMessage {
            expected: expected.to_string(),
            got: self.kind().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_part_serialization() {
        let req = Request::SavePart {
            object_id: 9,
            offset: 1024,
            data: Bytes::from_static(b"chunk"),
        };
        let bytes = req.to_bytes().unwrap();
        assert_eq!(Request::from_bytes(&bytes).unwrap(), req);
    }

    #[test]
    fn test_garbage_is_serialization_error() {
        assert!(matches!(
            Response::from_bytes(&[0xFF, 0xFF, 0xFF, 0xFF]),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_error_response_into_result() {
        let resp = Response::Error {
            message: "no such object".into(),
        };
        assert!(matches!(resp.into_result(), Err(Error::Remote(m)) if m == "no such object"));
        assert!(Response::Ready.into_result().is_ok());
    }
}
