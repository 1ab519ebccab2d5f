//! 에러 타입 정의

use thiserror::Error;

use crate::channel::Endpoint;
use crate::engine::PathId;

/// widepath 전송 엔진 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("연결 실패: {endpoint}: {source}")]
    Connect {
        endpoint: Endpoint,
        source: std::io::Error,
    },

    #[error("경로 생성 실패: 채널 {index}/{count} 열기 실패")]
    PathSetCreation {
        index: usize,
        count: usize,
        source: Box<Error>,
    },

    #[error("유효하지 않은 채널 인덱스: {index} (채널 수 {count})")]
    InvalidChannelIndex { index: usize, count: usize },

    #[error("중복된 채널 인덱스: {index}")]
    DuplicateChannelIndex { index: usize },

    #[error("채널이 지정되지 않음")]
    NoChannels,

    #[error("전송 실패: 채널 {channel}")]
    Transfer { channel: usize, source: Box<Error> },

    #[error("연결 에러: 채널 {channel}: {source}")]
    Connection {
        channel: usize,
        source: std::io::Error,
    },

    #[error("상대편 연결 종료: 채널 {channel}")]
    ConnectionClosed { channel: usize },

    #[error("닫힌 채널: {channel}")]
    ChannelClosed { channel: usize },

    #[error("알 수 없는 경로: {path}")]
    UnknownPath { path: PathId },

    #[error("동적 수신 크기 초과: 수신 {found} bytes, 최대 {max} bytes")]
    DynamicSizeExceeded { found: u64, max: usize },

    #[error("동적 수신 크기 불일치: 채널 {channel}, expected {expected}, got {got}")]
    DynamicSizeMismatch {
        channel: usize,
        expected: u64,
        got: u64,
    },

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("비동기 교환 중단: {0}")]
    ExchangeAborted(String),

    #[error("런타임 에러: {0}")]
    Runtime(String),
}

impl Error {
    /// 실패한 채널 인덱스 (해당되는 경우)
    pub fn channel(&self) -> Option<usize> {
        match self {
            Error::Transfer { channel, .. }
            | Error::Connection { channel, .. }
            | Error::ConnectionClosed { channel }
            | Error::ChannelClosed { channel }
            | Error::DynamicSizeMismatch { channel, .. } => Some(*channel),
            Error::PathSetCreation { index, .. } => Some(*index),
            Error::InvalidChannelIndex { index, .. } | Error::DuplicateChannelIndex { index } => {
                Some(*index)
            }
            _ => None,
        }
    }

    /// 송수신 도중 연결이 끊어진 경우
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection { .. } | Error::ConnectionClosed { .. } | Error::ChannelClosed { .. } => {
                true
            }
            Error::Transfer { source, .. } => source.is_connection_error(),
            _ => false,
        }
    }

    /// C 인터페이스용 음수 상태 코드
    pub fn code(&self) -> i32 {
        match self {
            Error::Connect { .. } => -1,
            Error::PathSetCreation { .. } => -2,
            Error::InvalidChannelIndex { .. } | Error::DuplicateChannelIndex { .. } => -3,
            Error::Transfer { .. } => -4,
            Error::Connection { .. } | Error::ConnectionClosed { .. } | Error::ChannelClosed { .. } => {
                -5
            }
            Error::NoChannels | Error::InvalidConfig(_) => -6,
            Error::UnknownPath { .. } => -7,
            Error::DynamicSizeExceeded { .. } | Error::DynamicSizeMismatch { .. } => -8,
            Error::ExchangeAborted(_) | Error::Runtime(_) => -9,
            Error::Io(_) => -10,
        }
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
