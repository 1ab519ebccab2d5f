//! # widepath
//!
//! 다중 TCP 스트림 광역망 전송 엔진
//!
//! ## 핵심 특징
//! - **경로 (Path Set)**: 한 원격지로 여러 TCP 채널을 함께 열고, 하나라도 실패하면 모두 닫음
//! - **전이중 분할 전송**: 송수신 버퍼를 채널 수로 나눠 모든 채널에서 동시에 처리
//! - **윈도우 조정**: 채널별 소켓 버퍼 크기 설정, 플랫폼이 제한한 실제 크기 보고
//! - **전역 페이싱**: 공유 토큰 버킷으로 채널 합산 송신 속도 제한
//! - **C 인터페이스**: 핸들 기반 `widepath_*` 함수

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod pacing;
pub mod path;
pub mod stats;
pub mod transfer;

#[cfg(test)]
mod test_util;

pub use channel::{Channel, Endpoint, Role, WindowSize};
pub use config::{Config, RemainderPlacement};
pub use engine::{Engine, Exchange, Exchanged, PathId};
pub use error::{Error, Result};
pub use pacing::Pacer;
pub use path::PathSet;
pub use stats::{ChannelStats, ChannelTransfer, TransferReport};
pub use transfer::partition;

/// 기본 채널 윈도우 크기 (바이트)
pub const DEFAULT_WINDOW_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// 기본 송수신 청크 크기 (바이트)
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024; // 8KB

/// 기본 시작 포트
pub const DEFAULT_BASE_PORT: u16 = 16256;
