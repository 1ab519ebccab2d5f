//! 엔진 설정

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result, DEFAULT_CHUNK_SIZE, DEFAULT_WINDOW_SIZE};

/// 자동 튜닝 시 경로 전체에 나눠 줄 윈도우 크기 (바이트)
pub const AUTOTUNE_PATH_WINDOW: usize = 32 * 1024 * 1024;

/// 자동 튜닝 시 전역 페이싱 상한 (bytes/sec)
pub const AUTOTUNE_PACING_RATE: f64 = 1200.0 * 1024.0 * 1024.0;

/// 나머지 바이트 배치 방식
///
/// 길이 L을 N개 채널로 나눌 때 `L % N`개의 채널이 1바이트씩 더 맡는다.
/// 양쪽 엔드포인트가 같은 방식을 사용해야 슬라이스 경계가 일치한다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RemainderPlacement {
    /// 뒤쪽 채널이 나머지를 맡음
    #[default]
    Trailing,

    /// 앞쪽 채널이 나머지를 맡음 (기존 피어 호환)
    Leading,
}

/// 전송 엔진 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// 채널별 TCP 윈도우 (송수신 소켓 버퍼) 크기
    /// 0이면 OS 기본값 유지
    pub window_size: usize,

    /// 쓰기 한 번에 넘기는 최대 바이트 (페이싱 단위)
    pub send_chunk_size: usize,

    /// 읽기 한 번에 받는 최대 바이트
    pub recv_chunk_size: usize,

    /// 기본 페이서의 초기 상한 (bytes/sec)
    /// 0이면 무제한
    pub pacing_rate: f64,

    /// 토큰 버킷 깊이 (밀리초, 상한 속도 기준)
    pub pacing_burst_ms: u64,

    /// 채널당 연결 시도 횟수
    pub connect_attempts: u32,

    /// 연결 재시도 간격 (밀리초)
    pub connect_retry_interval_ms: u64,

    /// 경로 생성 시 윈도우/페이싱 자동 조정
    pub autotune: bool,

    /// 분할 나머지 배치
    pub remainder: RemainderPlacement,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,  // 16MB
            send_chunk_size: DEFAULT_CHUNK_SIZE,
            recv_chunk_size: DEFAULT_CHUNK_SIZE,
            pacing_rate: 0.0,                  // 무제한
            pacing_burst_ms: 5,
            connect_attempts: 1,
            connect_retry_interval_ms: 50,
            autotune: false,
            remainder: RemainderPlacement::Trailing,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.send_chunk_size == 0 || self.recv_chunk_size == 0 {
            return Err(Error::InvalidConfig(
                "청크 크기는 0보다 커야 함".to_string(),
            ));
        }
        if self.pacing_rate.is_nan() || self.pacing_rate < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "페이싱 속도가 유효하지 않음: {}",
                self.pacing_rate
            )));
        }
        Ok(())
    }

    pub fn pacing_burst(&self) -> Duration {
        Duration::from_millis(self.pacing_burst_ms)
    }

    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connect_retry_interval_ms)
    }

    /// 자동 튜닝 시 채널당 윈도우 크기
    pub fn autotuned_window(&self, channels: usize) -> usize {
        AUTOTUNE_PATH_WINDOW / channels.max(1)
    }

    /// 광역망용 설정
    pub fn wide_area() -> Self {
        Self {
            connect_attempts: 100,
            connect_retry_interval_ms: 50,
            autotune: true,
            ..Self::default()
        }
    }

    /// 로컬 루프백 테스트용 설정
    pub fn loopback() -> Self {
        Self {
            window_size: 256 * 1024,
            pacing_burst_ms: 0,
            connect_attempts: 300,
            connect_retry_interval_ms: 10,
            ..Self::default()
        }
    }

    /// 기존 엔진과 같은 분할/튜닝 동작
    pub fn legacy() -> Self {
        Self {
            autotune: true,
            remainder: RemainderPlacement::Leading,
            ..Self::default()
        }
    }
}
