//! 전역 페이싱 (토큰 버킷)
//!
//! 하나의 `Pacer`를 공유하는 모든 채널의 합산 송신 속도를 상한 이하로 유지한다.
//! 쓰기 전에 `admit`으로 청크 크기만큼 토큰을 예약하고, 부족하면 필요한 만큼 대기한다.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::Config;

/// 버킷 상태 (mutex 내부)
#[derive(Debug)]
struct BucketState {
    /// 상한 (bytes/sec), 0이면 무제한
    rate: f64,

    /// 사용 가능한 토큰 (바이트)
    /// 음수는 이미 예약된 미래 대역폭
    tokens: f64,

    /// 버킷 깊이 (상한 속도 기준 시간)
    burst: Duration,

    /// 마지막 충전 시각
    last_refill: Instant,
}

impl BucketState {
    fn capacity(&self) -> f64 {
        self.rate * self.burst.as_secs_f64()
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + self.rate * elapsed).min(self.capacity());
        self.last_refill = now;
    }
}

/// 공유 토큰 버킷 페이서
#[derive(Debug)]
pub struct Pacer {
    state: Mutex<BucketState>,
}

impl Pacer {
    /// 새 페이서 생성
    ///
    /// `rate`가 0 이하이거나 유한하지 않으면 무제한.
    pub fn new(rate: f64, burst: Duration) -> Self {
        Self {
            state: Mutex::new(BucketState {
                rate: sanitize_rate(rate),
                tokens: 0.0,
                burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// 무제한 페이서
    pub fn unlimited() -> Self {
        Self::new(0.0, Duration::ZERO)
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.pacing_rate, config.pacing_burst())
    }

    /// 상한 변경 (0이면 해제)
    ///
    /// 버킷은 비운 상태에서 다시 시작한다.
    pub fn set_rate(&self, rate: f64) {
        let rate = sanitize_rate(rate);
        let mut state = self.state.lock();
        state.rate = rate;
        state.tokens = 0.0;
        state.last_refill = Instant::now();

        if rate > 0.0 {
            info!(
                "페이싱 활성화: {:.2} MB/s (버킷 {} bytes)",
                rate / 1_000_000.0,
                state.capacity() as u64
            );
        } else {
            info!("페이싱 해제");
        }
    }

    /// 현재 상한 (bytes/sec), 0이면 무제한
    pub fn rate(&self) -> f64 {
        self.state.lock().rate
    }

    pub fn is_limited(&self) -> bool {
        self.rate() > 0.0
    }

    /// 토큰을 예약하고 전송 전에 기다려야 할 시간을 반환
    ///
    /// 예약은 즉시 차감되므로 동시에 호출한 채널끼리 같은 토큰을 나눠 쓰지 않는다.
    pub fn reserve(&self, bytes: usize) -> Duration {
        let mut state = self.state.lock();
        if state.rate <= 0.0 || bytes == 0 {
            return Duration::ZERO;
        }

        state.refill(Instant::now());
        state.tokens -= bytes as f64;

        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / state.rate)
        }
    }

    /// `bytes`만큼 송신 허가가 날 때까지 대기
    pub async fn admit(&self, bytes: usize) {
        let wait = self.reserve(bytes);
        if !wait.is_zero() {
            debug!("페이싱 대기: {} bytes, {:?}", bytes, wait);
            tokio::time::sleep(wait).await;
        }
    }
}

impl Default for Pacer {
    fn default() -> Self {
        Self::unlimited()
    }
}

fn sanitize_rate(rate: f64) -> f64 {
    if rate.is_finite() && rate > 0.0 {
        rate
    } else {
        0.0
    }
}
