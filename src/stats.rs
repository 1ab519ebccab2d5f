//! 전송 통계

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// 채널별 누적 통계
#[derive(Debug, Default)]
pub struct ChannelStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl ChannelStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// 통계 리셋
    pub fn reset(&self) {
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
    }
}

/// 하나의 채널이 한 번의 전송에서 처리한 바이트
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTransfer {
    /// 경로 내 채널 인덱스
    pub channel: usize,

    /// 송신 바이트
    pub sent: usize,

    /// 수신 바이트
    pub received: usize,
}

/// SendRecv 한 번의 결과
#[derive(Debug, Clone)]
pub struct TransferReport {
    /// 호출에 참여한 채널별 결과 (요청 순서)
    pub channels: Vec<ChannelTransfer>,

    /// 전체 소요 시간 (가장 느린 채널 기준)
    pub elapsed: Duration,
}

impl TransferReport {
    pub fn total_sent(&self) -> usize {
        self.channels.iter().map(|c| c.sent).sum()
    }

    pub fn total_received(&self) -> usize {
        self.channels.iter().map(|c| c.received).sum()
    }

    /// 양방향 합산 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed.as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        (self.total_sent() + self.total_received()) as f64 / elapsed
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.4}s | Channels: {} | Sent: {} | Received: {} | Rate: {:.2} MB/s",
            self.elapsed.as_secs_f64(),
            self.channels.len(),
            self.total_sent(),
            self.total_received(),
            self.throughput() / 1_000_000.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_totals() {
        let report = TransferReport {
            channels: vec![
                ChannelTransfer { channel: 0, sent: 10, received: 4 },
                ChannelTransfer { channel: 1, sent: 11, received: 5 },
            ],
            elapsed: Duration::from_secs(1),
        };

        assert_eq!(report.total_sent(), 21);
        assert_eq!(report.total_received(), 9);
        assert_eq!(report.throughput(), 30.0);
        assert!(report.summary().contains("Channels: 2"));
    }

    #[test]
    fn test_channel_stats_counters() {
        let stats = ChannelStats::new();
        stats.record_sent(100);
        stats.record_sent(28);
        stats.record_received(7);

        assert_eq!(stats.bytes_sent(), 128);
        assert_eq!(stats.bytes_received(), 7);

        stats.reset();
        assert_eq!(stats.bytes_sent(), 0);
    }
}
