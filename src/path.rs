//! 경로 (Path Set) 관리
//!
//! 하나의 논리 링크를 구성하는 채널 묶음. 채널 수는 생성 시 고정된다.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::try_join_all;
use tracing::{debug, info, warn};

use crate::channel::{Channel, Endpoint, WindowSize};
use crate::pacing::Pacer;
use crate::stats::TransferReport;
use crate::transfer;
use crate::{Config, Error, Result};

/// 같은 원격지를 향해 함께 만들어진 채널 묶음
#[derive(Debug)]
pub struct PathSet {
    /// 채널 목록 (인덱스 0..N-1)
    channels: Vec<Channel>,

    /// 설정
    config: Config,

    /// 채널들이 공유하는 페이서
    pacer: Arc<Pacer>,

    /// 송신 청크 크기 (실행 중 변경 가능)
    send_chunk: AtomicUsize,

    /// 수신 청크 크기
    recv_chunk: AtomicUsize,
}

impl PathSet {
    /// 엔드포인트마다 채널을 하나씩 열어 경로 생성
    ///
    /// 모든 채널이 열려야 성공한다. 하나라도 실패하면 이미 열린 채널을 닫고
    /// `PathSetCreation`을 반환한다.
    pub async fn open(endpoints: &[Endpoint], config: Config, pacer: Arc<Pacer>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::NoChannels);
        }
        config.validate()?;

        let count = endpoints.len();
        let opens = endpoints.iter().enumerate().map(|(index, endpoint)| {
            let config = &config;
            let pacer = pacer.clone();
            async move {
                Channel::open(index, endpoint.clone(), config, pacer)
                    .await
                    .map_err(|e| (index, e))
            }
        });

        // 첫 실패에서 나머지 연결 시도는 취소되고, 열린 채널은 drop 시 닫힌다
        let channels = match try_join_all(opens).await {
            Ok(channels) => channels,
            Err((index, source)) => {
                warn!("경로 생성 실패: 채널 #{} ({}/{}): {}", index, index + 1, count, source);
                return Err(Error::PathSetCreation {
                    index,
                    count,
                    source: Box::new(source),
                });
            }
        };

        let path = Self {
            channels,
            send_chunk: AtomicUsize::new(config.send_chunk_size),
            recv_chunk: AtomicUsize::new(config.recv_chunk_size),
            config,
            pacer,
        };

        if path.config.autotune {
            let window = path.config.autotuned_window(count);
            for channel in &path.channels {
                if let Err(e) = channel.set_window_size(window) {
                    warn!("[{}] 자동 윈도우 설정 실패: {}", channel.index(), e);
                }
            }
        }

        info!(
            "경로 생성: {} 채널 ({} ~ {})",
            count,
            endpoints[0],
            endpoints[count - 1]
        );
        Ok(path)
    }

    /// 한 호스트의 연속 포트로 경로 생성 (`base_port`, `base_port + 1`, ...)
    pub async fn connect(
        host: &str,
        base_port: u16,
        count: usize,
        config: Config,
        pacer: Arc<Pacer>,
    ) -> Result<Self> {
        let endpoints = sequential_endpoints(host, base_port, count)?;
        Self::open(&endpoints, config, pacer).await
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// 인덱스로 채널 조회
    pub fn channel(&self, index: usize) -> Result<&Channel> {
        self.channels.get(index).ok_or(Error::InvalidChannelIndex {
            index,
            count: self.channels.len(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pacer(&self) -> &Arc<Pacer> {
        &self.pacer
    }

    /// 현재 (송신, 수신) 청크 크기
    pub fn chunk_sizes(&self) -> (usize, usize) {
        (
            self.send_chunk.load(Ordering::Relaxed),
            self.recv_chunk.load(Ordering::Relaxed),
        )
    }

    /// 청크 크기 변경. 다음 전송부터 적용된다.
    pub fn set_chunk_size(&self, send: usize, recv: usize) -> Result<()> {
        if send == 0 || recv == 0 {
            return Err(Error::InvalidConfig(format!(
                "청크 크기는 0보다 커야 함: 송신 {} / 수신 {}",
                send, recv
            )));
        }
        self.send_chunk.store(send, Ordering::Relaxed);
        self.recv_chunk.store(recv, Ordering::Relaxed);
        debug!("청크 크기 변경: 송신 {} / 수신 {}", send, recv);
        Ok(())
    }

    /// 모든 채널 인덱스
    pub fn all_indices(&self) -> Vec<usize> {
        (0..self.channels.len()).collect()
    }

    /// 열린 채널 수
    pub fn open_count(&self) -> usize {
        self.channels.iter().filter(|c| c.is_open()).count()
    }

    /// 채널 하나의 윈도우 크기 변경
    pub fn set_channel_window(&self, index: usize, bytes: usize) -> Result<WindowSize> {
        self.channel(index)?.set_window_size(bytes)
    }

    /// 모든 채널의 윈도우 크기 변경
    pub fn set_window(&self, bytes: usize) -> Result<Vec<WindowSize>> {
        self.channels
            .iter()
            .map(|c| c.set_window_size(bytes))
            .collect()
    }

    /// 모든 채널에서 송수신 (전이중)
    pub async fn send_recv(&self, send: &[u8], recv: &mut [u8]) -> Result<TransferReport> {
        transfer::send_recv(self, send, recv, &self.all_indices()).await
    }

    /// 지정한 채널들에서 송수신
    pub async fn send_recv_on(
        &self,
        send: &[u8],
        recv: &mut [u8],
        indices: &[usize],
    ) -> Result<TransferReport> {
        transfer::send_recv(self, send, recv, indices).await
    }

    /// 송신만
    pub async fn send(&self, buf: &[u8]) -> Result<TransferReport> {
        transfer::send_recv(self, buf, &mut [], &self.all_indices()).await
    }

    /// 수신만
    pub async fn recv(&self, buf: &mut [u8]) -> Result<TransferReport> {
        transfer::send_recv(self, &[], buf, &self.all_indices()).await
    }

    /// 크기 헤더를 포함한 가변 길이 교환
    pub async fn dynamic_send_recv(&self, send: &[u8], recv: &mut [u8]) -> Result<TransferReport> {
        transfer::dynamic_send_recv(self, send, recv, &self.all_indices()).await
    }

    /// 채널별 버퍼로 송수신 (`sends[i]`, `recvs[i]`는 `indices[i]` 채널 몫)
    pub async fn psend_recv(
        &self,
        sends: &[&[u8]],
        recvs: &mut [&mut [u8]],
        indices: &[usize],
    ) -> Result<TransferReport> {
        transfer::psend_recv(self, sends, recvs, indices).await
    }

    /// `send_indices`로 보내고 `recv_indices`로 받기
    pub async fn cycle(
        &self,
        send: &[u8],
        recv: &mut [u8],
        send_indices: &[usize],
        recv_indices: &[usize],
    ) -> Result<TransferReport> {
        transfer::cycle(self, send, recv, send_indices, recv_indices).await
    }

    /// 크기 헤더를 포함한 [`cycle`](Self::cycle)
    pub async fn dynamic_cycle(
        &self,
        send: &[u8],
        recv: &mut [u8],
        send_indices: &[usize],
        recv_indices: &[usize],
    ) -> Result<TransferReport> {
        transfer::dynamic_cycle(self, send, recv, send_indices, recv_indices).await
    }

    /// 채널 하나로 동기화
    pub async fn barrier(&self, index: usize) -> Result<()> {
        self.channel(index)?.barrier().await
    }

    /// 모든 채널에서 동시에 동기화
    pub async fn barrier_all(&self) -> Result<()> {
        try_join_all(self.channels.iter().map(|c| c.barrier())).await?;
        Ok(())
    }

    /// 지정한 채널 닫기
    pub fn close_channels(&self, indices: &[usize]) -> Result<()> {
        for &index in indices {
            self.channel(index)?;
        }
        for &index in indices {
            self.channels[index].close();
        }
        Ok(())
    }

    /// 지정한 채널을 같은 엔드포인트로 다시 연결
    ///
    /// 상대편도 같은 채널을 다시 열어야 한다. 일부만 성공할 수 있으며, 실패한 채널은
    /// 닫힌 상태로 남는다.
    pub async fn reopen_channels(&self, indices: &[usize]) -> Result<()> {
        transfer::validate_indices(indices, self.len())?;

        try_join_all(indices.iter().map(|&index| self.channels[index].reopen(&self.config))).await?;
        info!("채널 다시 열림: {:?}", indices);
        Ok(())
    }

    /// 모든 채널 닫기 (반복 호출 가능)
    pub fn close(&self) {
        for channel in &self.channels {
            channel.close();
        }
        debug!("경로 닫힘: {} 채널", self.channels.len());
    }
}

/// `count`개 연속 포트 엔드포인트 생성
pub fn sequential_endpoints(host: &str, base_port: u16, count: usize) -> Result<Vec<Endpoint>> {
    if count == 0 {
        return Err(Error::NoChannels);
    }
    if base_port as usize + count - 1 > u16::MAX as usize {
        return Err(Error::InvalidConfig(format!(
            "포트 범위 초과: {} + {} 채널",
            base_port, count
        )));
    }

    Ok((0..count)
        .map(|i| Endpoint::new(host, base_port + i as u16))
        .collect())
}
