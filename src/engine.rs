//! 전송 엔진 (경로 생명주기 관리)
//!
//! 경로를 핸들(`PathId`)로 등록하고, 핸들 단위로 설정과 송수신을 위임한다.
//! 엔진은 기본 페이서 하나를 소유하며, 별도 페이서를 지정하지 않은 모든 경로가 공유한다.
//!
//! 자동 튜닝이 켜져 있으면 경로 생성 때 기본 페이서를 [`AUTOTUNE_PACING_RATE`]로 맞춘다.
//! 설정이나 [`Engine::set_pacing_rate`]로 상한을 직접 지정했다면 그 값을 유지한다.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{Endpoint, WindowSize};
use crate::config::AUTOTUNE_PACING_RATE;
use crate::pacing::Pacer;
use crate::path::{sequential_endpoints, PathSet};
use crate::stats::TransferReport;
use crate::{Config, Error, Result};

/// 경로 핸들
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PathId(pub u32);

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "path#{}", self.0)
    }
}

/// 다중 경로 전송 엔진
#[derive(Debug)]
pub struct Engine {
    /// 새 경로에 적용할 설정
    config: Config,

    /// 기본 페이서
    pacer: Arc<Pacer>,

    /// 등록된 경로
    paths: DashMap<PathId, Arc<PathSet>>,

    /// 다음 경로 핸들
    next_path_id: AtomicU32,

    /// 페이싱 상한을 직접 지정했는지 (자동 튜닝이 덮어쓰지 않음)
    pacing_explicit: AtomicBool,

    /// 새 경로와 기존 경로에 적용할 청크 크기
    send_chunk: AtomicUsize,
    recv_chunk: AtomicUsize,
}

impl Engine {
    /// 새 엔진 생성 (기본 페이서는 `config.pacing_rate`로 시작)
    pub fn new(config: Config) -> Self {
        let pacer = Arc::new(Pacer::from_config(&config));
        Self::with_pacer(config, pacer)
    }

    /// 외부 페이서를 기본 페이서로 사용
    pub fn with_pacer(config: Config, pacer: Arc<Pacer>) -> Self {
        Self {
            pacing_explicit: AtomicBool::new(config.pacing_rate > 0.0),
            send_chunk: AtomicUsize::new(config.send_chunk_size),
            recv_chunk: AtomicUsize::new(config.recv_chunk_size),
            config,
            pacer,
            paths: DashMap::new(),
            next_path_id: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pacer(&self) -> &Arc<Pacer> {
        &self.pacer
    }

    /// 엔드포인트 목록으로 경로 생성 (채널마다 호스트/포트 지정)
    pub async fn init(&self, endpoints: &[Endpoint]) -> Result<PathId> {
        self.open_path(endpoints, self.pacer.clone()).await
    }

    /// 한 호스트의 연속 포트로 `count`채널 경로 생성
    pub async fn create_path(&self, host: &str, base_port: u16, count: usize) -> Result<PathId> {
        let endpoints = sequential_endpoints(host, base_port, count)?;
        self.open_path(&endpoints, self.pacer.clone()).await
    }

    /// 독립 페이서를 쓰는 경로 생성
    pub async fn create_path_with_pacer(
        &self,
        host: &str,
        base_port: u16,
        count: usize,
        pacer: Arc<Pacer>,
    ) -> Result<PathId> {
        let endpoints = sequential_endpoints(host, base_port, count)?;
        self.open_path(&endpoints, pacer).await
    }

    async fn open_path(&self, endpoints: &[Endpoint], pacer: Arc<Pacer>) -> Result<PathId> {
        let shared = Arc::ptr_eq(&pacer, &self.pacer);
        let config = Config {
            send_chunk_size: self.send_chunk.load(Ordering::Relaxed),
            recv_chunk_size: self.recv_chunk.load(Ordering::Relaxed),
            ..self.config.clone()
        };
        let path = PathSet::open(endpoints, config, pacer).await?;

        if self.config.autotune && shared {
            if self.pacing_explicit.load(Ordering::Relaxed) {
                debug!("자동 튜닝: 지정된 페이싱 {:.0} B/s 유지", self.pacer.rate());
            } else {
                self.pacer.set_rate(AUTOTUNE_PACING_RATE);
            }
        }

        let id = PathId(self.next_path_id.fetch_add(1, Ordering::Relaxed));
        info!("{} 등록: {} 채널", id, path.len());
        self.paths.insert(id, Arc::new(path));
        Ok(id)
    }

    /// 핸들로 경로 조회
    pub fn path(&self, id: PathId) -> Result<Arc<PathSet>> {
        self.paths
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(Error::UnknownPath { path: id })
    }

    /// 경로 해제
    ///
    /// 모든 채널을 닫아 진행 중인 송수신을 실패시킨다. 이미 해제된 핸들이면 아무것도 하지 않는다.
    pub fn destroy_path(&self, id: PathId) {
        match self.paths.remove(&id) {
            Some((_, path)) => {
                path.close();
                if Arc::strong_count(&path) > 1 {
                    debug!("{}: 진행 중인 작업이 남아 있음", id);
                }
                info!("{} 해제", id);
            }
            None => debug!("{}: 이미 해제됨", id),
        }
    }

    /// 모든 경로 해제
    pub fn finalize(&self) {
        let ids: Vec<PathId> = self.paths.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.destroy_path(id);
        }
        info!("엔진 종료");
    }

    /// 채널 하나의 윈도우 크기 변경
    pub fn set_window(&self, id: PathId, index: usize, bytes: usize) -> Result<WindowSize> {
        self.path(id)?.set_channel_window(index, bytes)
    }

    /// 경로 전체 윈도우 크기 변경
    pub fn set_path_window(&self, id: PathId, bytes: usize) -> Result<Vec<WindowSize>> {
        self.path(id)?.set_window(bytes)
    }

    /// 기본 페이서 상한 변경 (0이면 해제)
    ///
    /// 이후 생성되는 경로의 자동 튜닝도 이 값을 바꾸지 않는다.
    pub fn set_pacing_rate(&self, bytes_per_sec: f64) {
        self.pacing_explicit.store(true, Ordering::Relaxed);
        self.pacer.set_rate(bytes_per_sec);
    }

    pub fn pacing_rate(&self) -> f64 {
        self.pacer.rate()
    }

    /// 모든 경로와 이후 생성되는 경로의 청크 크기 변경
    pub fn set_chunk_size(&self, send: usize, recv: usize) -> Result<()> {
        Config {
            send_chunk_size: send,
            recv_chunk_size: recv,
            ..self.config.clone()
        }
        .validate()?;

        for entry in self.paths.iter() {
            entry.value().set_chunk_size(send, recv)?;
        }
        self.send_chunk.store(send, Ordering::Relaxed);
        self.recv_chunk.store(recv, Ordering::Relaxed);
        Ok(())
    }

    /// 경로 하나의 청크 크기 변경
    pub fn set_path_chunk_size(&self, id: PathId, send: usize, recv: usize) -> Result<()> {
        self.path(id)?.set_chunk_size(send, recv)
    }

    pub async fn send_recv(&self, id: PathId, send: &[u8], recv: &mut [u8]) -> Result<TransferReport> {
        self.path(id)?.send_recv(send, recv).await
    }

    pub async fn send_recv_on(
        &self,
        id: PathId,
        send: &[u8],
        recv: &mut [u8],
        indices: &[usize],
    ) -> Result<TransferReport> {
        self.path(id)?.send_recv_on(send, recv, indices).await
    }

    pub async fn send(&self, id: PathId, buf: &[u8]) -> Result<TransferReport> {
        self.path(id)?.send(buf).await
    }

    pub async fn recv(&self, id: PathId, buf: &mut [u8]) -> Result<TransferReport> {
        self.path(id)?.recv(buf).await
    }

    pub async fn dynamic_send_recv(
        &self,
        id: PathId,
        send: &[u8],
        recv: &mut [u8],
    ) -> Result<TransferReport> {
        self.path(id)?.dynamic_send_recv(send, recv).await
    }

    pub async fn psend_recv(
        &self,
        id: PathId,
        sends: &[&[u8]],
        recvs: &mut [&mut [u8]],
        indices: &[usize],
    ) -> Result<TransferReport> {
        self.path(id)?.psend_recv(sends, recvs, indices).await
    }

    pub async fn cycle(
        &self,
        id: PathId,
        send: &[u8],
        recv: &mut [u8],
        send_indices: &[usize],
        recv_indices: &[usize],
    ) -> Result<TransferReport> {
        self.path(id)?.cycle(send, recv, send_indices, recv_indices).await
    }

    pub async fn dynamic_cycle(
        &self,
        id: PathId,
        send: &[u8],
        recv: &mut [u8],
        send_indices: &[usize],
        recv_indices: &[usize],
    ) -> Result<TransferReport> {
        self.path(id)?
            .dynamic_cycle(send, recv, send_indices, recv_indices)
            .await
    }

    /// 송수신을 백그라운드 태스크로 시작
    ///
    /// 현재 tokio 런타임에서 실행되며, 버퍼는 태스크가 소유한다.
    pub fn isend_recv(&self, id: PathId, send: Bytes, recv_len: usize) -> Result<Exchange> {
        let path = self.path(id)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Runtime(e.to_string()))?;

        let send_len = send.len();
        let handle = runtime.spawn(async move {
            let mut buf = vec![0u8; recv_len];
            let report = path.send_recv(&send, &mut buf).await?;
            Ok(Exchanged {
                data: Bytes::from(buf),
                report,
            })
        });

        debug!("{}: 비동기 교환 시작 (송신 {} / 수신 {} bytes)", id, send_len, recv_len);
        Ok(Exchange { path: id, handle })
    }

    /// 채널 하나로 상대편과 동기화
    pub async fn barrier(&self, id: PathId, channel: usize) -> Result<()> {
        self.path(id)?.barrier(channel).await
    }

    /// 모든 채널로 동기화
    pub async fn barrier_all(&self, id: PathId) -> Result<()> {
        self.path(id)?.barrier_all().await
    }

    pub fn close_channels(&self, id: PathId, indices: &[usize]) -> Result<()> {
        self.path(id)?.close_channels(indices)
    }

    /// 닫힌 채널을 같은 엔드포인트로 다시 연결
    pub async fn reopen_channels(&self, id: PathId, indices: &[usize]) -> Result<()> {
        self.path(id)?.reopen_channels(indices).await
    }

    /// 등록된 경로 수
    pub fn path_count(&self) -> usize {
        self.paths.len()
    }

    /// 경로의 채널 수
    pub fn channel_count(&self, id: PathId) -> Result<usize> {
        Ok(self.path(id)?.len())
    }

    /// 등록된 경로 목록 출력
    pub fn log_paths(&self) {
        let mut ids: Vec<PathId> = self.paths.iter().map(|entry| *entry.key()).collect();
        ids.sort();

        info!("경로 {}개, 페이싱 {:.2} MB/s", ids.len(), self.pacing_rate() / 1_000_000.0);
        for id in ids {
            let Ok(path) = self.path(id) else { continue };
            for channel in path.channels() {
                match channel.window() {
                    Ok(window) => info!(
                        "  {} [{}] {} 윈도우 {} (send {} / recv {})",
                        id,
                        channel.index(),
                        channel.endpoint(),
                        window.requested,
                        window.send,
                        window.recv
                    ),
                    Err(_) => info!("  {} [{}] {} (닫힘)", id, channel.index(), channel.endpoint()),
                }
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.paths.is_empty() {
            warn!("엔진 해제 시 남은 경로 {}개 정리", self.paths.len());
            self.finalize();
        }
    }
}

/// 완료된 비동기 교환 결과
#[derive(Debug)]
pub struct Exchanged {
    /// 수신 데이터
    pub data: Bytes,

    pub report: TransferReport,
}

/// 진행 중인 비동기 교환
#[derive(Debug)]
pub struct Exchange {
    path: PathId,
    handle: JoinHandle<Result<Exchanged>>,
}

impl Exchange {
    pub fn path(&self) -> PathId {
        self.path
    }

    /// 교환이 끝났는지 (성공/실패 무관)
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// 교환 완료까지 대기
    pub async fn wait(self) -> Result<Exchanged> {
        self.handle
            .await
            .map_err(|e| Error::ExchangeAborted(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{free_base_port, pattern};

    async fn engine_pair(count: usize, config: Config) -> (Engine, PathId, Engine, PathId) {
        let base = free_base_port(count);
        let server_config = config.clone();
        let server = tokio::spawn(async move {
            let engine = Engine::new(server_config);
            let id = engine.create_path("0.0.0.0", base, count).await?;
            Ok::<_, Error>((engine, id))
        });

        let client = Engine::new(config);
        let client_id = client.create_path("127.0.0.1", base, count).await.unwrap();
        let (server, server_id) = server.await.unwrap().unwrap();
        (client, client_id, server, server_id)
    }

    #[test]
    fn test_path_id_display() {
        assert_eq!(PathId(3).to_string(), "path#3");
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let engine = Engine::new(Config::loopback());

        assert!(matches!(
            engine.set_window(PathId(42), 0, 1024),
            Err(Error::UnknownPath { path: PathId(42) })
        ));
        assert!(matches!(engine.send(PathId(42), b"x").await, Err(Error::UnknownPath { .. })));
        assert!(engine.isend_recv(PathId(42), Bytes::new(), 0).is_err());
    }

    #[tokio::test]
    async fn test_destroy_path_twice() {
        let (client, id, _server, _) = engine_pair(2, Config::loopback()).await;
        assert_eq!(client.path_count(), 1);
        assert_eq!(client.channel_count(id).unwrap(), 2);

        let path = client.path(id).unwrap();
        client.destroy_path(id);
        client.destroy_path(id);

        assert_eq!(client.path_count(), 0);
        assert_eq!(path.open_count(), 0);
        assert!(matches!(client.send(id, b"data").await, Err(Error::UnknownPath { .. })));
    }

    #[tokio::test]
    async fn test_engine_send_recv_and_window() {
        let (client, cid, server, sid) = engine_pair(4, Config::loopback()).await;

        let window = client.set_window(cid, 2, 128 * 1024).unwrap();
        assert_eq!(window.requested, 128 * 1024);
        assert!(matches!(
            client.set_window(cid, 7, 1024),
            Err(Error::InvalidChannelIndex { index: 7, count: 4 })
        ));

        let data = pattern(65_537, 11);
        let mut sink = vec![0u8; data.len()];
        let (c, s) = tokio::join!(client.send(cid, &data), server.recv(sid, &mut sink));
        c.unwrap();
        s.unwrap();
        assert_eq!(sink, data);

        let (a, b) = tokio::join!(client.barrier_all(cid), server.barrier_all(sid));
        a.unwrap();
        b.unwrap();
    }

    #[tokio::test]
    async fn test_isend_recv() {
        let (client, cid, server, sid) = engine_pair(3, Config::loopback()).await;

        let upstream = pattern(30_000, 12);
        let downstream = pattern(20_000, 13);

        let exchange = client
            .isend_recv(cid, Bytes::from(upstream.clone()), downstream.len())
            .unwrap();
        assert_eq!(exchange.path(), cid);

        let mut got = vec![0u8; upstream.len()];
        server.send_recv(sid, &downstream, &mut got).await.unwrap();

        let done = exchange.wait().await.unwrap();
        assert_eq!(got, upstream);
        assert_eq!(&done.data[..], &downstream[..]);
        assert_eq!(done.report.total_sent(), upstream.len());
    }

    #[tokio::test]
    async fn test_failed_creation_registers_nothing() {
        let engine = Engine::new(Config {
            connect_attempts: 2,
            connect_retry_interval_ms: 1,
            ..Config::loopback()
        });
        let base = free_base_port(2);

        let result = engine.create_path("127.0.0.1", base, 2).await;
        assert!(matches!(result, Err(Error::PathSetCreation { .. })));
        assert_eq!(engine.path_count(), 0);
    }

    #[tokio::test]
    async fn test_autotune_sets_default_pacer() {
        let config = Config {
            autotune: true,
            ..Config::loopback()
        };
        let (client, id, _server, _) = engine_pair(4, config).await;

        assert_eq!(client.pacing_rate(), AUTOTUNE_PACING_RATE);
        let windows = client.set_path_window(id, 0).unwrap();
        assert!(windows.iter().all(|w| w.requested == 8 * 1024 * 1024));
    }

    #[tokio::test]
    async fn test_autotune_keeps_explicit_rate() {
        let config = Config {
            autotune: true,
            ..Config::loopback()
        };
        let base = free_base_port(2);
        let server_config = config.clone();
        let server = tokio::spawn(async move {
            let engine = Engine::new(server_config);
            let id = engine.create_path("0.0.0.0", base, 2).await?;
            Ok::<_, Error>((engine, id))
        });

        let client = Engine::new(config);
        client.set_pacing_rate(50_000_000.0);
        client.create_path("127.0.0.1", base, 2).await.unwrap();
        let (server, _) = server.await.unwrap().unwrap();

        assert_eq!(client.pacing_rate(), 50_000_000.0);
        assert_eq!(server.pacing_rate(), AUTOTUNE_PACING_RATE);

        // 설정으로 지정한 상한도 유지
        let configured = Engine::new(Config {
            autotune: true,
            pacing_rate: 1_000_000.0,
            ..Config::loopback()
        });
        assert!(configured.pacing_explicit.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_engine_chunk_size_and_cycle() {
        let (client, cid, server, sid) = engine_pair(4, Config::loopback()).await;

        assert!(matches!(client.set_chunk_size(0, 0), Err(Error::InvalidConfig(_))));
        client.set_chunk_size(1000, 1000).unwrap();
        assert_eq!(client.path(cid).unwrap().chunk_sizes(), (1000, 1000));
        assert!(matches!(
            client.set_path_chunk_size(PathId(77), 10, 10),
            Err(Error::UnknownPath { .. })
        ));

        let up = pattern(12_345, 1);
        let down = pattern(6_789, 2);
        let mut at_server = vec![0u8; up.len()];
        let mut at_client = vec![0u8; down.len()];
        let (c, s) = tokio::join!(
            client.cycle(cid, &up, &mut at_client, &[0, 1], &[2, 3]),
            server.cycle(sid, &down, &mut at_server, &[2, 3], &[0, 1]),
        );
        c.unwrap();
        s.unwrap();
        assert_eq!(at_server, up);
        assert_eq!(at_client, down);
    }

    #[tokio::test]
    async fn test_independent_pacer() {
        let base = free_base_port(1);
        let server = tokio::spawn(async move {
            let engine = Engine::new(Config::loopback());
            let id = engine.create_path("0.0.0.0", base, 1).await?;
            Ok::<_, Error>((engine, id))
        });

        let client = Engine::new(Config::loopback());
        let own = Arc::new(Pacer::new(5_000_000.0, std::time::Duration::ZERO));
        let id = client
            .create_path_with_pacer("127.0.0.1", base, 1, own.clone())
            .await
            .unwrap();
        let _server = server.await.unwrap().unwrap();

        client.set_pacing_rate(1_000.0);
        assert!(Arc::ptr_eq(client.path(id).unwrap().pacer(), &own));
        assert_eq!(own.rate(), 5_000_000.0);
        assert_eq!(client.pacing_rate(), 1_000.0);
    }

    #[tokio::test]
    async fn test_finalize_closes_everything() {
        let (client, id, _server, _) = engine_pair(2, Config::loopback()).await;
        let path = client.path(id).unwrap();

        client.finalize();
        client.finalize();

        assert_eq!(client.path_count(), 0);
        assert_eq!(path.open_count(), 0);
    }
}
