//! 채널: 두 엔드포인트 사이의 TCP 연결 하나
//!
//! - 연결 방향: 호스트가 `"0"`/`"0.0.0.0"`이면 수신 대기, 그 외에는 접속
//! - 윈도우 크기: 송수신 소켓 버퍼를 함께 조정, 실제 적용된 크기를 보고
//! - 부분 송수신: `send`/`recv`는 한 번의 쓰기/읽기만 수행하고 처리한 바이트를 반환

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use socket2::SockRef;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::{debug, info, warn};

use crate::pacing::Pacer;
use crate::stats::ChannelStats;
use crate::{Config, Error, Result};

/// 배리어 교환 토큰 (8바이트)
pub const BARRIER_TOKEN: [u8; 8] = *b"Test 1!\0";

/// 채널 연결 방향
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// 원격 호스트에 접속
    Connect,

    /// 포트에서 상대편 접속을 한 번 수락
    Listen,
}

/// 채널 대상 주소
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// 원격 호스트 (이름 또는 IP)
    pub host: String,

    /// 원격 포트 (수신 대기 모드에서는 바인드 포트)
    pub port: u16,

    /// 접속 전에 바인드할 로컬 포트 (방화벽 우회용)
    pub local_port: Option<u16>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            local_port: None,
        }
    }

    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    /// 수신 대기 엔드포인트
    pub fn listen(port: u16) -> Self {
        Self::new("0.0.0.0", port)
    }

    pub fn role(&self) -> Role {
        match self.host.as_str() {
            "0" | "0.0.0.0" => Role::Listen,
            _ => Role::Connect,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// 소켓 윈도우 크기 조회 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    /// 요청한 크기
    pub requested: usize,

    /// 실제 송신 버퍼 크기
    pub send: usize,

    /// 실제 수신 버퍼 크기
    pub recv: usize,
}

impl WindowSize {
    /// 송수신 중 작은 쪽
    pub fn effective(&self) -> usize {
        self.send.min(self.recv)
    }

    /// 플랫폼이 요청보다 작게 잘랐는지
    pub fn is_clamped(&self) -> bool {
        self.effective() < self.requested
    }
}

/// 관리되는 TCP 연결 하나
///
/// 소켓은 `Open` 상태일 때만 존재한다. `close` 후에는 모든 송수신이 `ChannelClosed`로 실패한다.
#[derive(Debug)]
pub struct Channel {
    /// 경로 내 인덱스
    index: usize,

    endpoint: Endpoint,

    role: Role,

    /// 열린 소켓 (닫히면 None)
    stream: RwLock<Option<Arc<TcpStream>>>,

    /// 마지막으로 요청한 윈도우 크기
    requested_window: AtomicUsize,

    /// 송신 페이서 (공유)
    pacer: Arc<Pacer>,

    stats: ChannelStats,
}

impl Channel {
    /// 채널 열기
    ///
    /// 접속 모드는 `connect_attempts`만큼 재시도하고, 수신 대기 모드는 상대편 접속 한 번을 기다린다.
    /// 윈도우 크기는 연결 전에 소켓에 적용된다.
    pub async fn open(
        index: usize,
        endpoint: Endpoint,
        config: &Config,
        pacer: Arc<Pacer>,
    ) -> Result<Self> {
        let role = endpoint.role();
        let stream = match role {
            Role::Connect => connect(&endpoint, config).await?,
            Role::Listen => accept(&endpoint, config).await?,
        };

        let channel = Self {
            index,
            endpoint,
            role,
            stream: RwLock::new(Some(Arc::new(stream))),
            requested_window: AtomicUsize::new(config.window_size),
            pacer,
            stats: ChannelStats::new(),
        };

        if config.window_size > 0 {
            let window = channel.window()?;
            debug!(
                "[{}] 초기 윈도우: 요청 {} → 송신 {} / 수신 {}",
                index, window.requested, window.send, window.recv
            );
        }

        info!(
            "[{}] 채널 열림: {} ({:?}, peer={:?})",
            index,
            channel.endpoint,
            role,
            channel.peer_addr()
        );

        Ok(channel)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn pacer(&self) -> &Arc<Pacer> {
        &self.pacer
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    pub fn is_open(&self) -> bool {
        self.stream.read().is_some()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.read().as_ref().and_then(|s| s.peer_addr().ok())
    }

    /// 열린 소켓 핸들 (닫혔으면 `ChannelClosed`)
    fn stream(&self) -> Result<Arc<TcpStream>> {
        self.stream
            .read()
            .clone()
            .ok_or(Error::ChannelClosed { channel: self.index })
    }

    /// 송수신 버퍼 크기 변경
    ///
    /// 플랫폼이 크기를 제한하면 경고를 남기고 실제 적용된 크기를 반환한다.
    pub fn set_window_size(&self, bytes: usize) -> Result<WindowSize> {
        if bytes == 0 {
            return self.window();
        }

        let stream = self.stream()?;
        let sock = SockRef::from(&*stream);
        sock.set_send_buffer_size(bytes)?;
        sock.set_recv_buffer_size(bytes)?;
        self.requested_window.store(bytes, Ordering::Relaxed);

        let window = self.window()?;
        if window.is_clamped() {
            warn!(
                "[{}] 윈도우 크기 제한됨: 요청 {} → 송신 {} / 수신 {}",
                self.index, bytes, window.send, window.recv
            );
        } else if window.effective() > bytes {
            debug!(
                "[{}] 플랫폼 최소 윈도우 적용: 요청 {} → {}",
                self.index,
                bytes,
                window.effective()
            );
        } else {
            debug!("[{}] 윈도우 크기: {}", self.index, window.effective());
        }

        Ok(window)
    }

    /// 현재 적용된 윈도우 크기 조회
    pub fn window(&self) -> Result<WindowSize> {
        let stream = self.stream()?;
        let sock = SockRef::from(&*stream);
        Ok(WindowSize {
            requested: self.requested_window.load(Ordering::Relaxed),
            send: kernel_buffer_size(sock.send_buffer_size()?),
            recv: kernel_buffer_size(sock.recv_buffer_size()?),
        })
    }

    /// 한 번의 쓰기 (블로킹, 부분 쓰기 가능)
    pub async fn send(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let stream = self.stream()?;
        loop {
            stream
                .writable()
                .await
                .map_err(|e| self.connection_error(e))?;

            match stream.try_write(buf) {
                Ok(n) => {
                    self.stats.record_sent(n);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(self.connection_error(e)),
            }
        }
    }

    /// 한 번의 읽기 (블로킹, 부분 읽기 가능)
    ///
    /// 상대편이 연결을 닫으면 `ConnectionClosed`.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let stream = self.stream()?;
        loop {
            stream
                .readable()
                .await
                .map_err(|e| self.connection_error(e))?;

            match stream.try_read(buf) {
                Ok(0) => return Err(Error::ConnectionClosed { channel: self.index }),
                Ok(n) => {
                    self.stats.record_received(n);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(self.connection_error(e)),
            }
        }
    }

    /// 버퍼 전체 쓰기 (페이싱 없음)
    pub async fn send_all(&self, buf: &[u8]) -> Result<()> {
        let mut sent = 0;
        while sent < buf.len() {
            sent += self.send(&buf[sent..]).await?;
        }
        Ok(())
    }

    /// 버퍼를 가득 채울 때까지 읽기
    pub async fn recv_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut received = 0;
        while received < buf.len() {
            received += self.recv(&mut buf[received..]).await?;
        }
        Ok(())
    }

    /// 이 채널 하나로 상대편과 동기화
    ///
    /// 접속한 쪽이 토큰을 보내고, 수락한 쪽이 받은 토큰을 되돌려 준다.
    pub async fn barrier(&self) -> Result<()> {
        let mut token = [0u8; 8];
        match self.role {
            Role::Connect => {
                self.send_all(&BARRIER_TOKEN).await?;
                self.recv_exact(&mut token).await?;
            }
            Role::Listen => {
                self.recv_exact(&mut token).await?;
                self.send_all(&token).await?;
            }
        }
        debug!("[{}] 배리어 통과", self.index);
        Ok(())
    }

    /// 소켓 해제 (이미 닫혔으면 아무것도 하지 않음)
    ///
    /// shutdown으로 진행 중인 송수신을 깨워 실패시킨다.
    pub fn close(&self) {
        let stream = match self.stream.write().take() {
            Some(stream) => stream,
            None => return,
        };

        if let Err(e) = SockRef::from(&*stream).shutdown(Shutdown::Both) {
            // 상대편이 먼저 끊은 경우 NotConnected
            debug!("[{}] shutdown 실패: {}", self.index, e);
        }
        info!("[{}] 채널 닫힘: {}", self.index, self.endpoint);
    }

    /// 같은 엔드포인트로 다시 연결 (열려 있으면 먼저 닫음)
    ///
    /// 마지막으로 요청한 윈도우 크기를 새 소켓에 적용한다.
    pub async fn reopen(&self, config: &Config) -> Result<()> {
        self.close();

        let config = Config {
            window_size: self.requested_window.load(Ordering::Relaxed),
            ..config.clone()
        };
        let stream = match self.role {
            Role::Connect => connect(&self.endpoint, &config).await?,
            Role::Listen => accept(&self.endpoint, &config).await?,
        };
        *self.stream.write() = Some(Arc::new(stream));

        info!(
            "[{}] 채널 다시 열림: {} (peer={:?})",
            self.index,
            self.endpoint,
            self.peer_addr()
        );
        Ok(())
    }

    fn connection_error(&self, source: io::Error) -> Error {
        Error::Connection {
            channel: self.index,
            source,
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

/// 접속 모드: 해석 후 재시도하며 연결
async fn connect(endpoint: &Endpoint, config: &Config) -> Result<TcpStream> {
    let addr = resolve(endpoint).await?;
    let attempts = config.connect_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match try_connect(addr, endpoint.local_port, config.window_size).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(
                    "접속 시도 {}/{} 실패: {} ({})",
                    attempt, attempts, endpoint, e
                );
                last_error = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(config.connect_retry_interval()).await;
                }
            }
        }
    }

    Err(Error::Connect {
        endpoint: endpoint.clone(),
        source: last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "접속 시도 없음")),
    })
}

async fn try_connect(
    addr: SocketAddr,
    local_port: Option<u16>,
    window: usize,
) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    apply_buffer_hint(&socket, window)?;

    if let Some(port) = local_port {
        let local = if addr.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))
        };
        socket.bind(local)?;
    }

    socket.connect(addr).await
}

/// 수신 대기 모드: 포트를 열고 한 번 수락한 뒤 리스너를 닫음
async fn accept(endpoint: &Endpoint, config: &Config) -> Result<TcpStream> {
    let connect_error = |source| Error::Connect {
        endpoint: endpoint.clone(),
        source,
    };

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, endpoint.port));
    let socket = TcpSocket::new_v4().map_err(connect_error)?;
    socket.set_reuseaddr(true).map_err(connect_error)?;
    apply_buffer_hint(&socket, config.window_size).map_err(connect_error)?;
    socket.bind(addr).map_err(connect_error)?;

    let listener = socket.listen(1).map_err(connect_error)?;
    debug!("수신 대기: {}", addr);

    let (stream, peer) = listener.accept().await.map_err(connect_error)?;
    debug!("접속 수락: {} ← {}", addr, peer);
    Ok(stream)
}

/// 호스트 이름 해석 (IPv4 우선)
async fn resolve(endpoint: &Endpoint) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = lookup_host((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|source| Error::Connect {
            endpoint: endpoint.clone(),
            source,
        })?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| Error::Connect {
            endpoint: endpoint.clone(),
            source: io::Error::new(io::ErrorKind::NotFound, "주소를 찾을 수 없음"),
        })
}

/// 연결 전 소켓 버퍼 힌트 (TCP 윈도우 스케일은 연결 시점에 정해짐)
fn apply_buffer_hint(socket: &TcpSocket, window: usize) -> io::Result<()> {
    if window == 0 {
        return Ok(());
    }
    let size = u32::try_from(window).unwrap_or(u32::MAX);
    socket.set_send_buffer_size(size)?;
    socket.set_recv_buffer_size(size)?;
    Ok(())
}

/// 리눅스 커널은 설정값의 두 배(관리 오버헤드 포함)를 보고한다
fn kernel_buffer_size(reported: usize) -> usize {
    if cfg!(target_os = "linux") {
        reported / 2
    } else {
        reported
    }
}
