//! C 인터페이스
//!
//! 프로세스 전역 엔진 하나와 전용 tokio 런타임 위에서 동작하는 블로킹 함수들.
//! 성공하면 0 이상, 실패하면 [`Error::code`]의 음수 값을 반환한다.
//!
//! 이 함수들은 tokio 런타임 바깥의 스레드에서 호출해야 한다.
//!
//! 전역 엔진은 자동 튜닝 설정으로 시작하므로, 경로를 만들 때 페이싱 상한이 1200 MiB/s로
//! 맞춰진다. 그 전에 [`widepath_set_pacing_rate`]로 지정한 값은 유지된다.

use std::ffi::{c_char, c_int, CStr};
use std::slice;
use std::sync::OnceLock;

use tokio::runtime::{Builder, Runtime};
use tracing::{error, warn};

use crate::channel::Endpoint;
use crate::engine::{Engine, PathId};
use crate::{Config, Error, Result};

static ENGINE: OnceLock<Engine> = OnceLock::new();
static RUNTIME: OnceLock<Option<Runtime>> = OnceLock::new();

fn engine() -> &'static Engine {
    ENGINE.get_or_init(|| Engine::new(Config::wide_area()))
}

fn runtime() -> Result<&'static Runtime> {
    RUNTIME
        .get_or_init(|| {
            Builder::new_multi_thread()
                .enable_all()
                .thread_name("widepath")
                .build()
                .map_err(|e| error!("런타임 생성 실패: {}", e))
                .ok()
        })
        .as_ref()
        .ok_or_else(|| Error::Runtime("tokio 런타임을 만들 수 없음".to_string()))
}

fn status(result: Result<c_int>) -> c_int {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!("widepath 호출 실패: {}", e);
            e.code()
        }
    }
}

fn path_id(raw: c_int) -> Result<PathId> {
    u32::try_from(raw)
        .map(PathId)
        .map_err(|_| Error::InvalidConfig(format!("음수 경로 핸들: {}", raw)))
}

fn to_c_int(value: usize) -> c_int {
    c_int::try_from(value).unwrap_or(c_int::MAX)
}

fn id_to_c_int(id: PathId) -> Result<c_int> {
    c_int::try_from(id.0).map_err(|_| Error::Runtime(format!("경로 핸들 범위 초과: {}", id)))
}

fn count_arg(count: c_int) -> Result<usize> {
    usize::try_from(count)
        .ok()
        .filter(|&n| n > 0)
        .ok_or(Error::NoChannels)
}

fn port_arg(port: c_int) -> Result<u16> {
    u16::try_from(port).map_err(|_| Error::InvalidConfig(format!("유효하지 않은 포트: {}", port)))
}

/// C 채널 인덱스 목록 변환 (음수는 `count`개 채널 경로에서 유효하지 않은 인덱스)
fn channel_indices(raw: &[c_int], count: usize) -> Result<Vec<usize>> {
    raw.iter()
        .map(|&c| {
            usize::try_from(c).map_err(|_| Error::InvalidChannelIndex {
                index: usize::MAX,
                count,
            })
        })
        .collect()
}

/// # Safety
/// `ptr`는 null이거나 NUL로 끝나는 유효한 문자열이어야 한다.
unsafe fn host_arg(ptr: *const c_char) -> Result<String> {
    if ptr.is_null() {
        return Err(Error::InvalidConfig("호스트가 null".to_string()));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map(str::to_owned)
        .map_err(|e| Error::InvalidConfig(format!("호스트 문자열이 UTF-8이 아님: {}", e)))
}

/// # Safety
/// `ptr`는 null이거나 `len`개 원소를 읽을 수 있어야 한다.
unsafe fn slice_arg<'a, T>(ptr: *const T, len: usize, what: &str) -> Result<&'a [T]> {
    if len == 0 {
        return Ok(&[]);
    }
    if ptr.is_null() {
        return Err(Error::InvalidConfig(format!("{} 버퍼가 null", what)));
    }
    Ok(slice::from_raw_parts(ptr, len))
}

/// 채널마다 호스트와 포트를 지정해 경로 생성. 경로 핸들 반환.
///
/// # Safety
/// `hosts`는 `count`개의 C 문자열 포인터, `ports`는 `count`개의 포트를 가리켜야 한다.
#[no_mangle]
pub unsafe extern "C" fn widepath_init(
    hosts: *const *const c_char,
    ports: *const c_int,
    count: c_int,
) -> c_int {
    status((|| -> Result<c_int> {
        let count = count_arg(count)?;
        let hosts = slice_arg(hosts, count, "호스트")?;
        let ports = slice_arg(ports, count, "포트")?;

        let endpoints = hosts
            .iter()
            .zip(ports)
            .map(|(&host, &port)| Ok::<_, Error>(Endpoint::new(host_arg(host)?, port_arg(port)?)))
            .collect::<Result<Vec<_>>>()?;

        let engine = engine();
        let id = runtime()?.block_on(engine.init(&endpoints))?;
        id_to_c_int(id)
    })())
}

/// `host`의 `base_port`부터 연속 포트로 `count`채널 경로 생성. 경로 핸들 반환.
///
/// # Safety
/// `host`는 NUL로 끝나는 유효한 문자열이어야 한다.
#[no_mangle]
pub unsafe extern "C" fn widepath_create_path(
    host: *const c_char,
    base_port: c_int,
    count: c_int,
) -> c_int {
    status((|| -> Result<c_int> {
        let host = host_arg(host)?;
        let base_port = port_arg(base_port)?;
        let count = count_arg(count)?;

        let engine = engine();
        let id = runtime()?.block_on(engine.create_path(&host, base_port, count))?;
        id_to_c_int(id)
    })())
}

/// 채널 윈도우 크기 변경. 실제 적용된 크기 반환.
///
/// `channel`이 음수이면 경로의 모든 채널에 적용하고 가장 작은 값을 반환한다.
#[no_mangle]
pub extern "C" fn widepath_set_window(path: c_int, channel: c_int, bytes: c_int) -> c_int {
    status((|| -> Result<c_int> {
        let id = path_id(path)?;
        let bytes = usize::try_from(bytes)
            .map_err(|_| Error::InvalidConfig(format!("유효하지 않은 윈도우 크기: {}", bytes)))?;

        let effective = match usize::try_from(channel) {
            Ok(index) => engine().set_window(id, index, bytes)?.effective(),
            Err(_) => engine()
                .set_path_window(id, bytes)?
                .iter()
                .map(|w| w.effective())
                .min()
                .unwrap_or(0),
        };
        Ok(to_c_int(effective))
    })())
}

/// 전역 페이싱 상한 (bytes/sec), 0이면 해제
#[no_mangle]
pub extern "C" fn widepath_set_pacing_rate(bytes_per_sec: f64) -> c_int {
    engine().set_pacing_rate(bytes_per_sec);
    0
}

#[no_mangle]
pub extern "C" fn widepath_pacing_rate() -> f64 {
    engine().pacing_rate()
}

/// 송수신 청크 크기 변경
///
/// `path`가 음수이면 모든 경로와 이후 생성되는 경로에 적용한다.
#[no_mangle]
pub extern "C" fn widepath_set_chunk_size(path: c_int, send: c_int, recv: c_int) -> c_int {
    status((|| -> Result<c_int> {
        let send = usize::try_from(send).unwrap_or(0);
        let recv = usize::try_from(recv).unwrap_or(0);
        match u32::try_from(path) {
            Ok(id) => engine().set_path_chunk_size(PathId(id), send, recv)?,
            Err(_) => engine().set_chunk_size(send, recv)?,
        }
        Ok(0)
    })())
}

/// 경로의 채널들로 송수신
///
/// `channels`가 null이거나 `channel_count`가 0이면 모든 채널을 사용한다.
///
/// # Safety
/// 각 버퍼 포인터는 null이거나 주어진 길이만큼 유효해야 하며, `recv_buf`는 호출 동안
/// 다른 곳에서 접근하지 않아야 한다.
#[no_mangle]
pub unsafe extern "C" fn widepath_send_recv(
    path: c_int,
    send_buf: *const u8,
    send_len: usize,
    recv_buf: *mut u8,
    recv_len: usize,
    channels: *const c_int,
    channel_count: c_int,
) -> c_int {
    status((|| -> Result<c_int> {
        let id = path_id(path)?;
        let send = slice_arg(send_buf, send_len, "송신")?;
        let recv: &mut [u8] = if recv_len == 0 {
            &mut []
        } else if recv_buf.is_null() {
            return Err(Error::InvalidConfig("수신 버퍼가 null".to_string()));
        } else {
            slice::from_raw_parts_mut(recv_buf, recv_len)
        };

        let path = engine().path(id)?;
        let indices = match usize::try_from(channel_count) {
            Ok(n) if n > 0 && !channels.is_null() => {
                channel_indices(slice::from_raw_parts(channels, n), path.len())?
            }
            _ => path.all_indices(),
        };

        runtime()?.block_on(path.send_recv_on(send, recv, &indices))?;
        Ok(0)
    })())
}

/// 경로 해제 (항상 0)
#[no_mangle]
pub extern "C" fn widepath_destroy_path(path: c_int) -> c_int {
    match path_id(path) {
        Ok(id) => engine().destroy_path(id),
        Err(e) => warn!("widepath_destroy_path: {}", e),
    }
    0
}

/// 모든 경로 해제 (항상 0)
#[no_mangle]
pub extern "C" fn widepath_finalize() -> c_int {
    engine().finalize();
    0
}

#[no_mangle]
pub extern "C" fn widepath_channel_count(path: c_int) -> c_int {
    status(path_id(path).and_then(|id| engine().channel_count(id)).map(to_c_int))
}
