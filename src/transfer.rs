//! 다중 채널 송수신 (Transfer Coordinator)
//!
//! 송신 버퍼와 수신 버퍼를 채널 수만큼 연속 구간으로 나누고, 채널마다 자기 구간을
//! 전이중으로 처리한다. 호출은 가장 느린 채널이 양방향을 모두 끝낼 때 반환된다.
//!
//! 일반 송수신에는 프레이밍이 없다. 양쪽이 같은 길이와 같은 채널 순서로 호출해야
//! 구간 경계가 맞는다.

use std::ops::Range;

use futures::future::try_join_all;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::config::RemainderPlacement;
use crate::path::PathSet;
use crate::stats::{ChannelTransfer, TransferReport};
use crate::{Error, Result};

/// 동적 교환의 크기 헤더 길이
pub const SIZE_HEADER_LEN: usize = 8;

/// `len` 바이트를 `parts`개의 연속 구간으로 분할
///
/// 각 구간의 길이는 `len / parts`와 최대 1바이트 차이가 나며, 나머지는 `placement`에 따라
/// 뒤쪽 또는 앞쪽 채널이 1바이트씩 맡는다.
pub fn partition(len: usize, parts: usize, placement: RemainderPlacement) -> Vec<Range<usize>> {
    if parts == 0 {
        return Vec::new();
    }

    let base = len / parts;
    let remainder = len % parts;
    let mut start = 0;

    (0..parts)
        .map(|i| {
            let extra = match placement {
                RemainderPlacement::Trailing => i >= parts - remainder,
                RemainderPlacement::Leading => i < remainder,
            };
            let end = start + base + extra as usize;
            let range = start..end;
            start = end;
            range
        })
        .collect()
}

/// 연속 구간대로 버퍼를 겹치지 않는 가변 슬라이스로 분할
fn split_ranges_mut<'a>(mut buf: &'a mut [u8], ranges: &[Range<usize>]) -> Vec<&'a mut [u8]> {
    ranges
        .iter()
        .map(|range| {
            let (head, tail) = std::mem::take(&mut buf).split_at_mut(range.len());
            buf = tail;
            head
        })
        .collect()
}

/// 채널 인덱스 목록 검증
pub fn validate_indices(indices: &[usize], count: usize) -> Result<()> {
    if indices.is_empty() {
        return Err(Error::NoChannels);
    }

    let mut seen = vec![false; count];
    for &index in indices {
        if index >= count {
            return Err(Error::InvalidChannelIndex { index, count });
        }
        if seen[index] {
            return Err(Error::DuplicateChannelIndex { index });
        }
        seen[index] = true;
    }
    Ok(())
}

/// 한 호출에서 채널 하나가 맡는 송신 구간과 수신 구간
struct Lane<'a> {
    channel: &'a Channel,
    send: &'a [u8],
    recv: &'a mut [u8],
}

fn transfer_error(channel: usize, source: Error) -> Error {
    warn!("[{}] 전송 실패: {}", channel, source);
    Error::Transfer {
        channel,
        source: Box::new(source),
    }
}

/// 송신 채널 집합과 수신 채널 집합으로 작업 분배
///
/// 두 집합에 모두 속한 채널은 한 레인에서 양방향을 처리한다.
/// 레인 순서는 송신 집합 순서, 이어서 수신 전용 채널 순서.
fn plan_lanes<'a>(
    path: &'a PathSet,
    send: &'a [u8],
    recv: &'a mut [u8],
    send_indices: &[usize],
    recv_indices: &[usize],
) -> Result<Vec<Lane<'a>>> {
    validate_indices(send_indices, path.len())?;
    validate_indices(recv_indices, path.len())?;
    let placement = path.config().remainder;

    let mut slots: Vec<Option<&'a mut [u8]>> = (0..path.len()).map(|_| None).collect();
    let recv_ranges = partition(recv.len(), recv_indices.len(), placement);
    for (&index, slice) in recv_indices.iter().zip(split_ranges_mut(recv, &recv_ranges)) {
        slots[index] = Some(slice);
    }

    let mut lanes = Vec::with_capacity(send_indices.len().max(recv_indices.len()));
    let send_ranges = partition(send.len(), send_indices.len(), placement);
    for (&index, range) in send_indices.iter().zip(send_ranges) {
        lanes.push(Lane {
            channel: path.channel(index)?,
            send: &send[range],
            recv: slots[index].take().unwrap_or_default(),
        });
    }
    for &index in recv_indices {
        if let Some(slice) = slots[index].take() {
            lanes.push(Lane {
                channel: path.channel(index)?,
                send: &[],
                recv: slice,
            });
        }
    }
    Ok(lanes)
}

/// 레인마다 송신과 수신을 동시에 진행하고 전부 끝날 때까지 대기
async fn run_lanes(path: &PathSet, lanes: Vec<Lane<'_>>) -> Result<TransferReport> {
    let (send_chunk, recv_chunk) = path.chunk_sizes();

    let started = Instant::now();
    let exchanges = lanes.into_iter().map(|lane| async move {
        let Lane { channel, send, recv } = lane;
        let (sent, received) = (send.len(), recv.len());
        tokio::try_join!(
            send_paced(channel, send, send_chunk),
            recv_chunked(channel, recv, recv_chunk),
        )
        .map_err(|e| transfer_error(channel.index(), e))?;

        Ok::<_, Error>(ChannelTransfer {
            channel: channel.index(),
            sent,
            received,
        })
    });

    Ok(TransferReport {
        channels: try_join_all(exchanges).await?,
        elapsed: started.elapsed(),
    })
}

/// 지정한 채널들로 `send`를 모두 보내면서 `recv`를 가득 채움
///
/// 한 채널이라도 실패하면 그 채널 인덱스를 담은 `Transfer` 에러로 끝난다.
/// 다른 채널에서 이미 오간 바이트는 되돌리지 않는다.
pub async fn send_recv(
    path: &PathSet,
    send: &[u8],
    recv: &mut [u8],
    indices: &[usize],
) -> Result<TransferReport> {
    let lanes = plan_lanes(path, send, recv, indices, indices)?;
    let report = run_lanes(path, lanes).await?;
    debug!("send_recv: {}", report.summary());
    Ok(report)
}

/// 송신 채널과 수신 채널을 따로 지정한 교환
///
/// `send`는 `send_indices`로 나눠 보내고, `recv`는 `recv_indices`로 나눠 받는다.
/// 상대편은 두 집합을 뒤바꿔 호출해야 한다.
pub async fn cycle(
    path: &PathSet,
    send: &[u8],
    recv: &mut [u8],
    send_indices: &[usize],
    recv_indices: &[usize],
) -> Result<TransferReport> {
    let lanes = plan_lanes(path, send, recv, send_indices, recv_indices)?;
    let report = run_lanes(path, lanes).await?;
    debug!("cycle: {}", report.summary());
    Ok(report)
}

/// 미리 나눈 채널별 버퍼로 교환
///
/// `sends[i]`와 `recvs[i]`가 `indices[i]` 채널의 송수신 버퍼다. 분할은 하지 않는다.
pub async fn psend_recv(
    path: &PathSet,
    sends: &[&[u8]],
    recvs: &mut [&mut [u8]],
    indices: &[usize],
) -> Result<TransferReport> {
    validate_indices(indices, path.len())?;
    if sends.len() != indices.len() || recvs.len() != indices.len() {
        return Err(Error::InvalidConfig(format!(
            "채널별 버퍼 수 불일치: 채널 {}, 송신 {}, 수신 {}",
            indices.len(),
            sends.len(),
            recvs.len()
        )));
    }

    let lanes = indices
        .iter()
        .zip(sends)
        .zip(recvs.iter_mut())
        .map(|((&index, &send), recv)| {
            Ok::<_, Error>(Lane {
                channel: path.channel(index)?,
                send,
                recv: &mut **recv,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let report = run_lanes(path, lanes).await?;
    debug!("psend_recv: {}", report.summary());
    Ok(report)
}

/// 크기 헤더를 붙인 교환
///
/// 모든 채널이 먼저 송신 총량을 8바이트 빅엔디언으로 보낸 뒤 자기 구간을 보낸다.
/// 수신 측은 알려진 총량을 같은 방식으로 나눠 받으며, 총량은 `recv` 용량 이하여야 한다.
/// 보고서의 `total_received`가 실제로 채워진 앞부분 길이다.
pub async fn dynamic_send_recv(
    path: &PathSet,
    send: &[u8],
    recv: &mut [u8],
    indices: &[usize],
) -> Result<TransferReport> {
    dynamic_cycle(path, send, recv, indices, indices).await
}

/// 송신 채널과 수신 채널을 따로 지정한 크기 헤더 교환
///
/// 송신 집합의 채널마다 헤더와 자기 구간을 보내고, 수신 집합의 채널마다 헤더를 읽어
/// 알려진 총량을 수신 채널 수로 나눠 받는다.
pub async fn dynamic_cycle(
    path: &PathSet,
    send: &[u8],
    recv: &mut [u8],
    send_indices: &[usize],
    recv_indices: &[usize],
) -> Result<TransferReport> {
    validate_indices(send_indices, path.len())?;
    validate_indices(recv_indices, path.len())?;
    let (send_chunk, recv_chunk) = path.chunk_sizes();
    let placement = path.config().remainder;
    let recv_count = recv_indices.len();
    let capacity = recv.len();
    let header = (send.len() as u64).to_be_bytes();

    // (채널, 송신 구간, 수신 집합 내 위치)
    let mut lanes: Vec<(&Channel, Option<&[u8]>, Option<usize>)> = Vec::new();
    let send_ranges = partition(send.len(), send_indices.len(), placement);
    for (&index, range) in send_indices.iter().zip(send_ranges) {
        let position = recv_indices.iter().position(|&r| r == index);
        lanes.push((path.channel(index)?, Some(&send[range]), position));
    }
    for (position, &index) in recv_indices.iter().enumerate() {
        if !send_indices.contains(&index) {
            lanes.push((path.channel(index)?, None, Some(position)));
        }
    }

    let started = Instant::now();
    let exchanges = lanes.into_iter().map(|(channel, outgoing, position)| async move {
        let outbound = async {
            if let Some(data) = outgoing {
                channel.send_all(&header).await?;
                send_paced(channel, data, send_chunk).await?;
            }
            Ok::<_, Error>(())
        };
        let inbound = async {
            let Some(position) = position else {
                return Ok::<_, Error>(None);
            };
            let mut announced = [0u8; SIZE_HEADER_LEN];
            channel.recv_exact(&mut announced).await?;
            let total = u64::from_be_bytes(announced);
            if total > capacity as u64 {
                return Err(Error::DynamicSizeExceeded {
                    found: total,
                    max: capacity,
                });
            }

            let range = partition(total as usize, recv_count, placement)[position].clone();
            let mut slice = vec![0u8; range.len()];
            recv_chunked(channel, &mut slice, recv_chunk).await?;
            Ok(Some((total, range, slice)))
        };

        let ((), inbound) = tokio::try_join!(outbound, inbound)
            .map_err(|e| transfer_error(channel.index(), e))?;
        let sent = outgoing.map_or(0, |data| data.len());
        Ok::<_, Error>((channel.index(), sent, inbound))
    });

    let results = try_join_all(exchanges).await?;
    let elapsed = started.elapsed();

    let expected = results
        .iter()
        .find_map(|(_, _, inbound)| inbound.as_ref().map(|r| r.0))
        .unwrap_or(0);
    for (channel, _, inbound) in &results {
        if let Some((got, _, _)) = inbound {
            if *got != expected {
                return Err(Error::DynamicSizeMismatch {
                    channel: *channel,
                    expected,
                    got: *got,
                });
            }
        }
    }

    let mut transfers = Vec::with_capacity(results.len());
    for (channel, sent, inbound) in results {
        let received = match inbound {
            Some((_, range, slice)) => {
                recv[range].copy_from_slice(&slice);
                slice.len()
            }
            None => 0,
        };
        transfers.push(ChannelTransfer {
            channel,
            sent,
            received,
        });
    }

    let report = TransferReport {
        channels: transfers,
        elapsed,
    };
    debug!("dynamic exchange: {} bytes 수신, {}", expected, report.summary());
    Ok(report)
}

/// 청크마다 페이서 허가를 받은 뒤 전부 쓰기
async fn send_paced(channel: &Channel, data: &[u8], chunk_size: usize) -> Result<()> {
    for chunk in data.chunks(chunk_size) {
        channel.pacer().admit(chunk.len()).await;
        channel.send_all(chunk).await?;
    }
    Ok(())
}

/// 청크 단위로 버퍼를 가득 채울 때까지 읽기
async fn recv_chunked(channel: &Channel, buf: &mut [u8], chunk_size: usize) -> Result<()> {
    for chunk in buf.chunks_mut(chunk_size) {
        channel.recv_exact(chunk).await?;
    }
    Ok(())
}
