//! 테스트용 루프백 헬퍼

use std::net::TcpListener;
use std::sync::Arc;

use rand::Rng;

use crate::pacing::Pacer;
use crate::path::PathSet;
use crate::Config;

/// 연속으로 비어 있는 포트 블록의 시작 포트
pub(crate) fn free_base_port(count: usize) -> u16 {
    let mut rng = rand::thread_rng();
    loop {
        let base: u16 = rng.gen_range(20_000..60_000);
        let free = (0..count).all(|i| TcpListener::bind(("0.0.0.0", base + i as u16)).is_ok());
        if free {
            return base;
        }
    }
}

/// 루프백 경로 한 쌍 (client, server)
///
/// server는 수신 대기 모드로 별도 태스크에서 열리고, client는 127.0.0.1로 접속한다.
pub(crate) async fn loopback_pair(
    count: usize,
    config: Config,
    pacer: Arc<Pacer>,
) -> (PathSet, PathSet) {
    let base = free_base_port(count);
    let server_config = config.clone();
    let server = tokio::spawn(async move {
        PathSet::connect("0.0.0.0", base, count, server_config, Arc::new(Pacer::unlimited())).await
    });

    let client = PathSet::connect("127.0.0.1", base, count, config, pacer)
        .await
        .expect("client path");
    let server = server.await.expect("server task").expect("server path");
    (client, server)
}

/// 패턴 데이터
pub(crate) fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
