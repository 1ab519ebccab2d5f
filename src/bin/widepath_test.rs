//! widepath 전송 테스트 드라이버
//!
//! 양쪽 호스트에서 같은 인자로 실행하고, 한쪽은 호스트를 `0`으로 주어 수신 대기한다.
//! 매 반복마다 무작위 버퍼를 교환하고 CRC32와 처리율을 출력한다.
//!
//! 사용법:
//!   cargo run --release --bin widepath-test -- <host> [channels] [buffer KiB] [pacing MB/s] [tcpwin]
//!
//! 예시:
//!   # 수신 대기 측
//!   cargo run --release --bin widepath-test -- 0 4 1024 100
//!
//!   # 접속 측
//!   cargo run --release --bin widepath-test -- 10.0.0.2 4 1024 100

use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use rand::RngCore;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use widepath::{Config, Engine, PathId, TransferReport, DEFAULT_BASE_PORT};

#[derive(Parser, Debug)]
#[command(name = "widepath-test")]
#[command(about = "Multi-stream TCP exchange test between two hosts")]
struct Args {
    /// Remote host, or `0` to listen
    host: String,

    /// Number of channels
    #[arg(default_value_t = 1)]
    channels: usize,

    /// Buffer size per exchange (KiB)
    #[arg(default_value_t = 8)]
    buffer_kib: usize,

    /// Aggregate pacing rate (MB/s), 0 = unlimited
    #[arg(default_value_t = 0.0)]
    pacing_mbps: f64,

    /// TCP window per channel (bytes), 0 = autotune
    #[arg(default_value_t = 0)]
    tcpwin: usize,

    /// First port of the channel block
    #[arg(long, default_value_t = DEFAULT_BASE_PORT)]
    base_port: u16,

    /// Number of exchanges
    #[arg(long, default_value_t = 10)]
    iterations: usize,

    /// Pause between exchanges (ms)
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,

    /// Run exchanges as background tasks and poll for completion
    #[arg(long)]
    nonblocking: bool,

    /// Prefix each exchange with a size header
    #[arg(long)]
    dynamic: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정 (RUST_LOG, 기본 info)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    let config = Config {
        autotune: args.tcpwin == 0,
        window_size: if args.tcpwin == 0 {
            Config::default().window_size
        } else {
            args.tcpwin
        },
        ..Config::wide_area()
    };
    config.validate()?;

    info!("=== widepath-test ===");
    info!("호스트: {} (포트 {}~)", args.host, args.base_port);
    info!("채널: {}, 버퍼: {} KiB", args.channels, args.buffer_kib);

    let engine = Engine::new(config);
    let path = engine
        .create_path(&args.host, args.base_port, args.channels)
        .await?;

    if args.pacing_mbps > 0.0 {
        engine.set_pacing_rate(args.pacing_mbps * 1_000_000.0);
    }
    engine.log_paths();

    engine.barrier_all(path).await?;
    info!("배리어 통과, 교환 시작");

    let len = args.buffer_kib * 1024;
    for iteration in 1..=args.iterations {
        let mut outgoing = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut outgoing);

        let (incoming, report) = if args.nonblocking {
            exchange_nonblocking(&engine, path, outgoing.clone(), len).await?
        } else {
            let mut incoming = vec![0u8; len];
            let report = if args.dynamic {
                engine.dynamic_send_recv(path, &outgoing, &mut incoming).await?
            } else {
                engine.send_recv(path, &outgoing, &mut incoming).await?
            };
            incoming.truncate(report.total_received());
            (incoming, report)
        };

        log_iteration(iteration, &outgoing, &incoming, &report);

        if args.interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        }
    }

    engine.finalize();
    Ok(())
}

async fn exchange_nonblocking(
    engine: &Engine,
    path: PathId,
    outgoing: Vec<u8>,
    len: usize,
) -> widepath::Result<(Vec<u8>, TransferReport)> {
    let exchange = engine.isend_recv(path, Bytes::from(outgoing), len)?;

    let mut polls = 0u64;
    while !exchange.is_finished() {
        polls += 1;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    info!("비동기 교환 완료 ({} 회 확인)", polls);

    let done = exchange.wait().await?;
    Ok((done.data.to_vec(), done.report))
}

fn log_iteration(iteration: usize, outgoing: &[u8], incoming: &[u8], report: &TransferReport) {
    info!(
        "[{}] 송신 CRC32 {:08x} | 수신 CRC32 {:08x} ({} bytes)",
        iteration,
        crc32fast::hash(outgoing),
        crc32fast::hash(incoming),
        incoming.len()
    );
    info!("[{}] {}", iteration, report.summary());
}
