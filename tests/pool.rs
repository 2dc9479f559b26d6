//! Pool behavior through the public API, with duplex-backed connections
//! whose server half answers pings.
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use clickhouse_stream::{
    CompressionMethod, Connection, ConnectionPool, DialFn, Error, PoolOptions, ServerInfo,
    Settings,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf, duplex, split};

type R = ReadHalf<DuplexStream>;
type W = WriteHalf<DuplexStream>;

const PING: u8 = 4;
const PONG: u8 = 4;

/// A dialer whose server halves answer every Ping with Pong.
fn pong_dialer() -> (DialFn<R, W>, Arc<AtomicUsize>) {
    let dials = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&dials);
    let dial: DialFn<R, W> = Box::new(move || {
        let count = Arc::clone(&count);
        Box::pin(async move {
            let _ = count.fetch_add(1, Ordering::SeqCst);
            let (client, mut server) = duplex(4096);
            drop(tokio::spawn(async move {
                let mut byte = [0u8; 1];
                while server.read_exact(&mut byte).await.is_ok() {
                    if byte[0] == PING && server.write_all(&[PONG]).await.is_err() {
                        break;
                    }
                }
            }));
            let (reader, writer) = split(client);
            Ok(Connection::new(
                reader,
                writer,
                ServerInfo::default(),
                CompressionMethod::None,
                Settings::default(),
            ))
        })
    });
    (dial, dials)
}

#[tokio::test]
async fn ping_then_reacquire_reuses_the_connection() {
    let (dial, dials) = pong_dialer();
    let pool = ConnectionPool::new(dial, PoolOptions::default());

    let mut conn = pool.acquire().await.unwrap();
    conn.ping().await.unwrap();
    drop(conn);

    let mut conn = pool.acquire().await.unwrap();
    conn.ping().await.unwrap();
    assert_eq!(dials.load(Ordering::SeqCst), 1, "released connection must be reused");
}

#[tokio::test]
async fn ping_on_acquire_vets_candidates() {
    let (dial, dials) = pong_dialer();
    let options = PoolOptions { ping_on_acquire: true, ..PoolOptions::default() };
    let pool = ConnectionPool::new(dial, options);

    drop(pool.acquire().await.unwrap());
    drop(pool.acquire().await.unwrap());
    assert_eq!(dials.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn closed_connection_is_not_pooled() {
    let (dial, dials) = pong_dialer();
    let pool = ConnectionPool::new(dial, PoolOptions::default());

    let mut conn = pool.acquire().await.unwrap();
    conn.close().await.unwrap();
    assert!(conn.ping().await.is_err());
    drop(conn);

    assert_eq!(pool.status().idle, 0);
    let _conn = pool.acquire().await.unwrap();
    assert_eq!(dials.load(Ordering::SeqCst), 2, "poisoned connection must be discarded");
}

#[tokio::test]
async fn exhausted_pool_times_out_then_recovers() {
    let (dial, _dials) = pong_dialer();
    let options = PoolOptions {
        max_connections: 2,
        acquire_timeout: Some(Duration::from_millis(50)),
        ..PoolOptions::default()
    };
    let pool = ConnectionPool::new(dial, options);

    let first = pool.acquire().await.unwrap();
    let second = pool.acquire().await.unwrap();
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, Error::Canceled { .. }), "{err:?}");

    drop(first);
    drop(second);
    let mut conn = pool.acquire().await.unwrap();
    conn.ping().await.unwrap();
}

#[tokio::test]
async fn pool_close_drains_idle_and_rejects_acquire() {
    let (dial, _dials) = pong_dialer();
    let pool = ConnectionPool::new(dial, PoolOptions::default());

    drop(pool.acquire().await.unwrap());
    assert_eq!(pool.status().idle, 1);

    pool.close().await;
    assert_eq!(pool.status().idle, 0);
    assert!(matches!(pool.acquire().await.unwrap_err(), Error::Closed));
}
