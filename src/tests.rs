//! End-to-end query scenarios over an in-memory duplex transport.
//!
//! Each test scripts the server side of the exchange by hand: responses
//! are pre-written into the server half, and after the query finishes the
//! bytes the client sent are parsed back and asserted on.
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf, ReadHalf, WriteHalf, duplex,
    split,
};
use tokio_util::sync::CancellationToken;

use crate::compression::write_compressed;
use crate::connection::{Connection, ServerInfo};
use crate::io::{ClickHouseRead, ClickHouseWrite};
use crate::native::block::Block;
use crate::native::column::{Column, InputColumn, Value};
use crate::native::protocol::{CompressionMethod, ServerPacketId};
use crate::native::types::ColumnType;
use crate::query::{InputFlow, Parameter, Query};
use crate::settings::Settings;
use crate::Error;

type TestConnection = Connection<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

fn test_connection(compression: CompressionMethod) -> (TestConnection, DuplexStream) {
    let (client, server) = duplex(1 << 20);
    let (reader, writer) = split(client);
    let conn = Connection::new(
        reader,
        writer,
        ServerInfo::default(),
        compression,
        Settings::default(),
    );
    (conn, server)
}

// Server-side scripting helpers.

async fn server_send_block(
    server: &mut DuplexStream,
    code: ServerPacketId,
    block: &Block,
    compression: CompressionMethod,
) {
    server.write_var_uint(code as u64).await.unwrap();
    server.write_string("").await.unwrap();
    if compression.is_enabled() && code.compressible() {
        let mut raw = Vec::new();
        block.write(&mut raw).await.unwrap();
        write_compressed(server, &raw, compression).await.unwrap();
    } else {
        block.write(server).await.unwrap();
    }
}

async fn server_send_eos(server: &mut DuplexStream) {
    server.write_var_uint(ServerPacketId::EndOfStream as u64).await.unwrap();
}

async fn server_send_exception(server: &mut DuplexStream, code: i32, name: &str, message: &str) {
    server.write_var_uint(ServerPacketId::Exception as u64).await.unwrap();
    server.write_i32_le(code).await.unwrap();
    server.write_string(name).await.unwrap();
    server.write_string(message).await.unwrap();
    server.write_string("").await.unwrap();
    server.write_bool(false).await.unwrap();
}

async fn server_send_progress(server: &mut DuplexStream, rows: u64, bytes: u64) {
    server.write_var_uint(ServerPacketId::Progress as u64).await.unwrap();
    server.write_var_uint(rows).await.unwrap();
    server.write_var_uint(bytes).await.unwrap();
    server.write_var_uint(0).await.unwrap(); // total rows to read
    server.write_var_uint(0).await.unwrap(); // written rows
    server.write_var_uint(0).await.unwrap(); // written bytes
    server.write_var_uint(0).await.unwrap(); // elapsed ns
}

// Client-side parsing helpers, mirroring what the connection writes.

struct ParsedQueryHeader {
    qid:         String,
    body:        String,
    compression: u8,
    settings:    Vec<(String, String)>,
    parameters:  Vec<(String, String)>,
}

async fn read_query_header<R: ClickHouseRead>(server: &mut R) -> ParsedQueryHeader {
    assert_eq!(server.read_var_uint().await.unwrap(), 1, "expected Query packet");
    let qid = server.read_utf8_string().await.unwrap();

    // Client info stanza.
    assert_eq!(server.read_u8().await.unwrap(), 1, "initial query kind");
    let _initial_user = server.read_utf8_string().await.unwrap();
    let initial_query_id = server.read_utf8_string().await.unwrap();
    assert_eq!(initial_query_id, qid);
    let _initial_address = server.read_utf8_string().await.unwrap();
    let _query_start_time = server.read_u64_le().await.unwrap();
    assert_eq!(server.read_u8().await.unwrap(), 1, "tcp interface");
    let _os_user = server.read_utf8_string().await.unwrap();
    let _hostname = server.read_utf8_string().await.unwrap();
    let _client_name = server.read_utf8_string().await.unwrap();
    let _major = server.read_var_uint().await.unwrap();
    let _minor = server.read_var_uint().await.unwrap();
    let _revision = server.read_var_uint().await.unwrap();
    let _quota_key = server.read_utf8_string().await.unwrap();
    let _distributed_depth = server.read_var_uint().await.unwrap();
    let _patch = server.read_var_uint().await.unwrap();
    assert_eq!(server.read_u8().await.unwrap(), 0, "no otel context");
    let _collaborate = server.read_var_uint().await.unwrap();
    let _replica_count = server.read_var_uint().await.unwrap();
    let _replica_index = server.read_var_uint().await.unwrap();

    let mut settings = Vec::new();
    loop {
        let key = server.read_utf8_string().await.unwrap();
        if key.is_empty() {
            break;
        }
        let _flags = server.read_var_uint().await.unwrap();
        let value = server.read_utf8_string().await.unwrap();
        settings.push((key, value));
    }

    let _secret = server.read_utf8_string().await.unwrap();
    assert_eq!(server.read_var_uint().await.unwrap(), 2, "stage complete");
    let compression = server.read_u8().await.unwrap();
    let body = server.read_utf8_string().await.unwrap();

    let mut parameters = Vec::new();
    loop {
        let key = server.read_utf8_string().await.unwrap();
        if key.is_empty() {
            break;
        }
        let _flags = server.read_var_uint().await.unwrap();
        let value = server.read_utf8_string().await.unwrap();
        parameters.push((key, value));
    }

    ParsedQueryHeader { qid, body, compression, settings, parameters }
}

async fn read_data_packet<R: ClickHouseRead + 'static>(
    server: &mut R,
    compression: CompressionMethod,
) -> Block {
    assert_eq!(server.read_var_uint().await.unwrap(), 2, "expected Data packet");
    let table = server.read_utf8_string().await.unwrap();
    assert!(table.is_empty(), "unexpected table {table:?}");
    if compression.is_enabled() {
        let mut decompressor =
            crate::compression::StreamingDecompressor::new(compression, server);
        Block::read(&mut decompressor).await.unwrap()
    } else {
        Block::read(server).await.unwrap()
    }
}

/// Returns an error kind of `TimedOut` on the first read, then delegates.
struct FlakyReader<R> {
    inner:   R,
    tripped: bool,
}

impl<R: AsyncRead + Unpin> AsyncRead for FlakyReader<R> {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        if !self.tripped {
            self.tripped = true;
            return std::task::Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "synthetic read timeout",
            )));
        }
        std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

// Scenarios.

#[tokio::test]
async fn ping_pong() {
    let (mut conn, mut server) = test_connection(CompressionMethod::None);
    server.write_var_uint(ServerPacketId::Pong as u64).await.unwrap();
    conn.ping().await.unwrap();
    assert!(!conn.is_closed());

    // The client sent exactly one Ping code.
    drop(conn);
    let mut sent = Vec::new();
    let _ = server.read_to_end(&mut sent).await.unwrap();
    assert_eq!(sent, vec![4]);
}

#[tokio::test]
async fn ping_rejects_unexpected_packet() {
    let (mut conn, mut server) = test_connection(CompressionMethod::None);
    server_send_progress(&mut server, 1, 1).await;
    let err = conn.ping().await.unwrap_err();
    assert!(matches!(err.root(), Error::Protocol(_)));
    assert!(conn.is_closed());
}

#[tokio::test]
async fn select_single_block() {
    let (mut conn, mut server) = test_connection(CompressionMethod::None);

    let result = Block::from_columns(vec![("1".into(), Column::Int32(vec![1]))]);
    server_send_block(&mut server, ServerPacketId::Data, &result, CompressionMethod::None).await;
    server_send_eos(&mut server).await;

    let mut blocks = Vec::new();
    let query = Query::new("SELECT 1").with_on_result(|block| {
        blocks.push(block);
        Ok(())
    });
    conn.execute(query, &CancellationToken::new()).await.unwrap();

    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].rows(), 1);
    assert_eq!(blocks[0].column_count(), 1);
    assert_eq!(blocks[0].columns[0].1.value(0), Value::Int32(1));
    assert!(!conn.is_closed());

    drop(conn);
    let header = read_query_header(&mut server).await;
    assert_eq!(header.body, "SELECT 1");
    assert_eq!(header.compression, 0);
    // End-of-external-data terminator.
    let blank = read_data_packet(&mut server, CompressionMethod::None).await;
    assert!(blank.is_end());
}

#[tokio::test]
async fn select_under_compression_with_telemetry() {
    let (mut conn, mut server) = test_connection(CompressionMethod::Lz4);

    server_send_progress(&mut server, 10, 512).await;
    let result = Block::from_columns(vec![(
        "value".into(),
        Column::String(vec![b"one".to_vec(), b"two".to_vec()]),
    )]);
    server_send_block(&mut server, ServerPacketId::Data, &result, CompressionMethod::Lz4).await;
    server_send_eos(&mut server).await;

    let mut progress_rows = 0;
    let mut rows_seen = 0;
    let mut query = Query::new("SELECT value FROM t").with_on_result(|block| {
        rows_seen += block.rows();
        Ok(())
    });
    query.on_progress = Some(Box::new(|p| {
        progress_rows += p.read_rows;
        Ok(())
    }));
    conn.execute(query, &CancellationToken::new()).await.unwrap();

    assert_eq!(progress_rows, 10);
    assert_eq!(rows_seen, 2);
}

#[tokio::test]
async fn default_result_handler_allows_exactly_one_block() {
    let (mut conn, mut server) = test_connection(CompressionMethod::None);
    let block = Block::from_columns(vec![("v".into(), Column::UInt8(vec![1]))]);
    server_send_block(&mut server, ServerPacketId::Data, &block, CompressionMethod::None).await;
    server_send_block(&mut server, ServerPacketId::Data, &block, CompressionMethod::None).await;
    server_send_eos(&mut server).await;

    let err =
        conn.execute(Query::new("SELECT 1"), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err.root(), Error::Protocol(_)), "{err:?}");
    assert!(conn.is_closed());
}

#[tokio::test]
async fn insert_streams_blocks_and_terminator() {
    let (mut conn, mut server) = test_connection(CompressionMethod::None);

    // Column echo the server sends back for the INSERT.
    let echo = Block::from_columns(vec![("n".into(), Column::Int32(Vec::new()))]);
    server_send_block(&mut server, ServerPacketId::Data, &echo, CompressionMethod::None).await;
    server_send_eos(&mut server).await;

    let sent_batches = Arc::new(AtomicUsize::new(1));
    let batches = Arc::clone(&sent_batches);
    let mut query = Query::new("INSERT INTO t VALUES")
        .with_input(vec![InputColumn::new("n", Column::Int32((0..10).collect()))]);
    query.on_input = Some(Box::new(move |input| {
        let sent = batches.fetch_add(1, Ordering::SeqCst);
        if sent == 3 {
            // End of input with empty columns.
            for column in input.iter_mut() {
                column.data.reset();
            }
            return Ok(InputFlow::End);
        }
        for column in input.iter_mut() {
            column.data.reset();
            if let Column::Int32(data) = &mut column.data {
                data.extend(0..10);
            }
        }
        Ok(InputFlow::More)
    }));
    conn.execute(query, &CancellationToken::new()).await.unwrap();

    drop(conn);
    let header = read_query_header(&mut server).await;
    assert_eq!(header.body, "INSERT INTO t VALUES");
    // External-data terminator, three data blocks, then the input
    // terminator.
    let blank = read_data_packet(&mut server, CompressionMethod::None).await;
    assert!(blank.is_end());
    let mut rows = 0;
    for _ in 0..3 {
        let block = read_data_packet(&mut server, CompressionMethod::None).await;
        assert_eq!(block.column_count(), 1);
        rows += block.rows();
    }
    assert_eq!(rows, 30);
    let terminator = read_data_packet(&mut server, CompressionMethod::None).await;
    assert!(terminator.is_end());
    let mut remaining = Vec::new();
    let _ = server.read_to_end(&mut remaining).await.unwrap();
    assert!(remaining.is_empty(), "unexpected trailing bytes: {remaining:?}");
}

#[tokio::test]
async fn insert_without_callback_sends_one_block() {
    let (mut conn, mut server) = test_connection(CompressionMethod::None);
    let echo = Block::from_columns(vec![("n".into(), Column::UInt64(Vec::new()))]);
    server_send_block(&mut server, ServerPacketId::Data, &echo, CompressionMethod::None).await;
    server_send_eos(&mut server).await;

    let query = Query::new("INSERT INTO t VALUES")
        .with_input(vec![InputColumn::new("n", Column::UInt64(vec![7, 8]))]);
    conn.execute(query, &CancellationToken::new()).await.unwrap();

    drop(conn);
    let _header = read_query_header(&mut server).await;
    assert!(read_data_packet(&mut server, CompressionMethod::None).await.is_end());
    let block = read_data_packet(&mut server, CompressionMethod::None).await;
    assert_eq!(block.rows(), 2);
    assert!(read_data_packet(&mut server, CompressionMethod::None).await.is_end());
    let mut remaining = Vec::new();
    let _ = server.read_to_end(&mut remaining).await.unwrap();
    assert!(remaining.is_empty());
}

#[tokio::test]
async fn insert_tail_block_on_end_of_input() {
    let (mut conn, mut server) = test_connection(CompressionMethod::None);
    let echo = Block::from_columns(vec![("n".into(), Column::Int32(Vec::new()))]);
    server_send_block(&mut server, ServerPacketId::Data, &echo, CompressionMethod::None).await;
    server_send_eos(&mut server).await;

    let mut query = Query::new("INSERT INTO t VALUES")
        .with_input(vec![InputColumn::new("n", Column::Int32(vec![1, 2, 3]))]);
    let mut calls = 0;
    query.on_input = Some(Box::new(move |input| {
        calls += 1;
        assert_eq!(calls, 1, "input must not be polled past End");
        // End co-delivered with a final block.
        for column in input.iter_mut() {
            column.data.reset();
            if let Column::Int32(data) = &mut column.data {
                data.push(4);
            }
        }
        Ok(InputFlow::End)
    }));
    conn.execute(query, &CancellationToken::new()).await.unwrap();

    drop(conn);
    let _header = read_query_header(&mut server).await;
    assert!(read_data_packet(&mut server, CompressionMethod::None).await.is_end());
    assert_eq!(read_data_packet(&mut server, CompressionMethod::None).await.rows(), 3);
    assert_eq!(read_data_packet(&mut server, CompressionMethod::None).await.rows(), 1);
    assert!(read_data_packet(&mut server, CompressionMethod::None).await.is_end());
}

#[tokio::test]
async fn insert_infers_enum_bindings_from_echo() {
    let (mut conn, mut server) = test_connection(CompressionMethod::None);
    let echo = Block::from_columns(vec![(
        "status".into(),
        Column::Enum8 { variants: vec![("ok".into(), 1), ("err".into(), 2)], data: Vec::new() },
    )]);
    server_send_block(&mut server, ServerPacketId::Data, &echo, CompressionMethod::None).await;
    server_send_eos(&mut server).await;

    let query = Query::new("INSERT INTO t VALUES").with_input(vec![InputColumn::new(
        "status",
        Column::Enum8 { variants: Vec::new(), data: vec![1, 2, 1] },
    )]);
    conn.execute(query, &CancellationToken::new()).await.unwrap();

    drop(conn);
    let _header = read_query_header(&mut server).await;
    assert!(read_data_packet(&mut server, CompressionMethod::None).await.is_end());
    let block = read_data_packet(&mut server, CompressionMethod::None).await;
    // The streamed block carries the inferred bindings in its type.
    assert_eq!(
        block.columns[0].1.column_type(),
        ColumnType::from("Enum8('ok' = 1,'err' = 2)")
    );
    assert_eq!(block.rows(), 3);
}

#[tokio::test]
async fn server_exception_fails_query_but_keeps_connection() {
    let (mut conn, mut server) = test_connection(CompressionMethod::None);
    server_send_exception(&mut server, 62, "SYNTAX_ERROR", "Syntax error: near FORM").await;

    let err =
        conn.execute(Query::new("SELECT 1 FORM t"), &CancellationToken::new()).await.unwrap_err();
    assert!(err.is_exception());
    let exception = err.as_exception().unwrap();
    assert_eq!(exception.code, 62);
    assert_eq!(exception.name, "SYNTAX_ERROR");
    assert!(!conn.is_closed(), "exception must not poison the connection");

    // The connection services a subsequent query.
    let block = Block::from_columns(vec![("v".into(), Column::Int32(vec![5]))]);
    server_send_block(&mut server, ServerPacketId::Data, &block, CompressionMethod::None).await;
    server_send_eos(&mut server).await;
    let mut rows = 0;
    let query = Query::new("SELECT 5").with_on_result(|block| {
        rows += block.rows();
        Ok(())
    });
    conn.execute(query, &CancellationToken::new()).await.unwrap();
    assert_eq!(rows, 1);

    // No Cancel code was ever written: two query headers, two blanks,
    // nothing else.
    drop(conn);
    let _ = read_query_header(&mut server).await;
    assert!(read_data_packet(&mut server, CompressionMethod::None).await.is_end());
    let _ = read_query_header(&mut server).await;
    assert!(read_data_packet(&mut server, CompressionMethod::None).await.is_end());
    let mut remaining = Vec::new();
    let _ = server.read_to_end(&mut remaining).await.unwrap();
    assert!(remaining.is_empty());
}

#[tokio::test]
async fn corrupted_block_poisons_connection() {
    let (mut conn, mut server) = test_connection(CompressionMethod::Lz4);

    let block = Block::from_columns(vec![(
        "payload".into(),
        Column::String(vec![b"corruption target payload".to_vec(); 8]),
    )]);
    server.write_var_uint(ServerPacketId::Data as u64).await.unwrap();
    server.write_string("").await.unwrap();
    let mut raw = Vec::new();
    block.write(&mut raw).await.unwrap();
    let mut frame = Vec::new();
    write_compressed(&mut frame, &raw, CompressionMethod::Lz4).await.unwrap();
    // Single bit flip inside the compressed payload.
    let last = frame.len() - 1;
    frame[last] ^= 0x01;
    server.write_all(&frame).await.unwrap();

    let err = conn.execute(Query::new("SELECT payload"), &CancellationToken::new())
        .await
        .unwrap_err();
    match err.root() {
        Error::CorruptedData(corrupted) => {
            assert_ne!(corrupted.actual, corrupted.reference);
            assert_eq!(corrupted.data_size, raw.len());
        }
        other => panic!("expected corrupted data, got {other:?}"),
    }
    assert!(conn.is_closed(), "corrupted data must poison the connection");
}

#[tokio::test]
async fn cancel_mid_query_flushes_cancel_and_closes() {
    let (mut conn, mut server) = test_connection(CompressionMethod::None);
    server_send_progress(&mut server, 100, 4096).await;
    // The server then goes quiet: the query is still running.

    let token = CancellationToken::new();
    let trigger = token.clone();
    let mut query = Query::new("SELECT sleepEach(1) FROM big");
    query.on_progress = Some(Box::new(move |_| {
        trigger.cancel();
        Ok(())
    }));

    let err = conn.execute(query, &token).await.unwrap_err();
    assert!(matches!(err, Error::Canceled { .. }), "{err:?}");
    assert!(conn.is_closed());

    drop(conn);
    let _header = read_query_header(&mut server).await;
    assert!(read_data_packet(&mut server, CompressionMethod::None).await.is_end());
    // The best-effort Cancel code is the last thing on the wire.
    assert_eq!(server.read_var_uint().await.unwrap(), 3);
    let mut remaining = Vec::new();
    let _ = server.read_to_end(&mut remaining).await.unwrap();
    assert!(remaining.is_empty());
}

#[tokio::test]
async fn parameters_require_server_support() {
    let (client, _server) = duplex(1 << 20);
    let (reader, writer) = split(client);
    let server_info = ServerInfo {
        revision: crate::native::protocol::Feature::Parameters.revision() - 1,
        ..ServerInfo::default()
    };
    let mut conn = Connection::new(
        reader,
        writer,
        server_info,
        CompressionMethod::None,
        Settings::default(),
    );

    let mut query = Query::new("SELECT {n:UInt8}");
    query.parameters.push(Parameter::new("n", "7"));
    let err = conn.execute(query, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::UnsupportedFeature { .. }), "{err:?}");
    // Nothing touched the wire; the connection is still open.
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn parameters_are_quoted_on_the_wire() {
    let (mut conn, mut server) = test_connection(CompressionMethod::None);
    let block = Block::from_columns(vec![("v".into(), Column::UInt8(vec![7]))]);
    server_send_block(&mut server, ServerPacketId::Data, &block, CompressionMethod::None).await;
    server_send_eos(&mut server).await;

    let mut query = Query::new("SELECT {n:UInt8}").with_on_result(|_| Ok(()));
    query.parameters.push(Parameter::new("n", "it's 7"));
    query.settings = Settings::from([("max_threads", 2i32)]);
    conn.execute(query, &CancellationToken::new()).await.unwrap();

    drop(conn);
    let header = read_query_header(&mut server).await;
    assert_eq!(header.settings, vec![("max_threads".to_string(), "2".to_string())]);
    assert_eq!(header.parameters, vec![("n".to_string(), r"'it\'s 7'".to_string())]);
}

#[tokio::test]
async fn external_data_precedes_end_marker() {
    let (mut conn, mut server) = test_connection(CompressionMethod::None);
    let block = Block::from_columns(vec![("v".into(), Column::UInt8(vec![1]))]);
    server_send_block(&mut server, ServerPacketId::Data, &block, CompressionMethod::None).await;
    server_send_eos(&mut server).await;

    let mut query = Query::new("SELECT v FROM _data").with_on_result(|_| Ok(()));
    query.external_data = vec![InputColumn::new("id", Column::UInt64(vec![1, 2, 3]))];
    conn.execute(query, &CancellationToken::new()).await.unwrap();

    drop(conn);
    let _header = read_query_header(&mut server).await;
    // The external table rides a named Data packet.
    assert_eq!(server.read_var_uint().await.unwrap(), 2);
    assert_eq!(server.read_utf8_string().await.unwrap(), "_data");
    let external = Block::read(&mut server).await.unwrap();
    assert_eq!(external.rows(), 3);
    assert!(read_data_packet(&mut server, CompressionMethod::None).await.is_end());
}

#[tokio::test]
async fn read_timeouts_are_retried() {
    let (client, mut server) = duplex(1 << 20);
    let (reader, writer) = split(client);
    let mut conn = Connection::new(
        FlakyReader { inner: reader, tripped: false },
        writer,
        ServerInfo::default(),
        CompressionMethod::None,
        Settings::default(),
    );

    // The synthetic timeout is retried inside the packet loop; ping does
    // not retry, so drive a full query against a flaky reader instead.
    let block_server = async {
        let _header = read_query_header(&mut server).await;
        let _ = read_data_packet(&mut server, CompressionMethod::None).await;
        server_send_eos(&mut server).await;
    };
    let query = Query::new("SELECT 1").with_on_result(|_| Ok(()));
    let cancel = CancellationToken::new();
    let (result, ()) = tokio::join!(conn.execute(query, &cancel), block_server);
    result.unwrap();
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn logs_and_profile_events_reach_their_callbacks() {
    let (mut conn, mut server) = test_connection(CompressionMethod::Lz4);

    let log_block = Block::from_columns(vec![
        ("host_name".into(), Column::String(vec![b"ch1".to_vec()])),
        ("priority".into(), Column::Int8(vec![3])),
        ("text".into(), Column::String(vec![b"selected 1 parts".to_vec()])),
    ]);
    server_send_block(&mut server, ServerPacketId::Log, &log_block, CompressionMethod::Lz4)
        .await;

    let events_block = Block::from_columns(vec![
        ("name".into(), Column::String(vec![b"SelectedRows".to_vec()])),
        ("value".into(), Column::Int64(vec![42])),
        ("type".into(), Column::Int8(vec![1])),
    ]);
    server_send_block(
        &mut server,
        ServerPacketId::ProfileEvents,
        &events_block,
        CompressionMethod::Lz4,
    )
    .await;

    let result = Block::from_columns(vec![("v".into(), Column::UInt8(vec![1]))]);
    server_send_block(&mut server, ServerPacketId::Data, &result, CompressionMethod::Lz4).await;
    server_send_eos(&mut server).await;

    let mut logs = Vec::new();
    let mut events = Vec::new();
    let mut query = Query::new("SELECT 1").with_on_result(|_| Ok(()));
    query.on_logs = Some(Box::new(|batch| {
        logs.extend(batch);
        Ok(())
    }));
    query.on_profile_events = Some(Box::new(|batch| {
        events.extend(batch);
        Ok(())
    }));
    conn.execute(query, &CancellationToken::new()).await.unwrap();

    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].host_name, "ch1");
    assert_eq!(logs[0].text, "selected 1 parts");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].name, "SelectedRows");
    assert_eq!(events[0].value, 42);
    assert_eq!(events[0].kind, 1);
}

#[tokio::test]
async fn handler_error_terminates_query() {
    let (mut conn, mut server) = test_connection(CompressionMethod::None);
    let block = Block::from_columns(vec![("v".into(), Column::UInt8(vec![1]))]);
    server_send_block(&mut server, ServerPacketId::Data, &block, CompressionMethod::None).await;
    server_send_eos(&mut server).await;

    let query = Query::new("SELECT 1")
        .with_on_result(|_| Err(Error::Protocol("caller rejected block".into())));
    let err = conn.execute(query, &CancellationToken::new()).await.unwrap_err();
    assert!(err.to_string().contains("handler"));
    assert!(conn.is_closed());
}

#[tokio::test]
async fn execute_on_closed_connection_fails_fast() {
    let (mut conn, _server) = test_connection(CompressionMethod::None);
    conn.close().await.unwrap();
    let err = conn.execute(Query::new("SELECT 1"), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::Closed));
    let err = conn.ping().await.unwrap_err();
    assert!(matches!(err, Error::Closed));
}
