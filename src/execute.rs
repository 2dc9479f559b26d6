//! One query, end to end.
//!
//! [`Connection::execute`] drives three cooperating tasks under one
//! cancellation scope:
//!
//! 1. a producer that writes the query header and streams input blocks,
//! 2. a consumer that runs the packet loop and dispatches payloads to the
//!    query's callbacks,
//! 3. a cancellation watcher that, when the caller's scope fires before
//!    `EndOfStream` and no server exception arrived, writes a best-effort
//!    Cancel and closes the connection.
//!
//! The producer owns the write half until input is fully sent; the
//! consumer owns the read half for the whole query. The only state they
//! share is the exception flag, the column-info rendezvous, and the
//! metrics counters.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, error};

use crate::connection::{Connection, QueryFrame, Reader, Writer};
use crate::errors::ResultExt;
use crate::io::{ClickHouseRead, ClickHouseWrite};
use crate::native::block::Block;
use crate::native::column::InputColumn;
use crate::native::progress::Progress;
use crate::native::protocol::{
    CompressionMethod, Feature, LogEntry, ProfileEvent, ServerPacketId,
};
use crate::native::types::ColumnType;
use crate::query::{
    InputFlow, InputFn, LogsFn, ProfileEventsFn, ProfileFn, ProgressFn, Qid, Query, ResultFn,
};
use crate::{Error, Result};

/// Counters accumulated over one query and recorded on its span.
#[derive(Debug, Default)]
struct QueryMetrics {
    blocks_sent:      AtomicU64,
    rows_sent:        AtomicU64,
    blocks_received:  AtomicU64,
    rows_received:    AtomicU64,
    columns_received: AtomicU64,
    progress_rows:    AtomicU64,
    progress_bytes:   AtomicU64,
}

impl QueryMetrics {
    fn sent(&self, rows: usize) {
        let _ = self.blocks_sent.fetch_add(1, Ordering::Relaxed);
        let _ = self.rows_sent.fetch_add(rows as u64, Ordering::Relaxed);
    }

    fn received(&self, block: &Block) {
        let _ = self.blocks_received.fetch_add(1, Ordering::Relaxed);
        let _ = self.rows_received.fetch_add(block.rows() as u64, Ordering::Relaxed);
        let _ = self.columns_received.fetch_add(block.column_count() as u64, Ordering::Relaxed);
    }

    fn progress(&self, progress: &Progress) {
        let _ = self.progress_rows.fetch_add(progress.read_rows, Ordering::Relaxed);
        let _ = self.progress_bytes.fetch_add(progress.read_bytes, Ordering::Relaxed);
    }

    fn record(&self) {
        debug!(
            blocks_sent = self.blocks_sent.load(Ordering::Relaxed),
            rows_sent = self.rows_sent.load(Ordering::Relaxed),
            blocks_received = self.blocks_received.load(Ordering::Relaxed),
            rows_received = self.rows_received.load(Ordering::Relaxed),
            columns_received = self.columns_received.load(Ordering::Relaxed),
            progress_rows = self.progress_rows.load(Ordering::Relaxed),
            progress_bytes = self.progress_bytes.load(Ordering::Relaxed),
            "query finished"
        );
    }
}

/// The consumer-side callbacks of one query.
struct PacketHandlers<'q> {
    on_result:         Option<ResultFn<'q>>,
    on_progress:       Option<ProgressFn<'q>>,
    on_profile:        Option<ProfileFn<'q>>,
    on_profile_events: Option<ProfileEventsFn<'q>>,
    on_logs:           Option<LogsFn<'q>>,
    /// Default-handler state when no result handler is bound: one
    /// nonzero-row block is accepted, anything further fails.
    sole_block_seen:   bool,
}

type ColumnInfo = Vec<(String, ColumnType)>;

impl<R: ClickHouseRead + 'static, W: ClickHouseWrite> Connection<R, W> {
    /// Perform one query on this connection.
    ///
    /// `cancel` is the caller's scope: when it fires before the server's
    /// `EndOfStream`, a Cancel code is flushed under a 1-second internal
    /// deadline and the connection is closed so it cannot be reused.
    /// A server exception suppresses the Cancel (the server already
    /// aborted); an exception outcome leaves the connection usable for a
    /// subsequent query.
    pub async fn execute(&mut self, query: Query<'_>, cancel: &CancellationToken) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if !query.parameters.is_empty() && !Feature::Parameters.is_supported(self.server.revision)
        {
            return Err(Error::UnsupportedFeature {
                feature:  "query parameters",
                revision: self.server.revision,
            });
        }
        let qid = query.id.unwrap_or_default();
        let span = debug_span!("query", query_id = %qid);
        self.execute_inner(query, qid, cancel).instrument(span).await
    }

    async fn execute_inner(
        &mut self,
        query: Query<'_>,
        qid: Qid,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let revision = self.server.revision;
        let compression = self.compression;
        let metrics = QueryMetrics::default();
        let got_exception = AtomicBool::new(false);

        let Query {
            body,
            quota_key,
            secret,
            initial_user,
            mut input,
            on_input,
            on_result,
            on_progress,
            on_profile,
            on_profile_events,
            on_logs,
            settings: query_settings,
            parameters,
            external_data,
            external_table,
            id: _,
        } = query;

        // The header carries everything the Query packet needs; the
        // callbacks and input columns stay behind for the two tasks.
        let head = Query {
            body,
            id: Some(qid),
            quota_key,
            secret,
            initial_user,
            settings: query_settings,
            parameters,
            external_data,
            external_table,
            ..Query::new("")
        };

        // When input columns need inference, the first server block (the
        // column echo) is handed to the producer through a one-shot
        // rendezvous instead of the result handler.
        let needs_column_info = !input.is_empty() && on_result.is_none();
        let (info_tx, info_rx) = oneshot::channel::<ColumnInfo>();
        let mut info_tx = needs_column_info.then_some(info_tx);
        let mut info_rx = needs_column_info.then_some(info_rx);

        let mut handlers = PacketHandlers {
            on_result,
            on_progress,
            on_profile,
            on_profile_events,
            on_logs,
            sole_block_seen: false,
        };

        let outcome = {
            let Connection { reader, writer, settings, local_address, .. } = self;
            let frame = QueryFrame {
                qid,
                revision,
                compression,
                client_settings: &*settings,
                local_address: local_address.as_str(),
            };

            let producer = async {
                Writer::send_query(writer, frame, &head).await.context("send query")?;
                writer.flush().await.context("flush")?;
                if let Some(rx) = info_rx.take() {
                    debug!("waiting for column info");
                    let echoed = rx.await.map_err(|_| {
                        Error::Protocol("stream ended before column info".into())
                    })?;
                    infer_input(&mut input, &echoed)?;
                }
                send_input(writer, compression, &mut input, on_input, &metrics).await?;
                writer.flush().await.context("flush")?;
                Ok::<(), Error>(())
            };

            let consumer = async {
                let result = run_packet_loop(
                    reader,
                    revision,
                    compression,
                    &mut handlers,
                    &mut info_tx,
                    &got_exception,
                    &metrics,
                )
                .await;
                // Unblock a producer still parked on the column echo.
                drop(info_tx.take());
                result
            };

            tokio::select! {
                biased;
                result = async { tokio::try_join!(producer, consumer).map(|_| ()) } => {
                    Some(result)
                }
                () = cancel.cancelled() => None,
            }
        };

        metrics.record();
        match outcome {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => {
                // A server exception ends the query but leaves the
                // connection usable; everything else poisons it.
                match e.as_exception() {
                    Some(exception) => {
                        debug!(
                            code = exception.code,
                            name = %exception.name,
                            "query failed with server exception"
                        );
                    }
                    None => {
                        error!(error = %e, "query failed");
                        let _ = self.close().await;
                    }
                }
                Err(e)
            }
            None => {
                if got_exception.load(Ordering::SeqCst) {
                    // The server already aborted the query; suppress the
                    // Cancel code.
                    let _ = self.close().await;
                    Err(Error::Canceled {
                        reason: "context canceled after server exception",
                        flush:  None,
                    })
                } else {
                    let flush = self.cancel().await.err().map(Box::new);
                    Err(Error::Canceled { reason: "context canceled", flush })
                }
            }
        }
    }
}

/// Read server codes and dispatch their payloads until `EndOfStream`.
async fn run_packet_loop<R: ClickHouseRead + 'static>(
    reader: &mut R,
    revision: u64,
    compression: CompressionMethod,
    handlers: &mut PacketHandlers<'_>,
    info_tx: &mut Option<oneshot::Sender<ColumnInfo>>,
    got_exception: &AtomicBool,
    metrics: &QueryMetrics,
) -> Result<()> {
    loop {
        let code = loop {
            match Reader::read_packet_id(reader).await {
                Ok(code) => break code,
                // The server may still be computing; soft timeouts on the
                // read side are retried.
                Err(e) if e.is_timeout() => continue,
                Err(e) => return Err(e.context("packet")),
            }
        };
        match code {
            ServerPacketId::Data | ServerPacketId::Totals | ServerPacketId::Extremes => {
                let method = packet_compression(code, compression);
                let block =
                    Reader::read_block(reader, revision, method).await.context("decode block")?;
                if block.is_end() {
                    continue;
                }
                metrics.received(&block);
                if code == ServerPacketId::Data {
                    if let Some(tx) = info_tx.take() {
                        let echoed = block
                            .columns
                            .iter()
                            .map(|(name, column)| (name.clone(), column.column_type()))
                            .collect();
                        let _ = tx.send(echoed);
                        continue;
                    }
                }
                match handlers.on_result.as_mut() {
                    Some(handler) => handler(block).context("handler")?,
                    None => {
                        if handlers.sole_block_seen {
                            return Err(Error::Protocol(
                                "unexpected extra result block: no result handler bound".into(),
                            ));
                        }
                        // A zero-row block only announces column metadata.
                        if block.rows() > 0 {
                            handlers.sole_block_seen = true;
                        }
                    }
                }
            }
            ServerPacketId::EndOfStream => return Ok(()),
            ServerPacketId::Exception => {
                let exception =
                    Reader::read_exception(reader).await.context("decode exception")?;
                got_exception.store(true, Ordering::SeqCst);
                return Err(Error::Server(exception));
            }
            ServerPacketId::Progress => {
                let progress =
                    Reader::read_progress(reader, revision).await.context("progress")?;
                metrics.progress(&progress);
                if let Some(handler) = handlers.on_progress.as_mut() {
                    handler(progress).context("progress handler")?;
                }
            }
            ServerPacketId::ProfileInfo => {
                let info = Reader::read_profile_info(reader).await.context("profile")?;
                if let Some(handler) = handlers.on_profile.as_mut() {
                    handler(info).context("profile handler")?;
                }
            }
            ServerPacketId::TableColumns => {
                // Consumed and discarded.
                Reader::read_table_columns(reader).await.context("table columns")?;
            }
            ServerPacketId::ProfileEvents => {
                let method = packet_compression(code, compression);
                let block =
                    Reader::read_block(reader, revision, method).await.context("decode block")?;
                if !block.is_end() {
                    if let Some(handler) = handlers.on_profile_events.as_mut() {
                        handler(ProfileEvent::from_block(&block))
                            .context("profile events handler")?;
                    }
                }
            }
            ServerPacketId::Log => {
                let method = packet_compression(code, compression);
                let block =
                    Reader::read_block(reader, revision, method).await.context("decode block")?;
                if !block.is_end() {
                    if let Some(handler) = handlers.on_logs.as_mut() {
                        handler(LogEntry::from_block(&block)).context("logs handler")?;
                    }
                }
            }
            other => {
                return Err(Error::Protocol(format!("unexpected packet {}", other.as_ref())));
            }
        }
    }
}

fn packet_compression(code: ServerPacketId, negotiated: CompressionMethod) -> CompressionMethod {
    if code.compressible() { negotiated } else { CompressionMethod::None }
}

/// Specialize inferable input columns from the server's column echo,
/// matching by name.
fn infer_input(input: &mut [InputColumn], echoed: &[(String, ColumnType)]) -> Result<()> {
    for (name, ty) in echoed {
        for column in input.iter_mut() {
            if column.name == *name {
                column.data.infer(ty).context("infer")?;
            }
        }
    }
    Ok(())
}

/// Stream input blocks, then the blank terminator.
///
/// Every block the server receives is persisted on receipt; once the
/// terminator is written the commit boundary has passed.
async fn send_input<W: ClickHouseWrite>(
    writer: &mut W,
    compression: CompressionMethod,
    input: &mut Vec<InputColumn>,
    mut on_input: Option<InputFn<'_>>,
    metrics: &QueryMetrics,
) -> Result<()> {
    if input.is_empty() {
        return Ok(());
    }

    let rows_of = |input: &Vec<InputColumn>| input.first().map_or(0, |c| c.data.rows());

    if let Some(next) = on_input.as_mut() {
        if rows_of(input) == 0 {
            // Fetch initial input when no rows were provided up front.
            match next(input) {
                Ok(InputFlow::More) => {}
                Ok(InputFlow::End) if rows_of(input) == 0 => {
                    // Initial input was blank.
                    return Writer::send_empty_block(writer, compression)
                        .await
                        .context("write end of data");
                }
                Ok(InputFlow::End) => on_input = None,
                Err(e) => return Err(e.context("input")),
            }
        }
    }

    loop {
        let rows = rows_of(input);
        Writer::send_data(writer, "", input, compression).await.context("write block")?;
        metrics.sent(rows);

        let Some(next) = on_input.as_mut() else { break };
        // Flush per block to bound memory consumption.
        writer.flush().await.context("flush")?;
        match next(input) {
            Ok(InputFlow::More) => {}
            Ok(InputFlow::End) => {
                if rows_of(input) > 0 {
                    // End arrived together with a final block; write the
                    // tail before the terminator.
                    debug!(rows = rows_of(input), "writing tail of input data");
                    on_input = None;
                    continue;
                }
                break;
            }
            Err(e) => {
                return Err(e.context("next input (server already persisted previous blocks)"));
            }
        }
    }

    Writer::send_empty_block(writer, compression).await.context("write end of data")
}
