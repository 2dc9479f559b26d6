//! One authenticated session over a bidirectional stream.
//!
//! A [`Connection`] owns buffered read and write halves, the negotiated
//! server info, and the compression method. It services one query at a
//! time: [`crate::Connection::execute`] borrows both halves for the whole
//! exchange. The [`Reader`]/[`Writer`] helpers operate on bare halves so
//! the producer and consumer of a query can run concurrently over
//! disjoint borrows.
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};

use chrono_tz::Tz;
use strum::{AsRefStr, Display};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{trace, warn};

use crate::client_info::ClientInfo;
use crate::compression::{StreamingDecompressor, corruption_in, write_compressed};
use crate::constants::CANCEL_FLUSH_DEADLINE;
use crate::errors::ResultExt;
use crate::io::{ClickHouseRead, ClickHouseWrite};
use crate::native::block::{Block, BlockInfo, write_block_body};
use crate::native::column::{Column, InputColumn};
use crate::native::progress::Progress;
use crate::native::protocol::{
    ClientPacketId, CompressionMethod, Feature, ProfileInfo, STAGE_COMPLETE, ServerPacketId,
};
use crate::query::{Qid, Query, quote_parameter};
use crate::settings::{SETTING_FLAG_CUSTOM, Settings};
use crate::{Error, Result, ServerException};

/// A connection over plain TCP, as produced by [`crate::connect`].
pub type TcpConnection = Connection<BufReader<OwnedReadHalf>, BufWriter<OwnedWriteHalf>>;

/// Negotiated server identity from the handshake.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name:         String,
    pub display_name: String,
    pub major:        u64,
    pub minor:        u64,
    pub patch:        u64,
    /// Negotiated protocol version, `min(server, client)`.
    pub revision:     u64,
    pub timezone:     Option<Tz>,
}

impl Default for ServerInfo {
    fn default() -> Self {
        ServerInfo {
            name:         "ClickHouse".into(),
            display_name: String::new(),
            major:        0,
            minor:        0,
            patch:        0,
            revision:     crate::native::protocol::DBMS_TCP_PROTOCOL_VERSION,
            timezone:     None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
pub enum ConnectionStatus {
    Open,
    Closing,
    Closed,
}

impl ConnectionStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionStatus::Open,
            1 => ConnectionStatus::Closing,
            _ => ConnectionStatus::Closed,
        }
    }
}

/// One authenticated session. Services one query at a time.
pub struct Connection<R, W> {
    pub(crate) reader: R,
    pub(crate) writer: W,
    pub(crate) server: ServerInfo,
    pub(crate) compression: CompressionMethod,
    /// Connection-level settings, sent before query-level ones.
    pub(crate) settings: Settings,
    /// Local socket address, reported in client info.
    pub(crate) local_address: String,
    pub(crate) status: AtomicU8,
}

impl<R, W> std::fmt::Debug for Connection<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("server", &self.server)
            .field("compression", &self.compression)
            .field("local_address", &self.local_address)
            .finish()
    }
}

impl<R: ClickHouseRead + 'static, W: ClickHouseWrite> Connection<R, W> {
    /// Wrap an already-handshaken stream pair.
    pub fn new(
        reader: R,
        writer: W,
        server: ServerInfo,
        compression: CompressionMethod,
        settings: Settings,
    ) -> Self {
        Connection {
            reader,
            writer,
            server,
            compression,
            settings,
            local_address: String::new(),
            status: AtomicU8::new(0),
        }
    }

    pub(crate) fn with_local_address(mut self, local_address: String) -> Self {
        self.local_address = local_address;
        self
    }

    /// Write a Query packet (header, client info, merged settings,
    /// parameters), external data tables if any, and the blank block that
    /// ends external data. Does not read anything back.
    pub async fn send_query(&mut self, query: &Query<'_>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if !query.parameters.is_empty()
            && !Feature::Parameters.is_supported(self.server.revision)
        {
            return Err(Error::UnsupportedFeature {
                feature:  "query parameters",
                revision: self.server.revision,
            });
        }
        let qid = query.id.unwrap_or_default();
        Writer::send_query(
            &mut self.writer,
            QueryFrame {
                qid,
                revision: self.server.revision,
                compression: self.compression,
                client_settings: &self.settings,
                local_address: &self.local_address,
            },
            query,
        )
        .await
        .context("send query")?;
        self.writer.flush().await.context("flush")?;
        Ok(())
    }

    /// Send a Ping and wait for Pong. Any other received code is a
    /// protocol error and poisons the connection.
    pub async fn ping(&mut self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Writer::send_ping(&mut self.writer).await?;
        self.writer.flush().await.context("flush")?;
        let code = Reader::read_packet_id(&mut self.reader).await?;
        if code != ServerPacketId::Pong {
            self.mark_closed();
            return Err(Error::Protocol(format!("expected Pong, got {}", code.as_ref())));
        }
        trace!("pong received");
        Ok(())
    }

    /// Best-effort graceful shutdown. Idempotent; subsequent operations
    /// fail with [`Error::Closed`].
    pub async fn close(&mut self) -> Result<()> {
        if self.status.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Ok(());
        }
        let shutdown = self.writer.shutdown().await;
        self.mark_closed();
        shutdown?;
        Ok(())
    }

    /// Write the Cancel code under a short internal deadline, then close.
    /// Used when the caller's scope is canceled mid-query.
    pub async fn cancel(&mut self) -> Result<()> {
        warn!("cancel query");
        let flush = tokio::time::timeout(CANCEL_FLUSH_DEADLINE, async {
            Writer::send_cancel(&mut self.writer).await?;
            self.writer.flush().await.context("flush")
        })
        .await
        .unwrap_or_else(|_| {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "cancel flush deadline elapsed",
            )))
        });

        // Always close so the connection cannot be reused mid-query.
        let close = self.close().await;
        flush.and(close)
    }
}

impl<R, W> Connection<R, W> {
    pub fn server_info(&self) -> &ServerInfo { &self.server }

    pub fn compression(&self) -> CompressionMethod { self.compression }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool { !matches!(self.status(), ConnectionStatus::Open) }

    pub(crate) fn mark_closed(&self) { self.status.store(2, Ordering::Release); }
}

/// Per-query parameters needed to frame a Query packet.
pub(crate) struct QueryFrame<'a> {
    pub qid: Qid,
    pub revision: u64,
    pub compression: CompressionMethod,
    pub client_settings: &'a Settings,
    pub local_address: &'a str,
}

pub(crate) struct Writer<W> {
    _phantom: PhantomData<W>,
}

impl<W: ClickHouseWrite> Writer<W> {
    pub(crate) async fn send_query(
        writer: &mut W,
        frame: QueryFrame<'_>,
        query: &Query<'_>,
    ) -> Result<()> {
        let revision = frame.revision;
        writer.write_var_uint(ClientPacketId::Query as u64).await?;
        frame.qid.write_id(writer).await?;

        if Feature::ClientInfo.is_supported(revision) {
            let qid_text = frame.qid.to_string();
            let info = ClientInfo {
                initial_user:     &query.initial_user,
                initial_query_id: &qid_text,
                initial_address:  frame.local_address,
                quota_key:        &query.quota_key,
            };
            info.write(writer, revision).await?;
        }

        // Connection-level settings first so the query can override them.
        for setting in frame.client_settings.iter().chain(query.settings.iter()) {
            setting.encode(writer, revision).await?;
        }
        writer.write_string("").await?; // end of settings

        if Feature::DistributedSecret.is_supported(revision) {
            writer.write_string(&query.secret).await?;
        }

        writer.write_var_uint(STAGE_COMPLETE).await?;
        writer.write_u8(u8::from(frame.compression.is_enabled())).await?;
        writer.write_string(&query.body).await?;

        if Feature::Parameters.is_supported(revision) {
            for parameter in &query.parameters {
                writer.write_string(&parameter.key).await?;
                writer.write_var_uint(SETTING_FLAG_CUSTOM).await?;
                writer.write_string(quote_parameter(&parameter.value)).await?;
            }
            writer.write_string("").await?; // end of parameters
        }

        if !query.external_data.is_empty() {
            let table = if query.external_table.is_empty() {
                "_data"
            } else {
                &query.external_table
            };
            Writer::send_data(writer, table, &query.external_data, frame.compression)
                .await
                .context("external data")?;
        }
        // End of external data.
        Writer::send_empty_block(writer, frame.compression).await.context("external data end")?;

        Ok(())
    }

    /// Write a Data packet carrying the given columns. An empty column set
    /// produces the blank end-of-data block.
    pub(crate) async fn send_data(
        writer: &mut W,
        table: &str,
        columns: &[InputColumn],
        compression: CompressionMethod,
    ) -> Result<()> {
        writer.write_var_uint(ClientPacketId::Data as u64).await?;
        writer.write_string(table).await?;

        let refs: Vec<(&str, &Column)> =
            columns.iter().map(|c| (c.name.as_str(), &c.data)).collect();
        let info = BlockInfo::default();
        if compression.is_enabled() {
            // Blocks are not streamed under compression: encode into a
            // scratch buffer, then append its compressed frame.
            let mut raw = Vec::new();
            write_block_body(&mut raw, &info, &refs).await?;
            write_compressed(writer, &raw, compression).await?;
        } else {
            write_block_body(writer, &info, &refs).await?;
        }
        Ok(())
    }

    pub(crate) async fn send_empty_block(
        writer: &mut W,
        compression: CompressionMethod,
    ) -> Result<()> {
        Writer::send_data(writer, "", &[], compression).await
    }

    pub(crate) async fn send_ping(writer: &mut W) -> Result<()> {
        writer.write_var_uint(ClientPacketId::Ping as u64).await?;
        Ok(())
    }

    pub(crate) async fn send_cancel(writer: &mut W) -> Result<()> {
        writer.write_var_uint(ClientPacketId::Cancel as u64).await?;
        Ok(())
    }
}

pub(crate) struct Reader<R> {
    _phantom: PhantomData<R>,
}

impl<R: ClickHouseRead + 'static> Reader<R> {
    pub(crate) async fn read_packet_id(reader: &mut R) -> Result<ServerPacketId> {
        ServerPacketId::from_u64(reader.read_var_uint().await?)
    }

    pub(crate) async fn read_exception(reader: &mut R) -> Result<ServerException> {
        let code = reader.read_i32_le().await?;
        let name = reader.read_utf8_string().await?;
        let message = String::from_utf8_lossy(&reader.read_string().await?).into_owned();
        let stack_trace = reader.read_utf8_string().await?;
        let has_nested = reader.read_bool().await?;
        let nested = if has_nested {
            Some(Box::new(Box::pin(Self::read_exception(reader)).await?))
        } else {
            None
        };
        Ok(ServerException { code, name, message, stack_trace, nested })
    }

    pub(crate) async fn read_progress(reader: &mut R, revision: u64) -> Result<Progress> {
        let read_rows = reader.read_var_uint().await?;
        let read_bytes = reader.read_var_uint().await?;
        let total_rows_to_read = if Feature::ServerLogs.is_supported(revision) {
            reader.read_var_uint().await?
        } else {
            0
        };
        let (written_rows, written_bytes) = if Feature::ClientWriteInfo.is_supported(revision) {
            (Some(reader.read_var_uint().await?), Some(reader.read_var_uint().await?))
        } else {
            (None, None)
        };
        let elapsed_ns = if Feature::ServerQueryTimeInProgress.is_supported(revision) {
            Some(reader.read_var_uint().await?)
        } else {
            None
        };
        Ok(Progress {
            read_rows,
            read_bytes,
            total_rows_to_read,
            written_rows,
            written_bytes,
            elapsed_ns,
        })
    }

    pub(crate) async fn read_profile_info(reader: &mut R) -> Result<ProfileInfo> {
        let rows = reader.read_var_uint().await?;
        let blocks = reader.read_var_uint().await?;
        let bytes = reader.read_var_uint().await?;
        let applied_limit = reader.read_bool().await?;
        let rows_before_limit = reader.read_var_uint().await?;
        let calculated_rows_before_limit = reader.read_bool().await?;
        Ok(ProfileInfo {
            rows,
            blocks,
            bytes,
            applied_limit,
            rows_before_limit,
            calculated_rows_before_limit,
        })
    }

    /// Consume and discard a TableColumns payload.
    pub(crate) async fn read_table_columns(reader: &mut R) -> Result<()> {
        let _name = reader.read_utf8_string().await?;
        let _description = reader.read_utf8_string().await?;
        Ok(())
    }

    /// Read the payload of a block-bearing packet: the temp-table name
    /// (which must be empty), then the block. Pass the negotiated method
    /// for compressible packets and [`CompressionMethod::None`] otherwise.
    pub(crate) async fn read_block(
        reader: &mut R,
        revision: u64,
        compression: CompressionMethod,
    ) -> Result<Block> {
        if Feature::TempTables.is_supported(revision) {
            let table = reader.read_utf8_string().await?;
            if !table.is_empty() {
                return Err(Error::Protocol(format!("unexpected temp table {table:?}")));
            }
        }
        let result = if compression.is_enabled() {
            let mut decompressor = StreamingDecompressor::new(compression, reader);
            Block::read(&mut decompressor).await
        } else {
            Block::read(reader).await
        };
        result.map_err(|e| match e.root() {
            // Surface frame corruption as the structured error.
            Error::Io(io) => match corruption_in(io) {
                Some(corrupted) => Error::CorruptedData(corrupted),
                None => e,
            },
            _ => e,
        })
    }
}
