//! Packet codes, protocol revisions, and the out-of-band payloads the
//! packet loop materializes (server logs, profile events, profile info).
use strum::AsRefStr;

use super::block::Block;
use crate::{Error, Result};

pub(crate) const DBMS_MIN_REVISION_WITH_TEMPORARY_TABLES: u64 = 50264;
pub(crate) const DBMS_MIN_REVISION_WITH_CLIENT_INFO: u64 = 54032;
pub(crate) const DBMS_MIN_REVISION_WITH_SERVER_TIMEZONE: u64 = 54058;
pub(crate) const DBMS_MIN_REVISION_WITH_QUOTA_KEY_IN_CLIENT_INFO: u64 = 54060;
pub(crate) const DBMS_MIN_REVISION_WITH_SERVER_DISPLAY_NAME: u64 = 54372;
pub(crate) const DBMS_MIN_REVISION_WITH_VERSION_PATCH: u64 = 54401;
pub(crate) const DBMS_MIN_REVISION_WITH_SERVER_LOGS: u64 = 54406;
pub(crate) const DBMS_MIN_REVISION_WITH_CLIENT_WRITE_INFO: u64 = 54420;
pub(crate) const DBMS_MIN_REVISION_WITH_SETTINGS_SERIALIZED_AS_STRINGS: u64 = 54429;
pub(crate) const DBMS_MIN_REVISION_WITH_INTERSERVER_SECRET: u64 = 54441;
pub(crate) const DBMS_MIN_REVISION_WITH_OPENTELEMETRY: u64 = 54442;
pub(crate) const DBMS_MIN_PROTOCOL_VERSION_WITH_DISTRIBUTED_DEPTH: u64 = 54448;
pub(crate) const DBMS_MIN_PROTOCOL_VERSION_WITH_QUERY_START_TIME: u64 = 54449;
pub(crate) const DBMS_MIN_PROTOCOL_VERSION_WITH_PARALLEL_REPLICAS: u64 = 54453;
pub(crate) const DBMS_MIN_PROTOCOL_VERSION_WITH_PROFILE_EVENTS_IN_INSERT: u64 = 54456;
pub(crate) const DBMS_MIN_PROTOCOL_VERSION_WITH_ADDENDUM: u64 = 54458;
pub(crate) const DBMS_MIN_PROTOCOL_VERSION_WITH_PARAMETERS: u64 = 54459;
pub(crate) const DBMS_MIN_PROTOCOL_VERSION_WITH_SERVER_QUERY_TIME_IN_PROGRESS: u64 = 54460;
pub(crate) const DBMS_MIN_PROTOCOL_VERSION_WITH_PASSWORD_COMPLEXITY_RULES: u64 = 54461;
pub(crate) const DBMS_MIN_REVISION_WITH_INTERSERVER_SECRET_V2: u64 = 54462;

/// The newest revision this client speaks. Handshakes settle on
/// `min(server, client)`.
pub(crate) const DBMS_TCP_PROTOCOL_VERSION: u64 = DBMS_MIN_PROTOCOL_VERSION_WITH_PARAMETERS;

pub(crate) const MAX_STRING_SIZE: usize = 1 << 30;

/// Query processing stage requested by the client.
pub(crate) const STAGE_COMPLETE: u64 = 2;
/// Client interface kind.
pub(crate) const INTERFACE_TCP: u8 = 1;
/// Client query kind.
pub(crate) const CLIENT_QUERY_INITIAL: u8 = 1;

/// A protocol behavior advertised from some revision onward.
///
/// Every read/write path that depends on one of these consults the
/// predicate instead of comparing revisions inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum Feature {
    TempTables,
    ClientInfo,
    ServerTimezone,
    QuotaKey,
    ServerDisplayName,
    VersionPatch,
    ServerLogs,
    ClientWriteInfo,
    SettingsAsStrings,
    DistributedSecret,
    OpenTelemetry,
    DistributedDepth,
    QueryStartTime,
    ParallelReplicas,
    ProfileEvents,
    Addendum,
    Parameters,
    ServerQueryTimeInProgress,
    PasswordComplexityRules,
    InterserverSecretV2,
}

impl Feature {
    /// The first revision advertising this behavior.
    pub const fn revision(self) -> u64 {
        match self {
            Feature::TempTables => DBMS_MIN_REVISION_WITH_TEMPORARY_TABLES,
            Feature::ClientInfo => DBMS_MIN_REVISION_WITH_CLIENT_INFO,
            Feature::ServerTimezone => DBMS_MIN_REVISION_WITH_SERVER_TIMEZONE,
            Feature::QuotaKey => DBMS_MIN_REVISION_WITH_QUOTA_KEY_IN_CLIENT_INFO,
            Feature::ServerDisplayName => DBMS_MIN_REVISION_WITH_SERVER_DISPLAY_NAME,
            Feature::VersionPatch => DBMS_MIN_REVISION_WITH_VERSION_PATCH,
            Feature::ServerLogs => DBMS_MIN_REVISION_WITH_SERVER_LOGS,
            Feature::ClientWriteInfo => DBMS_MIN_REVISION_WITH_CLIENT_WRITE_INFO,
            Feature::SettingsAsStrings => DBMS_MIN_REVISION_WITH_SETTINGS_SERIALIZED_AS_STRINGS,
            Feature::DistributedSecret => DBMS_MIN_REVISION_WITH_INTERSERVER_SECRET,
            Feature::OpenTelemetry => DBMS_MIN_REVISION_WITH_OPENTELEMETRY,
            Feature::DistributedDepth => DBMS_MIN_PROTOCOL_VERSION_WITH_DISTRIBUTED_DEPTH,
            Feature::QueryStartTime => DBMS_MIN_PROTOCOL_VERSION_WITH_QUERY_START_TIME,
            Feature::ParallelReplicas => DBMS_MIN_PROTOCOL_VERSION_WITH_PARALLEL_REPLICAS,
            Feature::ProfileEvents => DBMS_MIN_PROTOCOL_VERSION_WITH_PROFILE_EVENTS_IN_INSERT,
            Feature::Addendum => DBMS_MIN_PROTOCOL_VERSION_WITH_ADDENDUM,
            Feature::Parameters => DBMS_MIN_PROTOCOL_VERSION_WITH_PARAMETERS,
            Feature::ServerQueryTimeInProgress => {
                DBMS_MIN_PROTOCOL_VERSION_WITH_SERVER_QUERY_TIME_IN_PROGRESS
            }
            Feature::PasswordComplexityRules => {
                DBMS_MIN_PROTOCOL_VERSION_WITH_PASSWORD_COMPLEXITY_RULES
            }
            Feature::InterserverSecretV2 => DBMS_MIN_REVISION_WITH_INTERSERVER_SECRET_V2,
        }
    }

    /// Whether `revision` advertises this behavior.
    pub const fn is_supported(self, revision: u64) -> bool { revision >= self.revision() }
}

#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ClientPacketId {
    Hello  = 0,
    Query  = 1,
    Data   = 2,
    Cancel = 3,
    Ping   = 4,
}

#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, AsRefStr)]
pub(crate) enum ServerPacketId {
    Hello,
    Data,
    Exception,
    Progress,
    Pong,
    EndOfStream,
    ProfileInfo,
    Totals,
    Extremes,
    TablesStatusResponse,
    Log,
    TableColumns,
    PartUuids,
    ReadTaskRequest,
    ProfileEvents,
}

impl ServerPacketId {
    pub(crate) fn from_u64(i: u64) -> Result<Self> {
        Ok(match i {
            0 => ServerPacketId::Hello,
            1 => ServerPacketId::Data,
            2 => ServerPacketId::Exception,
            3 => ServerPacketId::Progress,
            4 => ServerPacketId::Pong,
            5 => ServerPacketId::EndOfStream,
            6 => ServerPacketId::ProfileInfo,
            7 => ServerPacketId::Totals,
            8 => ServerPacketId::Extremes,
            9 => ServerPacketId::TablesStatusResponse,
            10 => ServerPacketId::Log,
            11 => ServerPacketId::TableColumns,
            12 => ServerPacketId::PartUuids,
            13 => ServerPacketId::ReadTaskRequest,
            14 => ServerPacketId::ProfileEvents,
            x => return Err(Error::Protocol(format!("unknown server packet id {x}"))),
        })
    }

    /// Whether the packet's payload goes through the block-compression
    /// layer when compression was negotiated.
    pub(crate) fn compressible(self) -> bool {
        matches!(
            self,
            ServerPacketId::Data
                | ServerPacketId::Totals
                | ServerPacketId::Extremes
                | ServerPacketId::ProfileEvents
                | ServerPacketId::Log
        )
    }
}

/// Block compression negotiated at handshake.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompressionMethod {
    None,
    #[default]
    Lz4,
    Zstd,
}

impl CompressionMethod {
    /// Method byte inside a compressed frame.
    pub(crate) fn byte(self) -> u8 {
        match self {
            CompressionMethod::None => 0x02,
            CompressionMethod::Lz4 => 0x82,
            CompressionMethod::Zstd => 0x90,
        }
    }

    pub(crate) fn is_enabled(self) -> bool { !matches!(self, CompressionMethod::None) }
}

impl std::fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompressionMethod::None => write!(f, "None"),
            CompressionMethod::Lz4 => write!(f, "LZ4"),
            CompressionMethod::Zstd => write!(f, "ZSTD"),
        }
    }
}

impl std::str::FromStr for CompressionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "None" => Ok(CompressionMethod::None),
            "lz4" | "LZ4" => Ok(CompressionMethod::Lz4),
            "zstd" | "ZSTD" => Ok(CompressionMethod::Zstd),
            _ => Err(format!("invalid compression method: {s}")),
        }
    }
}

/// Execution statistics for the result stream, sent once per query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfileInfo {
    pub rows:                         u64,
    pub blocks:                       u64,
    pub bytes:                        u64,
    pub applied_limit:                bool,
    pub rows_before_limit:            u64,
    pub calculated_rows_before_limit: bool,
}

/// One row of a server Log packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogEntry {
    /// Unix seconds of the event.
    pub time:       u32,
    pub time_micro: u32,
    pub host_name:  String,
    pub query_id:   String,
    pub thread_id:  u64,
    pub priority:   i8,
    pub source:     String,
    pub text:       String,
}

impl LogEntry {
    #[expect(clippy::cast_possible_truncation)]
    fn update(&mut self, name: &str, value: super::column::Value) {
        match name {
            "event_time" => self.time = value.as_u64().unwrap_or_default() as u32,
            "event_time_microseconds" => {
                self.time_micro = value.as_u64().unwrap_or_default() as u32;
            }
            "host_name" => self.host_name = value.into_text(),
            "query_id" => self.query_id = value.into_text(),
            "thread_id" => self.thread_id = value.as_u64().unwrap_or_default(),
            "priority" => self.priority = value.as_i64().unwrap_or_default() as i8,
            "source" => self.source = value.into_text(),
            "text" => self.text = value.into_text(),
            _ => {}
        }
    }

    /// Materialize a Log block into entries, row by row.
    pub(crate) fn from_block(block: &Block) -> Vec<Self> {
        let rows = block.rows();
        let mut entries = vec![Self::default(); rows];
        for (name, column) in &block.columns {
            for (i, entry) in entries.iter_mut().enumerate() {
                entry.update(name, column.value(i));
            }
        }
        entries
    }
}

/// One row of a ProfileEvents packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileEvent {
    pub host_name:    String,
    /// Unix seconds of the measurement.
    pub current_time: u32,
    pub thread_id:    u64,
    /// Increment (1) or gauge (2).
    pub kind:         i8,
    pub name:         String,
    pub value:        i64,
}

impl ProfileEvent {
    #[expect(clippy::cast_possible_truncation)]
    fn update(&mut self, name: &str, value: super::column::Value) {
        match name {
            "host_name" => self.host_name = value.into_text(),
            "current_time" => self.current_time = value.as_u64().unwrap_or_default() as u32,
            "thread_id" => self.thread_id = value.as_u64().unwrap_or_default(),
            "type" => self.kind = value.as_i64().unwrap_or_default() as i8,
            "name" => self.name = value.into_text(),
            "value" => self.value = value.as_i64().unwrap_or_default(),
            _ => {}
        }
    }

    /// Materialize a ProfileEvents block into events, row by row.
    pub(crate) fn from_block(block: &Block) -> Vec<Self> {
        let rows = block.rows();
        let mut events = vec![Self::default(); rows];
        for (name, column) in &block.columns {
            for (i, event) in events.iter_mut().enumerate() {
                event.update(name, column.value(i));
            }
        }
        events
    }
}
