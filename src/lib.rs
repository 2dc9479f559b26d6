#![doc = include_str!("../README.md")]

mod client_info;
mod compression;
mod connect;
mod connection;
mod constants;
mod errors;
mod execute;
mod io;
pub mod native;
mod pool;
mod query;
mod settings;
#[cfg(test)]
mod tests;

pub use connect::{ConnectOptions, Destination, Secret, connect};
pub use connection::{Connection, ConnectionStatus, ServerInfo, TcpConnection};
pub use errors::{CorruptedDataError, Error, Result, ServerException};
pub use io::{ClickHouseRead, ClickHouseWrite};
pub use native::block::{Block, BlockInfo};
pub use native::column::{Column, InputColumn, Value};
pub use native::progress::Progress;
pub use native::protocol::{CompressionMethod, Feature, LogEntry, ProfileEvent, ProfileInfo};
pub use native::types::ColumnType;
pub use pool::{ConnectionPool, DialFn, PoolOptions, PoolStatus, PooledConnection};
pub use query::{
    InputFlow, InputFn, LogsFn, Parameter, ProfileEventsFn, ProfileFn, ProgressFn, Qid, Query,
    ResultFn,
};
pub use settings::{Setting, SettingValue, Settings};

/// Re-exports of external types that appear in this crate's API.
pub use reexports::*;
mod reexports {
    pub use chrono_tz::Tz;
    pub use tokio_util::sync::CancellationToken;
    pub use uuid::Uuid;
    pub use tracing;
}
