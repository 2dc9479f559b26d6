use std::time::Duration;

pub(crate) const VERSION_MAJOR: u64 = 0;
pub(crate) const VERSION_MINOR: u64 = 1;
pub(crate) const VERSION_PATCH: u64 = 0;

pub(crate) const CLIENT_NAME: &str = "clickhouse-stream";

// Socket tuning for high-throughput block transfer
pub(crate) const TCP_READ_BUFFER_SIZE: usize = 16 * 1024; // 16KB
pub(crate) const TCP_WRITE_BUFFER_SIZE: usize = 8 * 1024 * 1024; // 8MB
pub(crate) const TCP_CONNECT_TIMEOUT: u64 = 30;
// Keep alive
pub(crate) const TCP_KEEP_ALIVE_SECS: u64 = 60;
pub(crate) const TCP_KEEP_ALIVE_INTERVAL: u64 = 10;
pub(crate) const TCP_KEEP_ALIVE_RETRIES: u32 = 6;

// Buffered stream capacities
pub(crate) const READ_BUFFER_CAPACITY: usize = 1024 * 1024;
pub(crate) const WRITE_BUFFER_CAPACITY: usize = 1024 * 1024;

// Deadline for flushing a Cancel packet, independent of the caller's scope.
pub(crate) const CANCEL_FLUSH_DEADLINE: Duration = Duration::from_secs(1);
