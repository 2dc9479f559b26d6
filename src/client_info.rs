//! The client-info stanza of a Query packet.
//!
//! Field presence is gated on the negotiated revision; every conditional
//! consults a [`Feature`] predicate.
use tokio::io::AsyncWriteExt;

use crate::constants::{CLIENT_NAME, VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH};
use crate::io::ClickHouseWrite;
use crate::native::protocol::{CLIENT_QUERY_INITIAL, Feature, INTERFACE_TCP};
use crate::Result;

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ClientInfo<'a> {
    pub initial_user:     &'a str,
    pub initial_query_id: &'a str,
    pub initial_address:  &'a str,
    pub quota_key:        &'a str,
}

impl ClientInfo<'_> {
    pub(crate) async fn write<W: ClickHouseWrite>(
        &self,
        writer: &mut W,
        revision: u64,
    ) -> Result<()> {
        writer.write_u8(CLIENT_QUERY_INITIAL).await?;
        writer.write_string(self.initial_user).await?;
        writer.write_string(self.initial_query_id).await?;
        writer.write_string(self.initial_address).await?;
        if Feature::QueryStartTime.is_supported(revision) {
            // Microseconds; 0 lets the server stamp receipt time.
            writer.write_u64_le(0).await?;
        }
        writer.write_u8(INTERFACE_TCP).await?;
        writer.write_string("").await?; // OS user
        writer.write_string("").await?; // client hostname
        writer.write_string(CLIENT_NAME).await?;
        writer.write_var_uint(VERSION_MAJOR).await?;
        writer.write_var_uint(VERSION_MINOR).await?;
        writer.write_var_uint(revision).await?;
        if Feature::QuotaKey.is_supported(revision) {
            writer.write_string(self.quota_key).await?;
        }
        if Feature::DistributedDepth.is_supported(revision) {
            writer.write_var_uint(0).await?;
        }
        if Feature::VersionPatch.is_supported(revision) {
            writer.write_var_uint(VERSION_PATCH).await?;
        }
        if Feature::OpenTelemetry.is_supported(revision) {
            // No trace context on the wire; span plumbing stays in-process.
            writer.write_u8(0).await?;
        }
        if Feature::ParallelReplicas.is_supported(revision) {
            writer.write_var_uint(0).await?; // collaborate_with_initiator
            writer.write_var_uint(0).await?; // count_participating_replicas
            writer.write_var_uint(0).await?; // number_of_current_replica
        }
        Ok(())
    }
}
