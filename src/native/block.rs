//! Columnar blocks, the unit of data exchange on the wire.
//!
//! A block is an info header, a column count, a row count, and an ordered
//! sequence of `(name, type, column body)` entries. A block with zero
//! columns and zero rows is the end-of-data marker.
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::column::Column;
use crate::io::{ClickHouseRead, ClickHouseWrite};
use crate::native::types::ColumnType;
use crate::{Error, Result};

/// Upper bounds on declared column/row counts before allocating.
const MAX_BLOCK_COLUMNS: u64 = 1 << 20;
const MAX_BLOCK_ROWS: u64 = 1 << 30;

/// Metadata header carried by every block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub is_overflows: bool,
    pub bucket_num:   i32,
}

impl Default for BlockInfo {
    fn default() -> Self { BlockInfo { is_overflows: false, bucket_num: -1 } }
}

impl BlockInfo {
    /// Field-id/value pairs terminated by field id 0.
    pub(crate) async fn read<R: ClickHouseRead>(reader: &mut R) -> Result<Self> {
        let mut info = Self::default();
        loop {
            let field_num = reader.read_var_uint().await?;
            match field_num {
                0 => break,
                1 => info.is_overflows = reader.read_bool().await?,
                2 => info.bucket_num = reader.read_i32_le().await?,
                field_num => {
                    return Err(Error::Protocol(format!(
                        "unknown block info field number: {field_num}"
                    )));
                }
            }
        }
        Ok(info)
    }

    pub(crate) async fn write<W: ClickHouseWrite>(&self, writer: &mut W) -> Result<()> {
        writer.write_var_uint(1).await?;
        writer.write_bool(self.is_overflows).await?;
        writer.write_var_uint(2).await?;
        writer.write_i32_le(self.bucket_num).await?;
        writer.write_var_uint(0).await?;
        Ok(())
    }
}

/// One columnar batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub info:    BlockInfo,
    pub columns: Vec<(String, Column)>,
}

impl Block {
    pub fn from_columns(columns: Vec<(String, Column)>) -> Self {
        Block { info: BlockInfo::default(), columns }
    }

    /// The canonical end-of-data marker.
    pub fn end() -> Self { Block { info: BlockInfo::default(), columns: Vec::new() } }

    pub fn rows(&self) -> usize {
        self.columns.first().map_or(0, |(_, column)| column.rows())
    }

    pub fn column_count(&self) -> usize { self.columns.len() }

    /// Whether this is the zero-column, zero-row end-of-data marker.
    pub fn is_end(&self) -> bool { self.columns.is_empty() && self.rows() == 0 }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, column)| column)
    }

    pub(crate) async fn write<W: ClickHouseWrite>(&self, writer: &mut W) -> Result<()> {
        let refs: Vec<(&str, &Column)> =
            self.columns.iter().map(|(name, column)| (name.as_str(), column)).collect();
        write_block_body(writer, &self.info, &refs).await
    }

    pub(crate) async fn read<R: ClickHouseRead>(reader: &mut R) -> Result<Block> {
        let info = BlockInfo::read(reader).await?;
        let column_count = reader.read_var_uint().await?;
        let row_count = reader.read_var_uint().await?;
        if column_count > MAX_BLOCK_COLUMNS || row_count > MAX_BLOCK_ROWS {
            return Err(Error::Protocol(format!(
                "implausible block dimensions: {column_count} columns, {row_count} rows"
            )));
        }
        #[expect(clippy::cast_possible_truncation)]
        let rows = row_count as usize;

        let mut columns = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            let name = reader.read_utf8_string().await?;
            let type_name = reader.read_utf8_string().await?;
            let mut column = Column::new_of(&ColumnType::from(type_name))?;
            column.decode(reader, rows).await?;
            columns.push((name, column));
        }
        Ok(Block { info, columns })
    }
}

/// Encode a block body from borrowed columns, so input columns can be
/// reused across streamed blocks.
pub(crate) async fn write_block_body<W: ClickHouseWrite>(
    writer: &mut W,
    info: &BlockInfo,
    columns: &[(&str, &Column)],
) -> Result<()> {
    let rows = columns.first().map_or(0, |(_, column)| column.rows());
    for (name, column) in columns {
        if column.rows() != rows {
            return Err(Error::Protocol(format!(
                "column {name} has {} rows, expected {rows}",
                column.rows()
            )));
        }
    }

    info.write(writer).await?;
    writer.write_var_uint(columns.len() as u64).await?;
    writer.write_var_uint(rows as u64).await?;
    for (name, column) in columns {
        writer.write_string(*name).await?;
        writer.write_string(column.column_type().as_ref()).await?;
        column.encode(writer).await?;
    }
    Ok(())
}
