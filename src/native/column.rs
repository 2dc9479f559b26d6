//! Columnar data and its wire codec.
//!
//! A [`Column`] is one tagged variant per supported `ClickHouse` type
//! family. Every variant can report its row count, reset, render its
//! [`ColumnType`], encode itself, decode a given number of rows (failing
//! with EOF on a short stream, never silently truncating), and hand out
//! per-row [`Value`]s. Variants with late-bound parameterization (enum
//! bindings, timezones) specialize through [`Column::infer`] using a type
//! echoed by the server.
//!
//! Rows are serialized consecutively with no per-row delimiter. Arrays and
//! maps emit a cumulative-end-offset sub-column before their flattened
//! payload; nullables emit a one-byte-per-row null bitmap before the inner
//! column; low-cardinality emits a header, a dictionary, then keys.
use std::net::{Ipv4Addr, Ipv6Addr};

use chrono_tz::Tz;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use super::types::{ColumnType, split_params};
use crate::io::{ClickHouseRead, ClickHouseWrite};
use crate::{Error, Result};

const LOW_CARDINALITY_VERSION: u64 = 1;
const LOW_CARDINALITY_HAS_ADDITIONAL_KEYS: u64 = 1 << 9;

/// One cell of a column.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    UInt128(u128),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Int128(i128),
    Float32(f32),
    Float64(f64),
    String(Vec<u8>),
    /// Days since the Unix epoch.
    Date(u16),
    /// Seconds since the Unix epoch.
    DateTime(u32),
    /// Sub-second ticks since the Unix epoch, at the column's precision.
    DateTime64(u64),
    Uuid(Uuid),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Enum8(i8),
    Enum16(i16),
    Decimal32(u8, i32),
    Decimal64(u8, i64),
    Decimal128(u8, i128),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Null,
}

impl Value {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt8(v) => Some(u64::from(*v)),
            Value::UInt16(v) | Value::Date(v) => Some(u64::from(*v)),
            Value::UInt32(v) | Value::DateTime(v) => Some(u64::from(*v)),
            Value::UInt64(v) | Value::DateTime64(v) => Some(*v),
            Value::Int8(v) => u64::try_from(*v).ok(),
            Value::Int16(v) => u64::try_from(*v).ok(),
            Value::Int32(v) => u64::try_from(*v).ok(),
            Value::Int64(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int8(v) | Value::Enum8(v) => Some(i64::from(*v)),
            Value::Int16(v) | Value::Enum16(v) => Some(i64::from(*v)),
            Value::Int32(v) => Some(i64::from(*v)),
            Value::Int64(v) => Some(*v),
            Value::UInt8(v) => Some(i64::from(*v)),
            Value::UInt16(v) | Value::Date(v) => Some(i64::from(*v)),
            Value::UInt32(v) | Value::DateTime(v) => Some(i64::from(*v)),
            Value::UInt64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// String payload as UTF-8 text; other variants format via `Display`.
    pub fn into_text(self) -> String {
        match self {
            Value::String(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            other => other.to_string(),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::UInt8(v) => write!(f, "{v}"),
            Value::UInt16(v) => write!(f, "{v}"),
            Value::UInt32(v) => write!(f, "{v}"),
            Value::UInt64(v) => write!(f, "{v}"),
            Value::UInt128(v) => write!(f, "{v}"),
            Value::Int8(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Int128(v) => write!(f, "{v}"),
            Value::Float32(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{}", String::from_utf8_lossy(v)),
            Value::Date(v) => write!(f, "{v}"),
            Value::DateTime(v) => write!(f, "{v}"),
            Value::DateTime64(v) => write!(f, "{v}"),
            Value::Uuid(v) => write!(f, "{v}"),
            Value::Ipv4(v) => write!(f, "{v}"),
            Value::Ipv6(v) => write!(f, "{v}"),
            Value::Enum8(v) => write!(f, "{v}"),
            Value::Enum16(v) => write!(f, "{v}"),
            Value::Decimal32(_, v) => write!(f, "{v}"),
            Value::Decimal64(_, v) => write!(f, "{v}"),
            Value::Decimal128(_, v) => write!(f, "{v}"),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(pairs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{k}:{v}")?;
                }
                write!(f, "}}")
            }
            Value::Null => write!(f, "NULL"),
        }
    }
}

/// A named input column for INSERT streaming and external data tables.
#[derive(Debug, Clone)]
pub struct InputColumn {
    pub name: String,
    pub data: Column,
}

impl InputColumn {
    pub fn new(name: impl Into<String>, data: Column) -> Self {
        Self { name: name.into(), data }
    }
}

/// A typed batch of rows for one column.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    UInt8(Vec<u8>),
    UInt16(Vec<u16>),
    UInt32(Vec<u32>),
    UInt64(Vec<u64>),
    UInt128(Vec<u128>),
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Int128(Vec<i128>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    String(Vec<Vec<u8>>),
    FixedString { size: usize, data: Vec<u8> },
    Date(Vec<u16>),
    DateTime { tz: Option<Tz>, data: Vec<u32> },
    DateTime64 { precision: u8, tz: Option<Tz>, data: Vec<u64> },
    Uuid(Vec<Uuid>),
    Ipv4(Vec<Ipv4Addr>),
    Ipv6(Vec<Ipv6Addr>),
    Enum8 { variants: Vec<(String, i8)>, data: Vec<i8> },
    Enum16 { variants: Vec<(String, i16)>, data: Vec<i16> },
    Decimal32 { scale: u8, data: Vec<i32> },
    Decimal64 { scale: u8, data: Vec<i64> },
    Decimal128 { scale: u8, data: Vec<i128> },
    /// Offsets are cumulative row end-indices into the flattened inner
    /// column.
    Array { offsets: Vec<u64>, data: Box<Column> },
    /// One byte per row: 0 = present, 1 = null. The inner column carries a
    /// placeholder at null positions.
    Nullable { nulls: Vec<u8>, data: Box<Column> },
    Map { offsets: Vec<u64>, keys: Box<Column>, values: Box<Column> },
    LowCardinality { index: Box<Column>, keys: Vec<u64> },
}

impl Column {
    pub fn rows(&self) -> usize {
        match self {
            Column::UInt8(d) => d.len(),
            Column::UInt16(d) => d.len(),
            Column::UInt32(d) => d.len(),
            Column::UInt64(d) => d.len(),
            Column::UInt128(d) => d.len(),
            Column::Int8(d) => d.len(),
            Column::Int16(d) => d.len(),
            Column::Int32(d) => d.len(),
            Column::Int64(d) => d.len(),
            Column::Int128(d) => d.len(),
            Column::Float32(d) => d.len(),
            Column::Float64(d) => d.len(),
            Column::String(d) => d.len(),
            Column::FixedString { size, data } => {
                if *size == 0 { 0 } else { data.len() / size }
            }
            Column::Date(d) => d.len(),
            Column::DateTime { data, .. } => data.len(),
            Column::DateTime64 { data, .. } => data.len(),
            Column::Uuid(d) => d.len(),
            Column::Ipv4(d) => d.len(),
            Column::Ipv6(d) => d.len(),
            Column::Enum8 { data, .. } => data.len(),
            Column::Enum16 { data, .. } => data.len(),
            Column::Decimal32 { data, .. } => data.len(),
            Column::Decimal64 { data, .. } => data.len(),
            Column::Decimal128 { data, .. } => data.len(),
            Column::Array { offsets, .. } => offsets.len(),
            Column::Nullable { nulls, .. } => nulls.len(),
            Column::Map { offsets, .. } => offsets.len(),
            Column::LowCardinality { keys, .. } => keys.len(),
        }
    }

    /// Drop all rows, preserving the declared type.
    pub fn reset(&mut self) {
        match self {
            Column::UInt8(d) => d.clear(),
            Column::UInt16(d) => d.clear(),
            Column::UInt32(d) => d.clear(),
            Column::UInt64(d) => d.clear(),
            Column::UInt128(d) => d.clear(),
            Column::Int8(d) => d.clear(),
            Column::Int16(d) => d.clear(),
            Column::Int32(d) => d.clear(),
            Column::Int64(d) => d.clear(),
            Column::Int128(d) => d.clear(),
            Column::Float32(d) => d.clear(),
            Column::Float64(d) => d.clear(),
            Column::String(d) => d.clear(),
            Column::FixedString { data, .. } => data.clear(),
            Column::Date(d) => d.clear(),
            Column::DateTime { data, .. } => data.clear(),
            Column::DateTime64 { data, .. } => data.clear(),
            Column::Uuid(d) => d.clear(),
            Column::Ipv4(d) => d.clear(),
            Column::Ipv6(d) => d.clear(),
            Column::Enum8 { data, .. } => data.clear(),
            Column::Enum16 { data, .. } => data.clear(),
            Column::Decimal32 { data, .. } => data.clear(),
            Column::Decimal64 { data, .. } => data.clear(),
            Column::Decimal128 { data, .. } => data.clear(),
            Column::Array { offsets, data } => {
                offsets.clear();
                data.reset();
            }
            Column::Nullable { nulls, data } => {
                nulls.clear();
                data.reset();
            }
            Column::Map { offsets, keys, values } => {
                offsets.clear();
                keys.reset();
                values.reset();
            }
            Column::LowCardinality { index, keys } => {
                index.reset();
                keys.clear();
            }
        }
    }

    /// The wire descriptor for this column.
    pub fn column_type(&self) -> ColumnType {
        match self {
            Column::UInt8(_) => "UInt8".into(),
            Column::UInt16(_) => "UInt16".into(),
            Column::UInt32(_) => "UInt32".into(),
            Column::UInt64(_) => "UInt64".into(),
            Column::UInt128(_) => "UInt128".into(),
            Column::Int8(_) => "Int8".into(),
            Column::Int16(_) => "Int16".into(),
            Column::Int32(_) => "Int32".into(),
            Column::Int64(_) => "Int64".into(),
            Column::Int128(_) => "Int128".into(),
            Column::Float32(_) => "Float32".into(),
            Column::Float64(_) => "Float64".into(),
            Column::String(_) => "String".into(),
            Column::FixedString { size, .. } => format!("FixedString({size})").into(),
            Column::Date(_) => "Date".into(),
            Column::DateTime { tz: None, .. } => "DateTime".into(),
            Column::DateTime { tz: Some(tz), .. } => format!("DateTime('{tz}')").into(),
            Column::DateTime64 { precision, tz: None, .. } => {
                format!("DateTime64({precision})").into()
            }
            Column::DateTime64 { precision, tz: Some(tz), .. } => {
                format!("DateTime64({precision}, '{tz}')").into()
            }
            Column::Uuid(_) => "UUID".into(),
            Column::Ipv4(_) => "IPv4".into(),
            Column::Ipv6(_) => "IPv6".into(),
            Column::Enum8 { variants, .. } => render_enum("Enum8", variants),
            Column::Enum16 { variants, .. } => render_enum("Enum16", variants),
            Column::Decimal32 { scale, .. } => format!("Decimal32({scale})").into(),
            Column::Decimal64 { scale, .. } => format!("Decimal64({scale})").into(),
            Column::Decimal128 { scale, .. } => format!("Decimal128({scale})").into(),
            Column::Array { data, .. } => format!("Array({})", data.column_type()).into(),
            Column::Nullable { data, .. } => format!("Nullable({})", data.column_type()).into(),
            Column::Map { keys, values, .. } => {
                format!("Map({},{})", keys.column_type(), values.column_type()).into()
            }
            Column::LowCardinality { index, .. } => {
                format!("LowCardinality({})", index.column_type()).into()
            }
        }
    }

    /// The value at row `i`.
    ///
    /// # Panics
    /// Panics if `i >= self.rows()`.
    pub fn value(&self, i: usize) -> Value {
        match self {
            Column::UInt8(d) => Value::UInt8(d[i]),
            Column::UInt16(d) => Value::UInt16(d[i]),
            Column::UInt32(d) => Value::UInt32(d[i]),
            Column::UInt64(d) => Value::UInt64(d[i]),
            Column::UInt128(d) => Value::UInt128(d[i]),
            Column::Int8(d) => Value::Int8(d[i]),
            Column::Int16(d) => Value::Int16(d[i]),
            Column::Int32(d) => Value::Int32(d[i]),
            Column::Int64(d) => Value::Int64(d[i]),
            Column::Int128(d) => Value::Int128(d[i]),
            Column::Float32(d) => Value::Float32(d[i]),
            Column::Float64(d) => Value::Float64(d[i]),
            Column::String(d) => Value::String(d[i].clone()),
            Column::FixedString { size, data } => {
                Value::String(data[i * size..(i + 1) * size].to_vec())
            }
            Column::Date(d) => Value::Date(d[i]),
            Column::DateTime { data, .. } => Value::DateTime(data[i]),
            Column::DateTime64 { data, .. } => Value::DateTime64(data[i]),
            Column::Uuid(d) => Value::Uuid(d[i]),
            Column::Ipv4(d) => Value::Ipv4(d[i]),
            Column::Ipv6(d) => Value::Ipv6(d[i]),
            Column::Enum8 { data, .. } => Value::Enum8(data[i]),
            Column::Enum16 { data, .. } => Value::Enum16(data[i]),
            Column::Decimal32 { scale, data } => Value::Decimal32(*scale, data[i]),
            Column::Decimal64 { scale, data } => Value::Decimal64(*scale, data[i]),
            Column::Decimal128 { scale, data } => Value::Decimal128(*scale, data[i]),
            Column::Array { offsets, data } => {
                let (start, end) = offset_range(offsets, i);
                Value::Array((start..end).map(|j| data.value(j)).collect())
            }
            Column::Nullable { nulls, data } => {
                if nulls[i] != 0 { Value::Null } else { data.value(i) }
            }
            Column::Map { offsets, keys, values } => {
                let (start, end) = offset_range(offsets, i);
                Value::Map((start..end).map(|j| (keys.value(j), values.value(j))).collect())
            }
            Column::LowCardinality { index, keys } => index.value(keys[i] as usize),
        }
    }

    /// Construct an empty column for a wire type descriptor.
    pub fn new_of(ty: &ColumnType) -> Result<Column> {
        let unsupported =
            || Error::Protocol(format!("unsupported column type {ty}"));
        Ok(match ty.base() {
            "UInt8" => Column::UInt8(Vec::new()),
            "UInt16" => Column::UInt16(Vec::new()),
            "UInt32" => Column::UInt32(Vec::new()),
            "UInt64" => Column::UInt64(Vec::new()),
            "UInt128" => Column::UInt128(Vec::new()),
            "Int8" => Column::Int8(Vec::new()),
            "Int16" => Column::Int16(Vec::new()),
            "Int32" => Column::Int32(Vec::new()),
            "Int64" => Column::Int64(Vec::new()),
            "Int128" => Column::Int128(Vec::new()),
            "Float32" => Column::Float32(Vec::new()),
            "Float64" => Column::Float64(Vec::new()),
            "String" => Column::String(Vec::new()),
            "FixedString" => {
                let size: usize = ty
                    .params()
                    .and_then(|p| p.trim().parse().ok())
                    .filter(|n| *n > 0)
                    .ok_or_else(unsupported)?;
                Column::FixedString { size, data: Vec::new() }
            }
            "Date" => Column::Date(Vec::new()),
            "DateTime" => Column::DateTime {
                tz:   ty.params().map(parse_timezone).transpose()?,
                data: Vec::new(),
            },
            "DateTime64" => {
                let params = ty.params().map(split_params).unwrap_or_default();
                let precision: u8 = params
                    .first()
                    .and_then(|p| p.trim().parse().ok())
                    .ok_or_else(unsupported)?;
                let tz = params.get(1).map(|p| parse_timezone(p)).transpose()?;
                Column::DateTime64 { precision, tz, data: Vec::new() }
            }
            "UUID" => Column::Uuid(Vec::new()),
            "IPv4" => Column::Ipv4(Vec::new()),
            "IPv6" => Column::Ipv6(Vec::new()),
            "Enum8" => Column::Enum8 {
                variants: parse_enum_variants(ty)?,
                data:     Vec::new(),
            },
            "Enum16" => Column::Enum16 {
                variants: parse_enum_variants(ty)?,
                data:     Vec::new(),
            },
            "Decimal" => {
                let params = ty.params().map(split_params).unwrap_or_default();
                let precision: u8 = params
                    .first()
                    .and_then(|p| p.trim().parse().ok())
                    .ok_or_else(unsupported)?;
                let scale: u8 = params
                    .get(1)
                    .and_then(|p| p.trim().parse().ok())
                    .ok_or_else(unsupported)?;
                match precision {
                    1..=9 => Column::Decimal32 { scale, data: Vec::new() },
                    10..=18 => Column::Decimal64 { scale, data: Vec::new() },
                    19..=38 => Column::Decimal128 { scale, data: Vec::new() },
                    _ => return Err(unsupported()),
                }
            }
            "Decimal32" => Column::Decimal32 { scale: decimal_scale(ty)?, data: Vec::new() },
            "Decimal64" => Column::Decimal64 { scale: decimal_scale(ty)?, data: Vec::new() },
            "Decimal128" => Column::Decimal128 { scale: decimal_scale(ty)?, data: Vec::new() },
            "Array" => Column::Array {
                offsets: Vec::new(),
                data:    Box::new(Column::new_of(&ty.elem().ok_or_else(unsupported)?)?),
            },
            "Nullable" => Column::Nullable {
                nulls: Vec::new(),
                data:  Box::new(Column::new_of(&ty.elem().ok_or_else(unsupported)?)?),
            },
            "Map" => {
                let params = ty.params().map(split_params).unwrap_or_default();
                let [key, value] = params.as_slice() else {
                    return Err(unsupported());
                };
                Column::Map {
                    offsets: Vec::new(),
                    keys:    Box::new(Column::new_of(&ColumnType::from(key.trim()))?),
                    values:  Box::new(Column::new_of(&ColumnType::from(value.trim()))?),
                }
            }
            "LowCardinality" => Column::LowCardinality {
                index: Box::new(Column::new_of(&ty.elem().ok_or_else(unsupported)?)?),
                keys:  Vec::new(),
            },
            _ => return Err(unsupported()),
        })
    }

    /// Specialize late-bound parameterization from a server-echoed type.
    ///
    /// Errors if the echoed type conflicts with the declared one.
    pub fn infer(&mut self, ty: &ColumnType) -> Result<()> {
        let declared = self.column_type();
        if declared.conflicts(ty) {
            return Err(Error::Protocol(format!("cannot infer {declared} as {ty}")));
        }
        match self {
            Column::Enum8 { variants, .. } if ty.base() == "Enum8" => {
                *variants = parse_enum_variants(ty)?;
            }
            Column::Enum16 { variants, .. } if ty.base() == "Enum16" => {
                *variants = parse_enum_variants(ty)?;
            }
            Column::DateTime { tz, .. } if ty.base() == "DateTime" => {
                if let Some(params) = ty.params() {
                    *tz = Some(parse_timezone(params)?);
                }
            }
            Column::DateTime64 { tz, .. } if ty.base() == "DateTime64" => {
                let params = ty.params().map(split_params).unwrap_or_default();
                if let Some(zone) = params.get(1) {
                    *tz = Some(parse_timezone(zone)?);
                }
            }
            Column::Array { data, .. } if ty.base() == "Array" => {
                if let Some(elem) = ty.elem() {
                    data.infer(&elem)?;
                }
            }
            Column::Nullable { data, .. } if ty.base() == "Nullable" => {
                if let Some(elem) = ty.elem() {
                    data.infer(&elem)?;
                }
            }
            Column::LowCardinality { index, .. } if ty.base() == "LowCardinality" => {
                if let Some(elem) = ty.elem() {
                    index.infer(&elem)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Serialize all rows to the writer, no per-row delimiter.
    pub(crate) fn encode<'a, W: ClickHouseWrite>(
        &'a self,
        writer: &'a mut W,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            match self {
                Column::UInt8(d) => {
                    for v in d {
                        writer.write_u8(*v).await?;
                    }
                }
                Column::UInt16(d) => {
                    for v in d {
                        writer.write_u16_le(*v).await?;
                    }
                }
                Column::UInt32(d) => {
                    for v in d {
                        writer.write_u32_le(*v).await?;
                    }
                }
                Column::UInt64(d) => {
                    for v in d {
                        writer.write_u64_le(*v).await?;
                    }
                }
                Column::UInt128(d) => {
                    for v in d {
                        writer.write_u128_le(*v).await?;
                    }
                }
                Column::Int8(d) => {
                    for v in d {
                        writer.write_i8(*v).await?;
                    }
                }
                Column::Int16(d) => {
                    for v in d {
                        writer.write_i16_le(*v).await?;
                    }
                }
                Column::Int32(d) => {
                    for v in d {
                        writer.write_i32_le(*v).await?;
                    }
                }
                Column::Int64(d) => {
                    for v in d {
                        writer.write_i64_le(*v).await?;
                    }
                }
                Column::Int128(d) => {
                    for v in d {
                        writer.write_i128_le(*v).await?;
                    }
                }
                Column::Float32(d) => {
                    for v in d {
                        writer.write_u32_le(v.to_bits()).await?;
                    }
                }
                Column::Float64(d) => {
                    for v in d {
                        writer.write_u64_le(v.to_bits()).await?;
                    }
                }
                Column::String(d) => {
                    for v in d {
                        writer.write_string(v.as_slice()).await?;
                    }
                }
                Column::FixedString { data, .. } => writer.write_all(data).await?,
                Column::Date(d) => {
                    for v in d {
                        writer.write_u16_le(*v).await?;
                    }
                }
                Column::DateTime { data, .. } => {
                    for v in data {
                        writer.write_u32_le(*v).await?;
                    }
                }
                Column::DateTime64 { data, .. } => {
                    for v in data {
                        writer.write_u64_le(*v).await?;
                    }
                }
                Column::Uuid(d) => {
                    for v in d {
                        let n = v.as_u128();
                        writer.write_u64_le((n >> 64) as u64).await?;
                        writer.write_u64_le(n as u64).await?;
                    }
                }
                Column::Ipv4(d) => {
                    for v in d {
                        writer.write_u32_le(u32::from(*v)).await?;
                    }
                }
                Column::Ipv6(d) => {
                    for v in d {
                        writer.write_all(&v.octets()).await?;
                    }
                }
                Column::Enum8 { data, .. } => {
                    for v in data {
                        writer.write_i8(*v).await?;
                    }
                }
                Column::Enum16 { data, .. } => {
                    for v in data {
                        writer.write_i16_le(*v).await?;
                    }
                }
                Column::Decimal32 { data, .. } => {
                    for v in data {
                        writer.write_i32_le(*v).await?;
                    }
                }
                Column::Decimal64 { data, .. } => {
                    for v in data {
                        writer.write_i64_le(*v).await?;
                    }
                }
                Column::Decimal128 { data, .. } => {
                    for v in data {
                        writer.write_i128_le(*v).await?;
                    }
                }
                Column::Array { offsets, data } => {
                    for offset in offsets {
                        writer.write_u64_le(*offset).await?;
                    }
                    data.encode(writer).await?;
                }
                Column::Nullable { nulls, data } => {
                    writer.write_all(nulls).await?;
                    data.encode(writer).await?;
                }
                Column::Map { offsets, keys, values } => {
                    for offset in offsets {
                        writer.write_u64_le(*offset).await?;
                    }
                    keys.encode(writer).await?;
                    values.encode(writer).await?;
                }
                Column::LowCardinality { index, keys } => {
                    if keys.is_empty() {
                        return Ok(());
                    }
                    writer.write_u64_le(LOW_CARDINALITY_VERSION).await?;
                    let key_width = key_width_for(index.rows());
                    writer
                        .write_u64_le(u64::from(key_width) | LOW_CARDINALITY_HAS_ADDITIONAL_KEYS)
                        .await?;
                    writer.write_u64_le(index.rows() as u64).await?;
                    index.encode(writer).await?;
                    writer.write_u64_le(keys.len() as u64).await?;
                    for key in keys {
                        match key_width {
                            0 => writer.write_u8(*key as u8).await?,
                            1 => writer.write_u16_le(*key as u16).await?,
                            2 => writer.write_u32_le(*key as u32).await?,
                            _ => writer.write_u64_le(*key).await?,
                        }
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Append `rows` decoded rows from the reader.
    ///
    /// Fails with an EOF I/O error if the stream ends before the rows are
    /// fully read.
    pub(crate) fn decode<'a, R: ClickHouseRead>(
        &'a mut self,
        reader: &'a mut R,
        rows: usize,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            match self {
                Column::UInt8(d) => {
                    d.reserve(rows);
                    for _ in 0..rows {
                        d.push(reader.read_u8().await?);
                    }
                }
                Column::UInt16(d) => {
                    d.reserve(rows);
                    for _ in 0..rows {
                        d.push(reader.read_u16_le().await?);
                    }
                }
                Column::UInt32(d) => {
                    d.reserve(rows);
                    for _ in 0..rows {
                        d.push(reader.read_u32_le().await?);
                    }
                }
                Column::UInt64(d) => {
                    d.reserve(rows);
                    for _ in 0..rows {
                        d.push(reader.read_u64_le().await?);
                    }
                }
                Column::UInt128(d) => {
                    d.reserve(rows);
                    for _ in 0..rows {
                        d.push(reader.read_u128_le().await?);
                    }
                }
                Column::Int8(d) => {
                    d.reserve(rows);
                    for _ in 0..rows {
                        d.push(reader.read_i8().await?);
                    }
                }
                Column::Int16(d) => {
                    d.reserve(rows);
                    for _ in 0..rows {
                        d.push(reader.read_i16_le().await?);
                    }
                }
                Column::Int32(d) => {
                    d.reserve(rows);
                    for _ in 0..rows {
                        d.push(reader.read_i32_le().await?);
                    }
                }
                Column::Int64(d) => {
                    d.reserve(rows);
                    for _ in 0..rows {
                        d.push(reader.read_i64_le().await?);
                    }
                }
                Column::Int128(d) => {
                    d.reserve(rows);
                    for _ in 0..rows {
                        d.push(reader.read_i128_le().await?);
                    }
                }
                Column::Float32(d) => {
                    d.reserve(rows);
                    for _ in 0..rows {
                        d.push(f32::from_bits(reader.read_u32_le().await?));
                    }
                }
                Column::Float64(d) => {
                    d.reserve(rows);
                    for _ in 0..rows {
                        d.push(f64::from_bits(reader.read_u64_le().await?));
                    }
                }
                Column::String(d) => {
                    d.reserve(rows);
                    for _ in 0..rows {
                        d.push(reader.read_string().await?);
                    }
                }
                Column::FixedString { size, data } => {
                    let start = data.len();
                    data.resize(start + *size * rows, 0);
                    let _ = reader.read_exact(&mut data[start..]).await?;
                }
                Column::Date(d) => {
                    d.reserve(rows);
                    for _ in 0..rows {
                        d.push(reader.read_u16_le().await?);
                    }
                }
                Column::DateTime { data, .. } => {
                    data.reserve(rows);
                    for _ in 0..rows {
                        data.push(reader.read_u32_le().await?);
                    }
                }
                Column::DateTime64 { data, .. } => {
                    data.reserve(rows);
                    for _ in 0..rows {
                        data.push(reader.read_u64_le().await?);
                    }
                }
                Column::Uuid(d) => {
                    d.reserve(rows);
                    for _ in 0..rows {
                        let hi = reader.read_u64_le().await?;
                        let lo = reader.read_u64_le().await?;
                        d.push(Uuid::from_u128((u128::from(hi) << 64) | u128::from(lo)));
                    }
                }
                Column::Ipv4(d) => {
                    d.reserve(rows);
                    for _ in 0..rows {
                        d.push(Ipv4Addr::from(reader.read_u32_le().await?));
                    }
                }
                Column::Ipv6(d) => {
                    d.reserve(rows);
                    for _ in 0..rows {
                        let mut octets = [0u8; 16];
                        let _ = reader.read_exact(&mut octets).await?;
                        d.push(Ipv6Addr::from(octets));
                    }
                }
                Column::Enum8 { data, .. } => {
                    data.reserve(rows);
                    for _ in 0..rows {
                        data.push(reader.read_i8().await?);
                    }
                }
                Column::Enum16 { data, .. } => {
                    data.reserve(rows);
                    for _ in 0..rows {
                        data.push(reader.read_i16_le().await?);
                    }
                }
                Column::Decimal32 { data, .. } => {
                    data.reserve(rows);
                    for _ in 0..rows {
                        data.push(reader.read_i32_le().await?);
                    }
                }
                Column::Decimal64 { data, .. } => {
                    data.reserve(rows);
                    for _ in 0..rows {
                        data.push(reader.read_i64_le().await?);
                    }
                }
                Column::Decimal128 { data, .. } => {
                    data.reserve(rows);
                    for _ in 0..rows {
                        data.push(reader.read_i128_le().await?);
                    }
                }
                Column::Array { offsets, data } => {
                    let base = offsets.last().copied().unwrap_or(0);
                    offsets.reserve(rows);
                    let mut prev = base;
                    for _ in 0..rows {
                        let offset = reader.read_u64_le().await?;
                        if offset < prev {
                            return Err(Error::Protocol(format!(
                                "array offsets must not decrease: {offset} < {prev}"
                            )));
                        }
                        offsets.push(offset);
                        prev = offset;
                    }
                    let inner_rows = usize::try_from(prev - base)
                        .map_err(|_| Error::Protocol("array too large".into()))?;
                    data.decode(reader, inner_rows).await?;
                }
                Column::Nullable { nulls, data } => {
                    let start = nulls.len();
                    nulls.resize(start + rows, 0);
                    let _ = reader.read_exact(&mut nulls[start..]).await?;
                    data.decode(reader, rows).await?;
                }
                Column::Map { offsets, keys, values } => {
                    let base = offsets.last().copied().unwrap_or(0);
                    offsets.reserve(rows);
                    let mut prev = base;
                    for _ in 0..rows {
                        let offset = reader.read_u64_le().await?;
                        if offset < prev {
                            return Err(Error::Protocol(format!(
                                "map offsets must not decrease: {offset} < {prev}"
                            )));
                        }
                        offsets.push(offset);
                        prev = offset;
                    }
                    let entries = usize::try_from(prev - base)
                        .map_err(|_| Error::Protocol("map too large".into()))?;
                    keys.decode(reader, entries).await?;
                    values.decode(reader, entries).await?;
                }
                Column::LowCardinality { index, keys } => {
                    if rows == 0 {
                        return Ok(());
                    }
                    let version = reader.read_u64_le().await?;
                    if version != LOW_CARDINALITY_VERSION {
                        return Err(Error::Protocol(format!(
                            "unsupported low cardinality serialization version {version}"
                        )));
                    }
                    let meta = reader.read_u64_le().await?;
                    let key_width = meta & 0xFF;
                    let dict_size = usize::try_from(reader.read_u64_le().await?)
                        .map_err(|_| Error::Protocol("dictionary too large".into()))?;
                    index.reset();
                    index.decode(reader, dict_size).await?;
                    let key_count = reader.read_u64_le().await?;
                    if key_count != rows as u64 {
                        return Err(Error::Protocol(format!(
                            "low cardinality key count {key_count} != rows {rows}"
                        )));
                    }
                    keys.reserve(rows);
                    for _ in 0..rows {
                        let key = match key_width {
                            0 => u64::from(reader.read_u8().await?),
                            1 => u64::from(reader.read_u16_le().await?),
                            2 => u64::from(reader.read_u32_le().await?),
                            3 => reader.read_u64_le().await?,
                            w => {
                                return Err(Error::Protocol(format!(
                                    "unsupported low cardinality key width {w}"
                                )));
                            }
                        };
                        if key >= dict_size as u64 {
                            return Err(Error::Protocol(format!(
                                "low cardinality key {key} outside dictionary of {dict_size}"
                            )));
                        }
                        keys.push(key);
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }
}

fn offset_range(offsets: &[u64], i: usize) -> (usize, usize) {
    let start = if i == 0 { 0 } else { offsets[i - 1] as usize };
    (start, offsets[i] as usize)
}

fn key_width_for(dict_size: usize) -> u8 {
    match dict_size {
        0..=0xFF => 0,
        0x100..=0xFFFF => 1,
        0x1_0000..=0xFFFF_FFFF => 2,
        _ => 3,
    }
}

fn render_enum<T: std::fmt::Display>(base: &str, variants: &[(String, T)]) -> ColumnType {
    if variants.is_empty() {
        return base.into();
    }
    let body = variants
        .iter()
        .map(|(name, value)| format!("'{}' = {value}", escape_enum_name(name)))
        .collect::<Vec<_>>()
        .join(",");
    format!("{base}({body})").into()
}

fn escape_enum_name(name: &str) -> String {
    name.replace('\\', "\\\\").replace('\'', "\\'")
}

fn decimal_scale(ty: &ColumnType) -> Result<u8> {
    ty.params()
        .and_then(|p| p.trim().parse().ok())
        .ok_or_else(|| Error::Protocol(format!("missing decimal scale in {ty}")))
}

fn parse_timezone(raw: &str) -> Result<Tz> {
    raw.trim()
        .trim_matches('\'')
        .parse()
        .map_err(|e| Error::Protocol(format!("invalid timezone {raw:?}: {e}")))
}

fn parse_enum_variants<T: TryFrom<i64>>(ty: &ColumnType) -> Result<Vec<(String, T)>> {
    let Some(params) = ty.params() else {
        return Ok(Vec::new());
    };
    let mut variants = Vec::new();
    for part in split_params(params) {
        let (name, value) = split_enum_binding(part)
            .ok_or_else(|| Error::Protocol(format!("malformed enum binding {part:?} in {ty}")))?;
        let value = value
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|v| T::try_from(v).ok())
            .ok_or_else(|| Error::Protocol(format!("enum value out of range in {ty}")))?;
        variants.push((name, value));
    }
    Ok(variants)
}

/// Split `'name' = value`, honoring escapes inside the quoted name.
fn split_enum_binding(part: &str) -> Option<(String, &str)> {
    let part = part.trim_start();
    let rest = part.strip_prefix('\'')?;
    let mut name = String::new();
    let mut escaped = false;
    for (i, c) in rest.char_indices() {
        if escaped {
            name.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '\'' => {
                let tail = rest[i + 1..].trim_start();
                let value = tail.strip_prefix('=')?;
                return Some((name, value));
            }
            c => name.push(c),
        }
    }
    None
}
