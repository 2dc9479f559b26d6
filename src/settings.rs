//! Query-scoped settings, key-value pairs sent with every query.
//!
//! For server revisions before settings-as-strings, only integer and
//! boolean values can be encoded; newer revisions serialize every value
//! as a string with a flags byte.
use std::fmt;

use crate::io::ClickHouseWrite;
use crate::native::protocol::Feature;
use crate::{Error, Result};

const SETTING_FLAG_IMPORTANT: u64 = 0x01;
/// Also used for query parameters, which ride the settings encoding.
pub(crate) const SETTING_FLAG_CUSTOM: u64 = 0x02;

/// A single query setting.
#[derive(Debug, Clone, PartialEq)]
pub struct Setting {
    pub key:       String,
    pub value:     SettingValue,
    /// Important settings fail the query when the server does not know
    /// them, instead of being ignored.
    pub important: bool,
    pub custom:    bool,
}

/// Supported value types for query settings.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    Int(i64),
    Bool(bool),
    Float(f64),
    String(String),
}

macro_rules! setting_value {
    ($ty:ident, $inner:ty) => {
        impl From<$inner> for SettingValue {
            fn from(value: $inner) -> Self { SettingValue::$ty(value) }
        }
    };
    ($ty:ident, $inner:ty, $override:ty) => {
        impl From<$override> for SettingValue {
            #[allow(clippy::cast_lossless)]
            #[allow(clippy::cast_possible_wrap)]
            fn from(value: $override) -> Self { SettingValue::$ty(value as $inner) }
        }
    };
}

setting_value!(Int, i64, u8);
setting_value!(Int, i64, u16);
setting_value!(Int, i64, u32);
setting_value!(Int, i64, u64);
setting_value!(Int, i64, i8);
setting_value!(Int, i64, i16);
setting_value!(Int, i64, i32);
setting_value!(Int, i64);
setting_value!(Bool, bool);
setting_value!(Float, f64, f32);
setting_value!(Float, f64);

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self { SettingValue::String(value.to_string()) }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self { SettingValue::String(value) }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Int(v) => write!(f, "{v}"),
            SettingValue::Bool(v) => write!(f, "{v}"),
            SettingValue::Float(v) => write!(f, "{v}"),
            SettingValue::String(v) => write!(f, "{v}"),
        }
    }
}

impl Setting {
    pub(crate) async fn encode<W: ClickHouseWrite>(
        &self,
        writer: &mut W,
        revision: u64,
    ) -> Result<()> {
        if !Feature::SettingsAsStrings.is_supported(revision) {
            if !matches!(self.value, SettingValue::Int(_) | SettingValue::Bool(_)) {
                return Err(Error::Protocol(format!(
                    "setting {} is not an integer, unsupported by revision {revision}",
                    self.key
                )));
            }
            writer.write_string(&self.key).await?;
            #[expect(clippy::cast_sign_loss)]
            match &self.value {
                SettingValue::Int(v) => writer.write_var_uint(*v as u64).await?,
                SettingValue::Bool(v) => writer.write_var_uint(u64::from(*v)).await?,
                _ => unreachable!("checked above"),
            }
            return Ok(());
        }

        writer.write_string(&self.key).await?;
        let mut flags = 0u64;
        if self.important {
            flags |= SETTING_FLAG_IMPORTANT;
        }
        if self.custom {
            flags |= SETTING_FLAG_CUSTOM;
        }
        writer.write_var_uint(flags).await?;
        writer.write_string(self.value.to_string()).await?;
        Ok(())
    }
}

/// An ordered collection of query settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings(pub Vec<Setting>);

impl Settings {
    pub fn add<S>(&mut self, key: impl Into<String>, value: S)
    where
        SettingValue: From<S>,
    {
        self.0.push(Setting {
            key:       key.into(),
            value:     value.into(),
            important: false,
            custom:    false,
        });
    }

    #[must_use]
    pub fn with<S>(mut self, key: impl Into<String>, value: S) -> Self
    where
        SettingValue: From<S>,
    {
        self.add(key, value);
        self
    }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn iter(&self) -> std::slice::Iter<'_, Setting> { self.0.iter() }
}

impl<K: Into<String>, V: Into<SettingValue>, const N: usize> From<[(K, V); N]> for Settings {
    fn from(pairs: [(K, V); N]) -> Self {
        let mut settings = Settings::default();
        for (key, value) in pairs {
            settings.add(key, value.into());
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::io::ClickHouseRead;
    use crate::native::protocol::DBMS_TCP_PROTOCOL_VERSION;

    #[tokio::test]
    async fn modern_revision_encodes_strings_with_flags() {
        let setting = Setting {
            key:       "max_threads".into(),
            value:     8i32.into(),
            important: true,
            custom:    false,
        };
        let mut buf = Vec::new();
        setting.encode(&mut buf, DBMS_TCP_PROTOCOL_VERSION).await.unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(cursor.read_utf8_string().await.unwrap(), "max_threads");
        assert_eq!(cursor.read_var_uint().await.unwrap(), SETTING_FLAG_IMPORTANT);
        assert_eq!(cursor.read_utf8_string().await.unwrap(), "8");
    }

    #[tokio::test]
    async fn legacy_revision_encodes_varints() {
        let setting = Setting {
            key:       "max_block_size".into(),
            value:     65536u32.into(),
            important: false,
            custom:    false,
        };
        let mut buf = Vec::new();
        setting.encode(&mut buf, 54420).await.unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(cursor.read_utf8_string().await.unwrap(), "max_block_size");
        assert_eq!(cursor.read_var_uint().await.unwrap(), 65536);
    }

    #[tokio::test]
    async fn legacy_revision_rejects_strings() {
        let setting = Setting {
            key:       "default_format".into(),
            value:     "JSON".into(),
            important: false,
            custom:    false,
        };
        let mut buf = Vec::new();
        assert!(setting.encode(&mut buf, 54420).await.is_err());
    }

    #[test]
    fn collection_builders() {
        let settings = Settings::from([("max_threads", 8i32)]).with("async_insert", true);
        assert_eq!(settings.0.len(), 2);
        assert_eq!(settings.0[1].value, SettingValue::Bool(true));
    }
}
