//! The query descriptor handed to [`crate::Connection::execute`].
use std::fmt;

use uuid::Uuid;

use crate::io::ClickHouseWrite;
use crate::native::block::Block;
use crate::native::column::InputColumn;
use crate::native::progress::Progress;
use crate::native::protocol::{LogEntry, ProfileEvent, ProfileInfo};
use crate::settings::Settings;
use crate::Result;

/// A query id, generated fresh per call when absent.
///
/// Kept as a [`Uuid`] so tracing and wire encoding avoid repeated string
/// allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Qid(Uuid);

impl Default for Qid {
    fn default() -> Self { Self::new() }
}

impl Qid {
    pub fn new() -> Self { Self(Uuid::new_v4()) }

    pub fn into_inner(self) -> Uuid { self.0 }

    /// Write as a 32-char hex string, no heap allocation.
    pub(crate) async fn write_id<W: ClickHouseWrite>(&self, writer: &mut W) -> Result<()> {
        let mut buffer = [0u8; 32];
        let hex = self.0.as_simple().encode_lower(&mut buffer);
        writer.write_string(&*hex).await
    }
}

impl From<Uuid> for Qid {
    fn from(id: Uuid) -> Self { Self(id) }
}

impl fmt::Display for Qid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_simple())
    }
}

/// What the input callback reports after refilling the input columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFlow {
    /// The columns hold the next block to send.
    More,
    /// No more input. A nonzero-row tail in the columns is still sent
    /// before the terminator.
    End,
}

/// A typed query parameter, substituted server-side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub key:   String,
    pub value: String,
}

impl Parameter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into() }
    }
}

pub type InputFn<'a> = Box<dyn FnMut(&mut Vec<InputColumn>) -> Result<InputFlow> + Send + 'a>;
pub type ResultFn<'a> = Box<dyn FnMut(Block) -> Result<()> + Send + 'a>;
pub type ProgressFn<'a> = Box<dyn FnMut(Progress) -> Result<()> + Send + 'a>;
pub type ProfileFn<'a> = Box<dyn FnMut(ProfileInfo) -> Result<()> + Send + 'a>;
pub type ProfileEventsFn<'a> = Box<dyn FnMut(Vec<ProfileEvent>) -> Result<()> + Send + 'a>;
pub type LogsFn<'a> = Box<dyn FnMut(Vec<LogEntry>) -> Result<()> + Send + 'a>;

/// One query execution request.
///
/// Progress values are deltas; accumulate them with
/// [`std::ops::Add`] on [`Progress`] if totals are needed. An error
/// returned from any callback terminates the query.
pub struct Query<'a> {
    /// Query body, like `SELECT 1`.
    pub body: String,
    /// Defaults to a fresh UUIDv4 per call.
    pub id: Option<Qid>,
    /// Optional quota key.
    pub quota_key: String,
    /// Optional inter-server per-cluster secret for Distributed queries.
    pub secret: String,
    /// Optional initial user for Distributed queries.
    pub initial_user: String,

    /// Input columns for INSERT operations.
    pub input: Vec<InputColumn>,
    /// Called to refill [`Query::input`] with the next block. When absent,
    /// the single block in `input` is sent, but the query fails if it has
    /// zero rows.
    pub on_input: Option<InputFn<'a>>,

    /// Called per received result block. When absent, a default handler
    /// accepts exactly one nonzero-row block (plus a zero-row metadata
    /// block) and fails on any more.
    pub on_result: Option<ResultFn<'a>>,

    pub on_progress: Option<ProgressFn<'a>>,
    pub on_profile: Option<ProfileFn<'a>>,
    pub on_profile_events: Option<ProfileEventsFn<'a>>,
    pub on_logs: Option<LogsFn<'a>>,

    /// Query-scoped settings, merged after (and overriding) the
    /// connection's.
    pub settings: Settings,
    /// Typed parameters. Requires a server advertising the parameters
    /// feature.
    pub parameters: Vec<Parameter>,

    /// Side tables the server materializes transiently for this query.
    pub external_data: Vec<InputColumn>,
    /// External data table name, defaults to `_data`.
    pub external_table: String,
}

impl<'a> Query<'a> {
    pub fn new(body: impl Into<String>) -> Self {
        Query {
            body: body.into(),
            id: None,
            quota_key: String::new(),
            secret: String::new(),
            initial_user: String::new(),
            input: Vec::new(),
            on_input: None,
            on_result: None,
            on_progress: None,
            on_profile: None,
            on_profile_events: None,
            on_logs: None,
            settings: Settings::default(),
            parameters: Vec::new(),
            external_data: Vec::new(),
            external_table: String::new(),
        }
    }

    #[must_use]
    pub fn with_input(mut self, input: Vec<InputColumn>) -> Self {
        self.input = input;
        self
    }

    #[must_use]
    pub fn with_on_result(
        mut self,
        f: impl FnMut(Block) -> Result<()> + Send + 'a,
    ) -> Self {
        self.on_result = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }
}

impl fmt::Debug for Query<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("body", &self.body)
            .field("id", &self.id)
            .field("input_columns", &self.input.len())
            .field("parameters", &self.parameters.len())
            .finish_non_exhaustive()
    }
}

/// Quote a parameter value the way the server expects: single quotes with
/// backslash escapes.
pub(crate) fn quote_parameter(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}
