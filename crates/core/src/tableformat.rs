//! Table formats and CSV rendering of events.
//!
//! A [`TableFormat`] is a named, ordered list of [`Column`]s. A column either
//! reads one event field directly or reads a key out of the event's free-form
//! `extra` JSON. Formats are validated when they are built so that a bad
//! column spec fails at start-up of a script, not halfway through a run.

use std::borrow::Cow;
use std::collections::HashSet;

use crate::error::CoreError;
use crate::event::{escape_sql_identifier, is_event_column, Event, EventValue};

/// Name of the event column holding the free-form JSON data.
pub const EXTRA_COLUMN: &str = "extra";

/// Prefix that turns a `(field, title)` spec into an extra-column.
const EXTRA_PREFIX: &str = "extra.";

/// Naive timestamp layout used in CSV output.
const CSV_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, thiserror::Error)]
pub enum TableFormatError {
    #[error("Table format {0:?} has no columns")]
    Empty(String),

    #[error("Table format {format:?} has duplicate column key {key:?}")]
    DuplicateColumn { format: String, key: String },

    #[error("Table format {format:?} reads unknown event column {column:?}")]
    UnknownColumn { format: String, column: String },

    #[error("Table format {format:?}: {source}")]
    InvalidColumn {
        format: String,
        #[source]
        source: CoreError,
    },

    #[error("Cannot decode extra data of event: {0}")]
    ExtraDecode(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("CSV output is not valid UTF-8")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// A single column of a [`TableFormat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Column {
    /// Filled directly from an event field.
    Field { title: String, field: String },
    /// Filled from a key of the event's `extra` JSON object.
    Extra { title: String, key: String },
}

impl Column {
    pub fn field(field: impl Into<String>, title: impl Into<String>) -> Self {
        Self::Field {
            title: title.into(),
            field: field.into(),
        }
    }

    pub fn extra(key: impl Into<String>, title: impl Into<String>) -> Self {
        Self::Extra {
            title: title.into(),
            key: key.into(),
        }
    }

    /// Build a column from a `(field, title)` pair. Fields starting with
    /// `extra.` become extra-columns reading the rest of the name.
    pub fn from_spec(field: &str, title: &str) -> Self {
        match field.strip_prefix(EXTRA_PREFIX) {
            Some(key) => Self::extra(key, title),
            None => Self::field(field, title),
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Self::Field { title, .. } | Self::Extra { title, .. } => title,
        }
    }

    /// The event table column this column reads.
    pub fn event_table_column(&self) -> &str {
        match self {
            Self::Field { field, .. } => field,
            Self::Extra { .. } => EXTRA_COLUMN,
        }
    }

    /// Key identifying the column within its format.
    pub fn column_key(&self) -> Cow<'_, str> {
        match self {
            Self::Field { field, .. } => Cow::Borrowed(field),
            Self::Extra { key, .. } => Cow::Owned(format!("extra:{key}")),
        }
    }

    fn validate(&self) -> Result<(), CoreError> {
        escape_sql_identifier(self.event_table_column())?;
        if let Self::Extra { key, .. } = self {
            if key.is_empty() {
                return Err(CoreError::Validation("extra column without key".into()));
            }
        }
        Ok(())
    }
}

/// A named, ordered column specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFormat {
    name: String,
    columns: Vec<Column>,
}

impl TableFormat {
    /// Create a format, checking that every column maps to a column of the
    /// `events` table and that column keys are unique.
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Result<Self, TableFormatError> {
        let name = name.into();
        if columns.is_empty() {
            return Err(TableFormatError::Empty(name));
        }
        let mut seen = HashSet::new();
        for column in &columns {
            column
                .validate()
                .map_err(|source| TableFormatError::InvalidColumn {
                    format: name.clone(),
                    source,
                })?;
            if !is_event_column(column.event_table_column()) {
                return Err(TableFormatError::UnknownColumn {
                    format: name,
                    column: column.event_table_column().to_string(),
                });
            }
            let key = column.column_key().into_owned();
            if !seen.insert(key.clone()) {
                return Err(TableFormatError::DuplicateColumn { format: name, key });
            }
        }
        Ok(Self { name, columns })
    }

    /// Build a format from `(field, title)` pairs, see [`Column::from_spec`].
    pub fn build<'a, I>(name: impl Into<String>, specs: I) -> Result<Self, TableFormatError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let columns = specs
            .into_iter()
            .map(|(field, title)| Column::from_spec(field, title))
            .collect();
        Self::new(name, columns)
    }

    /// The format used when a script does not pick one. It only uses fields
    /// that are present in almost all events.
    pub fn fallback() -> Self {
        Self {
            name: "Fallback".to_string(),
            columns: vec![
                Column::field("source.asn", "asn"),
                Column::field("source.ip", "ip"),
                Column::field("time.source", "timestamp"),
                Column::field("source.port", "src_port"),
                Column::field("destination.ip", "dst_ip"),
                Column::field("destination.port", "dst_port"),
                Column::field("destination.fqdn", "dst_host"),
                Column::field("protocol.transport", "proto"),
            ],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_titles(&self) -> Vec<&str> {
        self.columns.iter().map(Column::title).collect()
    }

    pub fn column_keys(&self) -> Vec<Cow<'_, str>> {
        self.columns.iter().map(Column::column_key).collect()
    }

    /// The distinct event table columns needed to render this format, in
    /// first-use order.
    pub fn event_table_columns(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.columns
            .iter()
            .map(Column::event_table_column)
            .filter(|c| seen.insert(*c))
            .map(str::to_string)
            .collect()
    }

    /// Resolve the cell values of one event, in column order.
    pub fn row_from_event(&self, event: &Event) -> Result<Vec<String>, TableFormatError> {
        // `extra` is decoded at most once per event, and only if needed.
        let mut extra: Option<Option<serde_json::Value>> = None;
        let mut row = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            let cell = match column {
                Column::Field { field, .. } => event.get(field).map(format_cell),
                Column::Extra { key, .. } => {
                    if extra.is_none() {
                        extra = Some(decode_extra(event.get(EXTRA_COLUMN))?);
                    }
                    extra
                        .as_ref()
                        .and_then(Option::as_ref)
                        .and_then(|obj| obj.get(key))
                        .cloned()
                        .map(|v| format_cell(&EventValue::from(v)))
                }
            };
            row.push(cell.unwrap_or_default());
        }
        Ok(row)
    }

    /// Render events as CSV: one header row of column titles, then one row
    /// per event, every field quoted.
    pub fn render_csv(&self, events: &[Event]) -> Result<String, TableFormatError> {
        let mut writer = csv::WriterBuilder::new()
            .quote_style(csv::QuoteStyle::Always)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());

        writer.write_record(self.column_titles())?;
        for event in events {
            writer.write_record(self.row_from_event(event)?)?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| csv::Error::from(e.into_error()))?;
        Ok(String::from_utf8(bytes)?)
    }
}

/// Decode the `extra` column. Depending on how the row was loaded it is
/// either structured JSON already or its text encoding.
fn decode_extra(value: Option<&EventValue>) -> Result<Option<serde_json::Value>, TableFormatError> {
    match value {
        None => Ok(None),
        Some(EventValue::Json(v)) => Ok(Some(v.clone())),
        Some(EventValue::Text(raw)) => Ok(Some(serde_json::from_str(raw)?)),
        Some(_) => Ok(None),
    }
}

/// Time-zone aware timestamps lose their offset so all CSV consumers see the
/// same naive layout.
fn format_cell(value: &EventValue) -> String {
    match value {
        EventValue::Timestamp(ts) => ts.naive_local().format(CSV_TIMESTAMP_FORMAT).to_string(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
