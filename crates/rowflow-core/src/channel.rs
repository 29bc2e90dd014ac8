// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Output channels: ordered row sinks that are closed exactly once.

use std::io::Write;

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::{ChannelError, ConfigError};
use crate::table::{Cell, ColumnSpec, Row, Table};

/// Destination of delivered rows.
pub trait OutputSink {
    /// Accepts the next row.
    fn push(&mut self, row: Row) -> Result<(), ChannelError>;

    /// Flushes and finalizes the sink.
    fn close(&mut self) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// A named sink that rejects use after close.
#[derive(Debug)]
pub struct OutputChannel<S> {
    name: String,
    sink: S,
    rows: u64,
    closed: bool,
}

impl<S: OutputSink> OutputChannel<S> {
    /// Wraps `sink` under `name`.
    pub fn new(name: impl Into<String>, sink: S) -> Self {
        Self {
            name: name.into(),
            sink,
            rows: 0,
            closed: false,
        }
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Writes one row.
    pub fn push(&mut self, row: Row) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed(self.name.clone()));
        }
        self.sink.push(row)?;
        self.rows += 1;
        Ok(())
    }

    /// Closes the channel. A second call fails.
    pub fn close(&mut self) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed(self.name.clone()));
        }
        self.closed = true;
        self.sink.close()
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Rows written so far.
    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    /// The wrapped sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Unwraps the sink.
    pub fn into_sink(self) -> S {
        self.sink
    }
}

/// Collects delivered rows into a [`Table`].
#[derive(Clone, Debug, Default)]
pub struct TableSink {
    table: Table,
}

impl TableSink {
    /// Creates a sink producing a table with `columns`.
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        Self {
            table: Table::new(columns),
        }
    }

    /// Rows collected so far.
    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Takes the collected table.
    pub fn into_table(self) -> Table {
        self.table
    }
}

impl OutputSink for TableSink {
    fn push(&mut self, row: Row) -> Result<(), ChannelError> {
        self.table.push(row);
        Ok(())
    }
}

/// Writes each row as one JSON object per line.
///
/// Keys are the column names, written in column order; missing cells become
/// `null`. When a key field is set the row key is written under that name
/// first.
#[derive(Debug)]
pub struct JsonLinesSink<W: Write> {
    writer: W,
    columns: Vec<String>,
    key_field: Option<String>,
}

impl<W: Write> JsonLinesSink<W> {
    /// Creates a sink writing objects keyed by the names in `columns`.
    pub fn new(writer: W, columns: &[ColumnSpec]) -> Self {
        Self {
            writer,
            columns: columns.iter().map(|c| c.name.clone()).collect(),
            key_field: None,
        }
    }

    /// Also writes the row key under `field`.
    ///
    /// Fails if a column already uses that name.
    pub fn with_key_field(mut self, field: impl Into<String>) -> Result<Self, ConfigError> {
        let field = field.into();
        if self.columns.contains(&field) {
            return Err(ConfigError::DuplicateColumn(field));
        }
        self.key_field = Some(field);
        Ok(self)
    }

    /// Unwraps the writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// One output line: the optional key entry, then the cells by column.
struct JsonRow<'a> {
    key: Option<(&'a str, &'a str)>,
    columns: &'a [String],
    cells: &'a [Cell],
}

impl Serialize for JsonRow<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = self.columns.len().min(self.cells.len()) + usize::from(self.key.is_some());
        let mut map = serializer.serialize_map(Some(len))?;
        if let Some((field, key)) = self.key {
            map.serialize_entry(field, key)?;
        }
        for (name, cell) in self.columns.iter().zip(self.cells) {
            map.serialize_entry(name, cell)?;
        }
        map.end()
    }
}

impl<W: Write> OutputSink for JsonLinesSink<W> {
    fn push(&mut self, row: Row) -> Result<(), ChannelError> {
        let line = JsonRow {
            key: self
                .key_field
                .as_deref()
                .map(|field| (field, row.key().as_str())),
            columns: &self.columns,
            cells: row.cells(),
        };
        serde_json::to_writer(&mut self.writer, &line)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), ChannelError> {
        self.writer.flush()?;
        Ok(())
    }
}
