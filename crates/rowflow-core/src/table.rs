// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Tabular data model: cells, column layouts, rows and row sources.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A single typed value in a row.
///
/// `Missing` is the empty sentinel: it marks an absent input value and is what
/// the engine emits for every output column of a row whose computation failed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    /// No value.
    #[default]
    Missing,
    /// Boolean value.
    Bool(bool),
    /// Signed integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// UTF-8 text value.
    Text(String),
}

impl Cell {
    /// Returns `true` for [`Cell::Missing`].
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    /// The kind of the value held by this cell (`Any` for `Missing`).
    pub fn kind(&self) -> CellKind {
        match self {
            Self::Missing => CellKind::Any,
            Self::Bool(_) => CellKind::Bool,
            Self::Int(_) => CellKind::Int,
            Self::Float(_) => CellKind::Float,
            Self::Text(_) => CellKind::Text,
        }
    }

    /// Builds `n` missing cells.
    pub fn missing_cells(n: usize) -> Vec<Self> {
        vec![Self::Missing; n]
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("?"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

impl From<bool> for Cell {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Cell {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Cell {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Cell {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for Cell {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl<T: Into<Self>> From<Option<T>> for Cell {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Missing, Into::into)
    }
}

/// Declared type of a column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    /// Boolean column.
    Bool,
    /// Integer column.
    Int,
    /// Floating point column (accepts integers).
    Float,
    /// Text column.
    Text,
    /// Untyped column; accepts every kind.
    Any,
}

impl CellKind {
    /// Whether a column declared as `self` can be read as `expected`.
    pub fn compatible_with(self, expected: Self) -> bool {
        match (self, expected) {
            (_, Self::Any) | (Self::Any, _) => true,
            (Self::Int, Self::Float) => true,
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for CellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Text => "text",
            Self::Any => "any",
        };
        f.write_str(s)
    }
}

/// Name and kind of one column.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name, unique within a table layout.
    pub name: String,
    /// Declared value kind.
    pub kind: CellKind,
}

impl ColumnSpec {
    /// Creates a column spec.
    pub fn new(name: impl Into<String>, kind: CellKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Stable identity of a row, carried unchanged through every output channel.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(Arc<str>);

impl RowKey {
    /// Creates a key.
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RowKey {
    fn from(v: &str) -> Self {
        Self::new(v)
    }
}

impl From<String> for RowKey {
    fn from(v: String) -> Self {
        Self(Arc::from(v))
    }
}

/// An immutable row: a key plus an ordered sequence of cells.
///
/// Cells are shared behind an `Arc`, so cloning a row is cheap and the same
/// row can be handed to several contracts without copying its values.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    key: RowKey,
    cells: Arc<[Cell]>,
}

impl Row {
    /// Creates a row.
    pub fn new(key: impl Into<RowKey>, cells: Vec<Cell>) -> Self {
        Self {
            key: key.into(),
            cells: Arc::from(cells),
        }
    }

    /// The row's stable key.
    pub fn key(&self) -> &RowKey {
        &self.key
    }

    /// All cells in column order.
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// The cell at `index`, if present.
    pub fn cell(&self, index: usize) -> Option<&Cell> {
        self.cells.get(index)
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the row has no cells.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Builds a new row with the same key: the original cells minus the
    /// columns listed in `drop`, followed by `extra`.
    pub fn merged(&self, extra: Vec<Cell>, drop: &[usize]) -> Self {
        let mut cells = Vec::with_capacity(self.cells.len() + extra.len());
        cells.extend(
            self.cells
                .iter()
                .enumerate()
                .filter(|(i, _)| !drop.contains(i))
                .map(|(_, c)| c.clone()),
        );
        cells.extend(extra);
        Self {
            key: self.key.clone(),
            cells: Arc::from(cells),
        }
    }
}

/// A forward-only supplier of rows.
///
/// `rows` may be called several times; every call starts a fresh, independent
/// pass over the same rows in the same order.
pub trait RowSource: Sync {
    /// Column layout of the rows.
    fn columns(&self) -> &[ColumnSpec];

    /// Number of rows, or `None` when unknown up front.
    fn row_count(&self) -> Option<u64>;

    /// Starts a new pass over the rows.
    fn rows(&self) -> Box<dyn Iterator<Item = Row> + Send + '_>;
}

/// An in-memory table.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Table {
    columns: Vec<ColumnSpec>,
    rows: Vec<Row>,
}

impl Table {
    /// Creates an empty table with the given layout.
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Creates a table from a layout and rows.
    pub fn with_rows(columns: Vec<ColumnSpec>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    /// Appends a row.
    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    /// Rows in insertion order.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Column layout.
    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of the column named `name`.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Consumes the table, returning its rows.
    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

impl RowSource for Table {
    fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    fn row_count(&self) -> Option<u64> {
        Some(self.rows.len() as u64)
    }

    fn rows(&self) -> Box<dyn Iterator<Item = Row> + Send + '_> {
        Box::new(self.rows.iter().cloned())
    }
}

/// A row source of unknown length backed by an iterator factory.
///
/// The factory is invoked once per pass, which keeps repeated passes
/// independent of each other.
pub struct IterSource<F> {
    columns: Vec<ColumnSpec>,
    factory: F,
}

impl<F, I> IterSource<F>
where
    F: Fn() -> I + Sync,
    I: Iterator<Item = Row> + Send + 'static,
{
    /// Creates a source with the given layout.
    pub fn new(columns: Vec<ColumnSpec>, factory: F) -> Self {
        Self { columns, factory }
    }
}

impl<F, I> RowSource for IterSource<F>
where
    F: Fn() -> I + Sync,
    I: Iterator<Item = Row> + Send + 'static,
{
    fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    fn row_count(&self) -> Option<u64> {
        None
    }

    fn rows(&self) -> Box<dyn Iterator<Item = Row> + Send + '_> {
        Box::new((self.factory)())
    }
}
