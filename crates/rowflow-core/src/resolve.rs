// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Typed access to input columns.
//!
//! Columns are located by name once, during setup, so that a missing or
//! mistyped column is a configuration error rather than a failure on every row.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, RowError};
use crate::table::{Cell, CellKind, ColumnSpec, Row};

/// How a resolver treats an empty (missing) input cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyCellPolicy {
    /// Return `Ok(None)` and let the transform decide.
    Skip,
    /// Fail the row; it gets empty output cells and an "empty input cell"
    /// warning regardless of the transform's failure policy.
    #[default]
    DeliverEmpty,
    /// Fail the whole run.
    Stop,
}

/// A located, typed input column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputColumn {
    index: usize,
    name: String,
    expected: CellKind,
    empty: EmptyCellPolicy,
}

impl InputColumn {
    /// Finds `name` in `columns` and checks it can be read as `expected`.
    pub fn locate(
        columns: &[ColumnSpec],
        name: &str,
        expected: CellKind,
        empty: EmptyCellPolicy,
    ) -> Result<Self, ConfigError> {
        let (index, spec) = columns
            .iter()
            .enumerate()
            .find(|(_, c)| c.name == name)
            .ok_or_else(|| ConfigError::MissingColumn(name.to_owned()))?;
        if !spec.kind.compatible_with(expected) {
            return Err(ConfigError::IncompatibleColumn {
                column: name.to_owned(),
                actual: spec.kind,
                expected,
            });
        }
        Ok(Self {
            index,
            name: name.to_owned(),
            expected,
            empty,
        })
    }

    /// Position of the column in the row.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Column name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw cell, with empty-cell handling applied.
    pub fn cell<'r>(&self, row: &'r Row) -> Result<Option<&'r Cell>, RowError> {
        match row.cell(self.index) {
            None | Some(Cell::Missing) => match self.empty {
                EmptyCellPolicy::Skip => Ok(None),
                EmptyCellPolicy::DeliverEmpty => Err(self.empty_error(false)),
                EmptyCellPolicy::Stop => Err(self.empty_error(true)),
            },
            Some(cell) => Ok(Some(cell)),
        }
    }

    fn empty_error(&self, stop: bool) -> RowError {
        RowError::EmptyCell {
            column: self.name.clone(),
            stop,
        }
    }

    fn mismatch(&self, cell: &Cell, expected: CellKind) -> RowError {
        RowError::TypeMismatch {
            column: self.name.clone(),
            actual: cell.kind(),
            expected,
        }
    }

    /// Reads an integer.
    pub fn int(&self, row: &Row) -> Result<Option<i64>, RowError> {
        match self.cell(row)? {
            None => Ok(None),
            Some(Cell::Int(v)) => Ok(Some(*v)),
            Some(other) => Err(self.mismatch(other, CellKind::Int)),
        }
    }

    /// Reads a float; integers are widened.
    #[allow(clippy::cast_precision_loss)]
    pub fn float(&self, row: &Row) -> Result<Option<f64>, RowError> {
        match self.cell(row)? {
            None => Ok(None),
            Some(Cell::Float(v)) => Ok(Some(*v)),
            Some(Cell::Int(v)) => Ok(Some(*v as f64)),
            Some(other) => Err(self.mismatch(other, CellKind::Float)),
        }
    }

    /// Reads text.
    pub fn text<'r>(&self, row: &'r Row) -> Result<Option<&'r str>, RowError> {
        match self.cell(row)? {
            None => Ok(None),
            Some(Cell::Text(v)) => Ok(Some(v.as_str())),
            Some(other) => Err(self.mismatch(other, CellKind::Text)),
        }
    }

    /// Reads a boolean.
    pub fn bool(&self, row: &Row) -> Result<Option<bool>, RowError> {
        match self.cell(row)? {
            None => Ok(None),
            Some(Cell::Bool(v)) => Ok(Some(*v)),
            Some(other) => Err(self.mismatch(other, CellKind::Bool)),
        }
    }

    /// Declared kind this resolver reads.
    pub fn expected(&self) -> CellKind {
        self.expected
    }
}
