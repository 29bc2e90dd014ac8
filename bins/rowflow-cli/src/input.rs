// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! JSON-lines input.
//!
//! Every non-blank line is one JSON object. The columns are the keys of the
//! first object (in serde_json's key order); keys that only appear later are
//! ignored and absent keys read as missing cells. A column's kind is the
//! common kind of its non-null values, `float` when ints and floats mix, and
//! `any` otherwise.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{bail, Context, Result};
use rowflow_core::{Cell, CellKind, ColumnSpec, Row, Table};
use serde_json::Value;

/// Reads a JSON-lines file into a table.
pub fn read_jsonl(path: &Path) -> Result<Table> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    parse_jsonl(BufReader::new(file)).with_context(|| format!("read {}", path.display()))
}

/// Parses JSON lines. Row keys are `line N` with 1-based line numbers.
pub fn parse_jsonl(reader: impl BufRead) -> Result<Table> {
    let mut names: Option<Vec<String>> = None;
    let mut rows = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let line_no = i + 1;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value =
            serde_json::from_str(&line).with_context(|| format!("line {line_no}: invalid JSON"))?;
        let Value::Object(object) = value else {
            bail!("line {line_no}: expected a JSON object");
        };
        let names = names.get_or_insert_with(|| object.keys().cloned().collect());
        let cells = names
            .iter()
            .map(|name| object.get(name).map_or(Cell::Missing, to_cell))
            .collect();
        rows.push(Row::new(format!("line {line_no}"), cells));
    }
    let columns = names
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(i, name)| ColumnSpec::new(name, column_kind(&rows, i)))
        .collect();
    Ok(Table::with_rows(columns, rows))
}

fn to_cell(value: &Value) -> Cell {
    match value {
        Value::Null => Cell::Missing,
        Value::Bool(b) => Cell::Bool(*b),
        Value::Number(n) => n
            .as_i64()
            .map(Cell::Int)
            .or_else(|| n.as_f64().map(Cell::Float))
            .unwrap_or_else(|| Cell::Text(n.to_string())),
        Value::String(s) => Cell::Text(s.clone()),
        nested => Cell::Text(nested.to_string()),
    }
}

fn column_kind(rows: &[Row], index: usize) -> CellKind {
    let mut kind: Option<CellKind> = None;
    for cell in rows.iter().filter_map(|r| r.cell(index)) {
        if cell.is_missing() {
            continue;
        }
        kind = Some(match (kind, cell.kind()) {
            (None, k) => k,
            (Some(a), b) if a == b => a,
            (Some(CellKind::Int | CellKind::Float), CellKind::Int | CellKind::Float) => {
                CellKind::Float
            }
            _ => return CellKind::Any,
        });
    }
    kind.unwrap_or(CellKind::Any)
}
