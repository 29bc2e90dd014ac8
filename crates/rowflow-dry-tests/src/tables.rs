// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Table builders and canned tables.

use rowflow_core::{Cell, CellKind, ColumnSpec, Row, Table};

/// Builder for small in-memory tables.
///
/// # Example
///
/// ```
/// use rowflow_core::{Cell, CellKind};
/// use rowflow_dry_tests::TableBuilder;
///
/// let table = TableBuilder::new()
///     .column("name", CellKind::Text)
///     .row("r0", vec![Cell::from("a")])
///     .build();
/// assert_eq!(table.len(), 1);
/// ```
#[derive(Clone, Debug, Default)]
pub struct TableBuilder {
    columns: Vec<ColumnSpec>,
    rows: Vec<Row>,
}

impl TableBuilder {
    /// An empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a column.
    pub fn column(mut self, name: &str, kind: CellKind) -> Self {
        self.columns.push(ColumnSpec::new(name, kind));
        self
    }

    /// Adds a row.
    pub fn row(mut self, key: impl Into<String>, cells: Vec<Cell>) -> Self {
        self.rows.push(Row::new(key.into(), cells));
        self
    }

    /// Finishes the table.
    pub fn build(self) -> Table {
        Table::with_rows(self.columns, self.rows)
    }
}

/// `n` rows keyed `row0..` with one `Int` column `n` holding the row index.
pub fn numbered_table(n: u64) -> Table {
    let builder = TableBuilder::new().column("n", CellKind::Int);
    (0..n)
        .fold(builder, |b, i| {
            b.row(format!("row{i}"), vec![Cell::Int(i64::try_from(i).unwrap_or(i64::MAX))])
        })
        .build()
}

/// One `Text` column `text`; `None` entries are missing cells.
pub fn text_table(values: &[Option<&str>]) -> Table {
    let builder = TableBuilder::new().column("text", CellKind::Text);
    values
        .iter()
        .enumerate()
        .fold(builder, |b, (i, v)| b.row(format!("row{i}"), vec![Cell::from(*v)]))
        .build()
}
