// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Demo transforms offered by the CLI.

use clap::ValueEnum;
use regex::Regex;
use rowflow_core::{
    Cell, CellKind, ColumnSpec, ConfigError, EmptyCellPolicy, InputColumn, Row, RowContext,
    RowError, RowFailurePolicy, RowTransform, SafeGuarded,
};

/// Transforms selectable with `--transform`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum TransformKind {
    /// Character and word counts of a text column.
    TextStats,
    /// Parses a column into a float.
    NumberParse,
}

/// Builds the transform reading `column`.
///
/// Under [`RowFailurePolicy::StopExecution`] an empty input cell stops the run
/// as well; otherwise such rows get empty outputs.
pub fn build(
    kind: TransformKind,
    columns: &[ColumnSpec],
    column: &str,
    policy: RowFailurePolicy,
) -> Result<Box<dyn RowTransform>, ConfigError> {
    let empty = match policy {
        RowFailurePolicy::DeliverEmpty => EmptyCellPolicy::DeliverEmpty,
        RowFailurePolicy::StopExecution => EmptyCellPolicy::Stop,
    };
    Ok(match kind {
        TransformKind::TextStats => Box::new(TextStats::new(columns, column, empty, policy)?),
        TransformKind::NumberParse => Box::new(NumberParse::new(columns, column, empty, policy)?),
    })
}

fn compile(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|e| ConfigError::Transform(format!("bad pattern `{pattern}`: {e}")))
}

/// Length in characters and number of words.
pub struct TextStats {
    input: InputColumn,
    columns: Vec<ColumnSpec>,
    policy: RowFailurePolicy,
    words: SafeGuarded<Regex>,
}

impl TextStats {
    fn new(
        columns: &[ColumnSpec],
        column: &str,
        empty: EmptyCellPolicy,
        policy: RowFailurePolicy,
    ) -> Result<Self, ConfigError> {
        let input = InputColumn::locate(columns, column, CellKind::Text, empty)?;
        let template = compile(r"\w+")?;
        Ok(Self {
            columns: vec![
                ColumnSpec::new(format!("{column}_length"), CellKind::Int),
                ColumnSpec::new(format!("{column}_words"), CellKind::Int),
            ],
            input,
            policy,
            words: SafeGuarded::per_thread(move || template.clone()),
        })
    }
}

impl RowTransform for TextStats {
    fn name(&self) -> &str {
        "text-stats"
    }

    fn output_columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    fn failure_policy(&self) -> RowFailurePolicy {
        self.policy
    }

    fn process(&self, row: &Row, _ctx: &RowContext<'_>) -> Result<Vec<Cell>, RowError> {
        let text = self.input.text(row)?.unwrap_or_default();
        let words = self
            .words
            .with(|re| re.find_iter(text).count())
            .ok_or_else(|| RowError::failed("word pattern is no longer available"))?;
        Ok(vec![count(text.chars().count()), count(words)])
    }
}

fn count(n: usize) -> Cell {
    Cell::Int(i64::try_from(n).unwrap_or(i64::MAX))
}

/// Parses text such as `"1,234.5"` into a float; numbers pass through.
pub struct NumberParse {
    input: InputColumn,
    columns: Vec<ColumnSpec>,
    policy: RowFailurePolicy,
    separators: SafeGuarded<Regex>,
}

impl NumberParse {
    fn new(
        columns: &[ColumnSpec],
        column: &str,
        empty: EmptyCellPolicy,
        policy: RowFailurePolicy,
    ) -> Result<Self, ConfigError> {
        let input = InputColumn::locate(columns, column, CellKind::Any, empty)?;
        let template = compile(r"[,_\s]")?;
        Ok(Self {
            columns: vec![ColumnSpec::new(format!("{column}_number"), CellKind::Float)],
            input,
            policy,
            separators: SafeGuarded::shared(move || template.clone()),
        })
    }

    fn parse(&self, text: &str) -> Result<f64, RowError> {
        let cleaned = self
            .separators
            .with(|re| re.replace_all(text.trim(), "").into_owned())
            .ok_or_else(|| RowError::failed("separator pattern is no longer available"))?;
        match cleaned.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v),
            _ => Err(RowError::failed(format!("cannot parse '{text}' as a number"))),
        }
    }
}

impl RowTransform for NumberParse {
    fn name(&self) -> &str {
        "number-parse"
    }

    fn output_columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    fn failure_policy(&self) -> RowFailurePolicy {
        self.policy
    }

    #[allow(clippy::cast_precision_loss)]
    fn process(&self, row: &Row, _ctx: &RowContext<'_>) -> Result<Vec<Cell>, RowError> {
        let value = match self.input.cell(row)? {
            None | Some(Cell::Missing) => return Ok(vec![Cell::Missing]),
            Some(Cell::Int(v)) => *v as f64,
            Some(Cell::Float(v)) => *v,
            Some(Cell::Text(t)) => self.parse(t)?,
            Some(other) => {
                return Err(RowError::TypeMismatch {
                    column: self.input.name().to_owned(),
                    actual: other.kind(),
                    expected: CellKind::Float,
                })
            }
        };
        Ok(vec![Cell::Float(value)])
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use rowflow_core::{
        AppendRouter, Engine, NoProgress, OutputChannel, ProcessorConfig, Table, TableSink,
    };

    fn run(transform: &dyn RowTransform, source: &Table) -> Vec<Vec<Cell>> {
        let mut router = AppendRouter::new(OutputChannel::new("out", TableSink::default()));
        let mut engine = Engine::new(ProcessorConfig {
            workers: Some(2),
            batch_size: 2,
            ..ProcessorConfig::default()
        })
        .unwrap();
        engine
            .run_single(source, transform, &mut router, &NoProgress)
            .unwrap();
        router
            .into_channel()
            .into_sink()
            .into_table()
            .rows()
            .iter()
            .map(|r| r.cells()[1..].to_vec())
            .collect()
    }

    fn one_column(kind: CellKind, cells: Vec<Cell>) -> Table {
        Table::with_rows(
            vec![ColumnSpec::new("v", kind)],
            cells
                .into_iter()
                .enumerate()
                .map(|(i, c)| Row::new(format!("r{i}"), vec![c]))
                .collect(),
        )
    }

    #[test]
    fn text_stats_counts_characters_and_words() {
        let source = one_column(
            CellKind::Text,
            vec![Cell::from("hello big world"), Cell::Missing, Cell::from("  héllo ")],
        );
        let t = build(
            TransformKind::TextStats,
            source.columns(),
            "v",
            RowFailurePolicy::DeliverEmpty,
        )
        .unwrap();
        assert_eq!(t.output_columns()[0].name, "v_length");
        assert_eq!(
            run(t.as_ref(), &source),
            vec![
                vec![Cell::Int(15), Cell::Int(3)],
                vec![Cell::Missing, Cell::Missing],
                vec![Cell::Int(8), Cell::Int(1)],
            ]
        );
    }

    #[test]
    fn number_parse_accepts_separators_and_numbers() {
        let source = one_column(
            CellKind::Any,
            vec![
                Cell::from("1,234.5"),
                Cell::Int(7),
                Cell::from("seven"),
                Cell::from("NaN"),
                Cell::Bool(true),
            ],
        );
        let t = build(
            TransformKind::NumberParse,
            source.columns(),
            "v",
            RowFailurePolicy::DeliverEmpty,
        )
        .unwrap();
        assert_eq!(
            run(t.as_ref(), &source),
            vec![
                vec![Cell::Float(1234.5)],
                vec![Cell::Float(7.0)],
                vec![Cell::Missing],
                vec![Cell::Missing],
                vec![Cell::Missing],
            ]
        );
    }

    #[test]
    fn unknown_or_mistyped_columns_are_rejected_up_front() {
        let source = one_column(CellKind::Int, vec![Cell::Int(1)]);
        assert!(matches!(
            build(TransformKind::TextStats, source.columns(), "nope", RowFailurePolicy::DeliverEmpty),
            Err(ConfigError::MissingColumn(_))
        ));
        assert!(matches!(
            build(TransformKind::TextStats, source.columns(), "v", RowFailurePolicy::DeliverEmpty),
            Err(ConfigError::IncompatibleColumn { .. })
        ));
    }
}
