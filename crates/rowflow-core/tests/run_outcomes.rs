// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Aborted, cancelled and rejected runs, plus progress reporting.
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

mod common;

use std::thread;
use std::time::Duration;

use common::{append_router, engine, first_ints, jitter, split_router, SEEDS, WORKER_COUNTS};
use rowflow_core::{
    CancelFlag, Cell, CellKind, ColumnSpec, ConfigError, EmptyCellPolicy, EngineError, FnTransform,
    InputColumn, IterSource, NoProgress, Pipeline, Row, RowContext, RowError, RowFailurePolicy,
    RunOutcome,
};
use rowflow_dry_tests::{numbered_table, text_table, RecordingProgress};

fn failing_at(
    bad: u64,
    seed: u64,
) -> FnTransform<impl Fn(&Row, &RowContext<'_>) -> Result<Vec<Cell>, RowError> + Send + Sync> {
    FnTransform::new(
        "fails-once",
        vec![ColumnSpec::new("out", CellKind::Int)],
        move |_row: &Row, ctx: &RowContext<'_>| {
            jitter(seed, ctx.index());
            if ctx.index() == bad {
                Err(RowError::failed("unparsable"))
            } else {
                Ok(vec![Cell::Int(1)])
            }
        },
    )
    .with_policy(RowFailurePolicy::StopExecution)
}

#[test]
fn stop_execution_aborts_with_the_failing_row() {
    for &workers in WORKER_COUNTS {
        for &seed in SEEDS {
            let transform = failing_at(37, seed);
            let mut router = append_router();
            let mut engine = engine(workers, 5);
            let err = engine
                .run_single(&numbered_table(300), &transform, &mut router, &NoProgress)
                .unwrap_err();
            let (name, index, key, source) = match err {
                EngineError::RowAborted {
                    transform,
                    index,
                    key,
                    source,
                } => (transform, index, key, source),
                other => panic!("expected RowAborted, got {other:?}"),
            };
            assert_eq!(name, "fails-once");
            assert_eq!(index, 37);
            assert_eq!(key.as_str(), "row37");
            assert!(matches!(source, RowError::Failed(ref m) if m == "unparsable"));

            let channel = router.into_channel();
            assert!(channel.is_closed());
            let delivered = first_ints(channel.sink().table());
            // Every row before the failing one, nothing from it on.
            let prefix: Vec<i64> = (0..37).collect();
            assert_eq!(delivered, prefix, "{workers} workers, seed {seed:#x}");
        }
    }
}

#[test]
fn stop_on_empty_cell_aborts_even_when_failures_are_delivered_empty() {
    let source = text_table(&[Some("a"), Some("b"), None, Some("d")]);
    let input = InputColumn::locate(source.columns(), "text", CellKind::Text, EmptyCellPolicy::Stop)
        .unwrap();
    let transform = FnTransform::new(
        "strict-text",
        vec![ColumnSpec::new("upper", CellKind::Text)],
        move |row: &Row, _ctx: &RowContext<'_>| {
            let text = input.text(row)?.unwrap_or_default();
            Ok(vec![Cell::from(text.to_uppercase())])
        },
    );
    let mut router = split_router(0);
    let mut engine = engine(2, 1);
    let err = engine
        .run_single(&source, &transform, &mut router, &NoProgress)
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::RowAborted {
            index: 2,
            source: RowError::EmptyCell { stop: true, .. },
            ..
        }
    ));
    let (accepted, rejected) = router.into_channels();
    assert!(accepted.is_closed() && rejected.is_closed());
    assert_eq!(accepted.rows_written(), 2);
    assert_eq!(rejected.rows_written(), 0);
}

#[test]
fn setup_errors_surface_before_any_row() {
    let source = numbered_table(10);
    assert!(matches!(
        InputColumn::locate(source.columns(), "missing", CellKind::Int, EmptyCellPolicy::Skip),
        Err(ConfigError::MissingColumn(ref c)) if c == "missing"
    ));
    assert!(matches!(
        InputColumn::locate(source.columns(), "n", CellKind::Text, EmptyCellPolicy::Skip),
        Err(ConfigError::IncompatibleColumn { .. })
    ));

    // Output column collides with an input column.
    let transform = FnTransform::new(
        "clash",
        vec![ColumnSpec::new("n", CellKind::Int)],
        |_row: &Row, _ctx: &RowContext<'_>| -> Result<Vec<Cell>, RowError> {
            panic!("must not run")
        },
    );
    let mut router = append_router();
    let mut engine = engine(2, 4);
    let err = engine
        .run_single(&source, &transform, &mut router, &NoProgress)
        .unwrap_err();
    assert!(matches!(err, EngineError::Config(ConfigError::DuplicateColumn(ref c)) if c == "n"));
    assert_eq!(router.channel().rows_written(), 0);

    // Split on an output cell that does not exist.
    let transform = FnTransform::new(
        "one-column",
        vec![ColumnSpec::new("x", CellKind::Int)],
        |_row: &Row, _ctx: &RowContext<'_>| Ok(vec![Cell::Int(0)]),
    );
    let mut router = split_router(3);
    let err = engine
        .run_single(&source, &transform, &mut router, &NoProgress)
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Config(ConfigError::RouterColumn { index: 3, declared: 1 })
    ));
}

#[test]
fn cancellation_delivers_in_flight_rows_in_order() {
    let transform = FnTransform::new(
        "slow",
        vec![ColumnSpec::new("out", CellKind::Int)],
        |_row: &Row, ctx: &RowContext<'_>| {
            jitter(SEEDS[2], ctx.index());
            Ok(vec![Cell::Int(0)])
        },
    );
    let progress = RecordingProgress::cancel_after(4);
    let mut router = append_router();
    let mut engine = engine(4, 6);
    let report = engine
        .run_single(&numbered_table(1000), &transform, &mut router, &progress)
        .unwrap();
    assert!(report.is_cancelled());
    assert_eq!(report.rows_read, 24);
    assert_eq!(report.rows_delivered, 24);
    let channel = router.into_channel();
    assert!(channel.is_closed());
    assert_eq!(first_ints(channel.sink().table()), (0..24).collect::<Vec<_>>());
}

#[test]
fn abort_in_one_pipeline_cuts_every_pipeline_at_the_same_row() {
    let slow_strict = FnTransform::new(
        "slow-strict",
        vec![ColumnSpec::new("a", CellKind::Int)],
        |_row: &Row, ctx: &RowContext<'_>| {
            if ctx.index() == 37 {
                thread::sleep(Duration::from_millis(30));
                return Err(RowError::failed("late failure"));
            }
            Ok(vec![Cell::Int(1)])
        },
    )
    .with_policy(RowFailurePolicy::StopExecution);
    let fast = FnTransform::new(
        "fast",
        vec![ColumnSpec::new("b", CellKind::Int)],
        |_row: &Row, _ctx: &RowContext<'_>| Ok(vec![Cell::Int(2)]),
    );
    for _ in 0..3 {
        let mut strict_router = append_router();
        let mut fast_router = append_router();
        let mut engine = engine(4, 5);
        let err = {
            let mut pipelines = [
                Pipeline::new(&slow_strict, &mut strict_router),
                Pipeline::new(&fast, &mut fast_router),
            ];
            engine
                .run(&numbered_table(300), &mut pipelines, &NoProgress)
                .unwrap_err()
        };
        assert!(
            matches!(err, EngineError::RowAborted { index: 37, ref transform, .. } if transform == "slow-strict"),
            "{err:?}"
        );
        for router in [strict_router, fast_router] {
            let channel = router.into_channel();
            assert!(channel.is_closed());
            assert_eq!(first_ints(channel.sink().table()), (0..37).collect::<Vec<_>>());
        }
    }
}

#[test]
fn cancel_after_the_last_batch_still_completes() {
    let transform = FnTransform::new(
        "noop",
        vec![ColumnSpec::new("out", CellKind::Int)],
        |_row: &Row, _ctx: &RowContext<'_>| Ok(vec![Cell::Int(0)]),
    );
    let progress = RecordingProgress::cancel_after(2);
    let mut router = append_router();
    let mut engine = engine(2, 10);
    let report = engine
        .run_single(&numbered_table(20), &transform, &mut router, &progress)
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.rows_read, 20);
    assert_eq!(report.rows_delivered, 20);
    assert_eq!(progress.polls(), 2);
}

#[test]
fn cancel_flag_before_start_processes_nothing() {
    let flag = CancelFlag::new();
    flag.cancel();
    let transform = FnTransform::new(
        "never",
        vec![ColumnSpec::new("out", CellKind::Int)],
        |_row: &Row, _ctx: &RowContext<'_>| -> Result<Vec<Cell>, RowError> {
            panic!("must not run")
        },
    );
    let mut router = append_router();
    let mut engine = engine(2, 4);
    let report = engine
        .run_single(&numbered_table(10), &transform, &mut router, &flag)
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.rows_read, 0);
    assert!(router.channel().is_closed());
}

#[test]
fn progress_reports_every_interval_with_the_last_key() {
    let transform = FnTransform::new(
        "noop",
        vec![ColumnSpec::new("out", CellKind::Int)],
        |_row: &Row, _ctx: &RowContext<'_>| Ok(vec![Cell::Int(0)]),
    );
    let progress = RecordingProgress::new();
    let mut router = append_router();
    let mut engine = engine(4, 10);
    engine
        .run_single(&numbered_table(100), &transform, &mut router, &progress)
        .unwrap();
    let messages = progress.messages();
    let texts: Vec<&str> = messages.iter().map(|(_, m)| m.as_str()).collect();
    assert_eq!(
        texts,
        vec![
            "Processed row 20/100 ('row19')",
            "Processed row 40/100 ('row39')",
            "Processed row 60/100 ('row59')",
            "Processed row 80/100 ('row79')",
            "Processed row 100/100 ('row99')",
        ]
    );
    assert_eq!(messages.last().and_then(|(f, _)| *f), Some(1.0));
}

#[test]
fn progress_without_a_row_count_has_no_fraction() {
    let source = IterSource::new(vec![ColumnSpec::new("n", CellKind::Int)], || {
        (0..25_i64).map(|i| Row::new(format!("row{i}"), vec![Cell::Int(i)]))
    });
    let transform = FnTransform::new(
        "noop",
        vec![ColumnSpec::new("out", CellKind::Int)],
        |_row: &Row, _ctx: &RowContext<'_>| Ok(vec![Cell::Int(0)]),
    );
    let progress = RecordingProgress::new();
    let mut router = append_router();
    let mut engine = engine(2, 10);
    engine
        .run_single(&source, &transform, &mut router, &progress)
        .unwrap();
    assert_eq!(
        progress.messages(),
        vec![
            (None, "Processed row 20 ('row19')".to_owned()),
            (None, "Processed row 25 ('row24')".to_owned()),
        ]
    );
}
