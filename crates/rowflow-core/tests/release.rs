// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Every tracked handle is released exactly once, whatever happens to its row.
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

mod common;

use common::{append_router, engine, mix};
use proptest::prelude::*;
use proptest::test_runner::{Config as PropConfig, RngAlgorithm, TestRng, TestRunner};
use rowflow_core::{
    Cell, CellKind, ColumnSpec, EngineError, FnTransform, NoProgress, Row, RowContext, RowError,
    RowFailurePolicy, RunOutcome,
};
use rowflow_dry_tests::{numbered_table, HandleRegistry, RecordingProgress, ReleaseBehavior};

fn behavior(seed: u64, index: u64, slot: u64) -> ReleaseBehavior {
    match mix(seed ^ slot, index) % 8 {
        0 => ReleaseBehavior::Fail,
        1 => ReleaseBehavior::Panic,
        _ => ReleaseBehavior::Succeed,
    }
}

#[test]
fn no_double_release_under_injected_failures() {
    // Pinned so a failing case reproduces everywhere.
    const SEED_BYTES: [u8; 32] = [
        0x52, 0x46, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        0, 0, 0, 0,
    ];
    let rng = TestRng::from_seed(RngAlgorithm::ChaCha, &SEED_BYTES);
    let mut runner = TestRunner::new_with_rng(PropConfig::with_cases(32), rng);
    let strategy = (1_u64..120, 1_usize..=6, 1_usize..=12, any::<u64>());

    runner
        .run(&strategy, |(n, workers, batch, seed)| {
            let registry = HandleRegistry::new();
            let reg = registry.clone();
            let transform = FnTransform::new(
                "leaky",
                vec![ColumnSpec::new("out", CellKind::Int)],
                move |_row: &Row, ctx: &RowContext<'_>| {
                    let index = ctx.index();
                    for slot in 0..mix(seed, index) % 4 {
                        ctx.track(reg.create_with(behavior(seed, index, slot)));
                    }
                    match mix(seed.rotate_left(7), index) % 6 {
                        0 => Err(RowError::failed("injected row failure")),
                        1 => panic!("injected row panic"),
                        _ => Ok(vec![Cell::Int(1)]),
                    }
                },
            );
            let mut router = append_router();
            let mut engine = engine(workers, batch);
            let report = engine
                .run_single(&numbered_table(n), &transform, &mut router, &NoProgress)
                .unwrap();

            prop_assert!(registry.double_released().is_empty());
            prop_assert!(registry.unreleased().is_empty());
            prop_assert!(registry.all_released_once());
            prop_assert_eq!(engine.ledger().outstanding(), 0);
            prop_assert_eq!(report.release.attempted(), registry.created());
            prop_assert_eq!(report.rows_delivered, n);
            Ok(())
        })
        .unwrap();
}

#[test]
fn release_failures_are_counted_not_fatal() {
    let registry = HandleRegistry::new();
    let reg = registry.clone();
    let transform = FnTransform::new(
        "one-bad-handle",
        vec![ColumnSpec::new("out", CellKind::Int)],
        move |_row: &Row, ctx: &RowContext<'_>| {
            ctx.track(reg.create());
            if ctx.index() == 3 {
                ctx.track(reg.create_with(ReleaseBehavior::Fail));
            }
            Ok(vec![Cell::Int(0)])
        },
    );
    let mut router = append_router();
    let mut engine = engine(2, 4);
    let report = engine
        .run_single(&numbered_table(10), &transform, &mut router, &NoProgress)
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.release_failures(), 1);
    assert_eq!(report.release.released, 10);
    let summary = report.warnings.unwrap();
    assert!(summary.contains("injected release failure"), "{summary}");
    assert!(registry.all_released_once());
}

#[test]
fn handles_are_released_when_the_run_aborts() {
    let registry = HandleRegistry::new();
    let reg = registry.clone();
    let transform = FnTransform::new(
        "strict",
        vec![ColumnSpec::new("out", CellKind::Int)],
        move |_row: &Row, ctx: &RowContext<'_>| {
            ctx.track(reg.create());
            ctx.track(reg.create());
            if ctx.index() == 23 {
                return Err(RowError::failed("bad row"));
            }
            Ok(vec![Cell::Int(0)])
        },
    )
    .with_policy(RowFailurePolicy::StopExecution);
    let mut router = append_router();
    let mut engine = engine(4, 3);
    let err = engine
        .run_single(&numbered_table(200), &transform, &mut router, &NoProgress)
        .unwrap_err();
    assert!(matches!(err, EngineError::RowAborted { index: 23, .. }));
    assert!(registry.created() >= 48);
    assert!(registry.all_released_once());
    assert_eq!(engine.ledger().outstanding(), 0);
}

#[test]
fn handles_are_released_when_the_run_is_cancelled() {
    let registry = HandleRegistry::new();
    let reg = registry.clone();
    let transform = FnTransform::new(
        "tracked",
        vec![ColumnSpec::new("out", CellKind::Int)],
        move |_row: &Row, ctx: &RowContext<'_>| {
            ctx.track(reg.create());
            ctx.track(reg.create());
            Ok(vec![Cell::Int(0)])
        },
    );
    let progress = RecordingProgress::cancel_after(3);
    let mut router = append_router();
    let mut engine = engine(4, 5);
    let report = engine
        .run_single(&numbered_table(500), &transform, &mut router, &progress)
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.rows_read, 15);
    assert_eq!(registry.created(), 30);
    assert!(registry.all_released_once());
    assert_eq!(engine.ledger().outstanding(), 0);
}

#[test]
fn handles_left_outside_row_waves_are_released_at_the_end() {
    let registry = HandleRegistry::new();
    let transform = FnTransform::new(
        "noop",
        vec![ColumnSpec::new("out", CellKind::Int)],
        |_row: &Row, _ctx: &RowContext<'_>| Ok(vec![Cell::Int(0)]),
    );
    let mut engine = engine(2, 4);
    let wave = engine.ledger().new_wave();
    engine.ledger().register(wave, registry.create());
    engine.ledger().register(wave, registry.create());
    let mut router = append_router();
    let report = engine
        .run_single(&numbered_table(5), &transform, &mut router, &NoProgress)
        .unwrap();
    assert_eq!(report.release.released, 2);
    assert!(registry.all_released_once());
    assert_eq!(engine.ledger().outstanding(), 0);
}
