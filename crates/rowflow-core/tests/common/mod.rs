// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(dead_code)]

use std::thread;
use std::time::Duration;

use rowflow_core::{
    AppendRouter, Cell, Engine, OutputChannel, ProcessorConfig, Row, SplitRouter, Table, TableSink,
};

/// Worker counts to prove "doesn't depend on num_cpus".
pub const WORKER_COUNTS: &[usize] = &[1, 2, 4, 8, 16, 32];

/// Useful seed set for jitter drills.
pub const SEEDS: &[u64] = &[
    0x0000_0000_0000_0001,
    0x1234_5678_9ABC_DEF0,
    0xDEAD_BEEF_CAFE_BABE,
    0xFEED_FACE_0123_4567,
];

/// Tiny deterministic RNG (xorshift64*) so tests don't need `rand`.
#[derive(Clone)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    pub fn new(seed: u64) -> Self {
        Self { state: seed.max(1) }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }
}

/// Stateless per-row hash so jitter is reproducible whatever thread runs the row.
pub fn mix(seed: u64, index: u64) -> u64 {
    XorShift64::new(seed ^ index.wrapping_mul(0x9E37_79B9_7F4A_7C15)).next_u64()
}

/// Sleeps 0-199 µs depending on `(seed, index)` to shuffle completion order.
pub fn jitter(seed: u64, index: u64) {
    let micros = mix(seed, index) % 200;
    if micros > 0 {
        thread::sleep(Duration::from_micros(micros));
    }
}

/// Engine with a fixed worker count and batch size.
pub fn engine(workers: usize, batch_size: usize) -> Engine {
    Engine::new(ProcessorConfig {
        workers: Some(workers),
        batch_size,
        ..ProcessorConfig::default()
    })
    .unwrap()
}

pub fn table_channel(name: &str) -> OutputChannel<TableSink> {
    OutputChannel::new(name, TableSink::default())
}

pub fn append_router() -> AppendRouter<TableSink> {
    AppendRouter::new(table_channel("out"))
}

pub fn split_router(cell: usize) -> SplitRouter<TableSink, TableSink> {
    SplitRouter::new(cell, table_channel("accepted"), table_channel("rejected"))
}

/// First cell of every row read as an integer.
pub fn first_ints(table: &Table) -> Vec<i64> {
    table
        .rows()
        .iter()
        .map(|r| match r.cell(0) {
            Some(Cell::Int(v)) => *v,
            other => panic!("row {} has no int in column 0: {other:?}", r.key()),
        })
        .collect()
}

/// Row keys of a table.
pub fn keys(table: &Table) -> Vec<String> {
    table.rows().iter().map(|r| r.key().as_str().to_owned()).collect()
}

/// The row's `n` cell as an index.
pub fn index_of(row: &Row) -> i64 {
    match row.cell(0) {
        Some(Cell::Int(v)) => *v,
        _ => -1,
    }
}
