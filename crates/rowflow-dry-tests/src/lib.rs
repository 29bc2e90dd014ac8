// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared test doubles and fixtures for rowflow crates.
#![forbid(unsafe_code)]
//!
//! # Modules
//!
//! - [`config`] - In-memory config store fake for testing without filesystem
//! - [`handles`] - Resource handles that count their releases
//! - [`gauge`] - Overlap detection for `process()` calls
//! - [`progress`] - Progress sink that records messages and cancels on demand
//! - [`tables`] - Table builders and canned tables

pub mod config;
pub mod handles;
pub mod gauge;
pub mod progress;
pub mod tables;

// Re-export commonly used items at crate root for convenience
pub use config::InMemoryConfigStore;
pub use handles::{HandleRegistry, ReleaseBehavior, TrackedHandle};
pub use gauge::{ConcurrencyGauge, GaugeGuard};
pub use progress::RecordingProgress;
pub use tables::{numbered_table, text_table, TableBuilder};
