// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared application services for rowflow tools (config, engine settings).
//! Keeps the CLI and other front ends thin and storage-agnostic.

pub mod config;
pub mod settings;
