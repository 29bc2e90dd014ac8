// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Result routers: turn `(row, outputs)` pairs into rows on output channels.
//!
//! The engine calls [`ResultRouter::route`] exactly once per row, in source
//! order, from a single thread, followed by exactly one
//! [`ResultRouter::close`]. Routers never buffer rows.

use std::collections::HashSet;

use crate::channel::{OutputChannel, OutputSink};
use crate::error::{ChannelError, ConfigError};
use crate::table::{Cell, ColumnSpec, Row};

/// Consumer side of a contract.
pub trait ResultRouter {
    /// Checks the router against the input and output layouts before the run.
    fn validate(&self, _input: &[ColumnSpec], _outputs: &[ColumnSpec]) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Delivers one row with its computed output cells.
    fn route(&mut self, index: u64, row: &Row, outputs: Vec<Cell>) -> Result<(), ChannelError>;

    /// Closes every channel of the router.
    fn close(&mut self) -> Result<(), ChannelError>;
}

/// Layout of a merged row: `input` minus `drop`, followed by `outputs`.
///
/// Fails if an output column collides with a kept input column.
pub fn merged_columns(
    input: &[ColumnSpec],
    outputs: &[ColumnSpec],
    drop: &[usize],
) -> Result<Vec<ColumnSpec>, ConfigError> {
    let kept: Vec<&ColumnSpec> = input
        .iter()
        .enumerate()
        .filter(|(i, _)| !drop.contains(i))
        .map(|(_, c)| c)
        .collect();
    let names: HashSet<&str> = kept.iter().map(|c| c.name.as_str()).collect();
    if let Some(clash) = outputs.iter().find(|c| names.contains(c.name.as_str())) {
        return Err(ConfigError::DuplicateColumn(clash.name.clone()));
    }
    Ok(kept.into_iter().chain(outputs).cloned().collect())
}

/// Appends all outputs to the original row on a single channel.
#[derive(Debug)]
pub struct AppendRouter<S> {
    channel: OutputChannel<S>,
}

impl<S: OutputSink> AppendRouter<S> {
    /// Routes every row to `channel`.
    pub fn new(channel: OutputChannel<S>) -> Self {
        Self { channel }
    }

    /// The output channel.
    pub fn channel(&self) -> &OutputChannel<S> {
        &self.channel
    }

    /// Unwraps the output channel.
    pub fn into_channel(self) -> OutputChannel<S> {
        self.channel
    }
}

impl<S: OutputSink> ResultRouter for AppendRouter<S> {
    fn validate(&self, input: &[ColumnSpec], outputs: &[ColumnSpec]) -> Result<(), ConfigError> {
        merged_columns(input, outputs, &[]).map(|_| ())
    }

    fn route(&mut self, _index: u64, row: &Row, outputs: Vec<Cell>) -> Result<(), ChannelError> {
        self.channel.push(row.merged(outputs, &[]))
    }

    fn close(&mut self) -> Result<(), ChannelError> {
        self.channel.close()
    }
}

/// Replaces some original columns with the outputs.
#[derive(Debug)]
pub struct ReplaceRouter<S> {
    channel: OutputChannel<S>,
    drop: Vec<usize>,
}

impl<S: OutputSink> ReplaceRouter<S> {
    /// Drops the input columns at `drop` and appends the outputs.
    pub fn new(channel: OutputChannel<S>, drop: Vec<usize>) -> Self {
        Self { channel, drop }
    }

    /// The output channel.
    pub fn channel(&self) -> &OutputChannel<S> {
        &self.channel
    }

    /// Unwraps the output channel.
    pub fn into_channel(self) -> OutputChannel<S> {
        self.channel
    }
}

impl<S: OutputSink> ResultRouter for ReplaceRouter<S> {
    fn validate(&self, input: &[ColumnSpec], outputs: &[ColumnSpec]) -> Result<(), ConfigError> {
        if let Some(&bad) = self.drop.iter().find(|&&i| i >= input.len()) {
            return Err(ConfigError::Transform(format!(
                "cannot replace input column {bad}: the input has {} columns",
                input.len()
            )));
        }
        merged_columns(input, outputs, &self.drop).map(|_| ())
    }

    fn route(&mut self, _index: u64, row: &Row, outputs: Vec<Cell>) -> Result<(), ChannelError> {
        self.channel.push(row.merged(outputs, &self.drop))
    }

    fn close(&mut self) -> Result<(), ChannelError> {
        self.channel.close()
    }
}

/// Decision of a [`SplitRouter`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    /// Merged row to the accepted channel.
    Accept,
    /// Original row, unchanged, to the rejected channel.
    Reject,
}

type Classifier = Box<dyn FnMut(u64, &Row, &[Cell]) -> Route>;

enum Split {
    MissingCell(usize),
    Custom(Classifier),
}

/// Splits rows between an accepted and a rejected channel.
pub struct SplitRouter<A, B> {
    accepted: OutputChannel<A>,
    rejected: OutputChannel<B>,
    split: Split,
}

impl<A: OutputSink, B: OutputSink> SplitRouter<A, B> {
    /// Rejects rows whose output cell `cell` is missing.
    pub fn new(cell: usize, accepted: OutputChannel<A>, rejected: OutputChannel<B>) -> Self {
        Self {
            accepted,
            rejected,
            split: Split::MissingCell(cell),
        }
    }

    /// Routes with an arbitrary predicate over `(index, row, outputs)`.
    pub fn with_classifier<F>(classify: F, accepted: OutputChannel<A>, rejected: OutputChannel<B>) -> Self
    where
        F: FnMut(u64, &Row, &[Cell]) -> Route + 'static,
    {
        Self {
            accepted,
            rejected,
            split: Split::Custom(Box::new(classify)),
        }
    }

    /// The accepted channel.
    pub fn accepted(&self) -> &OutputChannel<A> {
        &self.accepted
    }

    /// The rejected channel.
    pub fn rejected(&self) -> &OutputChannel<B> {
        &self.rejected
    }

    /// Unwraps both channels as `(accepted, rejected)`.
    pub fn into_channels(self) -> (OutputChannel<A>, OutputChannel<B>) {
        (self.accepted, self.rejected)
    }
}

impl<A: OutputSink, B: OutputSink> ResultRouter for SplitRouter<A, B> {
    fn validate(&self, input: &[ColumnSpec], outputs: &[ColumnSpec]) -> Result<(), ConfigError> {
        if let Split::MissingCell(index) = self.split {
            if index >= outputs.len() {
                return Err(ConfigError::RouterColumn {
                    index,
                    declared: outputs.len(),
                });
            }
        }
        merged_columns(input, outputs, &[]).map(|_| ())
    }

    fn route(&mut self, index: u64, row: &Row, outputs: Vec<Cell>) -> Result<(), ChannelError> {
        let route = match &mut self.split {
            Split::MissingCell(i) => match outputs.get(*i) {
                Some(cell) if !cell.is_missing() => Route::Accept,
                _ => Route::Reject,
            },
            Split::Custom(classify) => classify(index, row, &outputs),
        };
        match route {
            Route::Accept => self.accepted.push(row.merged(outputs, &[])),
            Route::Reject => self.rejected.push(row.clone()),
        }
    }

    fn close(&mut self) -> Result<(), ChannelError> {
        let accepted = self.accepted.close();
        let rejected = self.rejected.close();
        accepted.and(rejected)
    }
}

/// Sends each merged row to one of N channels, or drops it.
pub struct TargetRouter<S, F> {
    channels: Vec<OutputChannel<S>>,
    select: F,
}

impl<S, F> TargetRouter<S, F>
where
    S: OutputSink,
    F: FnMut(u64, &Row, &[Cell]) -> Option<usize>,
{
    /// `select` returns the channel index for a row, or `None` to drop it.
    pub fn new(channels: Vec<OutputChannel<S>>, select: F) -> Self {
        Self { channels, select }
    }

    /// The output channels.
    pub fn channels(&self) -> &[OutputChannel<S>] {
        &self.channels
    }

    /// Unwraps the output channels.
    pub fn into_channels(self) -> Vec<OutputChannel<S>> {
        self.channels
    }
}

impl<S, F> ResultRouter for TargetRouter<S, F>
where
    S: OutputSink,
    F: FnMut(u64, &Row, &[Cell]) -> Option<usize>,
{
    fn validate(&self, input: &[ColumnSpec], outputs: &[ColumnSpec]) -> Result<(), ConfigError> {
        if self.channels.is_empty() {
            return Err(ConfigError::Transform(
                "target router needs at least one channel".to_owned(),
            ));
        }
        merged_columns(input, outputs, &[]).map(|_| ())
    }

    fn route(&mut self, index: u64, row: &Row, outputs: Vec<Cell>) -> Result<(), ChannelError> {
        let Some(target) = (self.select)(index, row, &outputs) else {
            return Ok(());
        };
        let available = self.channels.len();
        let channel = self
            .channels
            .get_mut(target)
            .ok_or(ChannelError::NoSuchTarget {
                index: target,
                available,
            })?;
        channel.push(row.merged(outputs, &[]))
    }

    fn close(&mut self) -> Result<(), ChannelError> {
        let mut first_err = None;
        for ch in &mut self.channels {
            if let Err(e) = ch.close() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
