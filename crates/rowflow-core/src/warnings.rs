// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Consolidation of repeated non-fatal diagnostics.
//!
//! Workers report conditions such as "empty input cell" once per affected row.
//! The consolidator counts identical `(context, message)` pairs instead of
//! storing them again, and renders a compact summary at the end of a run:
//!
//! ```text
//! Output contained a null cell (3 times)
//! 12 rows: Encountered empty input cell.
//! 7 rows:
//!   5 x Failed to process data due to bad input. Generating empty result cells.
//!   2 x Failed to process data due to timeout. Generating empty result cells.
//! ```

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

/// Id of the context used by [`WarningConsolidator::save`].
pub const DEFAULT_CONTEXT_ID: &str = "default";
/// Id of the per-row context.
pub const ROW_CONTEXT_ID: &str = "row";
/// Id of the per-batch context.
pub const BATCH_CONTEXT_ID: &str = "batch";
/// Id of the resource-release context.
pub const RESOURCE_CONTEXT_ID: &str = "resource";

/// Number of distinct messages rendered per context unless configured otherwise.
pub const DEFAULT_DISPLAY_CAP: usize = 10;

/// A named diagnostic category.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    id: String,
    singular: String,
    plural: String,
    report_counts: bool,
}

impl Context {
    /// Creates a context. When `report_counts` is false the summary shows the
    /// messages of this context without occurrence counts.
    pub fn new(
        id: impl Into<String>,
        singular: impl Into<String>,
        plural: impl Into<String>,
        report_counts: bool,
    ) -> Self {
        Self {
            id: id.into(),
            singular: singular.into(),
            plural: plural.into(),
            report_counts,
        }
    }

    /// Context of [`WarningConsolidator::save`].
    pub fn default_context() -> Self {
        Self::new(DEFAULT_CONTEXT_ID, "", "", true)
    }

    /// Row context ("row" / "rows").
    pub fn row() -> Self {
        Self::new(ROW_CONTEXT_ID, "row", "rows", true)
    }

    /// Batch context ("batch" / "batches"); counts are not reported.
    pub fn batch() -> Self {
        Self::new(BATCH_CONTEXT_ID, "batch", "batches", false)
    }

    /// Resource-release context ("resource" / "resources").
    pub fn resource() -> Self {
        Self::new(RESOURCE_CONTEXT_ID, "resource", "resources", true)
    }

    /// Context id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Singular display label.
    pub fn singular(&self) -> &str {
        &self.singular
    }

    /// Plural display label.
    pub fn plural(&self) -> &str {
        &self.plural
    }

    /// Whether occurrence counts are rendered.
    pub fn reports_counts(&self) -> bool {
        self.report_counts
    }

    fn label(&self, n: u64) -> &str {
        if n == 1 {
            &self.singular
        } else {
            &self.plural
        }
    }

    fn is_default(&self) -> bool {
        self.id == DEFAULT_CONTEXT_ID
    }
}

/// A rule hiding matching messages from the rendered summary.
#[derive(Clone, Debug)]
pub enum Suppression {
    /// Message equals the text.
    Exact(String),
    /// Message contains the text.
    Substring(String),
    /// Whole message matches the expression.
    Regex(Regex),
}

impl Suppression {
    /// Parses `FULL:text`, `SUB:text`, `REGEX:expr`, or plain `text` (exact).
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        if let Some(expr) = pattern.strip_prefix("REGEX:") {
            let re = Regex::new(&format!("^(?:{expr})$")).map_err(|e| ConfigError::Suppression {
                pattern: pattern.to_owned(),
                reason: e.to_string(),
            })?;
            Ok(Self::Regex(re))
        } else if let Some(text) = pattern.strip_prefix("SUB:") {
            Ok(Self::Substring(text.to_owned()))
        } else if let Some(text) = pattern.strip_prefix("FULL:") {
            Ok(Self::Exact(text.to_owned()))
        } else {
            Ok(Self::Exact(pattern.to_owned()))
        }
    }

    /// Whether `message` is hidden by this rule.
    pub fn matches(&self, message: &str) -> bool {
        match self {
            Self::Exact(t) => message == t,
            Self::Substring(t) => message.contains(t.as_str()),
            Self::Regex(re) => re.is_match(message),
        }
    }
}

/// Messages and contexts to leave out of a rendered summary.
#[derive(Clone, Debug, Default)]
pub struct SummaryFilter {
    warnings: Vec<Suppression>,
    contexts: Vec<String>,
}

impl SummaryFilter {
    /// Builds a filter from settings strings (see [`Suppression::parse`]).
    pub fn from_settings(warnings: &[String], contexts: &[String]) -> Result<Self, ConfigError> {
        Ok(Self {
            warnings: warnings
                .iter()
                .map(|w| Suppression::parse(w))
                .collect::<Result<_, _>>()?,
            contexts: contexts.to_vec(),
        })
    }

    /// Whether the filter hides nothing.
    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty() && self.contexts.is_empty()
    }

    fn hides_context(&self, id: &str) -> bool {
        self.contexts.iter().any(|c| c == id)
    }

    fn hides(&self, message: &str) -> bool {
        self.warnings.iter().any(|s| s.matches(message))
    }
}

/// One counted message in a [`WarningSnapshot`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Context id.
    pub context: String,
    /// Message text.
    pub message: String,
    /// Occurrences.
    pub count: u64,
}

/// Serializable copy of a consolidator's contexts and counts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningSnapshot {
    /// Registered contexts in registration order.
    pub contexts: Vec<Context>,
    /// Counted messages, grouped by context in first-occurrence order.
    pub warnings: Vec<SnapshotEntry>,
}

#[derive(Default)]
struct ContextWarnings {
    order: Vec<String>,
    counts: HashMap<String, u64>,
}

impl ContextWarnings {
    fn add(&mut self, message: &str, n: u64) -> bool {
        if let Some(count) = self.counts.get_mut(message) {
            *count += n;
            false
        } else {
            self.order.push(message.to_owned());
            self.counts.insert(message.to_owned(), n);
            true
        }
    }

    fn entries(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.order
            .iter()
            .map(|m| (m.as_str(), self.counts.get(m).copied().unwrap_or(0)))
    }
}

#[derive(Default)]
struct State {
    contexts: Vec<Context>,
    warnings: HashMap<String, ContextWarnings>,
}

impl State {
    fn register(&mut self, context: Context) {
        if let Some(slot) = self.contexts.iter_mut().find(|c| c.id == context.id) {
            *slot = context;
        } else {
            self.contexts.push(context);
        }
    }

    fn ensure(&mut self, id: &str) {
        if !self.contexts.iter().any(|c| c.id == id) {
            debug!(context = id, "auto-registering unknown warning context");
            self.contexts
                .push(Context::new(id, id, format!("{id}s"), true));
        }
    }

    fn add(&mut self, context: &str, message: &str, n: u64) {
        self.ensure(context);
        let first = self
            .warnings
            .entry(context.to_owned())
            .or_default()
            .add(message, n);
        if first {
            debug!(context, message, "first occurrence of warning");
        }
    }
}

/// Thread-safe aggregator of non-fatal diagnostics.
pub struct WarningConsolidator {
    state: Mutex<State>,
    display_cap: usize,
}

impl Default for WarningConsolidator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WarningConsolidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarningConsolidator")
            .field("display_cap", &self.display_cap)
            .field("contexts", &self.lock().contexts.len())
            .finish_non_exhaustive()
    }
}

impl WarningConsolidator {
    /// Creates a consolidator with the built-in contexts (default, row, batch,
    /// resource) registered.
    pub fn new() -> Self {
        let mut state = State::default();
        state.register(Context::default_context());
        state.register(Context::row());
        state.register(Context::batch());
        state.register(Context::resource());
        Self {
            state: Mutex::new(state),
            display_cap: DEFAULT_DISPLAY_CAP,
        }
    }

    /// Sets how many distinct messages per context the summary shows.
    pub fn with_display_cap(mut self, cap: usize) -> Self {
        self.display_cap = cap.max(1);
        self
    }

    /// Rebuilds a consolidator from a snapshot.
    pub fn from_snapshot(snapshot: &WarningSnapshot) -> Self {
        let this = Self::new();
        this.restore(snapshot);
        this
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers or replaces a context.
    pub fn register_context(&self, context: Context) {
        self.lock().register(context);
    }

    /// Looks up a registered context.
    pub fn context(&self, id: &str) -> Option<Context> {
        self.lock().contexts.iter().find(|c| c.id == id).cloned()
    }

    /// Counts one occurrence of `message` in `context_id`.
    pub fn save_warning(&self, context_id: &str, message: impl AsRef<str>) {
        self.lock().add(context_id, message.as_ref(), 1);
    }

    /// Counts one occurrence of `message` in the default context.
    pub fn save(&self, message: impl AsRef<str>) {
        self.save_warning(DEFAULT_CONTEXT_ID, message);
    }

    /// Occurrences of `message` in `context_id`.
    pub fn count(&self, context_id: &str, message: &str) -> u64 {
        self.lock()
            .warnings
            .get(context_id)
            .and_then(|w| w.counts.get(message).copied())
            .unwrap_or(0)
    }

    /// Occurrences of all messages in `context_id`.
    pub fn total(&self, context_id: &str) -> u64 {
        self.lock()
            .warnings
            .get(context_id)
            .map_or(0, |w| w.counts.values().sum())
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.lock().warnings.values().all(|w| w.order.is_empty())
    }

    /// Forgets all recorded warnings; registered contexts are kept.
    pub fn clear(&self) {
        self.lock().warnings.clear();
    }

    /// Adds the contexts and counts of `other` to this consolidator.
    pub fn absorb(&self, other: &Self) {
        if std::ptr::eq(self, other) {
            return;
        }
        let snapshot = other.snapshot();
        self.restore(&snapshot);
    }

    fn restore(&self, snapshot: &WarningSnapshot) {
        let mut state = self.lock();
        for c in &snapshot.contexts {
            state.register(c.clone());
        }
        for e in &snapshot.warnings {
            state.add(&e.context, &e.message, e.count);
        }
    }

    /// Serializable copy of the current state.
    pub fn snapshot(&self) -> WarningSnapshot {
        let state = self.lock();
        let mut warnings = Vec::new();
        for c in &state.contexts {
            if let Some(w) = state.warnings.get(&c.id) {
                warnings.extend(w.entries().map(|(m, n)| SnapshotEntry {
                    context: c.id.clone(),
                    message: m.to_owned(),
                    count: n,
                }));
            }
        }
        WarningSnapshot {
            contexts: state.contexts.clone(),
            warnings,
        }
    }

    /// Renders the summary, or `None` when nothing was recorded.
    pub fn summary(&self) -> Option<String> {
        self.render(&SummaryFilter::default(), None)
    }

    /// Renders the summary using the number of items processed per context,
    /// e.g. `"3 of 10 rows: ..."` or `"All rows: ..."`.
    pub fn summary_with_totals(&self, totals: &HashMap<String, u64>) -> Option<String> {
        self.render(&SummaryFilter::default(), Some(totals))
    }

    /// Renders the summary leaving out what `filter` hides.
    pub fn summary_filtered(
        &self,
        filter: &SummaryFilter,
        totals: Option<&HashMap<String, u64>>,
    ) -> Option<String> {
        self.render(filter, totals)
    }

    fn render(&self, filter: &SummaryFilter, totals: Option<&HashMap<String, u64>>) -> Option<String> {
        let state = self.lock();
        let mut lines: Vec<String> = Vec::new();
        for ctx in &state.contexts {
            if filter.hides_context(&ctx.id) {
                continue;
            }
            let Some(w) = state.warnings.get(&ctx.id) else {
                continue;
            };
            let entries: Vec<(&str, u64)> = w.entries().filter(|(m, _)| !filter.hides(m)).collect();
            if entries.is_empty() {
                continue;
            }
            let total = totals.and_then(|t| t.get(&ctx.id).copied());
            self.render_context(ctx, &entries, total, &mut lines);
        }
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }

    fn render_context(
        &self,
        ctx: &Context,
        entries: &[(&str, u64)],
        total: Option<u64>,
        lines: &mut Vec<String>,
    ) {
        let shown = entries.len().min(self.display_cap);
        if ctx.is_default() {
            for (m, n) in &entries[..shown] {
                if *n > 1 {
                    lines.push(format!("{m} ({n} times)"));
                } else {
                    lines.push((*m).to_owned());
                }
            }
        } else if let [(m, n)] = entries {
            let line = if !ctx.report_counts {
                (*m).to_owned()
            } else {
                match total {
                    Some(t) if t == *n => format!("All {}: {m}", ctx.plural),
                    Some(t) if t > *n => format!("{n} of {t} {}: {m}", ctx.label(t)),
                    _ => format!("{n} {}: {m}", ctx.label(*n)),
                }
            };
            lines.push(line);
        } else {
            let sum: u64 = entries.iter().map(|(_, n)| n).sum();
            if ctx.report_counts {
                lines.push(format!("{sum} {}:", ctx.label(sum)));
            } else {
                lines.push(format!("{}:", ctx.plural));
            }
            for (m, n) in &entries[..shown] {
                if ctx.report_counts {
                    lines.push(format!("  {n} x {m}"));
                } else {
                    lines.push(format!("  {m}"));
                }
            }
        }
        if shown < entries.len() {
            let rest = &entries[shown..];
            let occurrences: u64 = rest.iter().map(|(_, n)| n).sum();
            lines.push(format!(
                "  ... {} more distinct messages ({occurrences} occurrences)",
                rest.len()
            ));
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_are_counted_not_repeated() {
        let w = WarningConsolidator::new();
        for _ in 0..5 {
            w.save_warning(ROW_CONTEXT_ID, "Encountered empty input cell.");
        }
        assert_eq!(w.count(ROW_CONTEXT_ID, "Encountered empty input cell."), 5);
        let s = w.summary();
        assert_eq!(s.as_deref(), Some("5 rows: Encountered empty input cell."));
    }

    #[test]
    fn single_occurrence_uses_singular_label() {
        let w = WarningConsolidator::new();
        w.save_warning(ROW_CONTEXT_ID, "bad");
        assert_eq!(w.summary().as_deref(), Some("1 row: bad"));
    }

    #[test]
    fn several_messages_are_sub_counted_in_first_occurrence_order() {
        let w = WarningConsolidator::new();
        w.save_warning(ROW_CONTEXT_ID, "b");
        w.save_warning(ROW_CONTEXT_ID, "a");
        w.save_warning(ROW_CONTEXT_ID, "b");
        assert_eq!(w.summary().as_deref(), Some("3 rows:\n  2 x b\n  1 x a"));
    }

    #[test]
    fn default_context_comes_first_and_shows_repeats() {
        let w = WarningConsolidator::new();
        w.save_warning(ROW_CONTEXT_ID, "r");
        w.save("general");
        w.save("general");
        assert_eq!(w.summary().as_deref(), Some("general (2 times)\n1 row: r"));
    }

    #[test]
    fn display_cap_folds_the_tail() {
        let w = WarningConsolidator::new().with_display_cap(2);
        for (i, m) in ["a", "b", "c", "d"].iter().enumerate() {
            for _ in 0..=i {
                w.save_warning(ROW_CONTEXT_ID, m);
            }
        }
        let s = w.summary().unwrap();
        assert_eq!(
            s,
            "10 rows:\n  1 x a\n  2 x b\n  ... 2 more distinct messages (7 occurrences)"
        );
    }

    #[test]
    fn totals_render_fractions() {
        let w = WarningConsolidator::new();
        w.save_warning(ROW_CONTEXT_ID, "x");
        w.save_warning(ROW_CONTEXT_ID, "x");
        let mut totals = HashMap::new();
        totals.insert(ROW_CONTEXT_ID.to_owned(), 10);
        assert_eq!(
            w.summary_with_totals(&totals).as_deref(),
            Some("2 of 10 rows: x")
        );
        totals.insert(ROW_CONTEXT_ID.to_owned(), 2);
        assert_eq!(w.summary_with_totals(&totals).as_deref(), Some("All rows: x"));
    }

    #[test]
    fn batch_context_hides_counts() {
        let w = WarningConsolidator::new();
        w.save_warning(BATCH_CONTEXT_ID, "slow batch");
        w.save_warning(BATCH_CONTEXT_ID, "slow batch");
        assert_eq!(w.summary().as_deref(), Some("slow batch"));
    }

    #[test]
    fn unknown_context_is_auto_registered() {
        let w = WarningConsolidator::new();
        w.save_warning("column", "odd");
        let ctx = w.context("column");
        assert_eq!(ctx.as_ref().map(Context::plural), Some("columns"));
        assert_eq!(w.summary().as_deref(), Some("1 column: odd"));
    }

    #[test]
    fn suppression_filters() {
        let w = WarningConsolidator::new();
        w.save_warning(ROW_CONTEXT_ID, "timeout after 3s");
        w.save_warning(ROW_CONTEXT_ID, "parse error");
        w.save("keep me");
        let filter =
            SummaryFilter::from_settings(&["REGEX:timeout after \\d+s".to_owned()], &[]).unwrap();
        assert_eq!(
            w.summary_filtered(&filter, None).as_deref(),
            Some("keep me\n1 row: parse error")
        );
        let hide_rows = SummaryFilter::from_settings(&[], &[ROW_CONTEXT_ID.to_owned()]).unwrap();
        assert_eq!(
            w.summary_filtered(&hide_rows, None).as_deref(),
            Some("keep me")
        );
    }

    #[test]
    fn suppression_parse_prefixes() {
        assert!(matches!(Suppression::parse("SUB:x"), Ok(Suppression::Substring(s)) if s == "x"));
        assert!(matches!(Suppression::parse("FULL:x"), Ok(Suppression::Exact(s)) if s == "x"));
        assert!(matches!(Suppression::parse("x"), Ok(Suppression::Exact(s)) if s == "x"));
        assert!(Suppression::parse("REGEX:(").is_err());
        // Regex must match the whole message.
        let re = Suppression::parse("REGEX:err");
        assert!(matches!(re, Ok(ref s) if !s.matches("an err here")));
    }

    #[test]
    fn clear_keeps_contexts() {
        let w = WarningConsolidator::new();
        w.register_context(Context::new("mol", "molecule", "molecules", true));
        w.save_warning("mol", "m");
        w.clear();
        assert!(w.is_empty());
        assert!(w.summary().is_none());
        assert!(w.context("mol").is_some());
    }

    #[test]
    fn absorb_and_snapshot_round_trip() {
        let a = WarningConsolidator::new();
        a.save_warning(ROW_CONTEXT_ID, "x");
        let b = WarningConsolidator::new();
        b.register_context(Context::new("mol", "molecule", "molecules", true));
        b.save_warning(ROW_CONTEXT_ID, "x");
        b.save_warning("mol", "y");
        a.absorb(&b);
        a.absorb(&a);
        assert_eq!(a.count(ROW_CONTEXT_ID, "x"), 2);
        assert_eq!(a.count("mol", "y"), 1);

        let json = serde_json::to_string(&a.snapshot()).unwrap();
        let back: WarningSnapshot = serde_json::from_str(&json).unwrap();
        let c = WarningConsolidator::from_snapshot(&back);
        assert_eq!(c.summary(), a.summary());
    }

    #[test]
    fn concurrent_saves_are_all_counted() {
        let w = WarningConsolidator::new();
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        w.save_warning(ROW_CONTEXT_ID, "same");
                    }
                });
            }
        });
        assert_eq!(w.total(ROW_CONTEXT_ID), 8000);
        assert_eq!(w.summary().as_deref(), Some("8000 rows: same"));
    }
}
