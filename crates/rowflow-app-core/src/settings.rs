// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Persisted engine settings.

use rowflow_core::{
    Engine, ProcessorConfig, RowFailurePolicy, SummaryFilter, DEFAULT_BATCH_SIZE,
    DEFAULT_DISPLAY_CAP, DEFAULT_PROGRESS_INTERVAL,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ConfigError, ConfigService, ConfigStore};

/// Key the settings are stored under.
pub const SETTINGS_KEY: &str = "engine";

/// User-facing engine settings. Missing fields take their defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Worker threads; `None` uses the available parallelism.
    pub workers: Option<usize>,
    /// Rows per batch.
    pub batch_size: usize,
    /// Batches in flight; `None` means four per worker.
    pub max_in_flight: Option<usize>,
    /// Rows between progress reports.
    pub progress_interval: u64,
    /// Distinct messages per warning context shown in summaries.
    pub warning_display_cap: usize,
    /// Default failure policy for transforms built from these settings.
    pub failure_policy: RowFailurePolicy,
    /// Warning suppression patterns (`FULL:`, `SUB:`, `REGEX:` or exact text).
    pub suppress_warnings: Vec<String>,
    /// Warning context ids hidden from summaries.
    pub suppress_contexts: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workers: None,
            batch_size: DEFAULT_BATCH_SIZE,
            max_in_flight: None,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            warning_display_cap: DEFAULT_DISPLAY_CAP,
            failure_policy: RowFailurePolicy::DeliverEmpty,
            suppress_warnings: Vec::new(),
            suppress_contexts: Vec::new(),
        }
    }
}

impl EngineSettings {
    /// The processor part of the settings.
    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            workers: self.workers,
            batch_size: self.batch_size,
            max_in_flight: self.max_in_flight,
            progress_interval: self.progress_interval,
            warning_display_cap: self.warning_display_cap,
        }
    }

    /// Compiles the suppression settings.
    pub fn summary_filter(&self) -> Result<SummaryFilter, rowflow_core::ConfigError> {
        SummaryFilter::from_settings(&self.suppress_warnings, &self.suppress_contexts)
    }

    /// Checks ranges and suppression patterns.
    pub fn validate(&self) -> Result<(), rowflow_core::ConfigError> {
        self.processor_config().validate()?;
        self.summary_filter().map(|_| ())
    }

    /// Builds an engine configured by these settings.
    pub fn build_engine(&self) -> Result<Engine, rowflow_core::ConfigError> {
        Ok(Engine::new(self.processor_config())?.with_summary_filter(self.summary_filter()?))
    }
}

/// Error type of [`SettingsService`].
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The store failed.
    #[error("settings store: {0}")]
    Store(#[from] ConfigError),
    /// The settings are out of range.
    #[error("invalid settings: {0}")]
    Invalid(#[from] rowflow_core::ConfigError),
}

/// Loads and saves [`EngineSettings`] through a [`ConfigStore`].
pub struct SettingsService<S> {
    config: ConfigService<S>,
}

impl<S: ConfigStore> SettingsService<S> {
    /// Wraps `store`.
    pub fn new(store: S) -> Self {
        Self {
            config: ConfigService::new(store),
        }
    }

    /// Stored settings, or the defaults when nothing is stored.
    pub fn load_or_default(&self) -> Result<EngineSettings, SettingsError> {
        let settings: EngineSettings = self.config.load(SETTINGS_KEY)?.unwrap_or_default();
        settings.validate()?;
        Ok(settings)
    }

    /// Validates and stores `settings`.
    pub fn save(&self, settings: &EngineSettings) -> Result<(), SettingsError> {
        settings.validate()?;
        self.config.save(SETTINGS_KEY, settings)?;
        Ok(())
    }

    /// Unwraps the store.
    pub fn into_inner(self) -> S {
        self.config.into_inner()
    }
}
