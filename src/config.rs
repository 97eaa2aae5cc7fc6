// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Engine configuration

use std::sync::Arc;
use std::time::Duration;

use crate::error::{CorralError, CorralResult};
use crate::timeline::{ActivitySink, LogActivitySink};

pub const FUSION_THRESHOLD_ENV: &str = "CORRAL_FUSION_THRESHOLD";
pub const CYCLE_TIME_ENV: &str = "CORRAL_CYCLE_TIME";
pub const STALL_CHECK_DISABLE_ENV: &str = "CORRAL_STALL_CHECK_DISABLE";
pub const STALL_CHECK_TIME_ENV: &str = "CORRAL_STALL_CHECK_TIME_SECONDS";
pub const HIERARCHICAL_ALLGATHER_ENV: &str = "CORRAL_HIERARCHICAL_ALLGATHER";

/// 64 MiB
pub const DEFAULT_FUSION_THRESHOLD: usize = 64 * 1024 * 1024;
pub const DEFAULT_CYCLE_TIME: Duration = Duration::from_millis(5);
pub const DEFAULT_STALL_WARNING_TIME: Duration = Duration::from_secs(60);

/// Tunables for one process's engine
#[derive(Clone)]
pub struct EngineConfig {
    /// Upper bound on bytes fused into one transport call
    pub fusion_threshold: usize,
    /// Pause between coordination rounds
    pub cycle_time: Duration,
    /// Whether the coordinator looks for stalled tensors
    pub stall_check_enabled: bool,
    /// How long a tensor may wait for its peers before it is reported
    pub stall_warning_time: Duration,
    /// Gather within a node through shared memory before crossing nodes
    pub hierarchical_allgather: bool,
    /// Receiver of activity labels and stall diagnostics
    pub activity_sink: Arc<dyn ActivitySink>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fusion_threshold: DEFAULT_FUSION_THRESHOLD,
            cycle_time: DEFAULT_CYCLE_TIME,
            stall_check_enabled: true,
            stall_warning_time: DEFAULT_STALL_WARNING_TIME,
            hierarchical_allgather: false,
            activity_sink: Arc::new(LogActivitySink),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by whatever `CORRAL_*` variables are set
    pub fn from_env() -> CorralResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`EngineConfig::from_env`] with an explicit variable source
    pub fn from_lookup<F>(lookup: F) -> CorralResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(FUSION_THRESHOLD_ENV) {
            config.fusion_threshold = value.trim().parse().map_err(|_| {
                invalid_value(FUSION_THRESHOLD_ENV, &value)
            })?;
        }

        if let Some(value) = lookup(CYCLE_TIME_ENV) {
            let millis: f64 = value
                .trim()
                .parse()
                .map_err(|_| invalid_value(CYCLE_TIME_ENV, &value))?;
            if !millis.is_finite() || millis < 0.0 {
                return Err(invalid_value(CYCLE_TIME_ENV, &value));
            }
            config.cycle_time = Duration::try_from_secs_f64(millis / 1000.0)
                .map_err(|_| invalid_value(CYCLE_TIME_ENV, &value))?;
        }

        if let Some(value) = lookup(STALL_CHECK_DISABLE_ENV) {
            config.stall_check_enabled = !parse_flag(STALL_CHECK_DISABLE_ENV, &value)?;
        }

        if let Some(value) = lookup(STALL_CHECK_TIME_ENV) {
            let seconds: u64 = value
                .trim()
                .parse()
                .map_err(|_| invalid_value(STALL_CHECK_TIME_ENV, &value))?;
            config.stall_warning_time = Duration::from_secs(seconds);
        }

        if let Some(value) = lookup(HIERARCHICAL_ALLGATHER_ENV) {
            config.hierarchical_allgather = parse_flag(HIERARCHICAL_ALLGATHER_ENV, &value)?;
        }

        Ok(config)
    }

    pub fn with_fusion_threshold(mut self, bytes: usize) -> Self {
        self.fusion_threshold = bytes;
        self
    }

    pub fn with_cycle_time(mut self, cycle_time: Duration) -> Self {
        self.cycle_time = cycle_time;
        self
    }

    pub fn with_stall_check(mut self, enabled: bool) -> Self {
        self.stall_check_enabled = enabled;
        self
    }

    pub fn with_stall_warning_time(mut self, after: Duration) -> Self {
        self.stall_warning_time = after;
        self
    }

    pub fn with_hierarchical_allgather(mut self, enabled: bool) -> Self {
        self.hierarchical_allgather = enabled;
        self
    }

    pub fn with_activity_sink(mut self, sink: Arc<dyn ActivitySink>) -> Self {
        self.activity_sink = sink;
        self
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("fusion_threshold", &self.fusion_threshold)
            .field("cycle_time", &self.cycle_time)
            .field("stall_check_enabled", &self.stall_check_enabled)
            .field("stall_warning_time", &self.stall_warning_time)
            .field("hierarchical_allgather", &self.hierarchical_allgather)
            .finish_non_exhaustive()
    }
}

fn parse_flag(key: &str, value: &str) -> CorralResult<bool> {
    match value.trim() {
        "1" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "false" | "FALSE" | "False" | "" => Ok(false),
        _ => Err(invalid_value(key, value)),
    }
}

fn invalid_value(key: &str, value: &str) -> CorralError {
    CorralError::InvalidArgument(format!("{}={} is not a valid value", key, value))
}
