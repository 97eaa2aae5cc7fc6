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

//! Tests for reading engine configuration from the environment

use std::collections::HashMap;
use std::time::Duration;

use corral::config::{
    EngineConfig, CYCLE_TIME_ENV, DEFAULT_CYCLE_TIME, DEFAULT_FUSION_THRESHOLD,
    DEFAULT_STALL_WARNING_TIME, FUSION_THRESHOLD_ENV, HIERARCHICAL_ALLGATHER_ENV,
    STALL_CHECK_DISABLE_ENV, STALL_CHECK_TIME_ENV,
};
use corral::error::Code;

fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn test_defaults_without_variables() {
    let config = EngineConfig::from_lookup(lookup_from(&[])).unwrap();
    assert_eq!(config.fusion_threshold, DEFAULT_FUSION_THRESHOLD);
    assert_eq!(config.cycle_time, DEFAULT_CYCLE_TIME);
    assert!(config.stall_check_enabled);
    assert_eq!(config.stall_warning_time, DEFAULT_STALL_WARNING_TIME);
    assert!(!config.hierarchical_allgather);
}

#[test]
fn test_variables_override_defaults() {
    let config = EngineConfig::from_lookup(lookup_from(&[
        (FUSION_THRESHOLD_ENV, "1048576"),
        (CYCLE_TIME_ENV, "2"),
        (STALL_CHECK_DISABLE_ENV, "1"),
        (STALL_CHECK_TIME_ENV, "30"),
        (HIERARCHICAL_ALLGATHER_ENV, "true"),
    ]))
    .unwrap();
    assert_eq!(config.fusion_threshold, 1 << 20);
    assert_eq!(config.cycle_time, Duration::from_millis(2));
    assert!(!config.stall_check_enabled);
    assert_eq!(config.stall_warning_time, Duration::from_secs(30));
    assert!(config.hierarchical_allgather);
}

#[test]
fn test_zero_threshold_disables_fusion() {
    let config = EngineConfig::from_lookup(lookup_from(&[(FUSION_THRESHOLD_ENV, "0")])).unwrap();
    assert_eq!(config.fusion_threshold, 0);
}

#[test]
fn test_invalid_values_rejected() {
    let cases = [
        (FUSION_THRESHOLD_ENV, "lots"),
        (FUSION_THRESHOLD_ENV, "-1"),
        (CYCLE_TIME_ENV, "-3"),
        (CYCLE_TIME_ENV, "fast"),
        (CYCLE_TIME_ENV, "1e300"),
        (STALL_CHECK_DISABLE_ENV, "maybe"),
        (STALL_CHECK_TIME_ENV, "1.5"),
        (HIERARCHICAL_ALLGATHER_ENV, "yes please"),
    ];
    for (key, value) in cases {
        let err = EngineConfig::from_lookup(lookup_from(&[(key, value)])).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument, "{}={}", key, value);
        assert!(err.to_string().contains(key));
    }
}

#[test]
fn test_builder() {
    let config = EngineConfig::new()
        .with_fusion_threshold(4096)
        .with_cycle_time(Duration::from_millis(1))
        .with_stall_check(false)
        .with_stall_warning_time(Duration::from_secs(5))
        .with_hierarchical_allgather(true);
    assert_eq!(config.fusion_threshold, 4096);
    assert_eq!(config.cycle_time, Duration::from_millis(1));
    assert!(!config.stall_check_enabled);
    assert_eq!(config.stall_warning_time, Duration::from_secs(5));
    assert!(config.hierarchical_allgather);

    let debug = format!("{:?}", config);
    assert!(debug.contains("fusion_threshold: 4096"));
}
