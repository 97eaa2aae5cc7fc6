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

//! Activity labels and diagnostics
//!
//! Operations announce named phases of work ("which tensor is in which
//! phase") through an [`ActivitySink`]. Sinks are observers only; nothing
//! they do feeds back into control flow.

use std::sync::{Arc, Mutex};

use crate::coordinator::StallReport;
use crate::tensor::TensorTableEntry;

pub const MEMCPY_IN_FUSION_BUFFER: &str = "MEMCPY_IN_FUSION_BUFFER";
pub const MEMCPY_OUT_FUSION_BUFFER: &str = "MEMCPY_OUT_FUSION_BUFFER";
pub const WAIT_FOR_DATA: &str = "WAIT_FOR_DATA";
pub const SIZE_EXCHANGE: &str = "SIZE_EXCHANGE";
pub const SHARED_BUFFER_WRITE: &str = "SHARED_BUFFER_WRITE";
pub const CROSS_NODE_ALLGATHER: &str = "CROSS_NODE_ALLGATHER";
pub const SHARED_BUFFER_READ: &str = "SHARED_BUFFER_READ";

/// Receiver of activity and stall events
pub trait ActivitySink: Send + Sync {
    fn activity_start(&self, tensor_name: &str, activity: &str);
    fn activity_end(&self, tensor_name: &str);
    fn stall_warning(&self, _report: &StallReport) {}
}

/// Default sink: everything goes to the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogActivitySink;

impl ActivitySink for LogActivitySink {
    fn activity_start(&self, tensor_name: &str, activity: &str) {
        log::trace!("{} -> {}", tensor_name, activity);
    }

    fn activity_end(&self, tensor_name: &str) {
        log::trace!("{} done", tensor_name);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityEvent {
    Start { tensor_name: String, activity: String },
    End { tensor_name: String },
}

/// In-memory sink keeping every event, mostly useful for inspection in tests
#[derive(Debug, Default)]
pub struct ActivityRecorder {
    events: Mutex<Vec<ActivityEvent>>,
    stalls: Mutex<Vec<StallReport>>,
}

impl ActivityRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ActivityEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Activity names started for `tensor_name`, in order
    pub fn activities_for(&self, tensor_name: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ActivityEvent::Start {
                    tensor_name: name,
                    activity,
                } if name == tensor_name => Some(activity),
                _ => None,
            })
            .collect()
    }

    pub fn stall_reports(&self) -> Vec<StallReport> {
        match self.stalls.lock() {
            Ok(stalls) => stalls.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ActivitySink for ActivityRecorder {
    fn activity_start(&self, tensor_name: &str, activity: &str) {
        if let Ok(mut events) = self.events.lock() {
            events.push(ActivityEvent::Start {
                tensor_name: tensor_name.to_string(),
                activity: activity.to_string(),
            });
        }
    }

    fn activity_end(&self, tensor_name: &str) {
        if let Ok(mut events) = self.events.lock() {
            events.push(ActivityEvent::End {
                tensor_name: tensor_name.to_string(),
            });
        }
    }

    fn stall_warning(&self, report: &StallReport) {
        if let Ok(mut stalls) = self.stalls.lock() {
            stalls.push(report.clone());
        }
    }
}

/// Cheap handle operations use to label their phases for a whole batch
#[derive(Clone)]
pub struct Timeline {
    sink: Arc<dyn ActivitySink>,
}

impl Timeline {
    pub fn new(sink: Arc<dyn ActivitySink>) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &Arc<dyn ActivitySink> {
        &self.sink
    }

    pub fn activity_start_all(&self, entries: &[TensorTableEntry], activity: &str) {
        for entry in entries {
            self.sink.activity_start(&entry.tensor_name, activity);
        }
    }

    pub fn activity_end_all(&self, entries: &[TensorTableEntry]) {
        for entry in entries {
            self.sink.activity_end(&entry.tensor_name);
        }
    }

    pub fn stall_warning(&self, report: &StallReport) {
        self.sink.stall_warning(report);
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new(Arc::new(LogActivitySink))
    }
}

impl std::fmt::Debug for Timeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeline").finish_non_exhaustive()
    }
}
