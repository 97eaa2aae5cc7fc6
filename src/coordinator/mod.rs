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

//! Rank-zero coordination
//!
//! The [`Coordinator`] turns the request lists gathered from every rank into
//! one response list. Names that become ready in the same pass are emitted in
//! lexicographic order, so the outcome does not depend on which rank's
//! requests were looked at first.

pub mod message_table;

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::message::{RequestList, Response, ResponseList, ResponseType};
use crate::timeline::Timeline;

pub use message_table::{MessageTable, ReadyTensor, StallReport};

/// Merge consecutive compatible responses while staying under `threshold` bytes
///
/// Only Allreduce and Allgather responses fuse, and only with neighbours of
/// the same type, data type and device placement. Order is preserved. A
/// threshold of zero turns fusion off.
pub fn fuse_responses(ready: Vec<ReadyTensor>, threshold: usize) -> Vec<Response> {
    let mut responses = Vec::with_capacity(ready.len());
    let mut current: Option<ReadyTensor> = None;

    for tensor in ready {
        let fusable = matches!(
            tensor.response.response_type,
            ResponseType::Allreduce | ResponseType::Allgather
        );
        if let Some(open) = current.as_mut() {
            if fusable
                && threshold > 0
                && open.response.response_type == tensor.response.response_type
                && open.dtype == tensor.dtype
                && open.response.devices == tensor.response.devices
                && open.byte_size.saturating_add(tensor.byte_size) <= threshold
            {
                open.response
                    .tensor_names
                    .extend(tensor.response.tensor_names);
                open.response
                    .tensor_sizes
                    .extend(tensor.response.tensor_sizes);
                open.byte_size = open.byte_size.saturating_add(tensor.byte_size);
                continue;
            }
        }
        if let Some(done) = current.take() {
            responses.push(done.response);
        }
        if fusable {
            current = Some(tensor);
        } else {
            responses.push(tensor.response);
        }
    }
    if let Some(done) = current {
        responses.push(done.response);
    }
    responses
}

/// Coordinator role state; lives on rank zero's background thread only
#[derive(Debug)]
pub struct Coordinator {
    table: MessageTable,
    fusion_threshold: usize,
    stall_check_enabled: bool,
    stall_warning_time: Duration,
    last_stall_check: Instant,
    timeline: Timeline,
}

impl Coordinator {
    pub fn new(world_size: usize, config: &EngineConfig) -> Self {
        Self {
            table: MessageTable::new(world_size),
            fusion_threshold: config.fusion_threshold,
            stall_check_enabled: config.stall_check_enabled,
            stall_warning_time: config.stall_warning_time,
            last_stall_check: Instant::now(),
            timeline: Timeline::new(config.activity_sink.clone()),
        }
    }

    pub fn message_table(&self) -> &MessageTable {
        &self.table
    }

    pub fn process(&mut self, lists: Vec<RequestList>) -> ResponseList {
        self.process_at(lists, Instant::now())
    }

    /// One coordination pass over the request lists of every rank
    pub fn process_at(&mut self, lists: Vec<RequestList>, now: Instant) -> ResponseList {
        let shutdown = lists.iter().any(|list| list.shutdown);
        let mut ready_names = BTreeSet::new();

        for list in lists {
            for request in list.requests {
                let name = request.tensor_name.clone();
                match self.table.record_at(request, now) {
                    Ok(true) => {
                        ready_names.insert(name);
                    }
                    Ok(false) => {}
                    Err(e) => log::warn!("rejected request: {}", e),
                }
            }
        }

        let mut ready = Vec::with_capacity(ready_names.len());
        for name in &ready_names {
            match self.table.construct_response(name) {
                Ok(tensor) => ready.push(tensor),
                Err(e) => log::error!("failed to build response for {}: {}", name, e),
            }
        }
        let responses = fuse_responses(ready, self.fusion_threshold);
        if !responses.is_empty() {
            log::debug!(
                "coordinator emits {} responses for {} tensors",
                responses.len(),
                ready_names.len()
            );
        }

        if self.stall_check_enabled
            && now.saturating_duration_since(self.last_stall_check) >= self.stall_warning_time
        {
            self.check_for_stalled_tensors(now);
            self.last_stall_check = now;
        }

        ResponseList {
            responses,
            shutdown,
        }
    }

    /// Report every tensor that has waited at least the stall warning time
    pub fn check_for_stalled_tensors(&self, now: Instant) -> Vec<StallReport> {
        let reports = self.table.stalled_tensors(now, self.stall_warning_time);
        for report in &reports {
            log::warn!("{}", report.to_status());
            self.timeline.stall_warning(report);
        }
        reports
    }
}
