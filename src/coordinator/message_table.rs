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

//! Coordinator message table
//!
//! One entry per in-flight tensor name, holding the requests received so far
//! and when the first one arrived. An entry is Collecting until every rank
//! has asked for the name, at which point it is Ready, or Error if any two
//! requests disagree. Error entries keep collecting so the failure is
//! reported exactly once, after every rank is accounted for.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::data_types::DataType;
use crate::error::{Code, CorralError, CorralResult, Status};
use crate::message::{Request, RequestType, Response, ResponseType};
use crate::tensor::Device;

/// A tensor that has waited too long for some ranks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallReport {
    pub tensor_name: String,
    pub ready_ranks: Vec<usize>,
    pub missing_ranks: Vec<usize>,
    pub waiting: Duration,
}

impl StallReport {
    pub fn to_status(&self) -> Status {
        Status::new(Code::StallWarning, self.to_string())
    }
}

impl fmt::Display for StallReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} waiting {:.1}s: ready ranks {:?}, missing ranks {:?}",
            self.tensor_name,
            self.waiting.as_secs_f64(),
            self.ready_ranks,
            self.missing_ranks
        )
    }
}

/// A name that left the table, with what fusion needs to know about it
#[derive(Debug, Clone)]
pub struct ReadyTensor {
    pub response: Response,
    /// Bytes the executed operation moves into each output
    pub byte_size: usize,
    pub dtype: DataType,
}

#[derive(Debug)]
struct TableEntry {
    requests: Vec<Request>,
    first_seen: Instant,
    error: Option<String>,
}

impl TableEntry {
    fn ranks(&self) -> Vec<usize> {
        let mut ranks: Vec<usize> = self.requests.iter().map(|r| r.request_rank).collect();
        ranks.sort_unstable();
        ranks
    }
}

fn device_class(device: Device) -> &'static str {
    if device.is_gpu() {
        "GPU"
    } else {
        "CPU"
    }
}

/// Problems a request has on its own, before it is compared with its peers
fn check_alone(request: &Request, world_size: usize) -> Option<String> {
    match request.request_type {
        RequestType::Broadcast if request.root_rank >= world_size => Some(format!(
            "Broadcast root rank {} for tensor {} is outside a world of {} ranks.",
            request.root_rank, request.tensor_name, world_size
        )),
        RequestType::Allgather if request.tensor_shape.rank() == 0 => Some(format!(
            "Rank {} tried to allgather scalar tensor {}; allgather needs at least one dimension.",
            request.request_rank, request.tensor_name
        )),
        _ => None,
    }
}

/// Differences between two requests for the same name that prevent execution
fn check_compatible(first: &Request, other: &Request) -> Option<String> {
    if first.request_type != other.request_type {
        return Some(format!(
            "Mismatched operations: rank {} requested {} on tensor {}, but rank {} requested {}.",
            first.request_rank,
            first.request_type,
            first.tensor_name,
            other.request_rank,
            other.request_type
        ));
    }
    if first.tensor_type != other.tensor_type {
        return Some(format!(
            "Mismatched data types: rank {} had type {} for tensor {}, but rank {} had type {}.",
            first.request_rank,
            first.tensor_type,
            first.tensor_name,
            other.request_rank,
            other.tensor_type
        ));
    }
    if first.device.is_gpu() != other.device.is_gpu() {
        return Some(format!(
            "Mismatched devices: rank {} placed tensor {} on {}, but rank {} placed it on {}.",
            first.request_rank,
            first.tensor_name,
            device_class(first.device),
            other.request_rank,
            device_class(other.device)
        ));
    }

    match first.request_type {
        RequestType::Allreduce | RequestType::Broadcast => {
            if first.tensor_shape != other.tensor_shape {
                return Some(format!(
                    "Mismatched {} tensor shapes: rank {} sent {} for tensor {}, but rank {} sent {}.",
                    first.request_type,
                    first.request_rank,
                    first.tensor_shape,
                    first.tensor_name,
                    other.request_rank,
                    other.tensor_shape
                ));
            }
            if first.request_type == RequestType::Broadcast && first.root_rank != other.root_rank {
                return Some(format!(
                    "Mismatched broadcast root ranks: rank {} used root {} for tensor {}, but rank {} used root {}.",
                    first.request_rank,
                    first.root_rank,
                    first.tensor_name,
                    other.request_rank,
                    other.root_rank
                ));
            }
        }
        RequestType::Allgather => {
            if first.tensor_shape.rank() != other.tensor_shape.rank() {
                return Some(format!(
                    "Mismatched allgather tensor ranks: rank {} sent a {}-d tensor {}, but rank {} sent a {}-d one.",
                    first.request_rank,
                    first.tensor_shape.rank(),
                    first.tensor_name,
                    other.request_rank,
                    other.tensor_shape.rank()
                ));
            }
            if first.tensor_shape.dims().get(1..) != other.tensor_shape.dims().get(1..) {
                return Some(format!(
                    "Mismatched allgather tensor shapes: only the first dimension may differ, \
                     but rank {} sent {} for tensor {} and rank {} sent {}.",
                    first.request_rank,
                    first.tensor_shape,
                    first.tensor_name,
                    other.request_rank,
                    other.tensor_shape
                ));
            }
        }
    }
    None
}

/// Readiness bookkeeping; owned by the coordinator only
#[derive(Debug)]
pub struct MessageTable {
    world_size: usize,
    entries: HashMap<String, TableEntry>,
}

impl MessageTable {
    pub fn new(world_size: usize) -> Self {
        Self {
            world_size,
            entries: HashMap::new(),
        }
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, tensor_name: &str) -> bool {
        self.entries.contains_key(tensor_name)
    }

    /// Ranks that have requested `tensor_name`, ascending
    pub fn ranks_for(&self, tensor_name: &str) -> Vec<usize> {
        self.entries
            .get(tensor_name)
            .map(TableEntry::ranks)
            .unwrap_or_default()
    }

    /// Whether the entry for `tensor_name` already disagrees with itself
    pub fn has_error(&self, tensor_name: &str) -> bool {
        self.entries
            .get(tensor_name)
            .is_some_and(|entry| entry.error.is_some())
    }

    pub fn record(&mut self, request: Request) -> CorralResult<bool> {
        self.record_at(request, Instant::now())
    }

    /// Add a request; returns true once every rank has requested the name
    ///
    /// A second request from the same rank for an in-flight name is rejected
    /// and leaves the entry untouched.
    pub fn record_at(&mut self, request: Request, now: Instant) -> CorralResult<bool> {
        if request.request_rank >= self.world_size {
            return Err(CorralError::InvalidArgument(format!(
                "request for {} from rank {} outside a world of {}",
                request.tensor_name, request.request_rank, self.world_size
            )));
        }

        let world_size = self.world_size;
        let entry = self
            .entries
            .entry(request.tensor_name.clone())
            .or_insert_with(|| TableEntry {
                requests: Vec::with_capacity(world_size),
                first_seen: now,
                error: None,
            });

        if entry
            .requests
            .iter()
            .any(|r| r.request_rank == request.request_rank)
        {
            return Err(CorralError::InvalidArgument(format!(
                "rank {} requested tensor {} twice",
                request.request_rank, request.tensor_name
            )));
        }

        if entry.error.is_none() {
            entry.error = check_alone(&request, world_size).or_else(|| {
                entry
                    .requests
                    .first()
                    .and_then(|first| check_compatible(first, &request))
            });
            if let Some(message) = &entry.error {
                log::warn!("{}", message);
            }
        }

        entry.requests.push(request);
        Ok(entry.requests.len() == world_size)
    }

    /// Remove a ready entry and build the response for it
    pub fn construct_response(&mut self, tensor_name: &str) -> CorralResult<ReadyTensor> {
        let ready = self
            .entries
            .get(tensor_name)
            .is_some_and(|entry| entry.requests.len() == self.world_size);
        if !ready {
            return Err(CorralError::InvalidArgument(format!(
                "tensor {} is not ready on every rank",
                tensor_name
            )));
        }
        let mut entry = self.entries.remove(tensor_name).ok_or_else(|| {
            CorralError::InvalidArgument(format!("tensor {} is not in the message table", tensor_name))
        })?;
        entry.requests.sort_by_key(|r| r.request_rank);

        let first = &entry.requests[0];
        if let Some(message) = entry.error {
            return Ok(ReadyTensor {
                response: Response::error(tensor_name, message),
                byte_size: 0,
                dtype: first.tensor_type,
            });
        }

        let mut response = Response::new(ResponseType::from(first.request_type));
        response.add_tensor_name(tensor_name);
        response.devices = entry.requests.iter().map(|r| r.device).collect();

        let byte_size = match first.request_type {
            RequestType::Allgather => {
                response.tensor_sizes = entry
                    .requests
                    .iter()
                    .map(|r| r.tensor_shape.dim_size(0))
                    .collect();
                entry
                    .requests
                    .iter()
                    .map(Request::byte_size)
                    .fold(0usize, usize::saturating_add)
            }
            RequestType::Allreduce | RequestType::Broadcast => first.byte_size(),
        };

        Ok(ReadyTensor {
            response,
            byte_size,
            dtype: first.tensor_type,
        })
    }

    /// Entries that have been collecting for at least `threshold`
    pub fn stalled_tensors(&self, now: Instant, threshold: Duration) -> Vec<StallReport> {
        let mut reports: Vec<StallReport> = self
            .entries
            .iter()
            .filter_map(|(name, entry)| {
                let waiting = now.saturating_duration_since(entry.first_seen);
                if waiting < threshold {
                    return None;
                }
                let ready_ranks = entry.ranks();
                let missing_ranks = (0..self.world_size)
                    .filter(|rank| ready_ranks.binary_search(rank).is_err())
                    .collect();
                Some(StallReport {
                    tensor_name: name.clone(),
                    ready_ranks,
                    missing_ranks,
                    waiting,
                })
            })
            .collect();
        reports.sort_by(|a, b| a.tensor_name.cmp(&b.tensor_name));
        reports
    }
}
