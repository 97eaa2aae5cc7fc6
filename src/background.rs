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

//! Background communication loop
//!
//! One thread per process. Every cycle it:
//! 1. drains the requests queued since the previous cycle
//! 2. gathers every rank's request list on rank zero
//! 3. on rank zero, runs the coordinator and encodes the response list
//! 4. broadcasts the response list and executes it, in order, on every rank
//!
//! The training thread only touches the [`TensorQueue`]; coordinator state
//! stays inside this loop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::coordinator::Coordinator;
use crate::error::{CorralError, CorralResult, Status};
use crate::message::{Request, RequestList, Response, ResponseList};
use crate::net::CommunicationContext;
use crate::ops::OperationManager;
use crate::tensor::TensorTableEntry;

const COORDINATOR_RANK: usize = 0;

/// Entries waiting for a response plus requests not yet sent
#[derive(Debug, Default)]
pub struct TensorQueue {
    entries: HashMap<String, TensorTableEntry>,
    message_queue: VecDeque<Request>,
    closed: bool,
}

impl TensorQueue {
    /// Queue a new entry and its request; names must be unique while pending
    pub fn add(&mut self, entry: TensorTableEntry, request: Request) -> CorralResult<()> {
        if self.closed {
            return Err(CorralError::Aborted(format!(
                "engine has shut down, {} was not submitted",
                entry.tensor_name
            )));
        }
        if self.entries.contains_key(&entry.tensor_name) {
            return Err(CorralError::InvalidArgument(format!(
                "a tensor named {} is already pending on this rank",
                entry.tensor_name
            )));
        }
        self.entries.insert(entry.tensor_name.clone(), entry);
        self.message_queue.push_back(request);
        Ok(())
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

    pub fn pop_messages(&mut self) -> Vec<Request> {
        self.message_queue.drain(..).collect()
    }

    /// Remove the entries a response names, in response order
    pub fn take_entries(&mut self, names: &[String]) -> CorralResult<Vec<TensorTableEntry>> {
        if let Some(missing) = names.iter().find(|name| !self.entries.contains_key(*name)) {
            return Err(CorralError::transport(format!(
                "response names {} which is not pending on this rank",
                missing
            )));
        }
        Ok(names
            .iter()
            .filter_map(|name| self.entries.remove(name))
            .collect())
    }

    /// Refuse further submissions and hand back everything still pending
    pub fn close(&mut self) -> Vec<TensorTableEntry> {
        self.closed = true;
        self.message_queue.clear();
        self.entries.drain().map(|(_, entry)| entry).collect()
    }
}

/// State shared between the submitting threads and the loop
#[derive(Debug, Default)]
pub struct SharedState {
    queue: Mutex<TensorQueue>,
    shut_down: AtomicBool,
    loop_finished: AtomicBool,
}

impl SharedState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn queue(&self) -> CorralResult<MutexGuard<'_, TensorQueue>> {
        self.queue
            .lock()
            .map_err(|_| CorralError::transport("tensor queue lock poisoned"))
    }

    pub fn request_shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn loop_finished(&self) -> bool {
        self.loop_finished.load(Ordering::SeqCst)
    }
}

/// What this process does in a coordination round
enum Role {
    Coordinator(Box<Coordinator>),
    Worker,
}

pub struct BackgroundLoop {
    comm: Arc<dyn CommunicationContext>,
    state: Arc<SharedState>,
    role: Role,
    ops: OperationManager,
    cycle_time: Duration,
}

impl BackgroundLoop {
    pub fn new(
        comm: Arc<dyn CommunicationContext>,
        state: Arc<SharedState>,
        config: &EngineConfig,
    ) -> Self {
        let role = if comm.rank() == COORDINATOR_RANK {
            Role::Coordinator(Box::new(Coordinator::new(comm.size(), config)))
        } else {
            Role::Worker
        };
        Self {
            ops: OperationManager::new(comm.clone(), config),
            comm,
            state,
            role,
            cycle_time: config.cycle_time,
        }
    }

    /// Run until a shutdown round or a transport failure
    pub fn run(mut self) {
        let rank = self.comm.rank();
        log::debug!("background loop started on rank {}", rank);

        let final_status = loop {
            match self.run_once() {
                Ok(true) => continue,
                Ok(false) => break Status::aborted("engine shut down before the tensor completed"),
                Err(e) => {
                    log::error!("background loop on rank {} failed: {}", rank, e);
                    break Status::from(e);
                }
            }
        };

        let leftovers = match self.state.queue() {
            Ok(mut queue) => queue.close(),
            Err(e) => {
                log::error!("cannot drain pending tensors on rank {}: {}", rank, e);
                Vec::new()
            }
        };
        if !leftovers.is_empty() {
            log::debug!(
                "failing {} pending tensors on rank {}: {}",
                leftovers.len(),
                rank,
                final_status
            );
        }
        for entry in leftovers {
            entry.finish(&final_status);
        }
        self.state.loop_finished.store(true, Ordering::SeqCst);
        log::debug!("background loop stopped on rank {}", rank);
    }

    /// One coordination round; returns false once the group shut down
    pub fn run_once(&mut self) -> CorralResult<bool> {
        thread::sleep(self.cycle_time);

        let request_list = RequestList {
            requests: self.state.queue()?.pop_messages(),
            shutdown: self.state.shutdown_requested(),
        };
        let gathered = self
            .comm
            .gather_bytes(&request_list.encode()?, COORDINATOR_RANK)?;

        let mut encoded = match &mut self.role {
            Role::Coordinator(coordinator) => {
                let lists = gathered
                    .iter()
                    .map(|raw| RequestList::decode(raw))
                    .collect::<CorralResult<Vec<_>>>()?;
                coordinator.process(lists).encode()?
            }
            Role::Worker => Vec::new(),
        };
        self.comm.broadcast_bytes(&mut encoded, COORDINATOR_RANK)?;
        let response_list = ResponseList::decode(&encoded)?;

        for response in &response_list.responses {
            self.perform_operation(response)?;
        }
        Ok(!response_list.shutdown)
    }

    fn perform_operation(&mut self, response: &Response) -> CorralResult<()> {
        let mut entries = self.state.queue()?.take_entries(&response.tensor_names)?;
        let status = self.ops.execute_operation(&mut entries, response);
        for entry in entries {
            entry.finish(&status);
        }
        Ok(())
    }
}
