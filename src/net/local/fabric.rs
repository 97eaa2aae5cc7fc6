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

//! Shared state behind the in-process backend
//!
//! Each process group (global, one per node, one per local rank index) owns a
//! [`Rendezvous`]: every member deposits a contribution, the last arrival
//! publishes all of them, and the round is closed only after every member
//! picked the result up, so a fast rank cannot overwrite a slot of the
//! previous round.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{CorralError, CorralResult};
use crate::net::shared::SharedWindow;

use super::context::LocalContext;

/// Placement of ranks on nodes; ranks are numbered contiguously node by node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    node_sizes: Vec<usize>,
}

impl Topology {
    pub fn new(node_sizes: Vec<usize>) -> CorralResult<Self> {
        if node_sizes.is_empty() || node_sizes.iter().any(|n| *n == 0) {
            return Err(CorralError::InvalidArgument(format!(
                "every node needs at least one rank, got {:?}",
                node_sizes
            )));
        }
        Ok(Self { node_sizes })
    }

    /// `nodes` nodes with `ranks_per_node` ranks each
    pub fn uniform(nodes: usize, ranks_per_node: usize) -> CorralResult<Self> {
        Self::new(vec![ranks_per_node; nodes])
    }

    pub fn single_node(world_size: usize) -> CorralResult<Self> {
        Self::new(vec![world_size])
    }

    pub fn world_size(&self) -> usize {
        self.node_sizes.iter().sum()
    }

    pub fn num_nodes(&self) -> usize {
        self.node_sizes.len()
    }

    pub fn node_sizes(&self) -> &[usize] {
        &self.node_sizes
    }

    pub fn is_homogeneous(&self) -> bool {
        self.node_sizes.windows(2).all(|w| w[0] == w[1])
    }

    /// (node, local rank) of a global rank
    pub fn locate(&self, rank: usize) -> Option<(usize, usize)> {
        let mut first = 0;
        for (node, size) in self.node_sizes.iter().enumerate() {
            if rank < first + size {
                return Some((node, rank - first));
            }
            first += size;
        }
        None
    }

    /// Nodes hosting a rank with this local rank, in node order
    pub(crate) fn cross_members(&self, local_rank: usize) -> Vec<usize> {
        self.node_sizes
            .iter()
            .enumerate()
            .filter(|(_, size)| **size > local_rank)
            .map(|(node, _)| node)
            .collect()
    }
}

#[derive(Debug)]
struct RoundState {
    generation: u64,
    arrived: usize,
    departing: usize,
    slots: Vec<Option<Vec<u8>>>,
    result: Arc<Vec<Vec<u8>>>,
}

/// All-to-all exchange point for one process group
#[derive(Debug)]
pub(crate) struct Rendezvous {
    parties: usize,
    state: Mutex<RoundState>,
    cv: Condvar,
    timeout: Option<Duration>,
}

fn poisoned<T>(_: T) -> CorralError {
    CorralError::transport("rendezvous lock poisoned by a panicking peer")
}

impl Rendezvous {
    pub(crate) fn new(parties: usize, timeout: Option<Duration>) -> Self {
        Self {
            parties,
            state: Mutex::new(RoundState {
                generation: 0,
                arrived: 0,
                departing: 0,
                slots: vec![None; parties],
                result: Arc::new(Vec::new()),
            }),
            cv: Condvar::new(),
            timeout,
        }
    }

    pub(crate) fn parties(&self) -> usize {
        self.parties
    }

    fn wait_while<'a, F>(
        &self,
        mut guard: MutexGuard<'a, RoundState>,
        deadline: Option<Instant>,
        mut condition: F,
    ) -> CorralResult<MutexGuard<'a, RoundState>>
    where
        F: FnMut(&RoundState) -> bool,
    {
        while condition(&guard) {
            guard = match deadline {
                None => self.cv.wait(guard).map_err(poisoned)?,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        // the group is unusable from here on; no recovery is attempted
                        return Err(CorralError::transport(format!(
                            "collective timed out waiting for {} of {} peers",
                            self.parties - guard.arrived,
                            self.parties
                        )));
                    }
                    self.cv
                        .wait_timeout(guard, deadline - now)
                        .map_err(poisoned)?
                        .0
                }
            };
        }
        Ok(guard)
    }

    /// Deposit `data` in `slot` and return every member's contribution
    pub(crate) fn exchange(&self, slot: usize, data: Vec<u8>) -> CorralResult<Arc<Vec<Vec<u8>>>> {
        if slot >= self.parties {
            return Err(CorralError::transport(format!(
                "slot {} outside a group of {}",
                slot, self.parties
            )));
        }
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let guard = self.state.lock().map_err(poisoned)?;
        let mut guard = self.wait_while(guard, deadline, |s| s.departing > 0)?;

        if guard.slots[slot].is_some() {
            return Err(CorralError::transport(format!(
                "slot {} contributed twice in one round",
                slot
            )));
        }
        guard.slots[slot] = Some(data);
        guard.arrived += 1;
        let generation = guard.generation;

        if guard.arrived == self.parties {
            let contributions: Vec<Vec<u8>> = guard
                .slots
                .iter_mut()
                .map(|s| s.take().unwrap_or_default())
                .collect();
            guard.result = Arc::new(contributions);
            guard.arrived = 0;
            guard.departing = self.parties;
            guard.generation += 1;
            self.cv.notify_all();
        } else {
            guard = self.wait_while(guard, deadline, |s| s.generation == generation)?;
        }

        let result = guard.result.clone();
        guard.departing -= 1;
        if guard.departing == 0 {
            self.cv.notify_all();
        }
        Ok(result)
    }
}

/// Per-node state: the local group and the shared window segments
#[derive(Debug)]
pub(crate) struct NodeState {
    pub(crate) rendezvous: Rendezvous,
    pub(crate) windows: Mutex<Vec<Option<SharedWindow>>>,
}

/// Wiring for a whole in-process world
///
/// # Example
///
/// ```rust,ignore
/// let fabric = LocalFabric::new(Topology::uniform(2, 2)?);
/// let contexts = fabric.contexts()?; // one per rank, move each into its thread
/// ```
#[derive(Debug)]
pub struct LocalFabric {
    topology: Topology,
    pub(crate) global: Rendezvous,
    pub(crate) nodes: Vec<NodeState>,
    pub(crate) cross: Vec<Rendezvous>,
}

impl LocalFabric {
    pub fn new(topology: Topology) -> Arc<Self> {
        Self::build(topology, None)
    }

    /// Collectives fail with a transport error instead of waiting forever
    pub fn with_timeout(topology: Topology, timeout: Duration) -> Arc<Self> {
        Self::build(topology, Some(timeout))
    }

    fn build(topology: Topology, timeout: Option<Duration>) -> Arc<Self> {
        let global = Rendezvous::new(topology.world_size(), timeout);
        let nodes = topology
            .node_sizes()
            .iter()
            .map(|size| NodeState {
                rendezvous: Rendezvous::new(*size, timeout),
                windows: Mutex::new(vec![None; *size]),
            })
            .collect();
        let max_local = topology.node_sizes().iter().copied().max().unwrap_or(0);
        let cross = (0..max_local)
            .map(|local_rank| Rendezvous::new(topology.cross_members(local_rank).len(), timeout))
            .collect();

        Arc::new(Self {
            topology,
            global,
            nodes,
            cross,
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn world_size(&self) -> usize {
        self.topology.world_size()
    }

    /// Context for one rank
    pub fn context(self: &Arc<Self>, rank: usize) -> CorralResult<LocalContext> {
        LocalContext::new(self.clone(), rank)
    }

    /// One context per rank, in rank order
    pub fn contexts(self: &Arc<Self>) -> CorralResult<Vec<LocalContext>> {
        (0..self.world_size()).map(|rank| self.context(rank)).collect()
    }
}
