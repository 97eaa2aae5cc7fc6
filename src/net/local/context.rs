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

//! In-process communication context
//!
//! Every collective is an exchange of contributions through the group's
//! rendezvous followed by a purely local step. Reductions fold contributions
//! in group-rank order, so all members compute bit-identical results.

use std::sync::Arc;

use crate::data_types::DataType;
use crate::error::{CorralError, CorralResult};
use crate::net::comm_operations::{reduce_into, ReduceOp};
use crate::net::communicator::{CommunicationContext, Communicator};
use crate::net::shared::SharedWindow;
use crate::net::CommType;

use super::fabric::{LocalFabric, Rendezvous};

pub const LOCAL_ALLREDUCE: &str = "LOCAL_ALLREDUCE";
pub const LOCAL_ALLGATHER: &str = "LOCAL_ALLGATHER";
pub const LOCAL_BCAST: &str = "LOCAL_BCAST";

/// One rank's view of a [`LocalFabric`]
#[derive(Debug, Clone)]
pub struct LocalContext {
    fabric: Arc<LocalFabric>,
    rank: usize,
    node: usize,
    local_rank: usize,
    local_size: usize,
    cross_rank: usize,
    cross_size: usize,
}

impl LocalContext {
    pub(crate) fn new(fabric: Arc<LocalFabric>, rank: usize) -> CorralResult<Self> {
        let topology = fabric.topology();
        let (node, local_rank) = topology.locate(rank).ok_or_else(|| {
            CorralError::InvalidArgument(format!(
                "rank {} outside a world of {}",
                rank,
                topology.world_size()
            ))
        })?;
        let local_size = topology.node_sizes()[node];
        let cross_members = topology.cross_members(local_rank);
        let cross_rank = cross_members
            .iter()
            .position(|n| *n == node)
            .unwrap_or_default();
        let cross_size = cross_members.len();

        Ok(Self {
            fabric,
            rank,
            node,
            local_rank,
            local_size,
            cross_rank,
            cross_size,
        })
    }

    pub fn node(&self) -> usize {
        self.node
    }

    fn group(&self, comm: Communicator) -> (&Rendezvous, usize) {
        match comm {
            Communicator::Global => (&self.fabric.global, self.rank),
            Communicator::Local => (&self.fabric.nodes[self.node].rendezvous, self.local_rank),
            Communicator::Cross => (&self.fabric.cross[self.local_rank], self.cross_rank),
        }
    }

    fn exchange(&self, comm: Communicator, data: Vec<u8>) -> CorralResult<Arc<Vec<Vec<u8>>>> {
        let (rendezvous, slot) = self.group(comm);
        rendezvous.exchange(slot, data)
    }
}

impl CommunicationContext for LocalContext {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.fabric.world_size()
    }

    fn local_rank(&self) -> usize {
        self.local_rank
    }

    fn local_size(&self) -> usize {
        self.local_size
    }

    fn cross_rank(&self) -> usize {
        self.cross_rank
    }

    fn cross_size(&self) -> usize {
        self.cross_size
    }

    fn is_homogeneous(&self) -> bool {
        self.fabric.topology().is_homogeneous()
    }

    fn comm_type(&self) -> CommType {
        CommType::Local
    }

    fn allreduce(
        &self,
        buffer: &mut [u8],
        num_elements: usize,
        dtype: DataType,
        op: ReduceOp,
        comm: Communicator,
    ) -> CorralResult<()> {
        let expected = num_elements * dtype.size();
        if buffer.len() != expected {
            return Err(CorralError::transport(format!(
                "allreduce of {} {} elements needs {} bytes, buffer has {}",
                num_elements,
                dtype,
                expected,
                buffer.len()
            )));
        }

        let contributions = self.exchange(comm, buffer.to_vec())?;
        let mut acc = contributions[0].clone();
        for contribution in contributions.iter().skip(1) {
            reduce_into(&mut acc, contribution, dtype, op)?;
        }
        buffer.copy_from_slice(&acc);
        Ok(())
    }

    fn allgatherv(
        &self,
        send: &[u8],
        recv: &mut [u8],
        recvcounts: &[usize],
        displs: &[usize],
        dtype: DataType,
        comm: Communicator,
    ) -> CorralResult<()> {
        let (rendezvous, slot) = self.group(comm);
        if recvcounts.len() != rendezvous.parties() || displs.len() != rendezvous.parties() {
            return Err(CorralError::transport(format!(
                "allgatherv over {} members got {} counts and {} displacements",
                rendezvous.parties(),
                recvcounts.len(),
                displs.len()
            )));
        }
        let element_size = dtype.size();
        if send.len() != recvcounts[slot] * element_size {
            return Err(CorralError::transport(format!(
                "allgatherv contribution of {} bytes does not match count {}",
                send.len(),
                recvcounts[slot]
            )));
        }

        let contributions = rendezvous.exchange(slot, send.to_vec())?;
        for (member, contribution) in contributions.iter().enumerate() {
            if contribution.len() != recvcounts[member] * element_size {
                return Err(CorralError::transport(format!(
                    "member {} contributed {} bytes, expected {} elements",
                    member,
                    contribution.len(),
                    recvcounts[member]
                )));
            }
            let start = displs[member] * element_size;
            let end = start + contribution.len();
            if end > recv.len() {
                return Err(CorralError::transport(format!(
                    "allgatherv receive buffer of {} bytes too small for [{}, {})",
                    recv.len(),
                    start,
                    end
                )));
            }
            recv[start..end].copy_from_slice(contribution);
        }
        Ok(())
    }

    fn broadcast(
        &self,
        buffer: &mut [u8],
        _dtype: DataType,
        root_rank: usize,
        comm: Communicator,
    ) -> CorralResult<()> {
        let (rendezvous, slot) = self.group(comm);
        if root_rank >= rendezvous.parties() {
            return Err(CorralError::transport(format!(
                "broadcast root {} outside a group of {}",
                root_rank,
                rendezvous.parties()
            )));
        }
        let data = if slot == root_rank {
            buffer.to_vec()
        } else {
            Vec::new()
        };
        let contributions = rendezvous.exchange(slot, data)?;
        let root_data = &contributions[root_rank];
        if root_data.len() != buffer.len() {
            return Err(CorralError::transport(format!(
                "broadcast root sent {} bytes into a buffer of {}",
                root_data.len(),
                buffer.len()
            )));
        }
        buffer.copy_from_slice(root_data);
        Ok(())
    }

    fn barrier(&self, comm: Communicator) -> CorralResult<()> {
        self.exchange(comm, Vec::new()).map(|_| ())
    }

    fn allocate_shared_buffer(&self, window_size: usize, _element_size: usize) -> CorralResult<()> {
        {
            let mut windows = self.fabric.nodes[self.node]
                .windows
                .lock()
                .map_err(|_| CorralError::transport("window table lock poisoned"))?;
            windows[self.local_rank] = Some(SharedWindow::heap(window_size));
        }
        // nobody queries a segment before every local rank has published its own
        self.barrier(Communicator::Local)
    }

    fn query_shared_buffer(&self, local_rank: usize) -> CorralResult<SharedWindow> {
        let windows = self.fabric.nodes[self.node]
            .windows
            .lock()
            .map_err(|_| CorralError::transport("window table lock poisoned"))?;
        windows
            .get(local_rank)
            .and_then(|w| w.clone())
            .ok_or_else(|| {
                CorralError::transport(format!(
                    "local rank {} has no shared buffer on node {}",
                    local_rank, self.node
                ))
            })
    }

    fn free_shared_buffer(&self) -> CorralResult<()> {
        self.barrier(Communicator::Local)?;
        let mut windows = self.fabric.nodes[self.node]
            .windows
            .lock()
            .map_err(|_| CorralError::transport("window table lock poisoned"))?;
        windows[self.local_rank] = None;
        Ok(())
    }

    fn gather_bytes(&self, data: &[u8], root: usize) -> CorralResult<Vec<Vec<u8>>> {
        let contributions = self.exchange(Communicator::Global, data.to_vec())?;
        if self.rank == root {
            Ok(contributions.to_vec())
        } else {
            Ok(Vec::new())
        }
    }

    fn broadcast_bytes(&self, data: &mut Vec<u8>, root: usize) -> CorralResult<()> {
        let mine = if self.rank == root {
            data.clone()
        } else {
            Vec::new()
        };
        let contributions = self.exchange(Communicator::Global, mine)?;
        let root_data = contributions.get(root).ok_or_else(|| {
            CorralError::transport(format!("broadcast root {} does not exist", root))
        })?;
        *data = root_data.clone();
        Ok(())
    }

    fn allgather_bytes(&self, data: &[u8], comm: Communicator) -> CorralResult<Vec<Vec<u8>>> {
        Ok(self.exchange(comm, data.to_vec())?.to_vec())
    }

    fn allreduce_activity(&self) -> &'static str {
        LOCAL_ALLREDUCE
    }

    fn allgather_activity(&self) -> &'static str {
        LOCAL_ALLGATHER
    }

    fn broadcast_activity(&self) -> &'static str {
        LOCAL_BCAST
    }
}
