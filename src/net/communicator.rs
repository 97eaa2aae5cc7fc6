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

//! Communication context trait
//!
//! This module defines the capability interface every transport backend
//! (in-process, MPI, ...) implements. Operations and the coordinator only
//! ever talk to `dyn CommunicationContext`.

use crate::data_types::DataType;
use crate::error::CorralResult;

use super::comm_operations::ReduceOp;
use super::shared::SharedWindow;
use super::CommType;

/// Which process group a collective runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Communicator {
    /// Every rank
    Global,
    /// Ranks sharing a physical node
    Local,
    /// Ranks with the same local rank, one per node
    Cross,
}

/// Transport capability interface
///
/// Every collective blocks until all members of the selected group have made
/// the matching call. Counts and displacements are expressed in elements of
/// the given data type.
pub trait CommunicationContext: Send + Sync {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    fn local_rank(&self) -> usize;
    fn local_size(&self) -> usize;
    fn cross_rank(&self) -> usize;
    fn cross_size(&self) -> usize;

    /// Every node hosts the same number of ranks, numbered contiguously
    fn is_homogeneous(&self) -> bool;

    fn comm_type(&self) -> CommType;

    /// Reduce `buffer` in place across the group
    fn allreduce(
        &self,
        buffer: &mut [u8],
        num_elements: usize,
        dtype: DataType,
        op: ReduceOp,
        comm: Communicator,
    ) -> CorralResult<()>;

    /// Variable-size gather to every member
    ///
    /// # Arguments
    /// * `send` - This rank's contribution, `recvcounts[my_index]` elements
    /// * `recv` - Receives member `i`'s contribution at `displs[i]`
    /// * `recvcounts` - Elements contributed by each member
    /// * `displs` - Element offset of each member's contribution in `recv`
    fn allgatherv(
        &self,
        send: &[u8],
        recv: &mut [u8],
        recvcounts: &[usize],
        displs: &[usize],
        dtype: DataType,
        comm: Communicator,
    ) -> CorralResult<()>;

    /// Overwrite `buffer` on every member with the root's copy
    fn broadcast(
        &self,
        buffer: &mut [u8],
        dtype: DataType,
        root_rank: usize,
        comm: Communicator,
    ) -> CorralResult<()>;

    fn barrier(&self, comm: Communicator) -> CorralResult<()>;

    /// Collectively allocate a node-local shared window; each local rank
    /// contributes a segment of `window_size` bytes (zero is allowed).
    fn allocate_shared_buffer(&self, window_size: usize, element_size: usize) -> CorralResult<()>;

    /// Segment contributed by `local_rank` to the current window
    fn query_shared_buffer(&self, local_rank: usize) -> CorralResult<SharedWindow>;

    /// Collectively release the current window
    fn free_shared_buffer(&self) -> CorralResult<()>;

    fn get_type_size(&self, dtype: DataType) -> usize {
        dtype.size()
    }

    // Control-plane byte collectives over the global group

    /// Gather opaque byte strings to `root`; other ranks get an empty vector
    fn gather_bytes(&self, data: &[u8], root: usize) -> CorralResult<Vec<Vec<u8>>>;

    /// Replace `data` on every rank with the root's bytes
    fn broadcast_bytes(&self, data: &mut Vec<u8>, root: usize) -> CorralResult<()>;

    /// Every member receives every member's bytes, indexed by group rank
    fn allgather_bytes(&self, data: &[u8], comm: Communicator) -> CorralResult<Vec<Vec<u8>>>;

    // Activity labels for telemetry

    fn allreduce_activity(&self) -> &'static str;
    fn allgather_activity(&self) -> &'static str;
    fn broadcast_activity(&self) -> &'static str;
}
