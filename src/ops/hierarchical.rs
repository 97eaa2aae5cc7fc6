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

//! Two-level allgather
//!
//! Ranks of a node write their components straight into a node-shared
//! window owned by local rank 0 (the node leader). Leaders exchange their
//! node's segment over the cross communicator and write the full result back
//! into the window, which every local rank then reads. Only leaders touch the
//! network. Requires a homogeneous layout (equal ranks per node, numbered
//! contiguously); otherwise the flat algorithm is used.

use std::sync::Arc;

use crate::data_types::DataType;
use crate::error::{CorralResult, Status};
use crate::message::Response;
use crate::net::{CommunicationContext, Communicator};
use crate::tensor::TensorTableEntry;
use crate::timeline::{Timeline, CROSS_NODE_ALLGATHER, SHARED_BUFFER_READ, SHARED_BUFFER_WRITE};

use super::allgather::{AllgatherImpl, AllgatherPlan};
use super::{to_status, CollectiveOperation, SharedFusionBuffers};

pub struct HierarchicalAllgather {
    comm: Arc<dyn CommunicationContext>,
    fusion: SharedFusionBuffers,
    timeline: Timeline,
}

impl HierarchicalAllgather {
    pub fn new(
        comm: Arc<dyn CommunicationContext>,
        fusion: SharedFusionBuffers,
        timeline: Timeline,
    ) -> Self {
        Self {
            comm,
            fusion,
            timeline,
        }
    }

    /// Leader step: share this node's segment with the other leaders
    fn cross_node_exchange(&self, gathered: &mut [u8], plan: &AllgatherPlan) -> CorralResult<()> {
        let comm = &self.comm;
        let local_size = comm.local_size();
        let cross_size = comm.cross_size();

        // node n hosts ranks [n * local_size, (n + 1) * local_size)
        let node_counts: Vec<usize> = (0..cross_size)
            .map(|node| {
                plan.recvcounts[node * local_size..(node + 1) * local_size]
                    .iter()
                    .sum()
            })
            .collect();
        let node_displs: Vec<usize> = (0..cross_size)
            .map(|node| plan.displcmnts[node * local_size])
            .collect();

        let own = comm.cross_rank();
        let start = node_displs[own] * plan.element_size;
        let end = start + node_counts[own] * plan.element_size;
        let segment = gathered[start..end].to_vec();

        // counts go out in bytes
        let byte_counts: Vec<usize> = node_counts.iter().map(|c| c * plan.element_size).collect();
        let byte_displs: Vec<usize> = node_displs.iter().map(|d| d * plan.element_size).collect();
        comm.allgatherv(
            &segment,
            gathered,
            &byte_counts,
            &byte_displs,
            DataType::UInt8,
            Communicator::Cross,
        )
    }
}

impl AllgatherImpl for HierarchicalAllgather {
    fn comm(&self) -> &Arc<dyn CommunicationContext> {
        &self.comm
    }

    fn fusion(&self) -> &SharedFusionBuffers {
        &self.fusion
    }

    fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    fn do_allgather(&mut self, entries: &mut [TensorTableEntry], plan: &AllgatherPlan) -> CorralResult<()> {
        let comm = self.comm.clone();
        if !comm.is_homogeneous() {
            log::debug!("node layout is not homogeneous, using flat allgather");
            let mut flat = super::AllgatherOp::new(comm, self.fusion.clone(), self.timeline.clone());
            return flat.do_allgather(entries, plan);
        }

        let is_leader = comm.local_rank() == 0;
        comm.allocate_shared_buffer(
            if is_leader { plan.total_bytes() } else { 0 },
            plan.element_size,
        )?;

        // the window is released whether or not the gather went through
        let gathered = self.gather_through_window(entries, plan, is_leader);
        let freed = comm.free_shared_buffer();
        if let (Err(e), Err(free_err)) = (&gathered, &freed) {
            log::error!("releasing shared window after {} also failed: {}", e, free_err);
        }
        gathered.and(freed)
    }
}

impl HierarchicalAllgather {
    fn gather_through_window(
        &self,
        entries: &mut [TensorTableEntry],
        plan: &AllgatherPlan,
        is_leader: bool,
    ) -> CorralResult<()> {
        let comm = &self.comm;
        let total_bytes = plan.total_bytes();
        let window = comm.query_shared_buffer(0)?;

        self.timeline.activity_start_all(entries, SHARED_BUFFER_WRITE);
        let rank = comm.rank();
        let block = plan.send_buffer(entries, rank)?;
        window.write(plan.displcmnts[rank] * plan.element_size, &block)?;
        self.timeline.activity_end_all(entries);
        comm.barrier(Communicator::Local)?;

        if is_leader {
            self.timeline.activity_start_all(entries, CROSS_NODE_ALLGATHER);
            let mut gathered = window.read_vec(0, total_bytes)?;
            self.cross_node_exchange(&mut gathered, plan)?;
            window.write(0, &gathered)?;
            self.timeline.activity_end_all(entries);
        }
        comm.barrier(Communicator::Local)?;

        self.timeline.activity_start_all(entries, SHARED_BUFFER_READ);
        let gathered = window.read_vec(0, total_bytes)?;
        plan.demultiplex(&gathered, entries)?;
        self.timeline.activity_end_all(entries);
        Ok(())
    }
}

impl CollectiveOperation for HierarchicalAllgather {
    fn execute(&mut self, entries: &mut [TensorTableEntry], response: &Response) -> Status {
        let result = self.execute_allgather(entries, response);
        to_status("hierarchical allgather", response, result)
    }
}
