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

//! Allreduce (sum) over a batch of entries
//!
//! A single entry is reduced in its own output buffer. Several entries are
//! packed into the fusion buffer and reduced with one transport call.

use std::sync::Arc;

use crate::error::{CorralResult, Status};
use crate::fusion::FusionLayout;
use crate::message::Response;
use crate::net::{CommunicationContext, Communicator, ReduceOp};
use crate::tensor::TensorTableEntry;
use crate::timeline::{Timeline, MEMCPY_IN_FUSION_BUFFER, MEMCPY_OUT_FUSION_BUFFER, WAIT_FOR_DATA};

use super::{check_batch, lock_fusion, to_status, CollectiveOperation, SharedFusionBuffers};

pub struct AllreduceOp {
    comm: Arc<dyn CommunicationContext>,
    fusion: SharedFusionBuffers,
    timeline: Timeline,
}

impl AllreduceOp {
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

    fn allreduce_single(&self, entries: &mut [TensorTableEntry]) -> CorralResult<()> {
        let activity = self.comm.allreduce_activity();
        self.timeline.activity_start_all(entries, activity);
        let entry = &mut entries[0];
        let num_elements = entry.num_elements();
        entry.output = entry.input.clone();
        self.comm.allreduce(
            &mut entry.output,
            num_elements,
            entry.dtype,
            ReduceOp::Sum,
            Communicator::Global,
        )?;
        self.timeline.activity_end_all(entries);
        Ok(())
    }

    fn allreduce_fused(&self, entries: &mut [TensorTableEntry]) -> CorralResult<()> {
        let layout = FusionLayout::plan(entries)?;
        let dtype = entries[0].dtype;
        let device = entries[0].device;
        let mut manager = lock_fusion(&self.fusion)?;

        self.timeline.activity_start_all(entries, MEMCPY_IN_FUSION_BUFFER);
        let fence = manager.memcpy_in(device, entries, &layout)?;
        self.timeline.activity_end_all(entries);

        self.timeline.activity_start_all(entries, WAIT_FOR_DATA);
        let mut buffer = fence.synchronize();
        self.timeline.activity_end_all(entries);

        self.timeline.activity_start_all(entries, self.comm.allreduce_activity());
        self.comm.allreduce(
            buffer.data_mut(),
            layout.num_elements(),
            dtype,
            ReduceOp::Sum,
            Communicator::Global,
        )?;
        self.timeline.activity_end_all(entries);

        self.timeline.activity_start_all(entries, MEMCPY_OUT_FUSION_BUFFER);
        buffer.memcpy_out(entries, &layout)?;
        self.timeline.activity_end_all(entries);
        Ok(())
    }

    fn allreduce(&self, entries: &mut [TensorTableEntry], response: &Response) -> CorralResult<()> {
        check_batch(entries, response)?;
        if entries.is_empty() {
            return Ok(());
        }
        if entries.len() == 1 {
            self.allreduce_single(entries)?;
        } else {
            self.allreduce_fused(entries)?;
        }
        for entry in entries.iter_mut() {
            entry.output_shape = entry.shape.clone();
        }
        Ok(())
    }
}

impl CollectiveOperation for AllreduceOp {
    fn execute(&mut self, entries: &mut [TensorTableEntry], response: &Response) -> Status {
        to_status("allreduce", response, self.allreduce(entries, response))
    }
}
