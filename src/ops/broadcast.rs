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

//! Broadcast from each entry's root rank; one transport call per entry

use std::sync::Arc;

use crate::error::{CorralResult, Status};
use crate::message::Response;
use crate::net::{CommunicationContext, Communicator};
use crate::tensor::TensorTableEntry;
use crate::timeline::Timeline;

use super::{check_batch, to_status, CollectiveOperation};

pub struct BroadcastOp {
    comm: Arc<dyn CommunicationContext>,
    timeline: Timeline,
}

impl BroadcastOp {
    pub fn new(comm: Arc<dyn CommunicationContext>, timeline: Timeline) -> Self {
        Self { comm, timeline }
    }

    fn broadcast(&self, entries: &mut [TensorTableEntry], response: &Response) -> CorralResult<()> {
        check_batch(entries, response)?;
        let rank = self.comm.rank();
        for idx in 0..entries.len() {
            self.timeline
                .activity_start_all(&entries[idx..=idx], self.comm.broadcast_activity());
            let entry = &mut entries[idx];
            // non-root ranks receive into a fresh buffer of the same size
            entry.output = if rank == entry.root_rank {
                entry.input.clone()
            } else {
                vec![0u8; entry.input.len()]
            };
            self.comm.broadcast(
                &mut entry.output,
                entry.dtype,
                entry.root_rank,
                Communicator::Global,
            )?;
            entry.output_shape = entry.shape.clone();
            self.timeline.activity_end_all(&entries[idx..=idx]);
        }
        Ok(())
    }
}

impl CollectiveOperation for BroadcastOp {
    fn execute(&mut self, entries: &mut [TensorTableEntry], response: &Response) -> Status {
        to_status("broadcast", response, self.broadcast(entries, response))
    }
}
