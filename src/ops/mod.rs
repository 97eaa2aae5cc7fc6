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

//! Collective operations
//!
//! Every operation executes a batch of worker-local entries against the
//! response the coordinator resolved for them. The batch is processed in the
//! order the response names its tensors, which is identical on every rank.
//! The operation set is closed: [`CollectiveOp`] holds one variant per kind
//! and [`OperationManager`] picks the variant for each response.

pub mod allgather;
pub mod allreduce;
pub mod broadcast;
pub mod error;
pub mod hierarchical;

use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::EngineConfig;
use crate::error::{CorralError, CorralResult, Status};
use crate::fusion::FusionBufferManager;
use crate::message::{Response, ResponseType};
use crate::net::CommunicationContext;
use crate::tensor::TensorTableEntry;
use crate::timeline::Timeline;

pub use allgather::{AllgatherImpl, AllgatherOp, AllgatherPlan};
pub use allreduce::AllreduceOp;
pub use broadcast::BroadcastOp;
pub use error::ErrorOp;
pub use hierarchical::HierarchicalAllgather;

/// Fusion buffers shared by the operations of one process
pub type SharedFusionBuffers = Arc<Mutex<FusionBufferManager>>;

pub(crate) fn lock_fusion(
    fusion: &SharedFusionBuffers,
) -> CorralResult<MutexGuard<'_, FusionBufferManager>> {
    fusion
        .lock()
        .map_err(|_| CorralError::transport("fusion buffer lock poisoned"))
}

/// Common execution contract
pub trait CollectiveOperation {
    /// Run the response over `entries`, which are given in response order.
    /// A failure applies to the whole batch.
    fn execute(&mut self, entries: &mut [TensorTableEntry], response: &Response) -> Status;
}

/// Check that the batch matches the response name for name, in order
pub(crate) fn check_batch(entries: &[TensorTableEntry], response: &Response) -> CorralResult<()> {
    let matches = entries.len() == response.tensor_names.len()
        && entries
            .iter()
            .zip(&response.tensor_names)
            .all(|(entry, name)| entry.tensor_name == *name);
    if !matches {
        return Err(CorralError::InvalidArgument(format!(
            "batch [{}] does not match response [{}]",
            entries
                .iter()
                .map(|e| e.tensor_name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            response.tensor_names_string()
        )));
    }
    Ok(())
}

/// Convert the outcome of a batch into a status, logging failures
pub(crate) fn to_status(op: &str, response: &Response, result: CorralResult<()>) -> Status {
    match result {
        Ok(()) => Status::ok(),
        Err(e) => {
            log::error!("{} of [{}] failed: {}", op, response.tensor_names_string(), e);
            e.into()
        }
    }
}

/// Closed set of operation kinds
pub enum CollectiveOp {
    Allreduce(AllreduceOp),
    Allgather(AllgatherOp),
    HierarchicalAllgather(HierarchicalAllgather),
    Broadcast(BroadcastOp),
    Error(ErrorOp),
}

impl CollectiveOp {
    pub fn name(&self) -> &'static str {
        match self {
            CollectiveOp::Allreduce(_) => "allreduce",
            CollectiveOp::Allgather(_) => "allgather",
            CollectiveOp::HierarchicalAllgather(_) => "hierarchical allgather",
            CollectiveOp::Broadcast(_) => "broadcast",
            CollectiveOp::Error(_) => "error",
        }
    }
}

impl CollectiveOperation for CollectiveOp {
    fn execute(&mut self, entries: &mut [TensorTableEntry], response: &Response) -> Status {
        match self {
            CollectiveOp::Allreduce(op) => op.execute(entries, response),
            CollectiveOp::Allgather(op) => op.execute(entries, response),
            CollectiveOp::HierarchicalAllgather(op) => op.execute(entries, response),
            CollectiveOp::Broadcast(op) => op.execute(entries, response),
            CollectiveOp::Error(op) => op.execute(entries, response),
        }
    }
}

/// Routes each response to the operation that executes it
pub struct OperationManager {
    allreduce: CollectiveOp,
    allgather: CollectiveOp,
    broadcast: CollectiveOp,
    error: CollectiveOp,
}

impl OperationManager {
    pub fn new(comm: Arc<dyn CommunicationContext>, config: &EngineConfig) -> Self {
        let timeline = Timeline::new(config.activity_sink.clone());
        let fusion: SharedFusionBuffers =
            Arc::new(Mutex::new(FusionBufferManager::new(config.fusion_threshold)));

        let allgather = if config.hierarchical_allgather {
            CollectiveOp::HierarchicalAllgather(HierarchicalAllgather::new(
                comm.clone(),
                fusion.clone(),
                timeline.clone(),
            ))
        } else {
            CollectiveOp::Allgather(AllgatherOp::new(comm.clone(), fusion.clone(), timeline.clone()))
        };

        Self {
            allreduce: CollectiveOp::Allreduce(AllreduceOp::new(
                comm.clone(),
                fusion,
                timeline.clone(),
            )),
            allgather,
            broadcast: CollectiveOp::Broadcast(BroadcastOp::new(comm, timeline)),
            error: CollectiveOp::Error(ErrorOp),
        }
    }

    /// The operation a response of `response_type` runs on
    pub fn select(&mut self, response_type: ResponseType) -> &mut CollectiveOp {
        match response_type {
            ResponseType::Allreduce => &mut self.allreduce,
            ResponseType::Allgather => &mut self.allgather,
            ResponseType::Broadcast => &mut self.broadcast,
            ResponseType::Error => &mut self.error,
        }
    }

    pub fn execute_operation(
        &mut self,
        entries: &mut [TensorTableEntry],
        response: &Response,
    ) -> Status {
        let op = self.select(response.response_type);
        log::debug!(
            "executing {} for [{}]",
            op.name(),
            response.tensor_names_string()
        );
        op.execute(entries, response)
    }
}
