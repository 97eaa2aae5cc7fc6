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

//! Allgather with ragged first dimensions
//!
//! The architecture follows a two-level design:
//! 1. [`AllgatherImpl::execute_allgather`] resolves every rank's first
//!    dimension, builds an [`AllgatherPlan`] and shapes the outputs
//! 2. [`AllgatherImpl::do_allgather`] moves the bytes and can be overridden
//!    (see the hierarchical variant)
//!
//! The gathered buffer is rank-major: rank `r`'s block starts at
//! `displcmnts[r]` and holds that rank's component of every entry, in batch
//! order.

use std::sync::Arc;

use crate::error::{CorralError, CorralResult, Status};
use crate::message::Response;
use crate::net::{CommunicationContext, Communicator};
use crate::tensor::{TensorShape, TensorTableEntry};
use crate::timeline::{Timeline, MEMCPY_OUT_FUSION_BUFFER, SIZE_EXCHANGE};

use super::{check_batch, lock_fusion, to_status, CollectiveOperation, SharedFusionBuffers};

/// Counts and offsets for one gathered batch, all in elements
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllgatherPlan {
    /// Elements contributed by each rank, summed over entries
    pub recvcounts: Vec<usize>,
    /// Offset of each rank's block in the gathered buffer
    pub displcmnts: Vec<usize>,
    /// `[entry][rank]` offset of the entry's component inside the rank's block
    pub entry_component_offsets: Vec<Vec<usize>>,
    /// `[entry][rank]` size of the entry's component
    pub entry_component_sizes: Vec<Vec<usize>>,
    pub total_num_elements: usize,
    pub element_size: usize,
}

impl AllgatherPlan {
    /// Build the plan from every rank's first dimension of every entry
    ///
    /// # Arguments
    /// * `first_dims` - `[entry][rank]` first-dimension sizes
    /// * `slice_elements` - elements per first-dimension slice, per entry
    /// * `element_size` - bytes per element, shared by the batch
    pub fn new(first_dims: &[Vec<i64>], slice_elements: &[usize], element_size: usize) -> Self {
        let world_size = first_dims.first().map_or(0, |dims| dims.len());
        let entry_component_sizes: Vec<Vec<usize>> = first_dims
            .iter()
            .zip(slice_elements)
            .map(|(dims, slice)| dims.iter().map(|d| (*d).max(0) as usize * slice).collect())
            .collect();

        let mut entry_component_offsets = vec![vec![0usize; world_size]; first_dims.len()];
        let mut recvcounts = vec![0usize; world_size];
        for rank in 0..world_size {
            for (entry, sizes) in entry_component_sizes.iter().enumerate() {
                entry_component_offsets[entry][rank] = recvcounts[rank];
                recvcounts[rank] += sizes[rank];
            }
        }

        let mut displcmnts = Vec::with_capacity(world_size);
        let mut total_num_elements = 0;
        for count in &recvcounts {
            displcmnts.push(total_num_elements);
            total_num_elements += count;
        }

        Self {
            recvcounts,
            displcmnts,
            entry_component_offsets,
            entry_component_sizes,
            total_num_elements,
            element_size,
        }
    }

    pub fn world_size(&self) -> usize {
        self.recvcounts.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_num_elements * self.element_size
    }

    /// Byte range of `entry`'s component from `rank` in the gathered buffer
    pub fn component_range(&self, entry: usize, rank: usize) -> std::ops::Range<usize> {
        let start =
            (self.displcmnts[rank] + self.entry_component_offsets[entry][rank]) * self.element_size;
        start..start + self.entry_component_sizes[entry][rank] * self.element_size
    }

    /// Concatenation of this rank's inputs, in batch order
    pub fn send_buffer(&self, entries: &[TensorTableEntry], rank: usize) -> CorralResult<Vec<u8>> {
        let mut send = Vec::with_capacity(self.recvcounts[rank] * self.element_size);
        for (idx, entry) in entries.iter().enumerate() {
            let expected = self.entry_component_sizes[idx][rank] * self.element_size;
            if entry.input.len() != expected {
                return Err(CorralError::InvalidArgument(format!(
                    "{} holds {} bytes, gather plan expects {}",
                    entry.tensor_name,
                    entry.input.len(),
                    expected
                )));
            }
            send.extend_from_slice(&entry.input);
        }
        Ok(send)
    }

    /// Split a gathered buffer into per-entry outputs, rank after rank
    pub fn demultiplex(&self, gathered: &[u8], entries: &mut [TensorTableEntry]) -> CorralResult<()> {
        if gathered.len() < self.total_bytes() {
            return Err(CorralError::transport(format!(
                "gathered {} bytes, plan needs {}",
                gathered.len(),
                self.total_bytes()
            )));
        }
        for (idx, entry) in entries.iter_mut().enumerate() {
            let len: usize = self.entry_component_sizes[idx].iter().sum::<usize>() * self.element_size;
            let mut output = Vec::with_capacity(len);
            for rank in 0..self.world_size() {
                output.extend_from_slice(&gathered[self.component_range(idx, rank)]);
            }
            entry.output = output;
        }
        Ok(())
    }
}

fn decode_dims(raw: &[u8], expected: usize, rank: usize) -> CorralResult<Vec<i64>> {
    if raw.len() != expected * 8 {
        return Err(CorralError::transport(format!(
            "rank {} sent {} bytes of sizes, expected {}",
            rank,
            raw.len(),
            expected * 8
        )));
    }
    Ok(raw
        .chunks_exact(8)
        .map(|chunk| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            i64::from_le_bytes(bytes)
        })
        .collect())
}

/// Gather contract shared by the flat and hierarchical variants
pub trait AllgatherImpl {
    fn comm(&self) -> &Arc<dyn CommunicationContext>;
    fn fusion(&self) -> &SharedFusionBuffers;
    fn timeline(&self) -> &Timeline;

    /// `[entry][rank]` first dimensions
    ///
    /// Taken from the response when the coordinator filled them in, exchanged
    /// between all ranks otherwise.
    fn component_first_dims(
        &self,
        entries: &[TensorTableEntry],
        response: &Response,
    ) -> CorralResult<Vec<Vec<i64>>> {
        let world_size = self.comm().size();
        if response.tensor_sizes.len() == entries.len() * world_size {
            return Ok(response
                .tensor_sizes
                .chunks(world_size.max(1))
                .map(|chunk| chunk.to_vec())
                .collect());
        }

        self.timeline().activity_start_all(entries, SIZE_EXCHANGE);
        let mine: Vec<u8> = entries
            .iter()
            .flat_map(|e| e.shape.dim_size(0).to_le_bytes())
            .collect();
        let all = self.comm().allgather_bytes(&mine, Communicator::Global)?;
        self.timeline().activity_end_all(entries);

        let per_rank = all
            .iter()
            .enumerate()
            .map(|(rank, raw)| decode_dims(raw, entries.len(), rank))
            .collect::<CorralResult<Vec<_>>>()?;
        Ok((0..entries.len())
            .map(|idx| per_rank.iter().map(|dims| dims[idx]).collect())
            .collect())
    }

    /// Move the bytes described by `plan` into every entry's output
    fn do_allgather(&mut self, entries: &mut [TensorTableEntry], plan: &AllgatherPlan) -> CorralResult<()> {
        let comm = self.comm().clone();
        let send = plan.send_buffer(entries, comm.rank())?;
        let dtype = entries[0].dtype;

        if entries.len() == 1 {
            let mut recv = vec![0u8; plan.total_bytes()];
            self.timeline().activity_start_all(entries, comm.allgather_activity());
            comm.allgatherv(
                &send,
                &mut recv,
                &plan.recvcounts,
                &plan.displcmnts,
                dtype,
                Communicator::Global,
            )?;
            self.timeline().activity_end_all(entries);
            return plan.demultiplex(&recv, entries);
        }

        let mut manager = lock_fusion(self.fusion())?;
        let mut buffer = manager.receive_region(entries[0].device, plan.total_bytes());
        self.timeline().activity_start_all(entries, comm.allgather_activity());
        comm.allgatherv(
            &send,
            buffer.data_mut(),
            &plan.recvcounts,
            &plan.displcmnts,
            dtype,
            Communicator::Global,
        )?;
        self.timeline().activity_end_all(entries);

        self.timeline().activity_start_all(entries, MEMCPY_OUT_FUSION_BUFFER);
        plan.demultiplex(buffer.data(), entries)?;
        self.timeline().activity_end_all(entries);
        Ok(())
    }

    /// Resolve sizes, gather, and shape every output as `[sum of first dims, rest...]`
    fn execute_allgather(
        &mut self,
        entries: &mut [TensorTableEntry],
        response: &Response,
    ) -> CorralResult<()> {
        check_batch(entries, response)?;
        if entries.is_empty() {
            return Ok(());
        }
        if let Some(scalar) = entries.iter().find(|e| e.shape.rank() == 0) {
            return Err(CorralError::InvalidArgument(format!(
                "cannot allgather scalar {}",
                scalar.tensor_name
            )));
        }

        let first_dims = self.component_first_dims(entries, response)?;
        let slice_elements: Vec<usize> = entries.iter().map(|e| e.shape.slice_elements()).collect();
        let plan = AllgatherPlan::new(&first_dims, &slice_elements, entries[0].dtype.size());
        self.do_allgather(entries, &plan)?;

        for (entry, dims) in entries.iter_mut().zip(&first_dims) {
            let mut output_dims = entry.shape.dims().to_vec();
            output_dims[0] = dims.iter().sum();
            entry.output_shape = TensorShape::new(output_dims);
        }
        Ok(())
    }
}

/// Flat allgather over the global communicator
pub struct AllgatherOp {
    comm: Arc<dyn CommunicationContext>,
    fusion: SharedFusionBuffers,
    timeline: Timeline,
}

impl AllgatherOp {
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
}

impl AllgatherImpl for AllgatherOp {
    fn comm(&self) -> &Arc<dyn CommunicationContext> {
        &self.comm
    }

    fn fusion(&self) -> &SharedFusionBuffers {
        &self.fusion
    }

    fn timeline(&self) -> &Timeline {
        &self.timeline
    }
}

impl CollectiveOperation for AllgatherOp {
    fn execute(&mut self, entries: &mut [TensorTableEntry], response: &Response) -> Status {
        let result = self.execute_allgather(entries, response);
        to_status("allgather", response, result)
    }
}
