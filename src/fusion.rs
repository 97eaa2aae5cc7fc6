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

//! Fusion buffer management
//!
//! Several tensors are packed into one staging buffer so a single transport
//! call serves all of them. The copy into the buffer hands back a
//! [`CopyFence`]; the fused bytes are reachable only through the
//! [`SyncedBuffer`] obtained by synchronizing that fence, so no code path can
//! read the buffer before the copies are visible.

use std::collections::HashMap;

use crate::error::{CorralError, CorralResult};
use crate::tensor::{Device, TensorTableEntry};

/// Placement of each entry inside a fused buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusionLayout {
    offsets: Vec<usize>,
    sizes: Vec<usize>,
    total_bytes: usize,
    element_size: usize,
}

fn align_up(value: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

impl FusionLayout {
    /// Lay out `sizes` bytes back to back, each offset a multiple of `element_size`
    pub fn from_sizes(sizes: &[usize], element_size: usize) -> Self {
        let mut offsets = Vec::with_capacity(sizes.len());
        let mut cursor = 0;
        for size in sizes {
            cursor = align_up(cursor, element_size);
            offsets.push(cursor);
            cursor += size;
        }
        Self {
            offsets,
            sizes: sizes.to_vec(),
            total_bytes: align_up(cursor, element_size),
            element_size: element_size.max(1),
        }
    }

    /// Layout for the inputs of a batch; every entry must share one data type
    pub fn plan(entries: &[TensorTableEntry]) -> CorralResult<Self> {
        let first = entries
            .first()
            .ok_or_else(|| CorralError::InvalidArgument("cannot fuse an empty batch".to_string()))?;
        if let Some(other) = entries.iter().find(|e| e.dtype != first.dtype) {
            return Err(CorralError::InvalidArgument(format!(
                "cannot fuse {} ({}) with {} ({})",
                first.tensor_name, first.dtype, other.tensor_name, other.dtype
            )));
        }
        let sizes: Vec<usize> = entries.iter().map(|e| e.byte_size()).collect();
        Ok(Self::from_sizes(&sizes, first.dtype.size()))
    }

    pub fn offset(&self, idx: usize) -> usize {
        self.offsets[idx]
    }

    pub fn size(&self, idx: usize) -> usize {
        self.sizes[idx]
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Element count of the single transport call over the whole buffer
    pub fn num_elements(&self) -> usize {
        self.total_bytes / self.element_size
    }
}

/// Reusable per-device staging buffers
#[derive(Debug)]
pub struct FusionBufferManager {
    threshold: usize,
    buffers: HashMap<Device, Vec<u8>>,
}

impl FusionBufferManager {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            buffers: HashMap::new(),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Current size of the buffer for `device`, zero before first use
    pub fn capacity(&self, device: Device) -> usize {
        self.buffers.get(&device).map_or(0, |b| b.len())
    }

    /// Borrow `len` cleared bytes of the buffer for `device`
    ///
    /// The buffer is allocated at the fusion threshold on first use and only
    /// grows when a single batch needs more than that.
    fn region(&mut self, device: Device, len: usize) -> &mut [u8] {
        let threshold = self.threshold;
        let buffer = self.buffers.entry(device).or_insert_with(|| {
            log::debug!("allocating {} byte fusion buffer on {}", threshold.max(len), device);
            vec![0u8; threshold.max(len)]
        });
        if buffer.len() < len {
            log::debug!("growing fusion buffer on {} to {} bytes", device, len);
            buffer.resize(len, 0);
        }
        let region = &mut buffer[..len];
        region.fill(0);
        region
    }

    /// Copy every entry's input into its slot of the fused buffer
    pub fn memcpy_in<'a>(
        &'a mut self,
        device: Device,
        entries: &[TensorTableEntry],
        layout: &FusionLayout,
    ) -> CorralResult<CopyFence<'a>> {
        if entries.len() != layout.len() {
            return Err(CorralError::InvalidArgument(format!(
                "layout for {} entries used with {}",
                layout.len(),
                entries.len()
            )));
        }
        let region = self.region(device, layout.total_bytes());
        for (idx, entry) in entries.iter().enumerate() {
            if entry.input.len() != layout.size(idx) {
                return Err(CorralError::InvalidArgument(format!(
                    "{} holds {} bytes, layout expects {}",
                    entry.tensor_name,
                    entry.input.len(),
                    layout.size(idx)
                )));
            }
            let offset = layout.offset(idx);
            region[offset..offset + entry.input.len()].copy_from_slice(&entry.input);
        }
        Ok(CopyFence { region })
    }

    /// Borrow a cleared region to receive into, with no pending copies
    pub fn receive_region(&mut self, device: Device, len: usize) -> SyncedBuffer<'_> {
        SyncedBuffer {
            region: self.region(device, len),
        }
    }
}

/// Pending copies into a fused buffer
#[must_use = "the fused buffer is only readable after synchronize()"]
#[derive(Debug)]
pub struct CopyFence<'a> {
    region: &'a mut [u8],
}

impl<'a> CopyFence<'a> {
    /// Wait until every copy issued by `memcpy_in` is visible
    pub fn synchronize(self) -> SyncedBuffer<'a> {
        // host copies complete before memcpy_in returns; a device backend
        // would block on its copy stream here
        SyncedBuffer {
            region: self.region,
        }
    }
}

/// A fused buffer whose contents are safe to hand to the transport
#[derive(Debug)]
pub struct SyncedBuffer<'a> {
    region: &'a mut [u8],
}

impl<'a> SyncedBuffer<'a> {
    pub fn data(&self) -> &[u8] {
        self.region
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.region
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    /// Copy each entry's slot back into its output buffer
    pub fn memcpy_out(
        &self,
        entries: &mut [TensorTableEntry],
        layout: &FusionLayout,
    ) -> CorralResult<()> {
        if entries.len() != layout.len() || layout.total_bytes() > self.region.len() {
            return Err(CorralError::InvalidArgument(format!(
                "layout of {} entries / {} bytes does not fit {} entries / {} bytes",
                layout.len(),
                layout.total_bytes(),
                entries.len(),
                self.region.len()
            )));
        }
        for (idx, entry) in entries.iter_mut().enumerate() {
            let offset = layout.offset(idx);
            entry.output = self.region[offset..offset + layout.size(idx)].to_vec();
        }
        Ok(())
    }
}
