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

//! Worker-local tensor bookkeeping
//!
//! A [`TensorTableEntry`] is one unit of work submitted by the training
//! binding. The engine holds it while the group agrees on the operation,
//! lends it mutably to the operation that executes it, and finally hands the
//! populated output back through the entry's completion channel.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::data_types::DataType;
use crate::error::{Code, CorralError, CorralResult, Status};
use crate::message::RequestType;

/// Device placement of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    Gpu(u32),
}

impl Device {
    pub fn is_gpu(&self) -> bool {
        matches!(self, Device::Gpu(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "CPU"),
            Device::Gpu(ordinal) => write!(f, "GPU:{}", ordinal),
        }
    }
}

/// Dimensions of a tensor, outermost first
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShape {
    dims: Vec<i64>,
}

impl TensorShape {
    pub fn new(dims: Vec<i64>) -> Self {
        Self { dims }
    }

    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn dims(&self) -> &[i64] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dim_size(&self, idx: usize) -> i64 {
        self.dims[idx]
    }

    /// Product of all dimensions; a scalar holds one element
    ///
    /// Saturates instead of overflowing; shapes that passed
    /// [`TensorShape::checked_byte_len`] never reach the bound.
    pub fn num_elements(&self) -> usize {
        self.checked_num_elements().unwrap_or(usize::MAX)
    }

    /// Product of all dimensions, `None` on overflow
    pub fn checked_num_elements(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |acc, d| acc.checked_mul((*d).max(0) as usize))
    }

    /// Bytes needed for this shape of `element_size`-byte elements, `None` on overflow
    pub fn checked_byte_len(&self, element_size: usize) -> Option<usize> {
        self.checked_num_elements()?.checked_mul(element_size)
    }

    /// Number of elements in one slice along the first dimension
    pub fn slice_elements(&self) -> usize {
        self.dims.iter().skip(1).map(|d| (*d).max(0) as usize).product()
    }

    pub fn is_valid(&self) -> bool {
        self.dims.iter().all(|d| *d >= 0)
    }
}

impl From<Vec<i64>> for TensorShape {
    fn from(dims: Vec<i64>) -> Self {
        Self::new(dims)
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

/// The collective a caller asks for, as seen by the submission interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectiveKind {
    Allreduce,
    Allgather,
    Broadcast { root_rank: usize },
}

impl CollectiveKind {
    pub fn request_type(&self) -> RequestType {
        match self {
            CollectiveKind::Allreduce => RequestType::Allreduce,
            CollectiveKind::Allgather => RequestType::Allgather,
            CollectiveKind::Broadcast { .. } => RequestType::Broadcast,
        }
    }

    pub fn root_rank(&self) -> usize {
        match self {
            CollectiveKind::Broadcast { root_rank } => *root_rank,
            _ => 0,
        }
    }
}

/// Buffer descriptor handed over by the training binding
#[derive(Debug, Clone)]
pub struct TensorDescriptor {
    pub dtype: DataType,
    pub shape: TensorShape,
    pub device: Device,
    pub data: Vec<u8>,
}

macro_rules! descriptor_from {
    ($fn_name:ident, $t:ty, $dtype:expr) => {
        /// Build a CPU descriptor from typed values (little-endian layout)
        pub fn $fn_name(shape: Vec<i64>, values: &[$t]) -> CorralResult<Self> {
            let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            Self::new($dtype, TensorShape::new(shape), data)
        }
    };
}

macro_rules! output_as {
    ($fn_name:ident, $t:ty) => {
        /// Decode the output bytes as little-endian values
        pub fn $fn_name(&self) -> Vec<$t> {
            const WIDTH: usize = std::mem::size_of::<$t>();
            self.data
                .chunks_exact(WIDTH)
                .map(|chunk| {
                    let mut raw = [0u8; WIDTH];
                    raw.copy_from_slice(chunk);
                    <$t>::from_le_bytes(raw)
                })
                .collect()
        }
    };
}

impl TensorDescriptor {
    /// Create a CPU descriptor, checking the byte length against shape and type
    pub fn new(dtype: DataType, shape: TensorShape, data: Vec<u8>) -> CorralResult<Self> {
        if !shape.is_valid() {
            return Err(CorralError::InvalidArgument(format!(
                "negative dimension in shape {}",
                shape
            )));
        }
        let expected = shape.checked_byte_len(dtype.size()).ok_or_else(|| {
            CorralError::InvalidArgument(format!(
                "shape {} of {} does not fit in memory",
                shape, dtype
            ))
        })?;
        if data.len() != expected {
            return Err(CorralError::InvalidArgument(format!(
                "buffer holds {} bytes but shape {} of {} needs {}",
                data.len(),
                shape,
                dtype,
                expected
            )));
        }
        Ok(Self {
            dtype,
            shape,
            device: Device::Cpu,
            data,
        })
    }

    pub fn on_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    descriptor_from!(from_f32, f32, DataType::Float32);
    descriptor_from!(from_f64, f64, DataType::Float64);
    descriptor_from!(from_i32, i32, DataType::Int32);
    descriptor_from!(from_i64, i64, DataType::Int64);
}

/// Result handed back to the caller once the collective finished
#[derive(Debug, Clone, PartialEq)]
pub struct TensorOutput {
    pub tensor_name: String,
    pub shape: TensorShape,
    pub data: Vec<u8>,
}

impl TensorOutput {
    output_as!(as_f32, f32);
    output_as!(as_f64, f64);
    output_as!(as_i32, i32);
    output_as!(as_i64, i64);
}

type CompletionSender = oneshot::Sender<CorralResult<TensorOutput>>;

/// One worker-local unit of work
pub struct TensorTableEntry {
    pub tensor_name: String,
    pub dtype: DataType,
    pub shape: TensorShape,
    pub device: Device,
    /// Only meaningful for broadcasts
    pub root_rank: usize,
    /// Source buffer
    pub input: Vec<u8>,
    /// Destination buffer, populated by the operation
    pub output: Vec<u8>,
    pub output_shape: TensorShape,
    callback: Option<CompletionSender>,
}

impl TensorTableEntry {
    pub fn new(tensor_name: impl Into<String>, descriptor: TensorDescriptor) -> Self {
        Self {
            tensor_name: tensor_name.into(),
            dtype: descriptor.dtype,
            output_shape: descriptor.shape.clone(),
            shape: descriptor.shape,
            device: descriptor.device,
            root_rank: 0,
            input: descriptor.data,
            output: Vec::new(),
            callback: None,
        }
    }

    pub fn with_root_rank(mut self, root_rank: usize) -> Self {
        self.root_rank = root_rank;
        self
    }

    /// Attach a completion channel and return the caller's end of it
    pub fn attach_completion(&mut self) -> CompletionHandle {
        let (tx, rx) = oneshot::channel();
        self.callback = Some(tx);
        CompletionHandle {
            tensor_name: self.tensor_name.clone(),
            receiver: rx,
        }
    }

    pub fn num_elements(&self) -> usize {
        self.shape.num_elements()
    }

    pub fn byte_size(&self) -> usize {
        self.input.len()
    }

    /// Release the entry back to its caller with the outcome of the operation
    pub fn finish(mut self, status: &Status) {
        let result = if status.is_ok() {
            Ok(TensorOutput {
                tensor_name: std::mem::take(&mut self.tensor_name),
                shape: std::mem::take(&mut self.output_shape),
                data: std::mem::take(&mut self.output),
            })
        } else {
            Err(CorralError::new(status.get_code(), status.get_msg()))
        };
        if let Some(callback) = self.callback.take() {
            if callback.send(result).is_err() {
                log::debug!("completion handle dropped before the result arrived");
            }
        }
    }
}

impl fmt::Debug for TensorTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorTableEntry")
            .field("tensor_name", &self.tensor_name)
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("device", &self.device)
            .field("root_rank", &self.root_rank)
            .field("input_bytes", &self.input.len())
            .field("output_bytes", &self.output.len())
            .finish()
    }
}

/// Caller's end of a submitted tensor operation
#[derive(Debug)]
pub struct CompletionHandle {
    tensor_name: String,
    receiver: oneshot::Receiver<CorralResult<TensorOutput>>,
}

impl CompletionHandle {
    pub fn tensor_name(&self) -> &str {
        &self.tensor_name
    }

    /// Block the calling thread until the operation completes.
    ///
    /// Must not be called from inside an async runtime; use
    /// [`CompletionHandle::wait_async`] there.
    pub fn wait(self) -> CorralResult<TensorOutput> {
        let name = self.tensor_name;
        self.receiver
            .blocking_recv()
            .map_err(|_| dropped_before_completion(&name))?
    }

    pub async fn wait_async(self) -> CorralResult<TensorOutput> {
        let name = self.tensor_name;
        self.receiver
            .await
            .map_err(|_| dropped_before_completion(&name))?
    }

    /// Non-blocking poll; `None` while the operation is still pending
    pub fn try_result(&mut self) -> Option<CorralResult<TensorOutput>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Err(dropped_before_completion(&self.tensor_name)))
            }
        }
    }
}

fn dropped_before_completion(name: &str) -> CorralError {
    CorralError::new(
        Code::Aborted,
        format!("tensor {} was dropped before it completed", name),
    )
}
