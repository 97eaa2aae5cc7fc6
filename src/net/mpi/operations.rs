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

//! MPI operations and helper functions
//!
//! Updated for rsmpi 0.8 API

use half::f16;
use mpi::collective::{CommunicatorCollectives, Operation, SystemOperation, UserOperation};
use mpi::datatype::{DynBuffer, DynBufferMut, Equivalence};

use crate::data_types::DataType;
use crate::error::{CorralError, CorralResult};
use crate::net::comm_operations::ReduceOp;

/// Convert a ReduceOp to the matching MPI operation
pub fn get_mpi_op(reduce_op: ReduceOp) -> SystemOperation {
    match reduce_op {
        ReduceOp::Sum => SystemOperation::sum(),
        ReduceOp::Min => SystemOperation::min(),
        ReduceOp::Max => SystemOperation::max(),
        ReduceOp::Prod => SystemOperation::product(),
    }
}

/// Booleans travel as 0/1 bytes, where max is "or" and min is "and"
fn get_bool_op(reduce_op: ReduceOp) -> SystemOperation {
    match reduce_op {
        ReduceOp::Sum | ReduceOp::Max => SystemOperation::max(),
        ReduceOp::Prod | ReduceOp::Min => SystemOperation::min(),
    }
}

/// Sum for float16 carried as u16 bit patterns; MPI has no native type for it
pub(crate) fn float16_sum() -> UserOperation<'static> {
    UserOperation::commutative(|x: DynBuffer, mut acc: DynBufferMut| {
        let (Some(x), Some(acc)) = (x.downcast::<u16>(), acc.downcast::<u16>()) else {
            return;
        };
        for (a, b) in acc.iter_mut().zip(x.iter()) {
            let sum = f16::from_bits(*a).to_f32() + f16::from_bits(*b).to_f32();
            *a = f16::from_f32(sum).to_bits();
        }
    })
}

/// Fixed-width element with a little-endian byte image
pub(crate) trait WireElement: Equivalence + Copy + Default {
    const WIDTH: usize;
    fn decode(raw: &[u8]) -> Self;
    fn encode(self, out: &mut [u8]);
}

macro_rules! wire_element {
    ($($t:ty),*) => {
        $(
            impl WireElement for $t {
                const WIDTH: usize = std::mem::size_of::<$t>();

                fn decode(raw: &[u8]) -> Self {
                    let mut bytes = [0u8; std::mem::size_of::<$t>()];
                    bytes.copy_from_slice(raw);
                    <$t>::from_le_bytes(bytes)
                }

                fn encode(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

wire_element!(u8, i8, u16, i16, i32, i64, f32, f64);

fn allreduce_typed<T, C, O>(comm: &C, buffer: &mut [u8], op: O)
where
    T: WireElement,
    C: CommunicatorCollectives,
    O: Operation,
{
    let send: Vec<T> = buffer.chunks_exact(T::WIDTH).map(T::decode).collect();
    let mut recv = vec![T::default(); send.len()];
    comm.all_reduce_into(&send[..], &mut recv[..], op);
    for (chunk, value) in buffer.chunks_exact_mut(T::WIDTH).zip(recv) {
        value.encode(chunk);
    }
}

/// In-place allreduce of a little-endian byte buffer
pub(crate) fn allreduce_bytes<C: CommunicatorCollectives>(
    comm: &C,
    buffer: &mut [u8],
    dtype: DataType,
    reduce_op: ReduceOp,
    float16_sum: &UserOperation<'_>,
) -> CorralResult<()> {
    match dtype {
        DataType::UInt8 => allreduce_typed::<u8, _, _>(comm, buffer, get_mpi_op(reduce_op)),
        DataType::Int8 => allreduce_typed::<i8, _, _>(comm, buffer, get_mpi_op(reduce_op)),
        DataType::UInt16 => allreduce_typed::<u16, _, _>(comm, buffer, get_mpi_op(reduce_op)),
        DataType::Int16 => allreduce_typed::<i16, _, _>(comm, buffer, get_mpi_op(reduce_op)),
        DataType::Int32 => allreduce_typed::<i32, _, _>(comm, buffer, get_mpi_op(reduce_op)),
        DataType::Int64 => allreduce_typed::<i64, _, _>(comm, buffer, get_mpi_op(reduce_op)),
        DataType::Float32 => allreduce_typed::<f32, _, _>(comm, buffer, get_mpi_op(reduce_op)),
        DataType::Float64 => allreduce_typed::<f64, _, _>(comm, buffer, get_mpi_op(reduce_op)),
        DataType::Bool => allreduce_typed::<u8, _, _>(comm, buffer, get_bool_op(reduce_op)),
        DataType::Float16 => match reduce_op {
            ReduceOp::Sum => allreduce_typed::<u16, _, _>(comm, buffer, float16_sum),
            other => {
                return Err(CorralError::NotImplemented(format!(
                    "MPI {:?} reduction for float16",
                    other
                )))
            }
        },
    }
    Ok(())
}
