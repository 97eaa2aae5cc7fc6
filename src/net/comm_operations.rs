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

//! Reduction operators and their element-wise kernels

use half::f16;

use crate::data_types::DataType;
use crate::error::{CorralError, CorralResult};

/// Reduction operations for collective communication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Min,
    Max,
    Prod,
}

macro_rules! combine_chunks {
    ($t:ty, $acc:expr, $src:expr, $f:expr) => {{
        const WIDTH: usize = std::mem::size_of::<$t>();
        let combine = $f;
        for (a, s) in $acc.chunks_exact_mut(WIDTH).zip($src.chunks_exact(WIDTH)) {
            let mut raw_a = [0u8; WIDTH];
            raw_a.copy_from_slice(a);
            let mut raw_s = [0u8; WIDTH];
            raw_s.copy_from_slice(s);
            let out: $t = combine(<$t>::from_le_bytes(raw_a), <$t>::from_le_bytes(raw_s));
            a.copy_from_slice(&out.to_le_bytes());
        }
    }};
}

macro_rules! reduce_int {
    ($t:ty, $acc:expr, $src:expr, $op:expr) => {
        combine_chunks!($t, $acc, $src, |a: $t, b: $t| match $op {
            ReduceOp::Sum => a.wrapping_add(b),
            ReduceOp::Prod => a.wrapping_mul(b),
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
        })
    };
}

macro_rules! reduce_float {
    ($t:ty, $acc:expr, $src:expr, $op:expr) => {
        combine_chunks!($t, $acc, $src, |a: $t, b: $t| match $op {
            ReduceOp::Sum => a + b,
            ReduceOp::Prod => a * b,
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
        })
    };
}

/// Combine `src` into `acc` element by element, both little-endian `dtype`
pub fn reduce_into(acc: &mut [u8], src: &[u8], dtype: DataType, op: ReduceOp) -> CorralResult<()> {
    if acc.len() != src.len() {
        return Err(CorralError::transport(format!(
            "cannot reduce buffers of {} and {} bytes",
            acc.len(),
            src.len()
        )));
    }
    if acc.len() % dtype.size() != 0 {
        return Err(CorralError::transport(format!(
            "{} bytes is not a whole number of {} elements",
            acc.len(),
            dtype
        )));
    }

    match dtype {
        DataType::UInt8 => reduce_int!(u8, acc, src, op),
        DataType::Int8 => reduce_int!(i8, acc, src, op),
        DataType::UInt16 => reduce_int!(u16, acc, src, op),
        DataType::Int16 => reduce_int!(i16, acc, src, op),
        DataType::Int32 => reduce_int!(i32, acc, src, op),
        DataType::Int64 => reduce_int!(i64, acc, src, op),
        DataType::Float32 => reduce_float!(f32, acc, src, op),
        DataType::Float64 => reduce_float!(f64, acc, src, op),
        DataType::Float16 => {
            // accumulate in f32, round back once per step
            combine_chunks!(u16, acc, src, |a: u16, b: u16| {
                let (a, b) = (f16::from_bits(a).to_f32(), f16::from_bits(b).to_f32());
                let out = match op {
                    ReduceOp::Sum => a + b,
                    ReduceOp::Prod => a * b,
                    ReduceOp::Min => a.min(b),
                    ReduceOp::Max => a.max(b),
                };
                f16::from_f32(out).to_bits()
            })
        }
        DataType::Bool => combine_chunks!(u8, acc, src, |a: u8, b: u8| match op {
            ReduceOp::Sum | ReduceOp::Max => ((a != 0) || (b != 0)) as u8,
            ReduceOp::Prod | ReduceOp::Min => ((a != 0) && (b != 0)) as u8,
        }),
    }

    Ok(())
}
