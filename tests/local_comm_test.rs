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

//! Tests for the in-process communication backend

mod common;

use std::time::Duration;

use half::f16;

use corral::data_types::DataType;
use corral::error::Code;
use corral::net::comm_operations::reduce_into;
use corral::net::local::{LocalFabric, Topology};
use corral::net::{CommType, CommunicationContext, Communicator, ReduceOp};

use common::{decode_f32, decode_i32, run_ranks, run_world};

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn i32_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

// =============================================================================
// Topology
// =============================================================================

#[test]
fn test_topology_queries() {
    let views = run_ranks(Topology::uniform(2, 2).unwrap(), |ctx| {
        (
            ctx.rank(),
            ctx.size(),
            ctx.local_rank(),
            ctx.local_size(),
            ctx.cross_rank(),
            ctx.cross_size(),
            ctx.is_homogeneous(),
            ctx.comm_type(),
        )
    });
    assert_eq!(views[0], (0, 4, 0, 2, 0, 2, true, CommType::Local));
    assert_eq!(views[1], (1, 4, 1, 2, 0, 2, true, CommType::Local));
    assert_eq!(views[2], (2, 4, 0, 2, 1, 2, true, CommType::Local));
    assert_eq!(views[3], (3, 4, 1, 2, 1, 2, true, CommType::Local));
}

#[test]
fn test_uneven_topology() {
    let topology = Topology::new(vec![3, 1]).unwrap();
    assert!(!topology.is_homogeneous());
    assert_eq!(topology.world_size(), 4);
    assert_eq!(topology.locate(3), Some((1, 0)));
    assert_eq!(topology.locate(4), None);

    let fabric = LocalFabric::new(topology);
    let ctx = fabric.context(2).unwrap();
    assert_eq!(ctx.local_rank(), 2);
    // local rank 2 exists on one node only
    assert_eq!(ctx.cross_size(), 1);

    assert_eq!(
        Topology::new(vec![2, 0]).unwrap_err().code(),
        Code::InvalidArgument
    );
    assert!(fabric.context(4).is_err());
}

// =============================================================================
// Collectives
// =============================================================================

#[test]
fn test_allreduce_sum_identical_on_every_rank() {
    let results = run_world(4, |ctx| {
        let rank = ctx.rank() as f32;
        let mut buffer = f32_bytes(&[rank, rank * 2.0, 1.0]);
        ctx.allreduce(&mut buffer, 3, DataType::Float32, ReduceOp::Sum, Communicator::Global)
            .unwrap();
        decode_f32(&buffer)
    });
    for result in &results {
        assert_eq!(result, &vec![6.0, 12.0, 4.0]);
    }
}

#[test]
fn test_allreduce_min_max_on_local_groups() {
    let results = run_ranks(Topology::uniform(2, 2).unwrap(), |ctx| {
        let value = ctx.rank() as i32 * 10;
        let mut min = i32_bytes(&[value]);
        ctx.allreduce(&mut min, 1, DataType::Int32, ReduceOp::Min, Communicator::Local)
            .unwrap();
        let mut max = i32_bytes(&[value]);
        ctx.allreduce(&mut max, 1, DataType::Int32, ReduceOp::Max, Communicator::Cross)
            .unwrap();
        (decode_i32(&min)[0], decode_i32(&max)[0])
    });
    // nodes hold ranks {0, 1} and {2, 3}; cross groups {0, 2} and {1, 3}
    assert_eq!(results, vec![(0, 20), (0, 30), (20, 20), (20, 30)]);
}

#[test]
fn test_float16_sum() {
    let results = run_world(3, |ctx| {
        let values = [f16::from_f32(1.5), f16::from_f32(-2.0)];
        let mut buffer: Vec<u8> = values.iter().flat_map(|v| v.to_bits().to_le_bytes()).collect();
        ctx.allreduce(&mut buffer, 2, DataType::Float16, ReduceOp::Sum, Communicator::Global)
            .unwrap();
        buffer
            .chunks_exact(2)
            .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
            .collect::<Vec<f32>>()
    });
    for result in results {
        assert_eq!(result, vec![4.5, -6.0]);
    }
}

#[test]
fn test_allreduce_rejects_wrong_length() {
    let fabric = LocalFabric::new(Topology::single_node(1).unwrap());
    let ctx = fabric.context(0).unwrap();
    let mut buffer = vec![0u8; 7];
    let err = ctx
        .allreduce(&mut buffer, 2, DataType::Float32, ReduceOp::Sum, Communicator::Global)
        .unwrap_err();
    assert_eq!(err.code(), Code::TransportFailure);
}

#[test]
fn test_allgatherv_ragged() {
    let results = run_world(3, |ctx| {
        let rank = ctx.rank();
        let send: Vec<i32> = (0..=rank as i32).map(|v| rank as i32 * 100 + v).collect();
        let counts = vec![1, 2, 3];
        let displs = vec![0, 1, 3];
        let mut recv = vec![0u8; 6 * 4];
        ctx.allgatherv(
            &i32_bytes(&send),
            &mut recv,
            &counts,
            &displs,
            DataType::Int32,
            Communicator::Global,
        )
        .unwrap();
        decode_i32(&recv)
    });
    for result in results {
        assert_eq!(result, vec![0, 100, 101, 200, 201, 202]);
    }
}

#[test]
fn test_broadcast_from_root() {
    let results = run_world(3, |ctx| {
        let mut buffer = if ctx.rank() == 2 {
            i32_bytes(&[7, 8, 9])
        } else {
            vec![0u8; 12]
        };
        ctx.broadcast(&mut buffer, DataType::Int32, 2, Communicator::Global)
            .unwrap();
        decode_i32(&buffer)
    });
    for result in results {
        assert_eq!(result, vec![7, 8, 9]);
    }
}

#[test]
fn test_repeated_rounds_stay_in_step() {
    let results = run_world(4, |ctx| {
        let mut total = 0;
        for round in 0..50 {
            let mut buffer = i32_bytes(&[round]);
            ctx.allreduce(&mut buffer, 1, DataType::Int32, ReduceOp::Sum, Communicator::Global)
                .unwrap();
            total += decode_i32(&buffer)[0];
        }
        total
    });
    let expected: i32 = (0..50).map(|round| round * 4).sum();
    assert_eq!(results, vec![expected; 4]);
}

// =============================================================================
// Control plane and shared windows
// =============================================================================

#[test]
fn test_byte_collectives() {
    let results = run_world(3, |ctx| {
        let rank = ctx.rank();
        let mine = vec![rank as u8; rank + 1];
        let gathered = ctx.gather_bytes(&mine, 0).unwrap();
        let mut message = if rank == 0 { b"hello".to_vec() } else { Vec::new() };
        ctx.broadcast_bytes(&mut message, 0).unwrap();
        let everyone = ctx.allgather_bytes(&mine, Communicator::Global).unwrap();
        (gathered, message, everyone)
    });

    let expected_all = vec![vec![0u8], vec![1, 1], vec![2, 2, 2]];
    assert_eq!(results[0].0, expected_all);
    assert!(results[1].0.is_empty());
    assert!(results[2].0.is_empty());
    for (_, message, everyone) in &results {
        assert_eq!(message, b"hello");
        assert_eq!(everyone, &expected_all);
    }
}

#[test]
fn test_shared_window_visible_to_node_peers() {
    let results = run_ranks(Topology::uniform(2, 3).unwrap(), |ctx| {
        let local_rank = ctx.local_rank();
        let size = if local_rank == 0 { 3 } else { 0 };
        ctx.allocate_shared_buffer(size, 1).unwrap();
        let window = ctx.query_shared_buffer(0).unwrap();
        assert_eq!(window.len(), 3);
        window.write(local_rank, &[ctx.rank() as u8]).unwrap();
        ctx.barrier(Communicator::Local).unwrap();
        let seen = window.read_vec(0, 3).unwrap();
        ctx.free_shared_buffer().unwrap();
        seen
    });
    for (rank, seen) in results.iter().enumerate() {
        if rank < 3 {
            assert_eq!(seen, &vec![0, 1, 2]);
        } else {
            assert_eq!(seen, &vec![3, 4, 5]);
        }
    }
}

#[test]
fn test_shared_window_bounds_checked() {
    let fabric = LocalFabric::new(Topology::single_node(1).unwrap());
    let ctx = fabric.context(0).unwrap();
    ctx.allocate_shared_buffer(4, 1).unwrap();
    let window = ctx.query_shared_buffer(0).unwrap();
    let err = window.write(2, &[1, 2, 3]).unwrap_err();
    assert_eq!(err.code(), Code::TransportFailure);
    ctx.free_shared_buffer().unwrap();
    assert!(ctx.query_shared_buffer(0).is_err());
}

#[test]
fn test_missing_peer_times_out() {
    let fabric = LocalFabric::with_timeout(Topology::single_node(2).unwrap(), Duration::from_millis(50));
    let ctx = fabric.context(0).unwrap();
    let err = ctx.barrier(Communicator::Global).unwrap_err();
    assert_eq!(err.code(), Code::TransportFailure);
}

// =============================================================================
// Reduction kernels
// =============================================================================

#[test]
fn test_reduce_into_kernels() {
    let mut acc = i32_bytes(&[1, -5, 7]);
    reduce_into(&mut acc, &i32_bytes(&[2, 3, -7]), DataType::Int32, ReduceOp::Prod).unwrap();
    assert_eq!(decode_i32(&acc), vec![2, -15, -49]);

    let mut flags = vec![0u8, 1, 1, 0];
    reduce_into(&mut flags, &[1, 1, 0, 0], DataType::Bool, ReduceOp::Sum).unwrap();
    assert_eq!(flags, vec![1, 1, 1, 0]);
    let mut flags = vec![0u8, 1, 1, 0];
    reduce_into(&mut flags, &[1, 1, 0, 0], DataType::Bool, ReduceOp::Prod).unwrap();
    assert_eq!(flags, vec![0, 1, 0, 0]);

    let mut small = vec![250u8];
    reduce_into(&mut small, &[10], DataType::UInt8, ReduceOp::Sum).unwrap();
    assert_eq!(small, vec![4], "integer sums wrap");

    let mut acc = vec![0u8; 4];
    let err = reduce_into(&mut acc, &[0u8; 8], DataType::Float32, ReduceOp::Sum).unwrap_err();
    assert_eq!(err.code(), Code::TransportFailure);
}
