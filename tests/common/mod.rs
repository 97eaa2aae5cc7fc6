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

//! Helpers shared by the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use corral::config::EngineConfig;
use corral::data_types::DataType;
use corral::message::{Request, RequestType};
use corral::net::local::{LocalContext, LocalFabric, Topology};
use corral::tensor::{Device, TensorDescriptor, TensorShape, TensorTableEntry};

/// Upper bound for any single collective in a test
pub const COLLECTIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Run `f` once per rank, each on its own thread, and collect the results in rank order
pub fn run_ranks<T, F>(topology: Topology, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(LocalContext) -> T + Sync,
{
    corral::util::logging::try_init_for_tests();
    let fabric = LocalFabric::with_timeout(topology, COLLECTIVE_TIMEOUT);
    let contexts = fabric.contexts().unwrap();
    let f = &f;
    thread::scope(|scope| {
        let handles: Vec<_> = contexts
            .into_iter()
            .map(|ctx| scope.spawn(move || f(ctx)))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("rank thread panicked"))
            .collect()
    })
}

/// Same as [`run_ranks`] on a single node
pub fn run_world<T, F>(world_size: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(LocalContext) -> T + Sync,
{
    run_ranks(Topology::single_node(world_size).unwrap(), f)
}

/// Engine config with a short cycle so tests do not idle
pub fn fast_config() -> EngineConfig {
    EngineConfig::default().with_cycle_time(Duration::from_millis(1))
}

pub fn as_comm(ctx: LocalContext) -> Arc<dyn corral::net::CommunicationContext> {
    Arc::new(ctx)
}

pub fn f32_entry(name: &str, dims: Vec<i64>, values: &[f32]) -> TensorTableEntry {
    TensorTableEntry::new(name, TensorDescriptor::from_f32(dims, values).unwrap())
}

pub fn i32_entry(name: &str, dims: Vec<i64>, values: &[i32]) -> TensorTableEntry {
    TensorTableEntry::new(name, TensorDescriptor::from_i32(dims, values).unwrap())
}

pub fn request(
    rank: usize,
    name: &str,
    request_type: RequestType,
    dtype: DataType,
    dims: Vec<i64>,
) -> Request {
    Request {
        request_rank: rank,
        request_type,
        tensor_name: name.to_string(),
        tensor_type: dtype,
        tensor_shape: TensorShape::new(dims),
        root_rank: 0,
        device: Device::Cpu,
    }
}

pub fn decode_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn decode_i32(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
