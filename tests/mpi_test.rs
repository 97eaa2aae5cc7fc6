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

//! Engine smoke test on the MPI backend
//!
//! MPI can be initialized once per process, so everything runs in one test.
//! Run under `mpirun -n <N> cargo test --features mpi --test mpi_test`.

#[cfg(feature = "mpi")]
#[test]
fn test_mpi_engine() {
    use std::time::Duration;

    use corral::net::mpi::MpiContext;
    use corral::net::CommunicationContext;
    use corral::{CorralContext, EngineConfig, TensorDescriptor};

    corral::util::logging::try_init_for_tests();

    let comm = MpiContext::initialize().unwrap();
    let rank = comm.rank();
    let size = comm.size();
    println!("Process {}/{} on node {}/{}", rank, size, comm.cross_rank(), comm.cross_size());

    let config = EngineConfig::default()
        .with_cycle_time(Duration::from_millis(1))
        .with_hierarchical_allgather(comm.is_homogeneous());
    let engine = CorralContext::init(comm, config).unwrap();

    let grad = TensorDescriptor::from_f32(vec![4], &[rank as f32; 4]).unwrap();
    let summed = engine.allreduce("grad", grad).unwrap();

    let rows = rank + 1;
    let values: Vec<i32> = (0..rows).map(|v| (rank * 10 + v) as i32).collect();
    let gathered = engine
        .allgather("rows", TensorDescriptor::from_i32(vec![rows as i64], &values).unwrap())
        .unwrap();

    let root = size - 1;
    let bcast = engine
        .broadcast("bcast", TensorDescriptor::from_i32(vec![1], &[rank as i32]).unwrap(), root)
        .unwrap();

    let expected_sum = (0..size).sum::<usize>() as f32;
    assert_eq!(summed.wait().unwrap().as_f32(), vec![expected_sum; 4]);

    let expected_rows: Vec<i32> = (0..size)
        .flat_map(|r| (0..r + 1).map(move |v| (r * 10 + v) as i32))
        .collect();
    assert_eq!(gathered.wait().unwrap().as_i32(), expected_rows);
    assert_eq!(bcast.wait().unwrap().as_i32(), vec![root as i32]);

    engine.shutdown().unwrap();
    if rank == 0 {
        println!("All {} processes completed", size);
    }
}
