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

//! MPI communication context
//!
//! Updated for rsmpi 0.8 API. The shared window calls and the variable-count
//! allgather go through mpi-sys directly, since rsmpi has no safe wrapper
//! for them.

use std::ffi::{c_int, c_void};
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard};

use mpi::collective::UserOperation;
use mpi::datatype::PartitionMut;
use mpi::environment::Universe;
use mpi::topology::{Color, SimpleCommunicator};
use mpi::traits::*;
use mpi::Threading;

use crate::data_types::DataType;
use crate::error::{CorralError, CorralResult};
use crate::net::comm_operations::ReduceOp;
use crate::net::communicator::{CommunicationContext, Communicator};
use crate::net::shared::{check_bounds, SharedRegion, SharedWindow};
use crate::net::CommType;

use super::operations::{allreduce_bytes, float16_sum};

pub const MPI_ALLREDUCE: &str = "MPI_ALLREDUCE";
pub const MPI_ALLGATHER: &str = "MPI_ALLGATHER";
pub const MPI_BCAST: &str = "MPI_BCAST";

struct MpiState {
    comm: SimpleCommunicator,
    local_comm: SimpleCommunicator,
    cross_comm: SimpleCommunicator,
    window: Option<mpi_sys::MPI_Win>,
    float16_sum: UserOperation<'static>,
    // declared last so MPI is finalized after everything above is released
    _universe: Universe,
}

impl MpiState {
    fn select(&self, comm: Communicator) -> &SimpleCommunicator {
        match comm {
            Communicator::Global => &self.comm,
            Communicator::Local => &self.local_comm,
            Communicator::Cross => &self.cross_comm,
        }
    }
}

/// Communication context over MPI
///
/// Owns a private duplicate of the world communicator plus the node-local
/// and cross-node communicators derived from it.
pub struct MpiContext {
    state: Mutex<MpiState>,
    rank: usize,
    size: usize,
    local_rank: usize,
    local_size: usize,
    cross_rank: usize,
    cross_size: usize,
    homogeneous: bool,
}

// All MPI handles live behind the mutex; calls are serialized through it,
// which is what MPI_THREAD_SERIALIZED requires.
unsafe impl Send for MpiContext {}
unsafe impl Sync for MpiContext {}

fn check(status: c_int, call: &str) -> CorralResult<()> {
    if status != mpi_sys::MPI_SUCCESS as i32 {
        return Err(CorralError::transport(format!(
            "{} failed with code {}",
            call, status
        )));
    }
    Ok(())
}

impl MpiContext {
    /// Initialize MPI and build the communicators
    pub fn initialize() -> CorralResult<Arc<Self>> {
        let (universe, threading) = mpi::initialize_with_threading(Threading::Serialized)
            .ok_or_else(|| {
                CorralError::transport(
                    "Failed to initialize MPI (already initialized or MPI library not found)",
                )
            })?;
        log::debug!("MPI initialized with threading level {:?}", threading);

        let world = universe.world();
        let comm = world.duplicate();
        let rank = comm.rank();
        let size = comm.size();
        if rank < 0 || size <= 0 || rank >= size {
            return Err(CorralError::transport(format!(
                "Malformed rank: {} or world size: {}",
                rank, size
            )));
        }

        let local_comm = comm.split_shared(rank);
        let local_rank = local_comm.rank();
        let local_size = local_comm.size();
        let cross_comm = comm
            .split_by_color_with_key(Color::with_value(local_rank), rank)
            .ok_or_else(|| CorralError::transport("failed to create the cross-node communicator"))?;
        let cross_rank = cross_comm.rank();
        let cross_size = cross_comm.size();

        // homogeneous: equal ranks per node, numbered contiguously node by node
        let mut local_sizes = vec![0i32; size as usize];
        comm.all_gather_into(&local_size, &mut local_sizes[..]);
        let contiguous = i32::from(rank == cross_rank * local_size + local_rank);
        let mut flags = vec![0i32; size as usize];
        comm.all_gather_into(&contiguous, &mut flags[..]);
        let homogeneous =
            local_sizes.windows(2).all(|w| w[0] == w[1]) && flags.iter().all(|f| *f == 1);

        log::info!(
            "MPI rank {}/{} local {}/{} cross {}/{} homogeneous={}",
            rank,
            size,
            local_rank,
            local_size,
            cross_rank,
            cross_size,
            homogeneous
        );

        Ok(Arc::new(Self {
            state: Mutex::new(MpiState {
                comm,
                local_comm,
                cross_comm,
                window: None,
                float16_sum: float16_sum(),
                _universe: universe,
            }),
            rank: rank as usize,
            size: size as usize,
            local_rank: local_rank as usize,
            local_size: local_size as usize,
            cross_rank: cross_rank as usize,
            cross_size: cross_size as usize,
            homogeneous,
        }))
    }

    fn lock(&self) -> CorralResult<MutexGuard<'_, MpiState>> {
        self.state
            .lock()
            .map_err(|_| CorralError::transport("MPI state lock poisoned"))
    }
}

fn to_counts(values: &[usize], element_size: usize) -> CorralResult<Vec<i32>> {
    values
        .iter()
        .map(|v| {
            i32::try_from(v * element_size).map_err(|_| {
                CorralError::transport(format!("{} bytes exceed the MPI count range", v * element_size))
            })
        })
        .collect()
}

fn displacements(counts: &[i32]) -> Vec<i32> {
    counts
        .iter()
        .scan(0i32, |offset, count| {
            let displ = *offset;
            *offset += count;
            Some(displ)
        })
        .collect()
}

impl CommunicationContext for MpiContext {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn local_rank(&self) -> usize {
        self.local_rank
    }

    fn local_size(&self) -> usize {
        self.local_size
    }

    fn cross_rank(&self) -> usize {
        self.cross_rank
    }

    fn cross_size(&self) -> usize {
        self.cross_size
    }

    fn is_homogeneous(&self) -> bool {
        self.homogeneous
    }

    fn comm_type(&self) -> CommType {
        CommType::Mpi
    }

    fn allreduce(
        &self,
        buffer: &mut [u8],
        num_elements: usize,
        dtype: DataType,
        op: ReduceOp,
        comm: Communicator,
    ) -> CorralResult<()> {
        if buffer.len() != num_elements * dtype.size() {
            return Err(CorralError::transport(format!(
                "allreduce of {} {} elements got {} bytes",
                num_elements,
                dtype,
                buffer.len()
            )));
        }
        let state = self.lock()?;
        allreduce_bytes(state.select(comm), buffer, dtype, op, &state.float16_sum)
    }

    fn allgatherv(
        &self,
        send: &[u8],
        recv: &mut [u8],
        recvcounts: &[usize],
        displs: &[usize],
        dtype: DataType,
        comm: Communicator,
    ) -> CorralResult<()> {
        let element_size = dtype.size();
        let counts = to_counts(recvcounts, element_size)?;
        let byte_displs = to_counts(displs, element_size)?;
        let state = self.lock()?;
        let group = state.select(comm);

        // counts and displacements travel in bytes
        let status = unsafe {
            let send_ptr = if send.is_empty() { ptr::null() } else { send.as_ptr() };
            let recv_ptr = if recv.is_empty() {
                ptr::null_mut()
            } else {
                recv.as_mut_ptr()
            };
            mpi_sys::MPI_Allgatherv(
                send_ptr as *const c_void,
                send.len() as c_int,
                mpi_sys::RSMPI_UINT8_T,
                recv_ptr as *mut c_void,
                counts.as_ptr(),
                byte_displs.as_ptr(),
                mpi_sys::RSMPI_UINT8_T,
                group.as_raw(),
            )
        };
        check(status, "MPI_Allgatherv")
    }

    fn broadcast(
        &self,
        buffer: &mut [u8],
        _dtype: DataType,
        root_rank: usize,
        comm: Communicator,
    ) -> CorralResult<()> {
        let state = self.lock()?;
        let group = state.select(comm);
        if root_rank >= group.size() as usize {
            return Err(CorralError::transport(format!(
                "broadcast root {} outside a group of {}",
                root_rank,
                group.size()
            )));
        }
        group.process_at_rank(root_rank as i32).broadcast_into(buffer);
        Ok(())
    }

    fn barrier(&self, comm: Communicator) -> CorralResult<()> {
        let state = self.lock()?;
        state.select(comm).barrier();
        Ok(())
    }

    fn allocate_shared_buffer(&self, window_size: usize, element_size: usize) -> CorralResult<()> {
        let mut state = self.lock()?;
        if state.window.is_some() {
            return Err(CorralError::transport("a shared window is already allocated"));
        }
        let mut base: *mut c_void = ptr::null_mut();
        let mut win = MaybeUninit::<mpi_sys::MPI_Win>::uninit();
        let status = unsafe {
            mpi_sys::MPI_Win_allocate_shared(
                window_size as mpi_sys::MPI_Aint,
                element_size.max(1) as c_int,
                mpi_sys::RSMPI_INFO_NULL,
                state.local_comm.as_raw(),
                &mut base as *mut *mut c_void as *mut c_void,
                win.as_mut_ptr(),
            )
        };
        check(status, "MPI_Win_allocate_shared")?;
        state.window = Some(unsafe { win.assume_init() });
        Ok(())
    }

    fn query_shared_buffer(&self, local_rank: usize) -> CorralResult<SharedWindow> {
        let state = self.lock()?;
        let win = state
            .window
            .ok_or_else(|| CorralError::transport("no shared window is allocated"))?;
        let mut size: mpi_sys::MPI_Aint = 0;
        let mut disp_unit: c_int = 0;
        let mut base: *mut c_void = ptr::null_mut();
        let status = unsafe {
            mpi_sys::MPI_Win_shared_query(
                win,
                local_rank as c_int,
                &mut size,
                &mut disp_unit,
                &mut base as *mut *mut c_void as *mut c_void,
            )
        };
        check(status, "MPI_Win_shared_query")?;
        Ok(SharedWindow::new(Arc::new(MpiWindowRegion {
            base: base as *mut u8,
            len: size as usize,
        })))
    }

    fn free_shared_buffer(&self) -> CorralResult<()> {
        let mut state = self.lock()?;
        if let Some(mut win) = state.window.take() {
            // MPI_Win_free is collective over the local communicator
            let status = unsafe { mpi_sys::MPI_Win_free(&mut win) };
            check(status, "MPI_Win_free")?;
        }
        Ok(())
    }

    fn gather_bytes(&self, data: &[u8], root: usize) -> CorralResult<Vec<Vec<u8>>> {
        let state = self.lock()?;
        let root_process = state.comm.process_at_rank(root as i32);
        let len = data.len() as i32;

        if self.rank != root {
            root_process.gather_into(&len);
            root_process.gather_varcount_into(data);
            return Ok(Vec::new());
        }

        let mut lens = vec![0i32; self.size];
        root_process.gather_into_root(&len, &mut lens[..]);
        let displs = displacements(&lens);
        let total: i32 = lens.iter().sum();
        let mut buffer = vec![0u8; total as usize];
        {
            let mut partition = PartitionMut::new(&mut buffer[..], &lens[..], &displs[..]);
            root_process.gather_varcount_into_root(data, &mut partition);
        }
        Ok(split(&buffer, &lens, &displs))
    }

    fn broadcast_bytes(&self, data: &mut Vec<u8>, root: usize) -> CorralResult<()> {
        let state = self.lock()?;
        let root_process = state.comm.process_at_rank(root as i32);
        let mut len = data.len() as u64;
        root_process.broadcast_into(&mut len);
        if self.rank != root {
            *data = vec![0u8; len as usize];
        }
        root_process.broadcast_into(&mut data[..]);
        Ok(())
    }

    fn allgather_bytes(&self, data: &[u8], comm: Communicator) -> CorralResult<Vec<Vec<u8>>> {
        let state = self.lock()?;
        let group = state.select(comm);
        let len = data.len() as i32;
        let mut lens = vec![0i32; group.size() as usize];
        group.all_gather_into(&len, &mut lens[..]);
        let displs = displacements(&lens);
        let total: i32 = lens.iter().sum();
        let mut buffer = vec![0u8; total as usize];
        {
            let mut partition = PartitionMut::new(&mut buffer[..], &lens[..], &displs[..]);
            group.all_gather_varcount_into(data, &mut partition);
        }
        Ok(split(&buffer, &lens, &displs))
    }

    fn allreduce_activity(&self) -> &'static str {
        MPI_ALLREDUCE
    }

    fn allgather_activity(&self) -> &'static str {
        MPI_ALLGATHER
    }

    fn broadcast_activity(&self) -> &'static str {
        MPI_BCAST
    }
}

fn split(buffer: &[u8], lens: &[i32], displs: &[i32]) -> Vec<Vec<u8>> {
    lens.iter()
        .zip(displs)
        .map(|(len, displ)| buffer[*displ as usize..(*displ + *len) as usize].to_vec())
        .collect()
}

/// One rank's segment of an MPI shared-memory window
struct MpiWindowRegion {
    base: *mut u8,
    len: usize,
}

// The segment stays mapped until MPI_Win_free, which every rank only calls
// after the closing local barrier of the operation that queried it.
unsafe impl Send for MpiWindowRegion {}
unsafe impl Sync for MpiWindowRegion {}

impl SharedRegion for MpiWindowRegion {
    fn len(&self) -> usize {
        self.len
    }

    fn read(&self, offset: usize, dst: &mut [u8]) -> CorralResult<()> {
        check_bounds(offset, dst.len(), self.len)?;
        if !dst.is_empty() {
            unsafe { ptr::copy_nonoverlapping(self.base.add(offset), dst.as_mut_ptr(), dst.len()) };
        }
        Ok(())
    }

    fn write(&self, offset: usize, src: &[u8]) -> CorralResult<()> {
        check_bounds(offset, src.len(), self.len)?;
        if !src.is_empty() {
            unsafe { ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(offset), src.len()) };
        }
        Ok(())
    }
}
