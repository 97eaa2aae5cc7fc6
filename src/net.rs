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

//! Networking and communication components

pub mod comm_operations;
pub mod communicator;
pub mod local;
pub mod shared;

#[cfg(feature = "mpi")]
pub mod mpi;

// Re-exports for convenience
pub use comm_operations::ReduceOp;
pub use communicator::{CommunicationContext, Communicator};
pub use shared::{SharedRegion, SharedWindow};

/// Transport backing a communication context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommType {
    Local,
    #[cfg(feature = "mpi")]
    Mpi,
}
