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

//! Corral: coordination engine for collective tensor operations
//!
//! Workers submit named tensors for allreduce, allgather or broadcast. Rank
//! zero decides which names are ready on every rank and in which order they
//! run; every rank then executes that decision through a pluggable
//! communication backend, fusing small tensors into larger transport calls
//! and, optionally, gathering through node-local shared memory first.

pub mod background;
pub mod config;
pub mod coordinator;
pub mod ctx;
pub mod data_types;
pub mod error;
pub mod fusion;
pub mod message;
pub mod net;
pub mod ops;
pub mod tensor;
pub mod timeline;
pub mod util;

// Re-export commonly used types
pub use crate::config::EngineConfig;
pub use crate::ctx::CorralContext;
pub use crate::data_types::DataType;
pub use crate::error::{Code, CorralError, CorralResult, Status};
pub use crate::tensor::{
    CollectiveKind, CompletionHandle, Device, TensorDescriptor, TensorOutput, TensorShape,
};

/// The main entry point and version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
