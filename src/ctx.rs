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

//! Corral context: the entry point for submitting collectives
//!
//! ```rust,ignore
//! let ctx = CorralContext::init(comm, EngineConfig::from_env()?)?;
//! let grad = TensorDescriptor::from_f32(vec![4], &[1.0, 2.0, 3.0, 4.0])?;
//! let summed = ctx.allreduce("grad1", grad)?.wait()?;
//! ctx.shutdown()?;
//! ```

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::background::{BackgroundLoop, SharedState};
use crate::config::EngineConfig;
use crate::error::{CorralError, CorralResult};
use crate::message::Request;
use crate::net::CommunicationContext;
use crate::tensor::{CollectiveKind, CompletionHandle, TensorDescriptor, TensorTableEntry};

/// Per-process engine handle
pub struct CorralContext {
    comm: Arc<dyn CommunicationContext>,
    config: EngineConfig,
    state: Arc<SharedState>,
    background: Mutex<Option<JoinHandle<()>>>,
}

impl CorralContext {
    /// Start the background loop on top of `comm`
    ///
    /// Every rank of the group must call this with the same configuration.
    pub fn init(comm: Arc<dyn CommunicationContext>, config: EngineConfig) -> CorralResult<Arc<Self>> {
        let state = SharedState::new();
        let background = BackgroundLoop::new(comm.clone(), state.clone(), &config);
        let rank = comm.rank();
        log::info!(
            "starting corral on rank {} of {} ({:?} backend): {:?}",
            rank,
            comm.size(),
            comm.comm_type(),
            config
        );

        let handle = thread::Builder::new()
            .name(format!("corral-background-{}", rank))
            .spawn(move || background.run())
            .map_err(|e| CorralError::transport(format!("failed to spawn background thread: {}", e)))?;

        Ok(Arc::new(Self {
            comm,
            config,
            state,
            background: Mutex::new(Some(handle)),
        }))
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn size(&self) -> usize {
        self.comm.size()
    }

    pub fn local_rank(&self) -> usize {
        self.comm.local_rank()
    }

    pub fn local_size(&self) -> usize {
        self.comm.local_size()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn communicator(&self) -> &Arc<dyn CommunicationContext> {
        &self.comm
    }

    /// Whether the background loop is still accepting work
    pub fn is_running(&self) -> bool {
        !self.state.loop_finished() && !self.state.shutdown_requested()
    }

    /// Queue a collective on `tensor_name`
    ///
    /// Fails synchronously with `InvalidArgument` when the name is already
    /// pending on this rank or the request can never be valid, and with
    /// `Aborted` after shutdown.
    pub fn submit(
        &self,
        tensor_name: impl Into<String>,
        kind: CollectiveKind,
        descriptor: TensorDescriptor,
    ) -> CorralResult<CompletionHandle> {
        let tensor_name = tensor_name.into();
        if self.state.shutdown_requested() || self.state.loop_finished() {
            return Err(CorralError::Aborted(format!(
                "engine has shut down, {} was not submitted",
                tensor_name
            )));
        }
        let expected = descriptor
            .shape
            .checked_byte_len(descriptor.dtype.size())
            .filter(|_| descriptor.shape.is_valid());
        if expected != Some(descriptor.data.len()) {
            return Err(CorralError::InvalidArgument(format!(
                "{} holds {} bytes, which does not match shape {} of {}",
                tensor_name,
                descriptor.data.len(),
                descriptor.shape,
                descriptor.dtype
            )));
        }
        match kind {
            CollectiveKind::Broadcast { root_rank } if root_rank >= self.size() => {
                return Err(CorralError::InvalidArgument(format!(
                    "broadcast root {} for {} is outside a world of {}",
                    root_rank,
                    tensor_name,
                    self.size()
                )));
            }
            CollectiveKind::Allgather if descriptor.shape.rank() == 0 => {
                return Err(CorralError::InvalidArgument(format!(
                    "cannot allgather scalar {}",
                    tensor_name
                )));
            }
            _ => {}
        }

        let mut entry =
            TensorTableEntry::new(tensor_name.clone(), descriptor).with_root_rank(kind.root_rank());
        let handle = entry.attach_completion();
        let request = Request {
            request_rank: self.rank(),
            request_type: kind.request_type(),
            tensor_name,
            tensor_type: entry.dtype,
            tensor_shape: entry.shape.clone(),
            root_rank: kind.root_rank(),
            device: entry.device,
        };

        self.state.queue()?.add(entry, request).map_err(|e| {
            log::warn!("rejected submission on rank {}: {}", self.rank(), e);
            e
        })?;
        Ok(handle)
    }

    pub fn allreduce(
        &self,
        tensor_name: impl Into<String>,
        descriptor: TensorDescriptor,
    ) -> CorralResult<CompletionHandle> {
        self.submit(tensor_name, CollectiveKind::Allreduce, descriptor)
    }

    pub fn allgather(
        &self,
        tensor_name: impl Into<String>,
        descriptor: TensorDescriptor,
    ) -> CorralResult<CompletionHandle> {
        self.submit(tensor_name, CollectiveKind::Allgather, descriptor)
    }

    pub fn broadcast(
        &self,
        tensor_name: impl Into<String>,
        descriptor: TensorDescriptor,
        root_rank: usize,
    ) -> CorralResult<CompletionHandle> {
        self.submit(tensor_name, CollectiveKind::Broadcast { root_rank }, descriptor)
    }

    /// Ask the group to stop and wait for this rank's loop to exit
    ///
    /// Pending tensors fail with `Aborted`. Calling it again is a no-op.
    pub fn shutdown(&self) -> CorralResult<()> {
        self.state.request_shutdown();
        let handle = self
            .background
            .lock()
            .map_err(|_| CorralError::transport("background handle lock poisoned"))?
            .take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| CorralError::transport("background thread panicked"))?;
            log::info!("corral on rank {} shut down", self.rank());
        }
        Ok(())
    }
}

impl Drop for CorralContext {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("shutdown on drop failed: {}", e);
        }
    }
}
