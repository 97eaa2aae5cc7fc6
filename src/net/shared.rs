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

//! Node-local shared memory windows
//!
//! Ranks on one node read and write the same region. Ordering between
//! writers and readers is established by barriers on the local communicator,
//! never by the window itself.

use std::fmt;
use std::sync::{Arc, RwLock};

use crate::error::{CorralError, CorralResult};

/// A byte region visible to every rank on a node
pub trait SharedRegion: Send + Sync {
    fn len(&self) -> usize;
    fn read(&self, offset: usize, dst: &mut [u8]) -> CorralResult<()>;
    fn write(&self, offset: usize, src: &[u8]) -> CorralResult<()>;
}

/// Handle to one rank's segment of a shared window
#[derive(Clone)]
pub struct SharedWindow {
    region: Arc<dyn SharedRegion>,
}

impl SharedWindow {
    pub fn new(region: Arc<dyn SharedRegion>) -> Self {
        Self { region }
    }

    /// Window backed by ordinary heap memory, for ranks that are threads
    pub fn heap(len: usize) -> Self {
        Self::new(Arc::new(HeapRegion::new(len)))
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self, offset: usize, dst: &mut [u8]) -> CorralResult<()> {
        self.region.read(offset, dst)
    }

    pub fn read_vec(&self, offset: usize, len: usize) -> CorralResult<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.region.read(offset, &mut out)?;
        Ok(out)
    }

    pub fn write(&self, offset: usize, src: &[u8]) -> CorralResult<()> {
        self.region.write(offset, src)
    }
}

impl fmt::Debug for SharedWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedWindow").field("len", &self.len()).finish()
    }
}

pub(crate) fn check_bounds(offset: usize, len: usize, total: usize) -> CorralResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= total => Ok(()),
        _ => Err(CorralError::transport(format!(
            "shared window access [{}, {}+{}) exceeds window of {} bytes",
            offset, offset, len, total
        ))),
    }
}

/// Heap memory shared between threads
pub struct HeapRegion {
    data: RwLock<Vec<u8>>,
    len: usize,
}

impl HeapRegion {
    pub fn new(len: usize) -> Self {
        Self {
            data: RwLock::new(vec![0u8; len]),
            len,
        }
    }
}

impl SharedRegion for HeapRegion {
    fn len(&self) -> usize {
        self.len
    }

    fn read(&self, offset: usize, dst: &mut [u8]) -> CorralResult<()> {
        check_bounds(offset, dst.len(), self.len)?;
        let data = self
            .data
            .read()
            .map_err(|_| CorralError::transport("shared window lock poisoned"))?;
        dst.copy_from_slice(&data[offset..offset + dst.len()]);
        Ok(())
    }

    fn write(&self, offset: usize, src: &[u8]) -> CorralResult<()> {
        check_bounds(offset, src.len(), self.len)?;
        let mut data = self
            .data
            .write()
            .map_err(|_| CorralError::transport("shared window lock poisoned"))?;
        data[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }
}
