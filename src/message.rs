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

//! Control-plane messages exchanged between workers and the coordinator
//!
//! Workers send [`RequestList`]s to rank zero every cycle; rank zero answers
//! with one [`ResponseList`] that every worker executes in order.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::data_types::DataType;
use crate::error::CorralResult;
use crate::tensor::{Device, TensorShape};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestType {
    Allreduce,
    Allgather,
    Broadcast,
}

impl RequestType {
    pub fn name(&self) -> &'static str {
        match self {
            RequestType::Allreduce => "ALLREDUCE",
            RequestType::Allgather => "ALLGATHER",
            RequestType::Broadcast => "BROADCAST",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// "Rank `request_rank` is ready to run `request_type` on `tensor_name`"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub request_rank: usize,
    pub request_type: RequestType,
    pub tensor_name: String,
    pub tensor_type: DataType,
    pub tensor_shape: TensorShape,
    pub root_rank: usize,
    pub device: Device,
}

impl Request {
    /// Bytes this rank contributes
    pub fn byte_size(&self) -> usize {
        self.tensor_shape
            .checked_byte_len(self.tensor_type.size())
            .unwrap_or(usize::MAX)
    }
}

/// Everything one worker has to say in a coordination round
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestList {
    pub requests: Vec<Request>,
    pub shutdown: bool,
}

impl RequestList {
    pub fn encode(&self) -> CorralResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> CorralResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseType {
    Allreduce,
    Allgather,
    Broadcast,
    Error,
}

impl ResponseType {
    pub fn name(&self) -> &'static str {
        match self {
            ResponseType::Allreduce => "ALLREDUCE",
            ResponseType::Allgather => "ALLGATHER",
            ResponseType::Broadcast => "BROADCAST",
            ResponseType::Error => "ERROR",
        }
    }
}

impl From<RequestType> for ResponseType {
    fn from(request_type: RequestType) -> Self {
        match request_type {
            RequestType::Allreduce => ResponseType::Allreduce,
            RequestType::Allgather => ResponseType::Allgather,
            RequestType::Broadcast => ResponseType::Broadcast,
        }
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The coordinator's decision for one or more fused tensors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub response_type: ResponseType,
    /// Execution order; identical on every worker
    pub tensor_names: Vec<String>,
    pub error_message: String,
    /// Device of each rank's tensor, indexed by rank
    pub devices: Vec<Device>,
    /// Allgather only: for each tensor in order, the first dimension
    /// contributed by every rank
    pub tensor_sizes: Vec<i64>,
}

impl Response {
    pub fn new(response_type: ResponseType) -> Self {
        Self {
            response_type,
            tensor_names: Vec::new(),
            error_message: String::new(),
            devices: Vec::new(),
            tensor_sizes: Vec::new(),
        }
    }

    pub fn error(tensor_name: impl Into<String>, message: impl Into<String>) -> Self {
        let mut response = Self::new(ResponseType::Error);
        response.tensor_names.push(tensor_name.into());
        response.error_message = message.into();
        response
    }

    pub fn add_tensor_name(&mut self, name: impl Into<String>) {
        self.tensor_names.push(name.into());
    }

    pub fn tensor_names_string(&self) -> String {
        self.tensor_names.join(", ")
    }
}

/// One coordination round's output, broadcast verbatim from rank zero
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseList {
    pub responses: Vec<Response>,
    pub shutdown: bool,
}

impl ResponseList {
    pub fn encode(&self) -> CorralResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> CorralResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
