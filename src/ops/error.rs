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

use crate::error::{Code, Status};
use crate::message::Response;
use crate::tensor::TensorTableEntry;

use super::CollectiveOperation;

/// Fails the whole batch with the coordinator's diagnostic
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorOp;

impl CollectiveOperation for ErrorOp {
    fn execute(&mut self, _entries: &mut [TensorTableEntry], response: &Response) -> Status {
        Status::new(Code::IncompatibleRequest, response.error_message.clone())
    }
}
