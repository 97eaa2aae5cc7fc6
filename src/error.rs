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

//! Error handling for collective coordination
//!
//! Coordination-level failures (`IncompatibleRequest`) are decided once on the
//! coordinator and shipped to every worker inside an Error response. Transport
//! failures are local to a worker and surface directly from the backend.

use std::fmt;

/// Error codes carried by [`Status`] and [`CorralError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Ok = 0,
    InvalidArgument = 1,
    IncompatibleRequest = 2,
    TransportFailure = 3,
    StallWarning = 4,
    Aborted = 5,
    NotImplemented = 6,
    SerializationError = 7,
    UnknownError = 9,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Code::Ok => write!(f, "OK"),
            Code::InvalidArgument => write!(f, "Invalid argument"),
            Code::IncompatibleRequest => write!(f, "Incompatible request"),
            Code::TransportFailure => write!(f, "Transport failure"),
            Code::StallWarning => write!(f, "Stall warning"),
            Code::Aborted => write!(f, "Aborted"),
            Code::NotImplemented => write!(f, "Not implemented"),
            Code::SerializationError => write!(f, "Serialization error"),
            Code::UnknownError => write!(f, "Unknown error"),
        }
    }
}

/// Main error type
#[derive(thiserror::Error, Debug)]
pub enum CorralError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Incompatible request: {0}")]
    IncompatibleRequest(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Generic error with code {code}: {message}")]
    Generic { code: Code, message: String },
}

impl CorralError {
    /// Create a new error with a specific code and message
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            Code::InvalidArgument => CorralError::InvalidArgument(message),
            Code::IncompatibleRequest => CorralError::IncompatibleRequest(message),
            Code::TransportFailure => CorralError::Transport(message),
            Code::Aborted => CorralError::Aborted(message),
            Code::NotImplemented => CorralError::NotImplemented(message),
            _ => CorralError::Generic { code, message },
        }
    }

    /// Shorthand for a transport failure
    pub fn transport(message: impl Into<String>) -> Self {
        CorralError::Transport(message.into())
    }

    /// Get the error code
    pub fn code(&self) -> Code {
        match self {
            CorralError::InvalidArgument(_) => Code::InvalidArgument,
            CorralError::IncompatibleRequest(_) => Code::IncompatibleRequest,
            CorralError::Transport(_) => Code::TransportFailure,
            CorralError::Aborted(_) => Code::Aborted,
            CorralError::NotImplemented(_) => Code::NotImplemented,
            CorralError::Serialization(_) => Code::SerializationError,
            CorralError::Generic { code, .. } => *code,
        }
    }

    /// The message without the code prefix
    pub fn message(&self) -> String {
        match self {
            CorralError::InvalidArgument(m)
            | CorralError::IncompatibleRequest(m)
            | CorralError::Transport(m)
            | CorralError::Aborted(m)
            | CorralError::NotImplemented(m) => m.clone(),
            CorralError::Serialization(e) => e.to_string(),
            CorralError::Generic { message, .. } => message.clone(),
        }
    }
}

/// Type alias for Results using CorralError
pub type CorralResult<T> = Result<T, CorralError>;

/// Outcome of executing one response on a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: Code,
    message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self {
            code: Code::Ok,
            message: String::new(),
        }
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(Code::Aborted, message)
    }

    pub fn get_code(&self) -> Code {
        self.code
    }

    pub fn get_msg(&self) -> &str {
        &self.message
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            write!(f, "OK")
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl From<CorralError> for Status {
    fn from(error: CorralError) -> Self {
        Self {
            code: error.code(),
            message: error.message(),
        }
    }
}

impl From<Status> for CorralResult<()> {
    fn from(status: Status) -> Self {
        if status.is_ok() {
            Ok(())
        } else {
            Err(CorralError::new(status.get_code(), status.get_msg()))
        }
    }
}
