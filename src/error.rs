//   Copyright (c) 2024-2026 Dataverse SQL Engine Contributors
//   All rights reserved.
//
//   Permission is hereby granted, free of charge, to any person obtaining a copy
//   of this software and associated documentation files (the "Software"), to deal
//   in the Software without restriction, including without limitation the rights
//   to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
//   copies of the Software, and to permit persons to whom the Software is
//   furnished to do so, subject to the following conditions:
//
//   The above copyright notice and this permission notice shall be included in all
//   copies or substantial portions of the Software.
//
//   THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
//   IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
//   FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
//   AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
//   LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
//   OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
//   SOFTWARE.
//! Stable-identifier error sum type. Every raised error carries a code from
//! `spec.md` §7; optional payloads (retry-after, record index, reauth flag)
//! ride alongside the variant that needs them.

use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum EngineError {
    Parse(String),
    Validation(String),
    AuthNoActiveProfile,
    AuthInvalidCredentials { requires_reauth: bool },
    ConnectionEnvironmentNotFound(String),
    ConnectionTransient { message: String, retry_after: Option<Duration> },
    OperationNotSupported(String),
    AggregateOverflow,
    MemoryLimitExceeded(String),
    InfiniteLoopSuspected,
    RowCapExceeded { cap: u64 },
    DmlPerRecord { index: usize, code: String, message: String },
    SessionNotFound(String),
    SessionAlreadyExists(String),
    Cancelled,
}

impl EngineError {
    /// Stable identifier string, matching `spec.md` §7's naming.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Parse(_) => "ParseError",
            EngineError::Validation(_) => "Validation",
            EngineError::AuthNoActiveProfile => "Auth.NoActiveProfile",
            EngineError::AuthInvalidCredentials { .. } => "Auth.InvalidCredentials",
            EngineError::ConnectionEnvironmentNotFound(_) => "Connection.EnvironmentNotFound",
            EngineError::ConnectionTransient { .. } => "Connection.Transient",
            EngineError::OperationNotSupported(_) => "Operation.NotSupported",
            EngineError::AggregateOverflow => "Query.AggregateOverflow",
            EngineError::MemoryLimitExceeded(_) => "Query.MemoryLimitExceeded",
            EngineError::InfiniteLoopSuspected => "Query.InfiniteLoopSuspected",
            EngineError::RowCapExceeded { .. } => "Query.RowCapExceeded",
            EngineError::DmlPerRecord { .. } => "DML.PerRecord",
            EngineError::SessionNotFound(_) => "Session.NotFound",
            EngineError::SessionAlreadyExists(_) => "Session.AlreadyExists",
            EngineError::Cancelled => "Cancelled",
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            EngineError::ConnectionTransient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }

    pub fn transient(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        EngineError::ConnectionTransient {
            message: message.into(),
            retry_after,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Parse(msg) => write!(f, "parse error: {msg}"),
            EngineError::Validation(msg) => write!(f, "validation error: {msg}"),
            EngineError::AuthNoActiveProfile => write!(f, "no active profile"),
            EngineError::AuthInvalidCredentials { requires_reauth } => {
                write!(f, "invalid credentials (requires_reauth={requires_reauth})")
            }
            EngineError::ConnectionEnvironmentNotFound(name) => {
                write!(f, "environment not found: {name}")
            }
            EngineError::ConnectionTransient { message, retry_after } => {
                write!(f, "transient connection error: {message}")?;
                if let Some(d) = retry_after {
                    write!(f, " (retry after {:?})", d)?;
                }
                Ok(())
            }
            EngineError::OperationNotSupported(msg) => write!(f, "operation not supported: {msg}"),
            EngineError::AggregateOverflow => write!(f, "aggregate query exceeded the backend's candidate-row limit"),
            EngineError::MemoryLimitExceeded(msg) => write!(f, "memory limit exceeded: {msg}"),
            EngineError::InfiniteLoopSuspected => write!(f, "WHILE loop exceeded its iteration cap"),
            EngineError::RowCapExceeded { cap } => write!(f, "row cap of {cap} exceeded"),
            EngineError::DmlPerRecord { index, code, message } => {
                write!(f, "record {index} failed ({code}): {message}")
            }
            EngineError::SessionNotFound(name) => write!(f, "session object not found: {name}"),
            EngineError::SessionAlreadyExists(name) => write!(f, "session object already exists: {name}"),
            EngineError::Cancelled => write!(f, "execution cancelled"),
        }
    }
}

impl std::error::Error for EngineError {}

pub type Result<T> = std::result::Result<T, EngineError>;
