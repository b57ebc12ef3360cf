/*
 * Copyright 2026 querygate Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use serde::Serialize;
use std::fmt;
use thiserror::Error;

pub const E_SERVICE_UNAVAILABLE: u32 = 1182;
pub const E_REQUEST_ERROR_LIMIT: u32 = 1195;
pub const E_INTERNAL: u32 = 5000;
pub const E_EXECUTION_PANIC: u32 = 5001;
pub const E_INVALID_SETTING: u32 = 6000;
pub const E_IO: u32 = 6001;
pub const E_TRANSACTION_INVALID: u32 = 17000;
pub const E_TRANSACTION_EXPIRED: u32 = 17010;
pub const E_TRANSACTION_RELEASED: u32 = 17011;
pub const E_TRANSACTION_INUSE: u32 = 17013;
pub const E_TRANSACTION_QUEUE_FULL: u32 = 17021;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxInvalid {
    Unknown,
    Expired,
    Released,
    InUse,
}

impl fmt::Display for TxInvalid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            TxInvalid::Unknown => "is not known",
            TxInvalid::Expired => "has expired",
            TxInvalid::Released => "has been released",
            TxInvalid::InUse => "is in use by another statement",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("service cannot handle requests: {pool} queue is full")]
    CapacityExceeded { pool: String },

    #[error("transaction queue is full for transaction {tx_id}")]
    TransactionQueueFull { tx_id: String },

    #[error("transaction {tx_id} {reason}")]
    TransactionInvalid { tx_id: String, reason: TxInvalid },

    #[error("request aborted: number of errors reached the limit of {limit}")]
    ErrorLimitExceeded { limit: usize },

    #[error("internal inconsistency: {0}")]
    InternalInconsistency(String),

    #[error("execution panic: {0}")]
    ExecutionPanic(String),

    #[error("execution error {code}: {message}")]
    Execution { code: u32, message: String },

    #[error("invalid setting: {0}")]
    InvalidSetting(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl GateError {
    pub fn code(&self) -> u32 {
        match self {
            GateError::CapacityExceeded { .. } => E_SERVICE_UNAVAILABLE,
            GateError::TransactionQueueFull { .. } => E_TRANSACTION_QUEUE_FULL,
            GateError::TransactionInvalid { reason, .. } => match reason {
                TxInvalid::Unknown => E_TRANSACTION_INVALID,
                TxInvalid::Expired => E_TRANSACTION_EXPIRED,
                TxInvalid::Released => E_TRANSACTION_RELEASED,
                TxInvalid::InUse => E_TRANSACTION_INUSE,
            },
            GateError::ErrorLimitExceeded { .. } => E_REQUEST_ERROR_LIMIT,
            GateError::InternalInconsistency(_) => E_INTERNAL,
            GateError::ExecutionPanic(_) => E_EXECUTION_PANIC,
            GateError::Execution { code, .. } => *code,
            GateError::InvalidSetting(_) => E_INVALID_SETTING,
            GateError::Io(_) => E_IO,
        }
    }

    pub fn tx_invalid(tx_id: impl Into<String>, reason: TxInvalid) -> Self {
        GateError::TransactionInvalid {
            tx_id: tx_id.into(),
            reason,
        }
    }
}

pub type Result<T> = std::result::Result<T, GateError>;

/// An error or warning as accumulated on a request. Identical code and
/// message pairs are folded into `repeats` instead of being appended again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub code: u32,
    pub message: String,
    pub repeats: u32,
}

impl ErrorRecord {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            repeats: 0,
        }
    }

    pub fn same_as(&self, other: &ErrorRecord) -> bool {
        self.code == other.code && self.message == other.message
    }
}

impl From<&GateError> for ErrorRecord {
    fn from(err: &GateError) -> Self {
        ErrorRecord::new(err.code(), err.to_string())
    }
}

impl From<GateError> for ErrorRecord {
    fn from(err: GateError) -> Self {
        ErrorRecord::from(&err)
    }
}
