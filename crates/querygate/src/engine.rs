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

//! Narrow boundary towards the execution engine. The dispatcher builds one
//! operator per admitted request and runs it on the calling thread.

use crate::dispatcher::Pool;
use crate::error::Result;
use crate::request::{Request, RequestId};
use crate::tx::TransactionContext;
use std::sync::Arc;
use std::time::Instant;

/// Root of an executing statement.
pub trait Operator: Send + Sync {
    /// Drives the statement to completion, reporting results, errors and
    /// warnings on `request`. An `Err` is recorded as one more request error.
    fn run(&self, request: &Request) -> Result<()>;

    /// Asks a running `run` to stop early. Called at most once, possibly
    /// from another thread, while the request's completion lock is held, so
    /// it must not report back on the request.
    fn cancel(&self);
}

pub trait ExecutionEngine: Send + Sync {
    fn build(&self, request: &Request, ctx: &ExecutionContext) -> Result<Arc<dyn Operator>>;
}

#[derive(Clone)]
pub struct ExecutionContext {
    pub request_id: RequestId,
    pub pool: Pool,
    pub max_parallelism: usize,
    pub transaction: Option<Arc<dyn TransactionContext>>,
    pub deadline: Option<Instant>,
}

impl ExecutionContext {
    pub fn tx_id(&self) -> Option<&str> {
        self.transaction.as_ref().map(|tx| tx.tx_id())
    }
}
