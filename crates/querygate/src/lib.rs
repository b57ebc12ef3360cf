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

pub mod active;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod expiry;
pub mod fault;
pub mod metrics;
pub mod request;
pub mod scheduler;
pub mod tx;
pub mod txqueue;

pub use config::{DispatcherConfig, Setting};
pub use dispatcher::{Dispatcher, DispatcherVitals, Pool};
pub use engine::{ExecutionContext, ExecutionEngine, Operator};
pub use error::{ErrorRecord, GateError, Result};
pub use request::{Request, RequestId, RequestSnapshot, RequestState};
pub use scheduler::{GateStats, Schedulable, SchedulerGate, Watchdog};
pub use tx::{TransactionContext, TransactionManager, TransactionSource};
pub use txqueue::TransactionQueues;
