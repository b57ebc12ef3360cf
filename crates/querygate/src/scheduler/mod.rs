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

pub mod gate;
pub mod watchdog;

#[cfg(test)]
mod tests;

pub use gate::{GateStats, SchedulerGate};
pub use watchdog::Watchdog;

use crate::request::{RequestId, RequestState};

/// What a gate needs from the thing it parks.
pub trait Schedulable: Send + Sync {
    fn id(&self) -> RequestId;
    fn tx_id(&self) -> Option<&str>;
    fn state(&self) -> RequestState;
    fn set_state(&self, state: RequestState) -> bool;
    fn arm(&self);
    fn wait(&self);
    fn wake(&self);
}
