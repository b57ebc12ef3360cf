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

//! Request lifecycle: the state machine a statement moves through from
//! submission to a terminal outcome, the one-shot blocking primitive it parks
//! on inside a gate, and its accumulated errors, warnings and results.

pub mod signal;
pub mod state;

#[cfg(test)]
mod tests;

pub use signal::Signal;
pub use state::RequestState;

use crate::engine::Operator;
use crate::error::{ErrorRecord, GateError};
use crate::scheduler::Schedulable;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl RequestId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        RequestId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{:08x}", self.0)
    }
}

#[derive(Debug, Default)]
struct Diagnostics {
    errors: Vec<ErrorRecord>,
    warnings: Vec<ErrorRecord>,
    limit_reached: bool,
}

#[derive(Debug, Clone, Copy)]
struct Timings {
    submitted: Instant,
    service_started: Option<Instant>,
    completed: Option<Instant>,
}

pub struct Request {
    id: RequestId,
    statement: String,
    tx_id: Option<String>,
    timeout: Option<Duration>,
    error_limit: usize,
    state: AtomicU8,
    crashed: AtomicBool,
    signal: Signal,
    stop_target: Mutex<Option<Weak<dyn Operator>>>,
    // Held by `stop` and `finish` so cancellation never overlaps completion.
    done_gate: Mutex<()>,
    diagnostics: Mutex<Diagnostics>,
    results: Mutex<Vec<Value>>,
    timings: Mutex<Timings>,
}

impl Request {
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            id: RequestId::next(),
            statement: statement.into(),
            tx_id: None,
            timeout: None,
            error_limit: 0,
            state: AtomicU8::new(RequestState::Submitted as u8),
            crashed: AtomicBool::new(false),
            signal: Signal::new(),
            stop_target: Mutex::new(None),
            done_gate: Mutex::new(()),
            diagnostics: Mutex::new(Diagnostics::default()),
            results: Mutex::new(Vec::new()),
            timings: Mutex::new(Timings {
                submitted: Instant::now(),
                service_started: None,
                completed: None,
            }),
        }
    }

    pub fn with_tx_id(mut self, tx_id: impl Into<String>) -> Self {
        let tx_id = tx_id.into();
        self.tx_id = (!tx_id.is_empty()).then_some(tx_id);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// `0` means unlimited.
    pub fn with_error_limit(mut self, limit: usize) -> Self {
        self.error_limit = limit;
        self
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn statement(&self) -> &str {
        &self.statement
    }

    pub fn tx_id(&self) -> Option<&str> {
        self.tx_id.as_deref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn error_limit(&self) -> usize {
        self.error_limit
    }

    /// Observed state. A crashed request reports `Abend` instead.
    pub fn state(&self) -> RequestState {
        if self.crashed.load(Ordering::Acquire) {
            return RequestState::Abend;
        }
        self.raw_state()
    }

    pub fn raw_state(&self) -> RequestState {
        RequestState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Applies `next` unless the current state refuses it: nothing leaves
    /// `Fatal`, and `Stopped`/`Completed` cannot overwrite an interruption.
    pub fn set_state(&self, next: RequestState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !RequestState::from_u8(current).accepts(next) {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Moves from exactly `from` to `to`; fails if anything else got there
    /// first.
    pub fn transition(&self, from: RequestState, to: RequestState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves to `next` only while the request is still active.
    fn halt_if_active(&self, next: RequestState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !RequestState::from_u8(current).is_active() {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Approximate and lock-free; may lag a concurrent `set_state`.
    pub fn halted(&self) -> bool {
        !RequestState::from_u8(self.state.load(Ordering::Relaxed)).is_active()
    }

    pub fn crashed(&self) -> bool {
        self.crashed.load(Ordering::Acquire)
    }

    pub fn mark_crashed(&self) {
        self.crashed.store(true, Ordering::Release);
    }

    pub fn set_stop_target(&self, target: &Arc<dyn Operator>) {
        *self.stop_target.lock() = Some(Arc::downgrade(target));
    }

    pub fn has_stop_target(&self) -> bool {
        self.stop_target.lock().is_some()
    }

    /// Sets `state` and cancels the registered operator, at most once across
    /// all callers.
    pub fn stop(&self, state: RequestState) {
        self.set_state(state);
        self.cancel_target();
    }

    /// Timer path. A request that already left the active states keeps its
    /// outcome.
    pub fn expire(&self) -> bool {
        if !self.halt_if_active(RequestState::Timeout) {
            return false;
        }
        self.cancel_target();
        true
    }

    /// Client went away.
    pub fn close(&self) -> bool {
        if !self.halt_if_active(RequestState::Closed) {
            return false;
        }
        self.cancel_target();
        true
    }

    fn cancel_target(&self) {
        let _done = self.done_gate.lock();
        let target = self.stop_target.lock().take();
        if let Some(op) = target.and_then(|weak| weak.upgrade()) {
            op.cancel();
        }
    }

    pub fn servicing(&self) {
        self.timings.lock().service_started = Some(Instant::now());
    }

    /// Normal completion: settles `Success`/`Errors` when still running, then
    /// `Completed`. Interrupted or fatal requests keep their state.
    pub fn finish(&self) {
        let _done = self.done_gate.lock();
        self.stop_target.lock().take();
        self.timings.lock().completed = Some(Instant::now());

        let settled = if self.has_errors() {
            RequestState::Errors
        } else {
            RequestState::Success
        };
        let _ = self.state.compare_exchange(
            RequestState::Running as u8,
            settled as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.set_state(RequestState::Completed);
    }

    /// Marks completion time for requests that never reached execution.
    pub(crate) fn mark_completed_at(&self) {
        let mut timings = self.timings.lock();
        if timings.completed.is_none() {
            timings.completed = Some(Instant::now());
        }
    }

    pub fn error(&self, err: impl Into<ErrorRecord>) {
        let record = err.into();
        let limit_tripped = {
            let mut diag = self.diagnostics.lock();
            if diag.limit_reached {
                return;
            }
            if let Some(existing) = diag.errors.iter_mut().find(|e| e.same_as(&record)) {
                existing.repeats += 1;
                return;
            }
            diag.errors.push(record);
            if self.error_limit > 0 && diag.errors.len() > self.error_limit {
                diag.limit_reached = true;
                diag.errors.push(ErrorRecord::from(GateError::ErrorLimitExceeded {
                    limit: self.error_limit,
                }));
                true
            } else {
                false
            }
        };
        if limit_tripped {
            self.stop(RequestState::Fatal);
        }
    }

    pub fn warning(&self, wrn: impl Into<ErrorRecord>) {
        let record = wrn.into();
        let mut diag = self.diagnostics.lock();
        if let Some(existing) = diag.warnings.iter_mut().find(|w| w.same_as(&record)) {
            existing.repeats += 1;
            return;
        }
        diag.warnings.push(record);
    }

    pub fn fatal(&self, err: impl Into<ErrorRecord>) {
        self.error(err);
        self.stop(RequestState::Fatal);
    }

    pub fn has_errors(&self) -> bool {
        !self.diagnostics.lock().errors.is_empty()
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.diagnostics.lock().errors.clone()
    }

    pub fn warnings(&self) -> Vec<ErrorRecord> {
        self.diagnostics.lock().warnings.clone()
    }

    /// Appends one result value. Refused once the request has halted, which
    /// tells the producer to stop.
    pub fn result(&self, item: Value) -> bool {
        if self.halted() {
            return false;
        }
        self.results.lock().push(item);
        true
    }

    pub fn results(&self) -> Vec<Value> {
        self.results.lock().clone()
    }

    pub fn take_results(&self) -> Vec<Value> {
        std::mem::take(&mut *self.results.lock())
    }

    pub fn submitted_at(&self) -> Instant {
        self.timings.lock().submitted
    }

    pub fn service_started_at(&self) -> Option<Instant> {
        self.timings.lock().service_started
    }

    pub fn completed_at(&self) -> Option<Instant> {
        self.timings.lock().completed
    }

    pub fn elapsed(&self) -> Duration {
        let timings = *self.timings.lock();
        timings
            .completed
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(timings.submitted)
    }

    pub fn arm(&self) {
        self.signal.arm();
    }

    pub fn wait(&self) {
        self.signal.wait();
    }

    pub fn wake(&self) {
        self.signal.wake();
    }

    pub fn snapshot(&self) -> RequestSnapshot {
        RequestSnapshot {
            request_id: self.id,
            statement: self.statement.clone(),
            tx_id: self.tx_id.clone(),
            state: self.state(),
            elapsed_ms: self.elapsed().as_millis() as u64,
            errors: self.errors(),
            warnings: self.warnings(),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("tx_id", &self.tx_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Schedulable for Request {
    fn id(&self) -> RequestId {
        self.id
    }

    fn tx_id(&self) -> Option<&str> {
        Request::tx_id(self)
    }

    fn state(&self) -> RequestState {
        Request::state(self)
    }

    fn set_state(&self, state: RequestState) -> bool {
        Request::set_state(self, state)
    }

    fn arm(&self) {
        self.signal.arm();
    }

    fn wait(&self) {
        self.signal.wait();
    }

    fn wake(&self) {
        self.signal.wake();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestSnapshot {
    pub request_id: RequestId,
    pub statement: String,
    pub tx_id: Option<String>,
    pub state: RequestState,
    pub elapsed_ms: u64,
    pub errors: Vec<ErrorRecord>,
    pub warnings: Vec<ErrorRecord>,
}
