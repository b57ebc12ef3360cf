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

use crate::request::RequestState;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherMetricsSnapshot {
    pub requests_admitted: u64,
    pub requests_rejected: u64,
    pub tx_queue_full: u64,
    pub active_requests: u64,
    pub peak_requests: u64,
    pub requests_total: u64,
    pub requests_completed: u64,
    pub requests_with_errors: u64,
    pub requests_stopped: u64,
    pub requests_timed_out: u64,
    pub requests_closed: u64,
    pub requests_fatal: u64,
    pub requests_abended: u64,
    pub request_latency_total_ns: u64,
    pub request_latency_max_ns: u64,
    pub error_codes: HashMap<u32, u64>,
}

#[derive(Debug, Default)]
pub struct DispatcherMetrics {
    requests_admitted: AtomicU64,
    requests_rejected: AtomicU64,
    tx_queue_full: AtomicU64,
    active_requests: AtomicU64,
    peak_requests: AtomicU64,
    requests_total: AtomicU64,
    requests_completed: AtomicU64,
    requests_with_errors: AtomicU64,
    requests_stopped: AtomicU64,
    requests_timed_out: AtomicU64,
    requests_closed: AtomicU64,
    requests_fatal: AtomicU64,
    requests_abended: AtomicU64,
    request_latency_total_ns: AtomicU64,
    request_latency_max_ns: AtomicU64,
    error_codes: Mutex<HashMap<u32, u64>>,
}

impl DispatcherMetrics {
    pub fn on_admitted(&self) {
        self.requests_admitted.fetch_add(1, Ordering::Relaxed);
        let active = self.active_requests.fetch_add(1, Ordering::Relaxed) + 1;
        let mut peak = self.peak_requests.load(Ordering::Relaxed);
        while active > peak {
            match self.peak_requests.compare_exchange(
                peak,
                active,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => peak = actual,
            }
        }
    }

    pub fn on_rejected(&self) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_tx_queue_full(&self) {
        self.tx_queue_full.fetch_add(1, Ordering::Relaxed);
    }

    /// Call once per admitted request, after its slot is released.
    pub fn on_released(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn on_request_finished(&self, elapsed_ns: u64, state: RequestState, error_codes: &[u32]) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.request_latency_total_ns
            .fetch_add(elapsed_ns, Ordering::Relaxed);
        self.update_latency_max(elapsed_ns);

        let counter = match state {
            RequestState::Stopped => &self.requests_stopped,
            RequestState::Timeout => &self.requests_timed_out,
            RequestState::Closed => &self.requests_closed,
            RequestState::Fatal => &self.requests_fatal,
            RequestState::Abend => &self.requests_abended,
            _ if error_codes.is_empty() => &self.requests_completed,
            _ => &self.requests_with_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if !error_codes.is_empty() {
            let mut map = self.error_codes.lock();
            for code in error_codes {
                *map.entry(*code).or_insert(0) += 1;
            }
        }
    }

    pub fn snapshot(&self) -> DispatcherMetricsSnapshot {
        DispatcherMetricsSnapshot {
            requests_admitted: self.requests_admitted.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            tx_queue_full: self.tx_queue_full.load(Ordering::Relaxed),
            active_requests: self.active_requests.load(Ordering::Relaxed),
            peak_requests: self.peak_requests.load(Ordering::Relaxed),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_with_errors: self.requests_with_errors.load(Ordering::Relaxed),
            requests_stopped: self.requests_stopped.load(Ordering::Relaxed),
            requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
            requests_closed: self.requests_closed.load(Ordering::Relaxed),
            requests_fatal: self.requests_fatal.load(Ordering::Relaxed),
            requests_abended: self.requests_abended.load(Ordering::Relaxed),
            request_latency_total_ns: self.request_latency_total_ns.load(Ordering::Relaxed),
            request_latency_max_ns: self.request_latency_max_ns.load(Ordering::Relaxed),
            error_codes: self.error_codes.lock().clone(),
        }
    }

    fn update_latency_max(&self, elapsed_ns: u64) {
        let mut current = self.request_latency_max_ns.load(Ordering::Relaxed);
        while elapsed_ns > current {
            match self.request_latency_max_ns.compare_exchange(
                current,
                elapsed_ns,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }
}
