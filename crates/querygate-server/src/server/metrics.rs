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

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerMetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_refused: u64,
    pub active_connections: u64,
    pub peak_connections: u64,
    pub commands_total: u64,
    pub malformed_commands: u64,
    pub queries_total: u64,
    pub queries_unavailable: u64,
    pub query_latency_total_ns: u64,
    pub query_latency_max_ns: u64,
    pub reply_statuses: HashMap<String, u64>,
}

#[derive(Debug, Default)]
pub struct ServerMetrics {
    connections_accepted: AtomicU64,
    connections_refused: AtomicU64,
    active_connections: AtomicU64,
    peak_connections: AtomicU64,
    commands_total: AtomicU64,
    malformed_commands: AtomicU64,
    queries_total: AtomicU64,
    queries_unavailable: AtomicU64,
    query_latency_total_ns: AtomicU64,
    query_latency_max_ns: AtomicU64,
    reply_statuses: Mutex<HashMap<String, u64>>,
}

impl ServerMetrics {
    pub fn on_connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        let active = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_connections.fetch_max(active, Ordering::Relaxed);
    }

    pub fn on_connection_refused(&self) {
        self.connections_refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn on_malformed_command(&self) {
        self.malformed_commands.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_reply(&self, status: &str) {
        self.commands_total.fetch_add(1, Ordering::Relaxed);
        let mut map = self.reply_statuses.lock();
        *map.entry(status.to_string()).or_insert(0) += 1;
    }

    pub fn on_query_finished(&self, elapsed_ns: u64, admitted: bool) {
        self.queries_total.fetch_add(1, Ordering::Relaxed);
        if !admitted {
            self.queries_unavailable.fetch_add(1, Ordering::Relaxed);
        }
        self.query_latency_total_ns
            .fetch_add(elapsed_ns, Ordering::Relaxed);
        self.query_latency_max_ns
            .fetch_max(elapsed_ns, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServerMetricsSnapshot {
        ServerMetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_refused: self.connections_refused.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            peak_connections: self.peak_connections.load(Ordering::Relaxed),
            commands_total: self.commands_total.load(Ordering::Relaxed),
            malformed_commands: self.malformed_commands.load(Ordering::Relaxed),
            queries_total: self.queries_total.load(Ordering::Relaxed),
            queries_unavailable: self.queries_unavailable.load(Ordering::Relaxed),
            query_latency_total_ns: self.query_latency_total_ns.load(Ordering::Relaxed),
            query_latency_max_ns: self.query_latency_max_ns.load(Ordering::Relaxed),
            reply_statuses: self.reply_statuses.lock().clone(),
        }
    }
}
