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

//! Per-transaction admission. The first statement of a transaction claims
//! it; later statements queue on a private single-servicer gate and are
//! handed the transaction in submission order as each predecessor finishes.
//! Tickets are claimed and released under the registry lock, so ordering is
//! strict; parking itself happens outside the lock.

use crate::error::{GateError, Result};
use crate::scheduler::{Schedulable, SchedulerGate};
use crate::tx::TransactionContext;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_TX_QUEUE_SIZE: usize = 16;
pub const DEFAULT_TX_BACKLOG_CAP: usize = 4096;

pub struct TransactionQueues {
    gates: Mutex<HashMap<String, Arc<SchedulerGate>>>,
    queued: AtomicI64,
    queue_size: AtomicUsize,
    backlog_cap: AtomicUsize,
}

impl Default for TransactionQueues {
    fn default() -> Self {
        Self::new(DEFAULT_TX_QUEUE_SIZE, DEFAULT_TX_BACKLOG_CAP)
    }
}

impl TransactionQueues {
    pub fn new(queue_size: usize, backlog_cap: usize) -> Self {
        Self {
            gates: Mutex::new(HashMap::new()),
            queued: AtomicI64::new(0),
            queue_size: AtomicUsize::new(queue_size),
            backlog_cap: AtomicUsize::new(backlog_cap),
        }
    }

    /// Returns once `request` holds the transaction, parking behind earlier
    /// statements if needed. Every `Ok` must be paired with a `post_admit`.
    pub fn pre_admit(
        &self,
        request: Arc<dyn Schedulable>,
        tx: &dyn TransactionContext,
    ) -> Result<()> {
        tx.valid()?;
        let tx_id = tx.tx_id();

        let mut gates = self.gates.lock();
        if !tx.in_use() {
            tx.set_in_use(true)?;
            return Ok(());
        }

        let gate = match gates.get(tx_id) {
            Some(gate) => Arc::clone(gate),
            None => {
                let gate = Arc::new(SchedulerGate::new(
                    format!("tx:{tx_id}"),
                    1,
                    self.queue_size(),
                ));
                gates.insert(tx_id.to_string(), Arc::clone(&gate));
                gate
            }
        };

        let cap = self.backlog_cap() as i64;
        if self.queued.load(Ordering::SeqCst) >= cap || !gate.reserve_backlog() {
            debug!(tx_id, request_id = %request.id(), "transaction queue full");
            return Err(GateError::TransactionQueueFull {
                tx_id: tx_id.to_string(),
            });
        }
        self.queued.fetch_add(1, Ordering::SeqCst);
        let ticket = gate.claim_tail();
        drop(gates);

        debug!(tx_id, request_id = %request.id(), ticket, "statement queued behind transaction");
        gate.park_at(ticket, request);
        Ok(())
    }

    /// Hands the transaction to the next queued statement, or frees it when
    /// none is waiting.
    pub fn post_admit(&self, tx: &dyn TransactionContext) {
        let tx_id = tx.tx_id();
        let mut gates = self.gates.lock();
        if let Some(gate) = gates.get(tx_id).map(Arc::clone) {
            if gate.take_backlog() {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                gate.release();
                return;
            }
            gates.remove(tx_id);
        }
        if let Err(e) = tx.set_in_use(false) {
            warn!(tx_id, error = %e, "transaction could not be given back");
        }
    }

    /// Statements parked across all transactions.
    pub fn queued(&self) -> i64 {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn queue_len(&self, tx_id: &str) -> i64 {
        self.gates
            .lock()
            .get(tx_id)
            .map(|gate| gate.queued())
            .unwrap_or(0)
    }

    pub fn transactions(&self) -> usize {
        self.gates.lock().len()
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size.load(Ordering::Relaxed)
    }

    /// Applies to transaction queues created after the call.
    pub fn set_queue_size(&self, size: usize) {
        self.queue_size.store(size, Ordering::Relaxed);
    }

    pub fn backlog_cap(&self) -> usize {
        self.backlog_cap.load(Ordering::Relaxed)
    }

    pub fn set_backlog_cap(&self, cap: usize) {
        self.backlog_cap.store(cap, Ordering::Relaxed);
    }
}
