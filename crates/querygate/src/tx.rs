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

//! Boundary towards the transaction manager, plus an in-memory manager that
//! tracks just enough per transaction to serialize its statements: in-use,
//! expired and released bits and an idle deadline.

use crate::error::{GateError, Result, TxInvalid};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_TX_TIMEOUT: Duration = Duration::from_secs(15);

pub trait TransactionContext: Send + Sync {
    fn tx_id(&self) -> &str;
    /// `Err` once the transaction has expired or been released.
    fn valid(&self) -> Result<()>;
    fn in_use(&self) -> bool;
    /// Claims (`true`) or gives back (`false`) the transaction's single
    /// execution slot. Claiming fails when already claimed or expired.
    fn set_in_use(&self, in_use: bool) -> Result<()>;
}

pub trait TransactionSource: Send + Sync {
    fn context(&self, tx_id: &str) -> Result<Arc<dyn TransactionContext>>;
}

const TX_INUSE: u8 = 0b001;
const TX_EXPIRED: u8 = 0b010;
const TX_RELEASED: u8 = 0b100;

#[derive(Debug)]
struct TxnStatus {
    flags: u8,
    expires_at: Instant,
}

impl TxnStatus {
    fn expired(&mut self) -> bool {
        if self.flags & TX_EXPIRED != 0 {
            return true;
        }
        if Instant::now() > self.expires_at {
            self.flags |= TX_EXPIRED;
            return true;
        }
        false
    }
}

#[derive(Debug)]
pub struct TransactionEntry {
    tx_id: String,
    timeout: Duration,
    started_at: Instant,
    status: Mutex<TxnStatus>,
}

impl TransactionEntry {
    fn new(tx_id: String, timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            tx_id,
            timeout,
            started_at: now,
            status: Mutex::new(TxnStatus {
                flags: 0,
                expires_at: now + timeout,
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_expired(&self) -> bool {
        self.status.lock().expired()
    }

    pub fn is_released(&self) -> bool {
        self.status.lock().flags & TX_RELEASED != 0
    }

    fn mark_released(&self) {
        let mut status = self.status.lock();
        status.flags |= TX_RELEASED;
        status.flags &= !TX_INUSE;
    }

    pub fn snapshot(&self) -> TransactionSnapshot {
        let mut status = self.status.lock();
        TransactionSnapshot {
            tx_id: self.tx_id.clone(),
            in_use: status.flags & TX_INUSE != 0,
            expired: status.expired(),
            released: status.flags & TX_RELEASED != 0,
            age_ms: self.started_at.elapsed().as_millis() as u64,
        }
    }
}

impl TransactionContext for TransactionEntry {
    fn tx_id(&self) -> &str {
        &self.tx_id
    }

    fn valid(&self) -> Result<()> {
        let mut status = self.status.lock();
        if status.flags & TX_RELEASED != 0 {
            return Err(GateError::tx_invalid(&self.tx_id, TxInvalid::Released));
        }
        if status.expired() {
            return Err(GateError::tx_invalid(&self.tx_id, TxInvalid::Expired));
        }
        Ok(())
    }

    fn in_use(&self) -> bool {
        self.status.lock().flags & TX_INUSE != 0
    }

    fn set_in_use(&self, in_use: bool) -> Result<()> {
        let mut status = self.status.lock();
        if !in_use {
            status.flags &= !TX_INUSE;
            // idle deadline restarts once the statement is done
            if status.flags & TX_EXPIRED == 0 {
                status.expires_at = Instant::now() + self.timeout;
            }
            return Ok(());
        }
        if status.flags & TX_RELEASED != 0 {
            return Err(GateError::tx_invalid(&self.tx_id, TxInvalid::Released));
        }
        if status.expired() {
            return Err(GateError::tx_invalid(&self.tx_id, TxInvalid::Expired));
        }
        if status.flags & TX_INUSE != 0 {
            return Err(GateError::tx_invalid(&self.tx_id, TxInvalid::InUse));
        }
        status.flags |= TX_INUSE;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionSnapshot {
    pub tx_id: String,
    pub in_use: bool,
    pub expired: bool,
    pub released: bool,
    pub age_ms: u64,
}

pub struct TransactionManager {
    next_txn_id: AtomicU64,
    default_timeout: Duration,
    txns: RwLock<HashMap<String, Arc<TransactionEntry>>>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new(DEFAULT_TX_TIMEOUT)
    }
}

impl TransactionManager {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            next_txn_id: AtomicU64::new(1),
            default_timeout,
            txns: RwLock::new(HashMap::new()),
        }
    }

    pub fn begin(&self, timeout: Option<Duration>) -> Arc<TransactionEntry> {
        let timeout = timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(self.default_timeout);
        let entry = loop {
            let candidate = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
            let tx_id = format!("tx{candidate:08x}");
            let mut txns = self.txns.write();
            if txns.contains_key(&tx_id) {
                continue;
            }
            let entry = Arc::new(TransactionEntry::new(tx_id.clone(), timeout));
            txns.insert(tx_id, Arc::clone(&entry));
            break entry;
        };
        debug!(tx_id = %entry.tx_id, timeout_ms = timeout.as_millis() as u64, "transaction started");
        entry
    }

    /// Ends the transaction. Handles still held elsewhere see it as released.
    pub fn release(&self, tx_id: &str) -> Result<()> {
        let entry = self
            .txns
            .write()
            .remove(tx_id)
            .ok_or_else(|| GateError::tx_invalid(tx_id, TxInvalid::Unknown))?;
        entry.mark_released();
        debug!(tx_id, "transaction released");
        Ok(())
    }

    pub fn get(&self, tx_id: &str) -> Option<Arc<TransactionEntry>> {
        self.txns.read().get(tx_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.txns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.txns.read().is_empty()
    }

    /// Drops expired transactions that are not executing a statement.
    pub fn purge_expired(&self) -> usize {
        let mut txns = self.txns.write();
        let before = txns.len();
        txns.retain(|_, entry| {
            let keep = !entry.is_expired() || entry.in_use();
            if !keep {
                entry.mark_released();
            }
            keep
        });
        before - txns.len()
    }

    pub fn snapshots(&self) -> Vec<TransactionSnapshot> {
        let mut out = self
            .txns
            .read()
            .values()
            .map(|entry| entry.snapshot())
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.tx_id.cmp(&b.tx_id));
        out
    }
}

impl TransactionSource for TransactionManager {
    fn context(&self, tx_id: &str) -> Result<Arc<dyn TransactionContext>> {
        match self.get(tx_id) {
            Some(entry) => Ok(entry as Arc<dyn TransactionContext>),
            None => Err(GateError::tx_invalid(tx_id, TxInvalid::Unknown)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn in_use_is_exclusive_until_given_back() {
        let tm = TransactionManager::default();
        let tx = tm.begin(None);
        assert!(!tx.in_use());
        tx.set_in_use(true).expect("claim");
        let err = tx.set_in_use(true).expect_err("second claim");
        assert_eq!(err.code(), crate::error::E_TRANSACTION_INUSE);
        tx.set_in_use(false).expect("give back");
        tx.set_in_use(true).expect("claim again");
    }

    #[test]
    fn expired_transaction_is_invalid_and_cannot_be_claimed() {
        let tm = TransactionManager::default();
        let tx = tm.begin(Some(Duration::from_millis(5)));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(
            tx.valid().expect_err("expired").code(),
            crate::error::E_TRANSACTION_EXPIRED
        );
        assert!(tx.set_in_use(true).is_err());
        assert_eq!(tm.purge_expired(), 1);
        assert!(tm.is_empty());
    }

    #[test]
    fn released_handle_reports_released_and_lookup_fails() {
        let tm = TransactionManager::default();
        let tx = tm.begin(None);
        let id = tx.tx_id().to_string();
        let ctx = tm.context(&id).expect("context");
        tm.release(&id).expect("release");

        assert_eq!(
            ctx.valid().expect_err("released").code(),
            crate::error::E_TRANSACTION_RELEASED
        );
        assert_eq!(
            tm.context(&id).err().map(|e| e.code()),
            Some(crate::error::E_TRANSACTION_INVALID)
        );
        assert!(tm.release(&id).is_err());
    }

    #[test]
    fn begin_hands_out_distinct_ids() {
        let tm = TransactionManager::default();
        let a = tm.begin(None);
        let b = tm.begin(Some(Duration::ZERO));
        assert_ne!(a.tx_id(), b.tx_id());
        assert_eq!(b.timeout(), DEFAULT_TX_TIMEOUT);
        assert_eq!(tm.snapshots().len(), 2);
    }
}
