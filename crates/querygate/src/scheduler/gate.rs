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

//! Bounded-concurrency admission gate.
//!
//! Up to `servicers` callers pass straight through; the next `backlog_limit`
//! callers park on a ring of wait entries and are handed a slot, in ticket
//! order, as runners leave. Parking and waking meet on a single CAS per
//! entry: the waiter stores itself and tries `EMPTY -> FULL`, the waker tries
//! `EMPTY -> GO`. Whoever loses that race knows the other side already
//! arrived.
//!
//! `run_count` and `backlog_count` move independently of each other. Keeping
//! them under one lock caps throughput on many-core hosts, so two windows are
//! accepted instead:
//!
//! * a waiter can finish parking after the last runner has already left and
//!   found an empty backlog;
//! * concurrent `dequeue` calls can both see a waiter and over-decrement the
//!   backlog, leaving a runner convinced nobody is waiting.
//!
//! Either way a waiter is left parked with nothing running. The
//! [`Watchdog`](super::Watchdog) calls [`SchedulerGate::check_waiters`] on a
//! short interval and admits such waiters, so the stall lasts at most one
//! sweep.

use crate::fault;
use crate::scheduler::Schedulable;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const WAIT_EMPTY: u8 = 0;
const WAIT_GO: u8 = 1;
const WAIT_FULL: u8 = 2;

pub const FAILPOINT_SKIP_HANDOFF: &str = "gate.dequeue.skip_handoff";

struct WaitEntry {
    waiter: Mutex<Option<Arc<dyn Schedulable>>>,
    state: AtomicU8,
}

impl WaitEntry {
    fn empty() -> Self {
        Self {
            waiter: Mutex::new(None),
            state: AtomicU8::new(WAIT_EMPTY),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GateStats {
    pub servicers: i64,
    pub backlog_limit: i64,
    pub capacity: usize,
    pub running: i64,
    pub queued: i64,
    pub admitted_total: u64,
    pub queued_total: u64,
    pub rejected_total: u64,
    pub repaired_total: u64,
}

pub struct SchedulerGate {
    name: String,
    servicers: AtomicI64,
    backlog_limit: AtomicI64,
    run_count: AtomicI64,
    backlog_count: AtomicI64,
    head: AtomicU64,
    tail: AtomicU64,
    slots: Box<[WaitEntry]>,
    admitted_total: AtomicU64,
    queued_total: AtomicU64,
    rejected_total: AtomicU64,
    repaired_total: AtomicU64,
}

impl SchedulerGate {
    pub fn new(name: impl Into<String>, servicers: usize, backlog_limit: usize) -> Self {
        let servicers = servicers.max(1);
        let ring_len = servicers.saturating_add(backlog_limit).max(1);
        let slots = (0..ring_len)
            .map(|_| WaitEntry::empty())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            name: name.into(),
            servicers: AtomicI64::new(servicers as i64),
            backlog_limit: AtomicI64::new(backlog_limit as i64),
            run_count: AtomicI64::new(0),
            backlog_count: AtomicI64::new(0),
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            slots,
            admitted_total: AtomicU64::new(0),
            queued_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
            repaired_total: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admits the caller, parking it first if every servicer is busy.
    /// Returns `false` without parking when the backlog is full.
    pub fn enqueue(&self, waiter: Arc<dyn Schedulable>) -> bool {
        let running = self.run_count.fetch_add(1, Ordering::SeqCst) + 1;
        if running <= self.servicers() {
            self.admitted_total.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        self.run_count.fetch_sub(1, Ordering::SeqCst);
        let queued = self.backlog_count.fetch_add(1, Ordering::SeqCst) + 1;
        if queued > self.backlog_limit() {
            self.backlog_count.fetch_sub(1, Ordering::SeqCst);
            self.rejected_total.fetch_add(1, Ordering::Relaxed);
            debug!(gate = %self.name, queued, "gate backlog full, rejecting request");
            return false;
        }

        self.queued_total.fetch_add(1, Ordering::Relaxed);
        self.park(waiter);
        self.admitted_total.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Called by a runner on its way out: hands its slot to the next waiter
    /// if there is one, otherwise gives it back.
    pub fn dequeue(&self) {
        if fault::should_fail_scoped(FAILPOINT_SKIP_HANDOFF, &self.name) {
            self.run_count.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        let mut wake_up = self.backlog_count.load(Ordering::SeqCst) > 0;
        if wake_up {
            let queued = self.backlog_count.fetch_sub(1, Ordering::SeqCst) - 1;
            wake_up = queued >= 0;
            if !wake_up {
                // another runner took the last waiter first
                self.backlog_count.fetch_add(1, Ordering::SeqCst);
            }
        }

        if wake_up {
            self.release();
        } else {
            self.run_count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn park(&self, waiter: Arc<dyn Schedulable>) {
        let ticket = self.claim_tail();
        self.park_at(ticket, waiter);
    }

    pub(crate) fn claim_tail(&self) -> u64 {
        self.tail.fetch_add(1, Ordering::SeqCst)
    }

    /// Parks `waiter` on the entry for `ticket` unless a release already
    /// marked that entry `GO`.
    pub(crate) fn park_at(&self, ticket: u64, waiter: Arc<dyn Schedulable>) {
        let entry = &self.slots[self.index(ticket)];
        waiter.arm();
        *entry.waiter.lock() = Some(Arc::clone(&waiter));

        if entry
            .state
            .compare_exchange(WAIT_EMPTY, WAIT_FULL, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            waiter.wait();
        } else {
            entry.waiter.lock().take();
            entry.state.store(WAIT_EMPTY, Ordering::Release);
        }
    }

    /// Hands one slot to the waiter holding the next head ticket, or leaves
    /// `GO` behind for it if it has not parked yet.
    pub(crate) fn release(&self) {
        let ticket = self.head.fetch_add(1, Ordering::SeqCst);
        let entry = &self.slots[self.index(ticket)];

        if entry
            .state
            .compare_exchange(WAIT_EMPTY, WAIT_GO, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let waiter = entry.waiter.lock().take();
            entry.state.store(WAIT_EMPTY, Ordering::Release);
            if let Some(waiter) = waiter {
                waiter.wake();
            }
        }
    }

    /// Reserves one backlog place; caller must hold whatever lock orders the
    /// gate's users.
    pub(crate) fn reserve_backlog(&self) -> bool {
        if self.backlog_count.load(Ordering::SeqCst) >= self.backlog_limit() {
            return false;
        }
        self.backlog_count.fetch_add(1, Ordering::SeqCst);
        self.queued_total.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Takes one waiter off the backlog count, if any.
    pub(crate) fn take_backlog(&self) -> bool {
        if self.backlog_count.load(Ordering::SeqCst) <= 0 {
            return false;
        }
        self.backlog_count.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// One watchdog sweep. Returns how many waiters were admitted.
    pub fn check_waiters(&self) -> usize {
        let mut running = self.run_count.load(Ordering::SeqCst);
        let mut queued = self.backlog_count.load(Ordering::SeqCst);
        if running > 0 {
            return 0;
        }

        if queued == 0 {
            return self.release_stranded();
        }

        let mut admitted = 0;
        while running <= 0 && queued > 0 {
            info!(gate = %self.name, queued, "scheduler gate emptying backlog");
            queued = self.backlog_count.fetch_sub(1, Ordering::SeqCst) - 1;
            if queued < 0 {
                // a runner came, went and emptied the backlog meanwhile
                self.backlog_count.fetch_add(1, Ordering::SeqCst);
                break;
            }
            running = self.run_count.fetch_add(1, Ordering::SeqCst) + 1;
            self.release();
            admitted += 1;
        }
        self.repaired_total
            .fetch_add(admitted as u64, Ordering::Relaxed);
        admitted
    }

    /// Parked entries with no runner and no backlog count left to wake them.
    fn release_stranded(&self) -> usize {
        let stranded = self.parked() as u64;
        if stranded == 0 {
            return 0;
        }
        let outstanding = self
            .tail
            .load(Ordering::SeqCst)
            .saturating_sub(self.head.load(Ordering::SeqCst));
        let to_release = stranded
            .min(outstanding)
            .min(self.servicers().max(0) as u64);

        warn!(gate = %self.name, stranded, to_release, "releasing stranded waiters");
        for _ in 0..to_release {
            self.run_count.fetch_add(1, Ordering::SeqCst);
            self.release();
        }
        self.repaired_total.fetch_add(to_release, Ordering::Relaxed);
        to_release as usize
    }

    fn index(&self, ticket: u64) -> usize {
        (ticket % self.slots.len() as u64) as usize
    }

    pub fn servicers(&self) -> i64 {
        self.servicers.load(Ordering::Relaxed)
    }

    /// Growing the servicer count shrinks the room left for the backlog, so
    /// the backlog limit is re-clamped.
    pub fn set_servicers(&self, servicers: usize) {
        self.servicers
            .store(servicers.max(1) as i64, Ordering::Relaxed);
        let limit = self.backlog_limit().max(0) as usize;
        if limit > self.backlog_ceiling() {
            self.set_backlog_limit(limit);
        }
    }

    pub fn backlog_limit(&self) -> i64 {
        self.backlog_limit.load(Ordering::Relaxed)
    }

    /// Every servicer may hold one handed-off entry its waiter has not
    /// consumed yet, so the backlog gets what the ring has left after them.
    fn backlog_ceiling(&self) -> usize {
        self.slots
            .len()
            .saturating_sub(self.servicers().max(0) as usize)
    }

    /// Backlog can grow only as far as the ring built at construction.
    /// Returns the limit actually applied.
    pub fn set_backlog_limit(&self, limit: usize) -> usize {
        let applied = limit.min(self.backlog_ceiling());
        if applied < limit {
            warn!(gate = %self.name, requested = limit, applied, "backlog limit clamped to slot ring");
        }
        self.backlog_limit.store(applied as i64, Ordering::Relaxed);
        applied
    }

    /// Entries currently holding a parked waiter.
    pub fn parked(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.state.load(Ordering::Acquire) == WAIT_FULL)
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn running(&self) -> i64 {
        self.run_count.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> i64 {
        self.backlog_count.load(Ordering::SeqCst)
    }

    /// Percentage of servicer capacity in use, counting `extra` queued
    /// requests held elsewhere on behalf of this gate.
    pub fn load(&self, extra: i64) -> i64 {
        100 * (self.running().max(0) + self.queued().max(0) + extra.max(0)) / self.servicers().max(1)
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            servicers: self.servicers(),
            backlog_limit: self.backlog_limit(),
            capacity: self.capacity(),
            running: self.running(),
            queued: self.queued(),
            admitted_total: self.admitted_total.load(Ordering::Relaxed),
            queued_total: self.queued_total.load(Ordering::Relaxed),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
            repaired_total: self.repaired_total.load(Ordering::Relaxed),
        }
    }
}
