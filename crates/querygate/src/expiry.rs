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

//! Request timeouts. One thread sleeps until the earliest deadline and calls
//! `expire()` on the request if it is still alive and active.

use crate::error::Result;
use crate::request::Request;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error};

struct Deadline {
    at: Instant,
    seq: u64,
    request: Weak<Request>,
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Deadline {}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

const PRUNE_FLOOR: usize = 64;

#[derive(Default)]
struct TimerState {
    deadlines: BinaryHeap<Reverse<Deadline>>,
    next_seq: u64,
    /// Heap size at which entries for finished or dropped requests are swept.
    prune_at: usize,
    shutdown: bool,
}

impl TimerState {
    fn prune(&mut self) {
        self.deadlines
            .retain(|Reverse(d)| d.request.upgrade().is_some_and(|r| !r.halted()));
        self.prune_at = (self.deadlines.len() * 2).max(PRUNE_FLOOR);
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<TimerState>,
    cv: Condvar,
}

pub struct ExpiryTimer {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl ExpiryTimer {
    pub fn start() -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("request-expiry".to_string())
            .spawn(move || run(&worker))?;
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    pub fn schedule(&self, request: &Arc<Request>, timeout: Duration) {
        let mut state = self.shared.state.lock();
        if state.deadlines.len() >= state.prune_at {
            state.prune();
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.deadlines.push(Reverse(Deadline {
            at: Instant::now() + timeout,
            seq,
            request: Arc::downgrade(request),
        }));
        self.shared.cv.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.shared.state.lock().deadlines.len()
    }

    pub fn close(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.deadlines.clear();
            self.shared.cv.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("request expiry thread exited abnormally");
            }
        }
    }
}

impl Drop for ExpiryTimer {
    fn drop(&mut self) {
        self.close();
    }
}

fn run(shared: &Shared) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            return;
        }
        let next_at = state.deadlines.peek().map(|Reverse(d)| d.at);
        match next_at {
            None => shared.cv.wait(&mut state),
            Some(at) if at > Instant::now() => {
                shared.cv.wait_until(&mut state, at);
            }
            Some(_) => {
                let Some(Reverse(due)) = state.deadlines.pop() else {
                    continue;
                };
                MutexGuard::unlocked(&mut state, || expire(due));
            }
        }
    }
}

fn expire(due: Deadline) {
    let Some(request) = due.request.upgrade() else {
        return;
    };
    if request.expire() {
        debug!(request_id = %request.id(), "request timed out");
    }
}
