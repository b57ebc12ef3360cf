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

use crate::error::Result;
use crate::fault;
use crate::scheduler::SchedulerGate;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_millis(100);

pub const FAILPOINT_SWEEP_PANIC: &str = "watchdog.sweep.panic";

/// Background sweep that admits waiters stranded by the gate's relaxed
/// counters. Stops when dropped.
pub struct Watchdog {
    gate: Arc<SchedulerGate>,
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn start(gate: Arc<SchedulerGate>, interval: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<()>();
        let swept = Arc::clone(&gate);
        let handle = thread::Builder::new()
            .name(format!("watchdog-{}", gate.name()))
            .spawn(move || loop {
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                let sweep = || {
                    if fault::should_fail_scoped(FAILPOINT_SWEEP_PANIC, swept.name()) {
                        panic!("failpoint {FAILPOINT_SWEEP_PANIC} fired");
                    }
                    swept.check_waiters()
                };
                match panic::catch_unwind(AssertUnwindSafe(sweep)) {
                    Ok(0) => {}
                    Ok(admitted) => {
                        debug!(gate = %swept.name(), admitted, "watchdog sweep admitted waiters")
                    }
                    Err(_) => {
                        error!(gate = %swept.name(), "watchdog sweep panicked, resuming")
                    }
                }
            })?;
        Ok(Self {
            gate,
            shutdown: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn gate(&self) -> &Arc<SchedulerGate> {
        &self.gate
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(gate = %self.gate.name(), "watchdog thread exited abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}
