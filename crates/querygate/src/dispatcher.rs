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

//! Admission and execution of requests. Callers are the servicers: each
//! `service_*` call carries one request from admission to a terminal state
//! on the calling thread, and gives back every slot it took on the way out,
//! whatever the outcome.

use crate::active::ActiveRequests;
use crate::config::{parse_settings, DispatcherConfig, Setting};
use crate::engine::{ExecutionContext, ExecutionEngine};
use crate::error::{GateError, Result};
use crate::expiry::ExpiryTimer;
use crate::metrics::{DispatcherMetrics, DispatcherMetricsSnapshot};
use crate::request::{Request, RequestId, RequestSnapshot, RequestState};
use crate::scheduler::{GateStats, Schedulable, SchedulerGate, Watchdog};
use crate::tx::{TransactionContext, TransactionSource};
use crate::txqueue::TransactionQueues;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Pool {
    Unbound,
    Plus,
}

impl Pool {
    pub fn as_str(self) -> &'static str {
        match self {
            Pool::Unbound => "unbound",
            Pool::Plus => "plus",
        }
    }
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatcherVitals {
    pub load: i64,
    pub unbound: GateStats,
    pub plus: GateStats,
    pub tx_queued: i64,
    pub tx_queues: usize,
    pub active_requests: usize,
    pub metrics: DispatcherMetricsSnapshot,
}

pub struct Dispatcher {
    config: RwLock<DispatcherConfig>,
    engine: Arc<dyn ExecutionEngine>,
    transactions: Option<Arc<dyn TransactionSource>>,
    unbound: Arc<SchedulerGate>,
    plus: Arc<SchedulerGate>,
    tx_queues: TransactionQueues,
    active: ActiveRequests,
    metrics: DispatcherMetrics,
    watchdogs: Mutex<Vec<Watchdog>>,
    timer: Mutex<Option<ExpiryTimer>>,
    closed: AtomicBool,
}

struct SlotGuard<'a> {
    gate: &'a SchedulerGate,
    metrics: &'a DispatcherMetrics,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.gate.dequeue();
        self.metrics.on_released();
    }
}

struct TxGuard<'a> {
    queues: &'a TransactionQueues,
    tx: Arc<dyn TransactionContext>,
}

impl Drop for TxGuard<'_> {
    fn drop(&mut self) {
        self.queues.post_admit(self.tx.as_ref());
    }
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        engine: Arc<dyn ExecutionEngine>,
        transactions: Option<Arc<dyn TransactionSource>>,
    ) -> Result<Self> {
        config.validate()?;

        let unbound = Arc::new(SchedulerGate::new(
            Pool::Unbound.as_str(),
            config.servicers,
            config.request_backlog,
        ));
        let plus = Arc::new(SchedulerGate::new(
            Pool::Plus.as_str(),
            config.plus_servicers,
            config.plus_request_backlog,
        ));
        let interval = config.watchdog_interval();
        let watchdogs = vec![
            Watchdog::start(Arc::clone(&unbound), interval)?,
            Watchdog::start(Arc::clone(&plus), interval)?,
        ];
        let timer = ExpiryTimer::start()?;

        info!(
            servicers = config.servicers,
            plus_servicers = config.plus_servicers,
            request_backlog = config.request_backlog,
            plus_request_backlog = config.plus_request_backlog,
            "dispatcher started"
        );

        Ok(Self {
            tx_queues: TransactionQueues::new(config.tx_queue_size, config.tx_backlog_cap),
            config: RwLock::new(config),
            engine,
            transactions,
            unbound,
            plus,
            active: ActiveRequests::new(),
            metrics: DispatcherMetrics::default(),
            watchdogs: Mutex::new(watchdogs),
            timer: Mutex::new(Some(timer)),
            closed: AtomicBool::new(false),
        })
    }

    /// Stops the background threads and refuses further admissions.
    /// Requests already admitted run to completion.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for mut watchdog in self.watchdogs.lock().drain(..) {
            watchdog.stop();
        }
        if let Some(mut timer) = self.timer.lock().take() {
            timer.close();
        }
        info!("dispatcher closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// New request carrying the configured error limit.
    pub fn request(&self, statement: impl Into<String>) -> Request {
        Request::new(statement).with_error_limit(self.config.read().error_limit)
    }

    /// Services `request` on the unbound pool. `false` only when the request
    /// was not admitted for lack of capacity.
    pub fn service_request(&self, request: &Arc<Request>) -> bool {
        self.dispatch(request, Pool::Unbound)
    }

    /// Services `request` on the plus pool, serializing it behind other
    /// statements of its transaction.
    pub fn service_plus_request(&self, request: &Arc<Request>) -> bool {
        self.dispatch(request, Pool::Plus)
    }

    fn dispatch(&self, request: &Arc<Request>, pool: Pool) -> bool {
        let ctx = match self.setup_context(request, pool) {
            Ok(ctx) => ctx,
            Err(err) => {
                // failed requests are answered, not bounced as unavailable
                request.fatal(err);
                self.conclude(request);
                return true;
            }
        };

        self.active.register(request);
        let admitted = self.admit_and_run(request, &ctx, pool);
        self.active.remove(request.id());
        self.conclude(request);
        admitted
    }

    fn setup_context(&self, request: &Request, pool: Pool) -> Result<ExecutionContext> {
        let transaction = match request.tx_id() {
            None => None,
            Some(tx_id) => {
                if pool != Pool::Plus {
                    return Err(GateError::InternalInconsistency(format!(
                        "transaction {tx_id} statement submitted to the {pool} pool"
                    )));
                }
                let source = self.transactions.as_ref().ok_or_else(|| {
                    GateError::InternalInconsistency("no transaction manager configured".to_string())
                })?;
                let tx = source.context(tx_id)?;
                tx.valid()?;
                Some(tx)
            }
        };
        Ok(ExecutionContext {
            request_id: request.id(),
            pool,
            max_parallelism: self.config.read().max_parallelism,
            transaction,
            deadline: None,
        })
    }

    fn admit(&self, request: &Arc<Request>, gate: &SchedulerGate, pool: Pool) -> bool {
        let waiter: Arc<dyn Schedulable> = Arc::clone(request) as Arc<dyn Schedulable>;
        if self.is_closed() || !gate.enqueue(waiter) {
            self.metrics.on_rejected();
            info!(request_id = %request.id(), %pool, "request refused: pool at capacity");
            request.fatal(GateError::CapacityExceeded {
                pool: pool.to_string(),
            });
            return false;
        }
        self.metrics.on_admitted();
        true
    }

    /// Transactional statements take their transaction before they compete
    /// for a pool slot, and give it back before the slot is released.
    fn admit_and_run(&self, request: &Arc<Request>, ctx: &ExecutionContext, pool: Pool) -> bool {
        let tx_guard = match &ctx.transaction {
            None => None,
            Some(tx) => {
                let waiter: Arc<dyn Schedulable> = Arc::clone(request) as Arc<dyn Schedulable>;
                if let Err(err) = self.tx_queues.pre_admit(waiter, tx.as_ref()) {
                    if matches!(err, GateError::TransactionQueueFull { .. }) {
                        self.metrics.on_tx_queue_full();
                    }
                    request.fatal(err);
                    return true;
                }
                let guard = TxGuard {
                    queues: &self.tx_queues,
                    tx: Arc::clone(tx),
                };
                // the transaction may have lapsed while this statement waited
                if let Err(err) = tx.valid() {
                    request.fatal(err);
                    return true;
                }
                // stopped or timed out while parked on the transaction
                if request.halted() {
                    return true;
                }
                Some(guard)
            }
        };

        let gate = self.gate(pool);
        if !self.admit(request, gate, pool) {
            return false;
        }
        let slot = SlotGuard {
            gate,
            metrics: &self.metrics,
        };
        self.service(request, ctx);
        drop(tx_guard);
        drop(slot);
        true
    }

    fn service(&self, request: &Arc<Request>, ctx: &ExecutionContext) {
        // stopped or timed out while parked
        if !request.transition(RequestState::Submitted, RequestState::Preprocessing) {
            return;
        }
        request.servicing();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.execute(request, ctx)));
        if let Err(payload) = outcome {
            let message = panic_message(payload.as_ref());
            error!(
                request_id = %request.id(),
                statement = %request.statement(),
                panic = %message,
                "request execution panicked"
            );
            request.mark_crashed();
            request.fatal(GateError::ExecutionPanic(message));
        }
        request.finish();
    }

    fn execute(&self, request: &Arc<Request>, ctx: &ExecutionContext) {
        let mut ctx = ctx.clone();
        if let Some(timeout) = self.effective_timeout(request) {
            ctx.deadline = Some(Instant::now() + timeout);
            if let Some(timer) = self.timer.lock().as_ref() {
                timer.schedule(request, timeout);
            }
        }

        let operator = match self.engine.build(request, &ctx) {
            Ok(op) => op,
            Err(err) => {
                request.fatal(err);
                return;
            }
        };
        request.set_stop_target(&operator);
        // a stop that landed before the target was registered cancelled nothing
        if !request.transition(RequestState::Preprocessing, RequestState::Running) {
            return;
        }

        if let Err(err) = operator.run(request) {
            request.error(err);
        }
    }

    /// The configured default caps the request's own timeout.
    fn effective_timeout(&self, request: &Request) -> Option<Duration> {
        let default = self.config.read().default_timeout();
        match (request.timeout(), default) {
            (Some(own), Some(cap)) => Some(own.min(cap)),
            (own, cap) => own.or(cap),
        }
    }

    fn conclude(&self, request: &Request) {
        request.mark_completed_at();
        let codes = request
            .errors()
            .iter()
            .map(|e| e.code)
            .collect::<Vec<_>>();
        let state = request.state();
        let elapsed = request.elapsed();
        self.metrics
            .on_request_finished(elapsed.as_nanos() as u64, state, &codes);
        debug!(
            request_id = %request.id(),
            %state,
            elapsed_ms = elapsed.as_millis() as u64,
            errors = codes.len(),
            "request concluded"
        );
    }

    fn gate(&self, pool: Pool) -> &SchedulerGate {
        match pool {
            Pool::Unbound => &self.unbound,
            Pool::Plus => &self.plus,
        }
    }

    pub fn gate_stats(&self, pool: Pool) -> GateStats {
        self.gate(pool).stats()
    }

    /// Combined load of both pools, counting statements parked behind
    /// transactions against the plus pool.
    pub fn load(&self) -> i64 {
        self.plus.load(self.tx_queues.queued()) + self.unbound.load(0)
    }

    pub fn stop_request(&self, id: RequestId) -> bool {
        let stopped = self.active.stop(id);
        if stopped {
            info!(request_id = %id, "request stopped");
        }
        stopped
    }

    pub fn active_requests(&self) -> Vec<RequestSnapshot> {
        self.active.snapshots()
    }

    pub fn metrics(&self) -> DispatcherMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn config(&self) -> DispatcherConfig {
        self.config.read().clone()
    }

    pub fn vitals(&self) -> DispatcherVitals {
        DispatcherVitals {
            load: self.load(),
            unbound: self.unbound.stats(),
            plus: self.plus.stats(),
            tx_queued: self.tx_queues.queued(),
            tx_queues: self.tx_queues.transactions(),
            active_requests: self.active.len(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Validates every entry, then applies them all. Parked requests are not
    /// affected; new admissions and newly created transaction queues are.
    pub fn apply_settings(&self, settings: &Map<String, Value>) -> Result<Vec<Setting>> {
        let parsed = parse_settings(settings)?;
        let mut applied = Vec::with_capacity(parsed.len());
        let mut config = self.config.write();
        for setting in parsed {
            let setting = match setting {
                Setting::Servicers(v) => {
                    self.unbound.set_servicers(v);
                    setting
                }
                Setting::PlusServicers(v) => {
                    self.plus.set_servicers(v);
                    setting
                }
                Setting::RequestBacklog(v) => {
                    Setting::RequestBacklog(self.unbound.set_backlog_limit(v))
                }
                Setting::PlusRequestBacklog(v) => {
                    Setting::PlusRequestBacklog(self.plus.set_backlog_limit(v))
                }
                Setting::TxQueueSize(v) => {
                    self.tx_queues.set_queue_size(v);
                    setting
                }
                Setting::TxBacklogCap(v) => {
                    self.tx_queues.set_backlog_cap(v);
                    setting
                }
                Setting::TimeoutMs(_) | Setting::ErrorLimit(_) | Setting::MaxParallelism(_) => {
                    setting
                }
            };
            config.apply(setting);
            config.request_backlog = self.unbound.backlog_limit().max(0) as usize;
            config.plus_request_backlog = self.plus.backlog_limit().max(0) as usize;
            info!(setting = setting.name(), value = %setting, "dispatcher configuration changed");
            applied.push(setting);
        }
        Ok(applied)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
