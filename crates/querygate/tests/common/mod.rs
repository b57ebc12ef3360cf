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

#![allow(dead_code)]

use querygate::error::{GateError, Result};
use querygate::{
    Dispatcher, DispatcherConfig, ExecutionContext, ExecutionEngine, Operator, Request,
    RequestState, TransactionManager, TransactionSource,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Executes statements from a tiny script language:
/// `hold` runs until cancelled or the engine is opened, `sleep:<ms>`,
/// `error:<code>`, `panic`; anything else echoes itself as one result.
#[derive(Default)]
pub struct ScriptedEngine {
    open: Arc<AtomicBool>,
    cancels: Arc<AtomicUsize>,
    spans: Arc<Mutex<Vec<Span>>>,
}

#[derive(Debug, Clone)]
pub struct Span {
    pub statement: String,
    pub tx_id: Option<String>,
    pub started: Instant,
    pub finished: Instant,
}

impl ScriptedEngine {
    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn spans(&self) -> Vec<Span> {
        self.spans.lock().clone()
    }
}

struct ScriptedOperator {
    statement: String,
    tx_id: Option<String>,
    cancelled: AtomicBool,
    open: Arc<AtomicBool>,
    cancels: Arc<AtomicUsize>,
    spans: Arc<Mutex<Vec<Span>>>,
}

impl ScriptedOperator {
    fn interrupted(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.open.load(Ordering::SeqCst)
    }
}

impl Operator for ScriptedOperator {
    fn run(&self, request: &Request) -> Result<()> {
        let started = Instant::now();
        let outcome = match self.statement.split_once(':') {
            Some(("sleep", ms)) => {
                let ms = ms.parse::<u64>().unwrap_or(0);
                let deadline = started + Duration::from_millis(ms);
                while Instant::now() < deadline && !self.cancelled.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            }
            Some(("error", code)) => Err(GateError::Execution {
                code: code.parse().unwrap_or(0),
                message: "scripted failure".to_string(),
            }),
            _ if self.statement == "hold" => {
                while !self.interrupted() {
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            }
            _ if self.statement == "panic" => panic!("scripted panic"),
            _ => {
                request.result(json!({ "echo": self.statement }));
                Ok(())
            }
        };
        self.spans.lock().push(Span {
            statement: self.statement.clone(),
            tx_id: self.tx_id.clone(),
            started,
            finished: Instant::now(),
        });
        outcome
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

impl ExecutionEngine for ScriptedEngine {
    fn build(&self, request: &Request, ctx: &ExecutionContext) -> Result<Arc<dyn Operator>> {
        Ok(Arc::new(ScriptedOperator {
            statement: request.statement().to_string(),
            tx_id: ctx.tx_id().map(str::to_string),
            cancelled: AtomicBool::new(false),
            open: Arc::clone(&self.open),
            cancels: Arc::clone(&self.cancels),
            spans: Arc::clone(&self.spans),
        }))
    }
}

pub struct Harness {
    pub dispatcher: Arc<Dispatcher>,
    pub engine: Arc<ScriptedEngine>,
    pub transactions: Arc<TransactionManager>,
}

pub fn harness(config: DispatcherConfig) -> Harness {
    let engine = Arc::new(ScriptedEngine::default());
    let transactions = Arc::new(TransactionManager::default());
    let source: Arc<dyn TransactionSource> = transactions.clone();
    let dispatcher = Dispatcher::new(config, engine.clone(), Some(source)).expect("dispatcher");
    Harness {
        dispatcher: Arc::new(dispatcher),
        engine,
        transactions,
    }
}

pub fn small_config(servicers: usize, backlog: usize) -> DispatcherConfig {
    DispatcherConfig {
        servicers,
        plus_servicers: servicers,
        request_backlog: backlog,
        plus_request_backlog: backlog,
        watchdog_interval_ms: 20,
        ..DispatcherConfig::default()
    }
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

pub fn wait_for_state(request: &Request, state: RequestState) -> bool {
    wait_until(Duration::from_secs(5), || request.state() == state)
}
