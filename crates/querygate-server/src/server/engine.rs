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

//! Stand-in execution engine used by the server until a real planner is
//! plugged in. Statements are interpreted as:
//!
//! - `sleep <ms>`: waits, returning early when cancelled.
//! - `fail <code> <message>`: reports an execution error.
//! - a JSON array: each element becomes one result.
//! - anything else: echoed back as a single string result.

use querygate::error::{GateError, Result};
use querygate::{ExecutionContext, ExecutionEngine, Operator, Request};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const SLEEP_TICK: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq)]
enum Statement {
    Sleep(Duration),
    Fail { code: u32, message: String },
    Rows(Vec<Value>),
    Echo(String),
}

fn parse_statement(text: &str) -> Result<Statement> {
    let text = text.trim();
    let (head, rest) = text.split_once(char::is_whitespace).unwrap_or((text, ""));
    let rest = rest.trim();
    if head.eq_ignore_ascii_case("sleep") {
        let ms = rest.parse::<u64>().map_err(|_| GateError::Execution {
            code: querygate::error::E_INTERNAL,
            message: format!("sleep needs milliseconds, got '{rest}'"),
        })?;
        return Ok(Statement::Sleep(Duration::from_millis(ms)));
    }
    if head.eq_ignore_ascii_case("fail") {
        let (code, message) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        let code = code.parse::<u32>().map_err(|_| GateError::Execution {
            code: querygate::error::E_INTERNAL,
            message: format!("fail needs an error code, got '{code}'"),
        })?;
        return Ok(Statement::Fail {
            code,
            message: message.trim().to_string(),
        });
    }
    if text.starts_with('[') {
        if let Ok(Value::Array(rows)) = serde_json::from_str::<Value>(text) {
            return Ok(Statement::Rows(rows));
        }
    }
    Ok(Statement::Echo(text.to_string()))
}

#[derive(Debug, Default)]
pub struct LoopbackEngine;

impl ExecutionEngine for LoopbackEngine {
    fn build(&self, request: &Request, _ctx: &ExecutionContext) -> Result<Arc<dyn Operator>> {
        let statement = parse_statement(request.statement())?;
        Ok(Arc::new(LoopbackOperator {
            statement,
            cancelled: AtomicBool::new(false),
        }))
    }
}

struct LoopbackOperator {
    statement: Statement,
    cancelled: AtomicBool,
}

impl Operator for LoopbackOperator {
    fn run(&self, request: &Request) -> Result<()> {
        match &self.statement {
            Statement::Sleep(total) => {
                let started = Instant::now();
                while started.elapsed() < *total {
                    if self.cancelled.load(Ordering::Acquire) {
                        break;
                    }
                    thread::sleep(SLEEP_TICK.min(total.saturating_sub(started.elapsed())));
                }
                request.result(json!({ "slept_ms": started.elapsed().as_millis() as u64 }));
                Ok(())
            }
            Statement::Fail { code, message } => Err(GateError::Execution {
                code: *code,
                message: message.clone(),
            }),
            Statement::Rows(rows) => {
                for row in rows {
                    if self.cancelled.load(Ordering::Acquire) || !request.result(row.clone()) {
                        break;
                    }
                }
                Ok(())
            }
            Statement::Echo(text) => {
                request.result(Value::String(text.clone()));
                Ok(())
            }
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}
