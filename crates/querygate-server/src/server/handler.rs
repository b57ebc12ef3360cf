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

use super::metrics::ServerMetrics;
use super::ServerState;
use querygate::error::{GateError, E_INTERNAL, E_SERVICE_UNAVAILABLE};
use querygate::request::RequestId;
use querygate::{Request, TransactionContext};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn};

/// Raised once the client's side of the connection is gone.
pub type Hangup = watch::Receiver<bool>;

/// Code carried by replies to lines that do not decode as a command.
pub const E_MALFORMED_COMMAND: u32 = 1050;

/// One request line. The `command` field selects the variant.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum Command {
    Query {
        statement: String,
        tx_id: Option<String>,
        #[serde(default)]
        plus: bool,
        timeout_ms: Option<u64>,
    },
    Begin {
        timeout_ms: Option<u64>,
    },
    End {
        tx_id: String,
    },
    Stop {
        request_id: u64,
    },
    Settings {
        values: Map<String, Value>,
    },
    Vitals,
}

pub struct CommandHandler {
    state: Arc<ServerState>,
}

impl CommandHandler {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    fn metrics(&self) -> &ServerMetrics {
        &self.state.metrics
    }

    /// Decodes and runs one line, always producing exactly one reply.
    pub async fn handle_line(&self, line: &str, hangup: &Hangup) -> Value {
        let reply = match serde_json::from_str::<Command>(line) {
            Ok(command) => self.handle(command, hangup).await,
            Err(e) => {
                self.metrics().on_malformed_command();
                debug!(error = %e, "malformed command line");
                json!({
                    "status": "error",
                    "code": E_MALFORMED_COMMAND,
                    "message": format!("malformed command: {e}"),
                })
            }
        };
        self.metrics().on_reply(reply_status(&reply));
        reply
    }

    pub fn oversized_line(&self, limit: usize) -> Value {
        self.metrics().on_malformed_command();
        let reply = json!({
            "status": "error",
            "code": E_MALFORMED_COMMAND,
            "message": format!("command line exceeds max_line_bytes ({limit})"),
        });
        self.metrics().on_reply(reply_status(&reply));
        reply
    }

    pub async fn handle(&self, command: Command, hangup: &Hangup) -> Value {
        match command {
            Command::Query {
                statement,
                tx_id,
                plus,
                timeout_ms,
            } => {
                self.query(statement, tx_id, plus, timeout_ms, hangup.clone())
                    .await
            }
            Command::Begin { timeout_ms } => self.begin(timeout_ms),
            Command::End { tx_id } => self.end(&tx_id),
            Command::Stop { request_id } => self.stop(request_id),
            Command::Settings { values } => self.settings(&values),
            Command::Vitals => self.vitals(),
        }
    }

    async fn query(
        &self,
        statement: String,
        tx_id: Option<String>,
        plus: bool,
        timeout_ms: Option<u64>,
        hangup: Hangup,
    ) -> Value {
        // Transactional statements are only serviced by the plus pool.
        let plus = plus || tx_id.is_some();
        let mut request = self.state.dispatcher.request(statement);
        if let Some(tx_id) = tx_id {
            request = request.with_tx_id(tx_id);
        }
        if let Some(ms) = timeout_ms.filter(|ms| *ms > 0) {
            request = request.with_timeout(Duration::from_millis(ms));
        }
        let request = request.into_shared();
        let span = info_span!(
            "querygate.query",
            request_id = %request.id(),
            plus,
            tx_id = request.tx_id().unwrap_or("")
        );

        let started = Instant::now();
        let dispatcher = Arc::clone(&self.state.dispatcher);
        let serviced = Arc::clone(&request);
        let mut task = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            if plus {
                dispatcher.service_plus_request(&serviced)
            } else {
                dispatcher.service_request(&serviced)
            }
        });
        let admitted = tokio::select! {
            joined = &mut task => joined,
            _ = hung_up(hangup) => {
                if request.close() {
                    info!(request_id = %request.id(), "client disconnected, request closed");
                }
                task.await
            }
        };

        match admitted {
            Ok(admitted) => {
                self.metrics()
                    .on_query_finished(started.elapsed().as_nanos() as u64, admitted);
                if admitted {
                    query_reply(&request)
                } else {
                    unavailable_reply(&request)
                }
            }
            Err(e) => {
                warn!(request_id = %request.id(), error = %e, "query task failed");
                json!({
                    "status": "error",
                    "code": E_INTERNAL,
                    "request_id": request.id().0,
                    "message": format!("query task failed: {e}"),
                })
            }
        }
    }

    fn begin(&self, timeout_ms: Option<u64>) -> Value {
        let purged = self.state.transactions.purge_expired();
        if purged > 0 {
            debug!(purged, "expired transactions purged");
        }
        let entry = self
            .state
            .transactions
            .begin(timeout_ms.map(Duration::from_millis));
        json!({
            "status": "ok",
            "tx_id": entry.tx_id(),
            "timeout_ms": entry.timeout().as_millis() as u64,
        })
    }

    fn end(&self, tx_id: &str) -> Value {
        match self.state.transactions.release(tx_id) {
            Ok(()) => json!({ "status": "ok", "tx_id": tx_id }),
            Err(e) => error_reply(&e),
        }
    }

    fn stop(&self, request_id: u64) -> Value {
        let stopped = self.state.dispatcher.stop_request(RequestId(request_id));
        json!({ "status": "ok", "request_id": request_id, "stopped": stopped })
    }

    fn settings(&self, values: &Map<String, Value>) -> Value {
        match self.state.dispatcher.apply_settings(values) {
            Ok(applied) => json!({
                "status": "ok",
                "applied": applied.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "config": self.state.dispatcher.config(),
            }),
            Err(e) => error_reply(&e),
        }
    }

    fn vitals(&self) -> Value {
        json!({
            "status": "ok",
            "vitals": self.state.dispatcher.vitals(),
            "requests": self.state.dispatcher.active_requests(),
            "transactions": self.state.transactions.snapshots(),
            "server": self.metrics().snapshot(),
        })
    }
}

/// Resolves once the connection's reader has given up.
async fn hung_up(mut hangup: Hangup) {
    let _ = hangup.wait_for(|gone| *gone).await;
}

fn reply_status(reply: &Value) -> &str {
    reply
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
}

fn query_reply(request: &Request) -> Value {
    json!({
        "status": request.state().as_str(),
        "request_id": request.id().0,
        "results": request.take_results(),
        "errors": request.errors(),
        "warnings": request.warnings(),
        "elapsed_ms": request.elapsed().as_millis() as u64,
    })
}

fn unavailable_reply(request: &Request) -> Value {
    json!({
        "status": "unavailable",
        "code": E_SERVICE_UNAVAILABLE,
        "request_id": request.id().0,
        "errors": request.errors(),
    })
}

pub fn error_reply(err: &GateError) -> Value {
    let status = match err {
        GateError::CapacityExceeded { .. } => "unavailable",
        _ => "error",
    };
    json!({
        "status": status,
        "code": err.code(),
        "message": err.to_string(),
    })
}
