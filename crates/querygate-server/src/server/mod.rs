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

pub mod engine;
pub mod handler;
pub mod metrics;

use crate::server::engine::LoopbackEngine;
use crate::server::handler::CommandHandler;
use crate::server::metrics::ServerMetrics;
use querygate::error::{GateError, Result};
use querygate::{
    Dispatcher, DispatcherConfig, ExecutionEngine, TransactionManager, TransactionSource,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info};

/// Lines read ahead of the one being answered.
const LINE_QUEUE: usize = 16;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub max_line_bytes: usize,
    pub tx_timeout_ms: u64,
    pub dispatcher: DispatcherConfig,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(GateError::InvalidSetting(
                "host cannot be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(GateError::InvalidSetting("port must be > 0".to_string()));
        }
        if self.max_connections == 0 {
            return Err(GateError::InvalidSetting(
                "max_connections must be > 0".to_string(),
            ));
        }
        if self.max_line_bytes == 0 {
            return Err(GateError::InvalidSetting(
                "max_line_bytes must be > 0".to_string(),
            ));
        }
        if self.tx_timeout_ms == 0 {
            return Err(GateError::InvalidSetting(
                "tx_timeout_ms must be > 0".to_string(),
            ));
        }
        self.dispatcher.validate()
    }
}

/// Everything a connection needs, shared across all of them.
pub struct ServerState {
    pub dispatcher: Arc<Dispatcher>,
    pub transactions: Arc<TransactionManager>,
    pub metrics: Arc<ServerMetrics>,
}

impl ServerState {
    pub fn open(config: &ServerConfig) -> Result<Self> {
        Self::with_engine(config, Arc::new(LoopbackEngine))
    }

    pub fn with_engine(config: &ServerConfig, engine: Arc<dyn ExecutionEngine>) -> Result<Self> {
        let transactions = Arc::new(TransactionManager::new(Duration::from_millis(
            config.tx_timeout_ms,
        )));
        let source: Arc<dyn TransactionSource> = transactions.clone();
        let dispatcher = Dispatcher::new(config.dispatcher.clone(), engine, Some(source))?;
        Ok(Self {
            dispatcher: Arc::new(dispatcher),
            transactions,
            metrics: Arc::new(ServerMetrics::default()),
        })
    }
}

pub async fn run(config: ServerConfig) -> Result<()> {
    config.validate()?;
    let state = Arc::new(ServerState::open(&config)?);
    let listener = TcpListener::bind(config.listen_addr()).await?;
    serve(listener, Arc::new(config), state, None).await
}

pub async fn serve(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    state: Arc<ServerState>,
    mut shutdown: Option<oneshot::Receiver<()>>,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "querygate server listening");
    let conn_limit = Arc::new(Semaphore::new(config.max_connections));
    let handler = Arc::new(CommandHandler::new(Arc::clone(&state)));

    loop {
        tokio::select! {
            _ = async {
                if let Some(rx) = &mut shutdown {
                    let _ = rx.await;
                }
            }, if shutdown.is_some() => {
                info!(%addr, "shutdown signal received");
                state.dispatcher.close();
                info!(
                    vitals = ?state.dispatcher.vitals(),
                    metrics = ?state.metrics.snapshot(),
                    "server shutdown metrics"
                );
                break;
            }
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                let permit = match Arc::clone(&conn_limit).try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        state.metrics.on_connection_refused();
                        info!(%peer, "connection refused due to max_connections limit");
                        continue;
                    }
                };
                state.metrics.on_connection_accepted();
                let handler = Arc::clone(&handler);
                let metrics = Arc::clone(&state.metrics);
                let max_line_bytes = config.max_line_bytes;
                info!(%peer, "accepted connection");
                tokio::spawn(async move {
                    let _permit: OwnedSemaphorePermit = permit;
                    if let Err(err) = process_socket(socket, handler, max_line_bytes).await {
                        error!(%peer, error = %err, "connection processing error");
                    }
                    metrics.on_connection_closed();
                });
            }
        }
    }

    Ok(())
}

/// One unit read off a connection.
enum Line {
    Command(String),
    Oversized,
}

/// Answers commands in arrival order, one reply line each. A separate task
/// reads the socket so a hang-up is noticed while a query is in flight.
async fn process_socket(
    socket: TcpStream,
    handler: Arc<CommandHandler>,
    max_line_bytes: usize,
) -> Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let (lines_tx, mut lines_rx) = mpsc::channel(LINE_QUEUE);
    let (hangup_tx, hangup) = watch::channel(false);
    let reader = tokio::spawn(read_lines(read_half, max_line_bytes, lines_tx, hangup_tx));

    let outcome = async {
        while let Some(line) = lines_rx.recv().await {
            let reply = match line {
                Line::Command(text) => handler.handle_line(&text, &hangup).await,
                Line::Oversized => handler.oversized_line(max_line_bytes),
            };
            write_reply(&mut write_half, &reply).await?;
        }
        Ok::<(), GateError>(())
    }
    .await;
    reader.abort();
    outcome
}

/// Feeds complete lines to `lines` until end of stream or a read error, then
/// raises `hangup`.
async fn read_lines(
    read_half: OwnedReadHalf,
    max_line_bytes: usize,
    lines: mpsc::Sender<Line>,
    hangup: watch::Sender<bool>,
) {
    let mut reader = BufReader::new(read_half);
    if let Err(err) = forward_lines(&mut reader, max_line_bytes, &lines).await {
        debug!(error = %err, "connection read failed");
    }
    hangup.send_replace(true);
}

async fn forward_lines<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max_line_bytes: usize,
    lines: &mpsc::Sender<Line>,
) -> Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        let read = (&mut *reader)
            .take(max_line_bytes as u64 + 1)
            .read_line(&mut line)
            .await?;
        if read == 0 {
            return Ok(());
        }
        let next = if line.len() > max_line_bytes && !line.ends_with('\n') {
            Line::Oversized
        } else {
            let command = line.trim();
            if command.is_empty() {
                continue;
            }
            Line::Command(command.to_string())
        };
        let oversized = matches!(next, Line::Oversized);
        if lines.send(next).await.is_err() {
            return Ok(());
        }
        if oversized && !skip_line(reader).await? {
            return Ok(());
        }
    }
}

/// Consumes input up to and including the next newline. Returns `false` on
/// end of stream.
async fn skip_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<bool> {
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(false);
        }
        match buf.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                reader.consume(pos + 1);
                return Ok(true);
            }
            None => {
                let len = buf.len();
                reader.consume(len);
            }
        }
    }
}

async fn write_reply(out: &mut OwnedWriteHalf, reply: &Value) -> Result<()> {
    let mut bytes = serde_json::to_vec(reply).map_err(std::io::Error::from)?;
    bytes.push(b'\n');
    out.write_all(&bytes).await?;
    Ok(())
}
