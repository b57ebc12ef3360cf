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

use crate::server::ServerConfig;
use clap::Parser;
use querygate::error::{GateError, Result};
use querygate::DispatcherConfig;

#[derive(Debug, Clone, Parser)]
#[command(name = "querygate", about = "querygate request dispatcher")]
pub struct Cli {
    /// JSON file with dispatcher settings; flags given on the command line win.
    #[arg(short = 'c', long = "config")]
    pub config_path: Option<String>,

    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(short, long, default_value_t = 8093)]
    pub port: u16,

    #[arg(long, default_value_t = 256)]
    pub max_connections: usize,

    #[arg(long, default_value_t = 1_048_576)]
    pub max_line_bytes: usize,

    /// Idle timeout for transactions opened with `begin`.
    #[arg(long, default_value_t = 15_000)]
    pub tx_timeout_ms: u64,

    #[arg(long)]
    pub servicers: Option<usize>,

    #[arg(long)]
    pub plus_servicers: Option<usize>,

    #[arg(long)]
    pub request_backlog: Option<usize>,

    #[arg(long)]
    pub plus_request_backlog: Option<usize>,

    #[arg(long)]
    pub tx_queue_size: Option<usize>,

    #[arg(long)]
    pub tx_backlog_cap: Option<usize>,

    #[arg(long = "timeout-ms", alias = "timeout")]
    pub timeout_ms: Option<u64>,

    #[arg(long)]
    pub error_limit: Option<usize>,

    #[arg(long)]
    pub max_parallelism: Option<usize>,

    #[arg(long)]
    pub watchdog_interval_ms: Option<u64>,
}

impl Cli {
    pub fn dispatcher_config(&self) -> Result<DispatcherConfig> {
        let mut cfg = match &self.config_path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    GateError::InvalidSetting(format!("cannot read config '{path}': {e}"))
                })?;
                DispatcherConfig::from_json(&text)?
            }
            None => DispatcherConfig::default(),
        };
        if let Some(v) = self.servicers {
            cfg.servicers = v;
        }
        if let Some(v) = self.plus_servicers {
            cfg.plus_servicers = v;
        }
        if let Some(v) = self.request_backlog {
            cfg.request_backlog = v;
        }
        if let Some(v) = self.plus_request_backlog {
            cfg.plus_request_backlog = v;
        }
        if let Some(v) = self.tx_queue_size {
            cfg.tx_queue_size = v;
        }
        if let Some(v) = self.tx_backlog_cap {
            cfg.tx_backlog_cap = v;
        }
        if let Some(v) = self.timeout_ms {
            cfg.default_timeout_ms = v;
        }
        if let Some(v) = self.error_limit {
            cfg.error_limit = v;
        }
        if let Some(v) = self.max_parallelism {
            cfg.max_parallelism = v;
        }
        if let Some(v) = self.watchdog_interval_ms {
            cfg.watchdog_interval_ms = v;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn server_config(&self) -> Result<ServerConfig> {
        let config = ServerConfig {
            host: self.host.clone(),
            port: self.port,
            max_connections: self.max_connections,
            max_line_bytes: self.max_line_bytes,
            tx_timeout_ms: self.tx_timeout_ms,
            dispatcher: self.dispatcher_config()?,
        };
        config.validate()?;
        Ok(config)
    }
}
