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

use crate::error::{GateError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

pub const SETTING_SERVICERS: &str = "servicers";
pub const SETTING_PLUS_SERVICERS: &str = "plus-servicers";
pub const SETTING_REQUEST_BACKLOG: &str = "request-backlog";
pub const SETTING_PLUS_REQUEST_BACKLOG: &str = "plus-request-backlog";
pub const SETTING_TX_QUEUE_SIZE: &str = "tx-queue-size";
pub const SETTING_TX_BACKLOG_CAP: &str = "tx-backlog-cap";
pub const SETTING_TIMEOUT: &str = "timeout";
pub const SETTING_ERROR_LIMIT: &str = "error-limit";
pub const SETTING_MAX_PARALLELISM: &str = "max-parallelism";

fn cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub servicers: usize,
    pub plus_servicers: usize,
    pub request_backlog: usize,
    pub plus_request_backlog: usize,
    pub tx_queue_size: usize,
    /// Statements parked across all transactions.
    pub tx_backlog_cap: usize,
    pub watchdog_interval_ms: u64,
    /// `0` disables the default request timeout.
    pub default_timeout_ms: u64,
    /// `0` means unlimited.
    pub error_limit: usize,
    pub max_parallelism: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let cpus = cpus();
        Self {
            servicers: 4 * cpus,
            plus_servicers: 16 * cpus,
            request_backlog: 256 * cpus,
            plus_request_backlog: 256 * cpus,
            tx_queue_size: crate::txqueue::DEFAULT_TX_QUEUE_SIZE,
            tx_backlog_cap: 256 * cpus,
            watchdog_interval_ms: 100,
            default_timeout_ms: 0,
            error_limit: 0,
            max_parallelism: cpus,
        }
    }
}

impl DispatcherConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(text)
            .map_err(|e| GateError::InvalidSetting(format!("config decode failed: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.servicers == 0 {
            return Err(GateError::InvalidSetting(
                "servicers must be > 0".to_string(),
            ));
        }
        if self.plus_servicers == 0 {
            return Err(GateError::InvalidSetting(
                "plus_servicers must be > 0".to_string(),
            ));
        }
        if self.watchdog_interval_ms == 0 {
            return Err(GateError::InvalidSetting(
                "watchdog_interval_ms must be > 0".to_string(),
            ));
        }
        if self.max_parallelism == 0 {
            return Err(GateError::InvalidSetting(
                "max_parallelism must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_ms > 0).then(|| Duration::from_millis(self.default_timeout_ms))
    }

    pub fn apply(&mut self, setting: Setting) {
        match setting {
            Setting::Servicers(v) => self.servicers = v,
            Setting::PlusServicers(v) => self.plus_servicers = v,
            Setting::RequestBacklog(v) => self.request_backlog = v,
            Setting::PlusRequestBacklog(v) => self.plus_request_backlog = v,
            Setting::TxQueueSize(v) => self.tx_queue_size = v,
            Setting::TxBacklogCap(v) => self.tx_backlog_cap = v,
            Setting::TimeoutMs(v) => self.default_timeout_ms = v,
            Setting::ErrorLimit(v) => self.error_limit = v,
            Setting::MaxParallelism(v) => self.max_parallelism = v,
        }
    }
}

/// One runtime-adjustable knob with its already validated value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    Servicers(usize),
    PlusServicers(usize),
    RequestBacklog(usize),
    PlusRequestBacklog(usize),
    TxQueueSize(usize),
    TxBacklogCap(usize),
    TimeoutMs(u64),
    ErrorLimit(usize),
    MaxParallelism(usize),
}

impl Setting {
    pub fn parse(name: &str, value: &Value) -> Result<Self> {
        let Some(raw) = value.as_u64() else {
            return Err(GateError::InvalidSetting(format!(
                "{name}: expected a non-negative integer, got {value}"
            )));
        };
        let count = || -> Result<usize> {
            usize::try_from(raw)
                .map_err(|_| GateError::InvalidSetting(format!("{name}: {raw} is out of range")))
        };
        let positive = || -> Result<usize> {
            let v = count()?;
            if v == 0 {
                return Err(GateError::InvalidSetting(format!("{name} must be > 0")));
            }
            Ok(v)
        };
        match name {
            SETTING_SERVICERS => Ok(Setting::Servicers(positive()?)),
            SETTING_PLUS_SERVICERS => Ok(Setting::PlusServicers(positive()?)),
            SETTING_REQUEST_BACKLOG => Ok(Setting::RequestBacklog(count()?)),
            SETTING_PLUS_REQUEST_BACKLOG => Ok(Setting::PlusRequestBacklog(count()?)),
            SETTING_TX_QUEUE_SIZE => Ok(Setting::TxQueueSize(count()?)),
            SETTING_TX_BACKLOG_CAP => Ok(Setting::TxBacklogCap(count()?)),
            SETTING_TIMEOUT => Ok(Setting::TimeoutMs(raw)),
            SETTING_ERROR_LIMIT => Ok(Setting::ErrorLimit(count()?)),
            SETTING_MAX_PARALLELISM => Ok(Setting::MaxParallelism(positive()?)),
            other => Err(GateError::InvalidSetting(format!("unknown setting {other}"))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Setting::Servicers(_) => SETTING_SERVICERS,
            Setting::PlusServicers(_) => SETTING_PLUS_SERVICERS,
            Setting::RequestBacklog(_) => SETTING_REQUEST_BACKLOG,
            Setting::PlusRequestBacklog(_) => SETTING_PLUS_REQUEST_BACKLOG,
            Setting::TxQueueSize(_) => SETTING_TX_QUEUE_SIZE,
            Setting::TxBacklogCap(_) => SETTING_TX_BACKLOG_CAP,
            Setting::TimeoutMs(_) => SETTING_TIMEOUT,
            Setting::ErrorLimit(_) => SETTING_ERROR_LIMIT,
            Setting::MaxParallelism(_) => SETTING_MAX_PARALLELISM,
        }
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Setting::Servicers(v)
            | Setting::PlusServicers(v)
            | Setting::RequestBacklog(v)
            | Setting::PlusRequestBacklog(v)
            | Setting::TxQueueSize(v)
            | Setting::TxBacklogCap(v)
            | Setting::ErrorLimit(v)
            | Setting::MaxParallelism(v) => write!(f, "{}={v}", self.name()),
            Setting::TimeoutMs(v) => write!(f, "{}={v}ms", self.name()),
        }
    }
}

/// Checks every entry before returning any, so a bad entry leaves the whole
/// batch unapplied.
pub fn parse_settings(settings: &Map<String, Value>) -> Result<Vec<Setting>> {
    settings
        .iter()
        .map(|(name, value)| Setting::parse(name, value))
        .collect()
}
