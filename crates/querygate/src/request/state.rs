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

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum RequestState {
    Submitted = 0,
    Preprocessing = 1,
    Running = 2,
    Success = 3,
    Errors = 4,
    Completed = 5,
    Stopped = 6,
    Timeout = 7,
    Closed = 8,
    Fatal = 9,
    Abend = 10,
}

const STATES: [RequestState; 11] = [
    RequestState::Submitted,
    RequestState::Preprocessing,
    RequestState::Running,
    RequestState::Success,
    RequestState::Errors,
    RequestState::Completed,
    RequestState::Stopped,
    RequestState::Timeout,
    RequestState::Closed,
    RequestState::Fatal,
    RequestState::Abend,
];

impl RequestState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        STATES
            .get(raw as usize)
            .copied()
            .unwrap_or(RequestState::Abend)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestState::Submitted => "submitted",
            RequestState::Preprocessing => "preprocessing",
            RequestState::Running => "running",
            RequestState::Success => "success",
            RequestState::Errors => "errors",
            RequestState::Completed => "completed",
            RequestState::Stopped => "stopped",
            RequestState::Timeout => "timeout",
            RequestState::Closed => "closed",
            RequestState::Fatal => "fatal",
            RequestState::Abend => "abend",
        }
    }

    /// Still moving towards execution or executing.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RequestState::Submitted | RequestState::Preprocessing | RequestState::Running
        )
    }

    /// Halted by something other than the request's own completion.
    pub fn is_interrupted(self) -> bool {
        matches!(
            self,
            RequestState::Stopped | RequestState::Timeout | RequestState::Closed
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed
                | RequestState::Stopped
                | RequestState::Timeout
                | RequestState::Closed
                | RequestState::Fatal
                | RequestState::Abend
        )
    }

    /// Whether a request currently in `self` may move to `next`.
    pub(crate) fn accepts(self, next: RequestState) -> bool {
        match self {
            RequestState::Fatal => false,
            s if s.is_interrupted() => {
                !matches!(next, RequestState::Stopped | RequestState::Completed)
            }
            _ => true,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
