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

use crate::request::{Request, RequestId, RequestSnapshot, RequestState};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Requests currently holding or waiting for a slot. Entries are weak, so a
/// request dropped without deregistering simply disappears from listings.
#[derive(Debug, Default)]
pub struct ActiveRequests {
    requests: RwLock<HashMap<RequestId, Weak<Request>>>,
}

impl ActiveRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request: &Arc<Request>) {
        self.requests
            .write()
            .insert(request.id(), Arc::downgrade(request));
    }

    pub fn remove(&self, id: RequestId) {
        self.requests.write().remove(&id);
    }

    pub fn get(&self, id: RequestId) -> Option<Arc<Request>> {
        self.requests.read().get(&id).and_then(Weak::upgrade)
    }

    pub fn len(&self) -> usize {
        self.requests.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.read().is_empty()
    }

    /// Stops one request. `false` when it is unknown or already finished.
    pub fn stop(&self, id: RequestId) -> bool {
        match self.get(id) {
            Some(request) if !request.halted() => {
                request.stop(RequestState::Stopped);
                true
            }
            _ => false,
        }
    }

    pub fn snapshots(&self) -> Vec<RequestSnapshot> {
        let live = self
            .requests
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .collect::<Vec<_>>();
        let mut out = live.iter().map(|r| r.snapshot()).collect::<Vec<_>>();
        out.sort_by_key(|s| s.request_id);
        out
    }
}
