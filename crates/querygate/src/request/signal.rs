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

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// One-shot wake-up: `arm`, then exactly one `wake` releases a `wait`.
/// A `wake` that lands before the `wait` is remembered.
#[derive(Debug, Default)]
pub struct Signal {
    released: Mutex<bool>,
    cv: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self) {
        *self.released.lock() = false;
    }

    pub fn wait(&self) {
        let mut released = self.released.lock();
        while !*released {
            self.cv.wait(&mut released);
        }
    }

    /// Returns `false` if `timeout` elapsed before the wake.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut released = self.released.lock();
        while !*released {
            if self.cv.wait_until(&mut released, deadline).timed_out() {
                return *released;
            }
        }
        true
    }

    pub fn wake(&self) {
        let mut released = self.released.lock();
        *released = true;
        self.cv.notify_all();
    }

    pub fn is_released(&self) -> bool {
        *self.released.lock()
    }
}
