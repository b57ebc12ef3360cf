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

mod diagnostics_tests;

use crate::engine::Operator;
use crate::error::Result;
use crate::request::Request;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
struct CountingOperator {
    cancels: AtomicUsize,
}

impl CountingOperator {
    fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

impl Operator for CountingOperator {
    fn run(&self, _request: &Request) -> Result<()> {
        Ok(())
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}
