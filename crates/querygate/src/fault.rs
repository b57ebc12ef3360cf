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

//! Named failpoints. Hot paths consult `should_fail` only after a cheap
//! atomic check, so an idle registry costs one relaxed load.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

static ARMED: AtomicUsize = AtomicUsize::new(0);

fn registry() -> &'static Mutex<HashMap<String, usize>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, usize>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn sync_armed(reg: &HashMap<String, usize>) {
    ARMED.store(reg.len(), Ordering::Release);
}

/// Arms `name`: it passes `hits_before_fail` times, then fails once.
pub fn set_failpoint(name: &str, hits_before_fail: usize) {
    let mut reg = registry().lock();
    reg.insert(name.to_string(), hits_before_fail);
    sync_armed(&reg);
}

pub fn clear_failpoint(name: &str) {
    let mut reg = registry().lock();
    reg.remove(name);
    sync_armed(&reg);
}

pub fn clear_all_failpoints() {
    let mut reg = registry().lock();
    reg.clear();
    sync_armed(&reg);
}

pub fn should_fail(name: &str) -> bool {
    if ARMED.load(Ordering::Acquire) == 0 {
        return false;
    }
    let mut reg = registry().lock();
    let Some(remaining) = reg.get_mut(name) else {
        return false;
    };

    if *remaining == 0 {
        reg.remove(name);
        sync_armed(&reg);
        return true;
    }

    *remaining -= 1;
    false
}

/// Failpoint keyed by `"{name}:{scope}"`, so one gate can be targeted while
/// others in the same process run untouched.
pub fn should_fail_scoped(name: &str, scope: &str) -> bool {
    if ARMED.load(Ordering::Acquire) == 0 {
        return false;
    }
    should_fail(&scoped_name(name, scope))
}

pub fn scoped_name(name: &str, scope: &str) -> String {
    format!("{name}:{scope}")
}
