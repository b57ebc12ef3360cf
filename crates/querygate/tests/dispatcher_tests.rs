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

mod common;

use common::{harness, small_config, wait_for_state, wait_until};
use querygate::error::{
    E_EXECUTION_PANIC, E_INTERNAL, E_SERVICE_UNAVAILABLE, E_TRANSACTION_INVALID,
    E_TRANSACTION_QUEUE_FULL,
};
use querygate::{DispatcherConfig, Pool, Request, RequestState, TransactionContext};
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const PATIENCE: Duration = Duration::from_secs(5);

#[test]
fn echo_request_completes_with_results() {
    let h = harness(small_config(2, 2));
    let request = h.dispatcher.request("select 1").into_shared();
    assert!(h.dispatcher.service_request(&request));
    assert_eq!(request.state(), RequestState::Completed);
    assert_eq!(request.results(), vec![json!({"echo": "select 1"})]);
    assert!(request.service_started_at().is_some());

    let m = h.dispatcher.metrics();
    assert_eq!(m.requests_admitted, 1);
    assert_eq!(m.requests_completed, 1);
    assert_eq!(m.active_requests, 0);
    assert_eq!(h.dispatcher.gate_stats(Pool::Unbound).running, 0);
}

#[test]
fn single_servicer_without_backlog_rejects_second_request() {
    let h = harness(small_config(1, 0));
    let a = h.dispatcher.request("hold").into_shared();
    let runner = {
        let d = Arc::clone(&h.dispatcher);
        let a = Arc::clone(&a);
        thread::spawn(move || d.service_request(&a))
    };
    assert!(wait_for_state(&a, RequestState::Running));

    let b = h.dispatcher.request("select b").into_shared();
    assert!(!h.dispatcher.service_request(&b));
    assert_eq!(b.state(), RequestState::Fatal);
    assert_eq!(b.errors()[0].code, E_SERVICE_UNAVAILABLE);

    h.engine.open();
    assert!(runner.join().expect("join a"));
    assert_eq!(a.state(), RequestState::Completed);

    let c = h.dispatcher.request("select c").into_shared();
    assert!(h.dispatcher.service_request(&c));
    assert_eq!(c.state(), RequestState::Completed);
    assert_eq!(h.dispatcher.metrics().requests_rejected, 1);
}

#[test]
fn statements_of_one_transaction_never_overlap() {
    let h = harness(small_config(4, 4));
    let tx = h.transactions.begin(None);
    let tx_id = tx.tx_id().to_string();

    let first = Request::new("sleep:60").with_tx_id(&tx_id).into_shared();
    let second = Request::new("sleep:10").with_tx_id(&tx_id).into_shared();

    let t1 = {
        let d = Arc::clone(&h.dispatcher);
        let r = Arc::clone(&first);
        thread::spawn(move || d.service_plus_request(&r))
    };
    assert!(wait_until(PATIENCE, || tx.in_use()));
    let t2 = {
        let d = Arc::clone(&h.dispatcher);
        let r = Arc::clone(&second);
        thread::spawn(move || d.service_plus_request(&r))
    };

    assert!(t1.join().expect("join first"));
    assert!(t2.join().expect("join second"));
    assert_eq!(first.state(), RequestState::Completed);
    assert_eq!(second.state(), RequestState::Completed);
    assert!(!tx.in_use());

    let spans = h.engine.spans();
    let a = spans.iter().find(|s| s.statement == "sleep:60").expect("first span");
    let b = spans.iter().find(|s| s.statement == "sleep:10").expect("second span");
    assert!(b.started >= a.finished);
    assert_eq!(a.tx_id.as_deref(), Some(tx_id.as_str()));
}

#[test]
fn queued_transaction_statement_holds_no_plus_slot() {
    let h = harness(small_config(1, 1));
    let tx = h.transactions.begin(None);
    let tx_id = tx.tx_id().to_string();

    let first = Request::new("hold").with_tx_id(&tx_id).into_shared();
    let second = Request::new("select second").with_tx_id(&tx_id).into_shared();
    let t1 = {
        let d = Arc::clone(&h.dispatcher);
        let r = Arc::clone(&first);
        thread::spawn(move || d.service_plus_request(&r))
    };
    assert!(wait_for_state(&first, RequestState::Running));
    let t2 = {
        let d = Arc::clone(&h.dispatcher);
        let r = Arc::clone(&second);
        thread::spawn(move || d.service_plus_request(&r))
    };
    assert!(wait_until(PATIENCE, || h.dispatcher.vitals().tx_queued == 1));

    let plus = h.dispatcher.gate_stats(Pool::Plus);
    assert_eq!(plus.running, 1);
    assert_eq!(plus.queued, 0);
    assert_eq!(plus.admitted_total, 1);
    assert_eq!(second.state(), RequestState::Submitted);

    h.engine.open();
    assert!(t1.join().expect("join first"));
    assert!(t2.join().expect("join second"));
    assert_eq!(first.state(), RequestState::Completed);
    assert_eq!(second.state(), RequestState::Completed);
    assert_eq!(second.results(), vec![json!({"echo": "select second"})]);
    assert!(second.service_started_at().is_some());
    assert!(second.service_started_at() >= first.completed_at());
    assert_eq!(h.dispatcher.gate_stats(Pool::Plus).admitted_total, 2);
    assert_eq!(h.dispatcher.metrics().requests_rejected, 0);
    assert!(!tx.in_use());
}

#[test]
fn full_transaction_queue_rejects_before_plus_admission() {
    let h = harness(DispatcherConfig {
        tx_queue_size: 0,
        ..small_config(2, 2)
    });
    let tx = h.transactions.begin(None);
    let tx_id = tx.tx_id().to_string();

    let first = Request::new("hold").with_tx_id(&tx_id).into_shared();
    let t1 = {
        let d = Arc::clone(&h.dispatcher);
        let r = Arc::clone(&first);
        thread::spawn(move || d.service_plus_request(&r))
    };
    assert!(wait_for_state(&first, RequestState::Running));

    let second = Request::new("select second").with_tx_id(&tx_id).into_shared();
    assert!(h.dispatcher.service_plus_request(&second));
    assert_eq!(second.state(), RequestState::Fatal);
    assert_eq!(second.errors()[0].code, E_TRANSACTION_QUEUE_FULL);
    assert_eq!(h.dispatcher.gate_stats(Pool::Plus).admitted_total, 1);
    assert_eq!(h.dispatcher.metrics().tx_queue_full, 1);

    h.engine.open();
    assert!(t1.join().expect("join first"));
    assert_eq!(first.state(), RequestState::Completed);
    assert_eq!(h.dispatcher.gate_stats(Pool::Plus).running, 0);
    assert!(!tx.in_use());
}

#[test]
fn engine_panic_is_contained_and_slot_released() {
    let h = harness(small_config(1, 0));
    let request = h.dispatcher.request("panic").into_shared();
    assert!(h.dispatcher.service_request(&request));
    assert_eq!(request.state(), RequestState::Abend);
    assert!(request
        .errors()
        .iter()
        .any(|e| e.code == E_EXECUTION_PANIC));

    let next = h.dispatcher.request("select 2").into_shared();
    assert!(h.dispatcher.service_request(&next));
    assert_eq!(next.state(), RequestState::Completed);
    let m = h.dispatcher.metrics();
    assert_eq!(m.requests_abended, 1);
    assert_eq!(m.active_requests, 0);
}

#[test]
fn engine_error_is_recorded_without_halting() {
    let h = harness(small_config(1, 1));
    let request = h.dispatcher.request("error:12003").into_shared();
    assert!(h.dispatcher.service_request(&request));
    assert_eq!(request.state(), RequestState::Completed);
    assert_eq!(request.errors()[0].code, 12003);
    assert_eq!(h.dispatcher.metrics().requests_with_errors, 1);
}

#[test]
fn default_timeout_interrupts_running_request() {
    let config = DispatcherConfig {
        default_timeout_ms: 30,
        ..small_config(1, 1)
    };
    let h = harness(config);
    let request = h.dispatcher.request("hold").into_shared();
    assert!(h.dispatcher.service_request(&request));
    assert_eq!(request.state(), RequestState::Timeout);
    assert_eq!(h.engine.cancels(), 1);
    assert_eq!(h.dispatcher.metrics().requests_timed_out, 1);
}

#[test]
fn request_timeout_is_capped_by_default() {
    let config = DispatcherConfig {
        default_timeout_ms: 30,
        ..small_config(1, 1)
    };
    let h = harness(config);
    let request = Request::new("hold")
        .with_timeout(Duration::from_secs(60))
        .into_shared();
    assert!(h.dispatcher.service_request(&request));
    assert_eq!(request.state(), RequestState::Timeout);
}

#[test]
fn stop_request_cancels_running_request() {
    let h = harness(small_config(1, 1));
    let request = h.dispatcher.request("hold").into_shared();
    let runner = {
        let d = Arc::clone(&h.dispatcher);
        let r = Arc::clone(&request);
        thread::spawn(move || d.service_request(&r))
    };
    assert!(wait_for_state(&request, RequestState::Running));
    let listed = h.dispatcher.active_requests();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].request_id, request.id());

    assert!(h.dispatcher.stop_request(request.id()));
    assert!(runner.join().expect("join runner"));
    assert_eq!(request.state(), RequestState::Stopped);
    assert_eq!(h.engine.cancels(), 1);
    assert!(!h.dispatcher.stop_request(request.id()));
    assert!(h.dispatcher.active_requests().is_empty());
}

#[test]
fn request_stopped_while_parked_never_executes() {
    let h = harness(small_config(1, 1));
    let holder = h.dispatcher.request("hold").into_shared();
    let parked = h.dispatcher.request("select parked").into_shared();

    let t1 = {
        let d = Arc::clone(&h.dispatcher);
        let r = Arc::clone(&holder);
        thread::spawn(move || d.service_request(&r))
    };
    assert!(wait_for_state(&holder, RequestState::Running));
    let t2 = {
        let d = Arc::clone(&h.dispatcher);
        let r = Arc::clone(&parked);
        thread::spawn(move || d.service_request(&r))
    };
    assert!(wait_until(PATIENCE, || h.dispatcher.gate_stats(Pool::Unbound).queued == 1));

    assert!(h.dispatcher.stop_request(parked.id()));
    h.engine.open();
    assert!(t1.join().expect("join holder"));
    assert!(t2.join().expect("join parked"));

    assert_eq!(parked.state(), RequestState::Stopped);
    assert!(parked.results().is_empty());
    assert!(parked.service_started_at().is_none());
    let stats = h.dispatcher.gate_stats(Pool::Unbound);
    assert_eq!(stats.running, 0);
    assert_eq!(stats.queued, 0);
}

#[test]
fn unknown_transaction_fails_without_admission() {
    let h = harness(small_config(1, 0));
    let request = Request::new("select 1").with_tx_id("tx-missing").into_shared();
    assert!(h.dispatcher.service_plus_request(&request));
    assert_eq!(request.state(), RequestState::Fatal);
    assert_eq!(request.errors()[0].code, E_TRANSACTION_INVALID);
    assert_eq!(h.dispatcher.metrics().requests_admitted, 0);
}

#[test]
fn transactional_statement_on_unbound_pool_is_refused() {
    let h = harness(small_config(1, 0));
    let tx = h.transactions.begin(None);
    let request = Request::new("select 1").with_tx_id(tx.tx_id()).into_shared();
    assert!(h.dispatcher.service_request(&request));
    assert_eq!(request.state(), RequestState::Fatal);
    assert_eq!(request.errors()[0].code, E_INTERNAL);
    assert!(!tx.in_use());
}

#[test]
fn settings_apply_all_or_nothing() {
    let h = harness(small_config(1, 0));
    let bad = json!({"servicers": 2, "no-such-setting": 1});
    assert!(h
        .dispatcher
        .apply_settings(bad.as_object().expect("object"))
        .is_err());
    assert_eq!(h.dispatcher.config().servicers, 1);

    let good = json!({"servicers": 2, "request-backlog": 50, "error-limit": 3});
    let applied = h
        .dispatcher
        .apply_settings(good.as_object().expect("object"))
        .expect("apply");
    assert_eq!(applied.len(), 3);
    let config = h.dispatcher.config();
    assert_eq!(config.servicers, 2);
    assert_eq!(config.error_limit, 3);
    // backlog growth is bounded by the slot ring built at startup
    assert_eq!(config.request_backlog, 0);
    assert_eq!(h.dispatcher.gate_stats(Pool::Unbound).servicers, 2);
    assert_eq!(h.dispatcher.request("select 1").error_limit(), 3);
}

#[test]
fn closed_dispatcher_refuses_new_work() {
    let h = harness(small_config(2, 2));
    h.dispatcher.close();
    assert!(h.dispatcher.is_closed());
    let request = h.dispatcher.request("select 1").into_shared();
    assert!(!h.dispatcher.service_request(&request));
    assert_eq!(request.errors()[0].code, E_SERVICE_UNAVAILABLE);
    h.dispatcher.close();
}

#[test]
fn vitals_report_load_and_pools() {
    let h = harness(small_config(2, 2));
    let request = h.dispatcher.request("hold").into_shared();
    let runner = {
        let d = Arc::clone(&h.dispatcher);
        let r = Arc::clone(&request);
        thread::spawn(move || d.service_plus_request(&r))
    };
    assert!(wait_for_state(&request, RequestState::Running));
    let vitals = h.dispatcher.vitals();
    assert_eq!(vitals.plus.running, 1);
    assert_eq!(vitals.load, 50);
    assert_eq!(vitals.active_requests, 1);

    h.engine.open();
    assert!(runner.join().expect("join runner"));
    assert_eq!(h.dispatcher.load(), 0);
}
