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

use super::CountingOperator;
use crate::engine::Operator;
use crate::error::{ErrorRecord, GateError, E_REQUEST_ERROR_LIMIT, E_TRANSACTION_QUEUE_FULL};
use crate::request::{Request, RequestState};
use std::sync::Arc;

#[test]
fn identical_errors_fold_into_repeats() {
    let request = Request::new("select 1");
    request.error(ErrorRecord::new(12003, "keyspace not found"));
    request.error(ErrorRecord::new(12003, "keyspace not found"));
    request.error(ErrorRecord::new(12003, "keyspace not found"));
    request.error(ErrorRecord::new(12003, "bucket not found"));

    let errors = request.errors();
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0].repeats, 2);
    assert_eq!(errors[1].repeats, 0);
    assert!(request.has_errors());
    assert!(!request.halted());
}

#[test]
fn exceeding_error_limit_appends_marker_and_goes_fatal() {
    let request = Request::new("select 1").with_error_limit(2).into_shared();
    let op = Arc::new(CountingOperator::default());
    let target: Arc<dyn Operator> = op.clone();
    request.set_stop_target(&target);
    assert!(request.transition(RequestState::Submitted, RequestState::Preprocessing));
    assert!(request.transition(RequestState::Preprocessing, RequestState::Running));

    request.error(ErrorRecord::new(1, "first"));
    request.error(ErrorRecord::new(2, "second"));
    assert_eq!(request.state(), RequestState::Running);
    request.error(ErrorRecord::new(3, "third"));

    let errors = request.errors();
    assert_eq!(errors.len(), 4);
    assert_eq!(errors[3].code, E_REQUEST_ERROR_LIMIT);
    assert_eq!(request.state(), RequestState::Fatal);
    assert_eq!(op.cancels(), 1);

    request.error(ErrorRecord::new(4, "ignored"));
    assert_eq!(request.errors().len(), 4);
}

#[test]
fn duplicates_do_not_count_towards_the_limit() {
    let request = Request::new("select 1").with_error_limit(1);
    request.error(ErrorRecord::new(1, "same"));
    request.error(ErrorRecord::new(1, "same"));
    assert_eq!(request.state(), RequestState::Submitted);
    assert_eq!(request.errors().len(), 1);
}

#[test]
fn warnings_fold_and_leave_state_alone() {
    let request = Request::new("select 1");
    request.warning(ErrorRecord::new(5200, "index scan degraded"));
    request.warning(ErrorRecord::new(5200, "index scan degraded"));
    assert_eq!(request.warnings().len(), 1);
    assert_eq!(request.warnings()[0].repeats, 1);
    assert!(!request.has_errors());
    assert_eq!(request.state(), RequestState::Submitted);
}

#[test]
fn fatal_records_error_and_halts() {
    let request = Request::new("select 1");
    request.fatal(GateError::TransactionQueueFull {
        tx_id: "tx1".to_string(),
    });
    assert_eq!(request.state(), RequestState::Fatal);
    assert_eq!(request.errors()[0].code, E_TRANSACTION_QUEUE_FULL);
}

#[test]
fn snapshot_serializes_state_and_errors() {
    let request = Request::new("select 1").with_tx_id("tx9");
    request.error(ErrorRecord::new(7, "oops"));
    request.finish();
    let value = serde_json::to_value(request.snapshot()).expect("encode snapshot");
    assert_eq!(value["state"], "completed");
    assert_eq!(value["tx_id"], "tx9");
    assert_eq!(value["errors"][0]["code"], 7);
    assert_eq!(value["statement"], "select 1");
}
