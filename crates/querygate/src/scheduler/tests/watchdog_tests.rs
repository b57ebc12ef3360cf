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

use super::{wait_until, waiter};
use crate::fault;
use crate::scheduler::gate::FAILPOINT_SKIP_HANDOFF;
use crate::scheduler::watchdog::FAILPOINT_SWEEP_PANIC;
use crate::scheduler::{SchedulerGate, Watchdog};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const PATIENCE: Duration = Duration::from_secs(5);

fn park_in_background(
    gate: &Arc<SchedulerGate>,
    label: &'static str,
    tx: &mpsc::Sender<&'static str>,
) -> thread::JoinHandle<()> {
    let g = Arc::clone(gate);
    let tx = tx.clone();
    thread::spawn(move || {
        assert!(g.enqueue(waiter(label)));
        tx.send(label).expect("send admission");
        g.dequeue();
    })
}

#[test]
fn sweep_admits_backlog_when_runner_vanished() {
    let gate = Arc::new(SchedulerGate::new("sweep-rc2", 1, 2));
    assert!(gate.enqueue(waiter("a")));

    let (tx, rx) = mpsc::channel();
    let b = park_in_background(&gate, "b", &tx);
    assert!(wait_until(PATIENCE, || gate.parked() == 1));
    let c = park_in_background(&gate, "c", &tx);
    assert!(wait_until(PATIENCE, || gate.parked() == 2));

    fault::set_failpoint(&fault::scoped_name(FAILPOINT_SKIP_HANDOFF, gate.name()), 0);
    gate.dequeue();
    assert_eq!(gate.running(), 0);
    assert_eq!(gate.queued(), 2);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    assert_eq!(gate.check_waiters(), 1);
    assert_eq!(rx.recv_timeout(PATIENCE).expect("b admitted"), "b");
    assert_eq!(rx.recv_timeout(PATIENCE).expect("c admitted"), "c");
    b.join().expect("join b");
    c.join().expect("join c");
    assert_eq!(gate.running(), 0);
    assert_eq!(gate.queued(), 0);
}

#[test]
fn sweep_releases_parked_waiter_with_empty_backlog() {
    let gate = Arc::new(SchedulerGate::new("sweep-rc1", 1, 1));
    assert!(gate.enqueue(waiter("a")));

    let (tx, rx) = mpsc::channel();
    let b = park_in_background(&gate, "b", &tx);
    assert!(wait_until(PATIENCE, || gate.parked() == 1));

    // counters lose the waiter: backlog emptied and the runner gone
    assert!(gate.take_backlog());
    gate.dequeue();
    assert_eq!(gate.running(), 0);
    assert_eq!(gate.queued(), 0);
    assert_eq!(gate.parked(), 1);

    assert_eq!(gate.check_waiters(), 1);
    assert_eq!(rx.recv_timeout(PATIENCE).expect("b admitted"), "b");
    b.join().expect("join b");
    assert_eq!(gate.running(), 0);
    assert_eq!(gate.parked(), 0);
}

#[test]
fn sweep_is_a_no_op_while_a_runner_is_present() {
    let gate = Arc::new(SchedulerGate::new("sweep-busy", 1, 1));
    assert!(gate.enqueue(waiter("a")));
    let (tx, rx) = mpsc::channel();
    let b = park_in_background(&gate, "b", &tx);
    assert!(wait_until(PATIENCE, || gate.parked() == 1));

    assert_eq!(gate.check_waiters(), 0);
    assert!(rx.try_recv().is_err());

    gate.dequeue();
    assert_eq!(rx.recv_timeout(PATIENCE).expect("b admitted"), "b");
    b.join().expect("join b");
}

#[test]
fn watchdog_thread_repairs_lost_handoff_within_a_sweep() {
    let gate = Arc::new(SchedulerGate::new("watchdog-thread", 1, 2));
    let watchdog = Watchdog::start(Arc::clone(&gate), Duration::from_millis(20)).expect("start");
    assert!(watchdog.is_running());
    assert!(gate.enqueue(waiter("a")));

    let (tx, rx) = mpsc::channel();
    let b = park_in_background(&gate, "b", &tx);
    assert!(wait_until(PATIENCE, || gate.parked() == 1));
    let c = park_in_background(&gate, "c", &tx);
    assert!(wait_until(PATIENCE, || gate.parked() == 2));

    fault::set_failpoint(&fault::scoped_name(FAILPOINT_SKIP_HANDOFF, gate.name()), 0);
    gate.dequeue();

    assert_eq!(rx.recv_timeout(PATIENCE).expect("b admitted"), "b");
    assert_eq!(rx.recv_timeout(PATIENCE).expect("c admitted"), "c");
    b.join().expect("join b");
    c.join().expect("join c");
    assert!(gate.stats().repaired_total >= 1);
    drop(watchdog);
}

#[test]
fn watchdog_survives_a_panicking_sweep() {
    let gate = Arc::new(SchedulerGate::new("watchdog-panic", 1, 1));
    fault::set_failpoint(&fault::scoped_name(FAILPOINT_SWEEP_PANIC, gate.name()), 0);
    let mut watchdog =
        Watchdog::start(Arc::clone(&gate), Duration::from_millis(10)).expect("start");
    assert!(gate.enqueue(waiter("a")));

    let (tx, rx) = mpsc::channel();
    let b = park_in_background(&gate, "b", &tx);
    assert!(wait_until(PATIENCE, || gate.parked() == 1));
    fault::set_failpoint(&fault::scoped_name(FAILPOINT_SKIP_HANDOFF, gate.name()), 0);
    gate.dequeue();

    assert_eq!(rx.recv_timeout(PATIENCE).expect("b admitted"), "b");
    b.join().expect("join b");
    watchdog.stop();
    assert!(!watchdog.is_running());
}
