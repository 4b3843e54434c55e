mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use build_golem::parallel::{logical_processor_count, run_parallel, RunOptions};
use build_golem::runner::{MockBehavior, MockProcessRunner, TimelineEvent};
use build_golem::scheduler::{order_by_cost, run_slots};
use build_golem::trace::MockTraceSource;
use build_golem::types::{ExitState, ItemState};

use common::{build_name, items_with_costs, make_item};

fn options(degree_of_parallelism: usize) -> RunOptions {
    RunOptions {
        degree_of_parallelism,
        ..RunOptions::default()
    }
}

// --- Ordering ---

#[tokio::test]
async fn launches_by_descending_cost_with_two_slots() {
    let runner = Arc::new(MockProcessRunner::new());
    let source = MockTraceSource::new();

    let summary = run_parallel(
        items_with_costs(&[1, 5, 3, 2, 4]),
        Arc::clone(&runner),
        &source,
        &options(2),
    )
    .await
    .unwrap();

    // costs 5, 4, 3, 2, 1
    assert_eq!(runner.timeline().launch_order(), vec![1, 4, 2, 3, 0]);
    assert!(runner.peak_concurrency() <= 2);
    assert_eq!(summary.records.len(), 5);
    assert_eq!(summary.degree_of_parallelism, 2);
    assert_eq!(summary.batches, 1);
    assert_eq!(summary.trace_sessions, 0);
    assert_eq!(source.sessions_opened(), 0);
}

#[tokio::test]
async fn records_come_back_in_item_order_with_launch_ordinals() {
    let runner = Arc::new(MockProcessRunner::new());
    let summary = run_parallel(
        items_with_costs(&[1, 5, 3]),
        runner,
        &MockTraceSource::new(),
        &options(3),
    )
    .await
    .unwrap();

    let ids: Vec<usize> = summary.records.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![0, 1, 2]);
    let ordinals: Vec<usize> = summary.records.iter().map(|r| r.ordinal).collect();
    assert_eq!(ordinals, vec![2, 0, 1]);
}

#[test]
fn order_by_cost_does_not_change_costs() {
    let mut items = items_with_costs(&[3, 9, 1]);
    order_by_cost(&mut items);
    let costs: Vec<u64> = items.iter().map(|i| i.cost()).collect();
    assert_eq!(costs, vec![9, 3, 1]);
}

// --- Bounded concurrency ---

#[tokio::test]
async fn never_exceeds_parallelism_for_any_size() {
    for n in 1..=8usize {
        for p in 1..=n {
            let mut runner = MockProcessRunner::new();
            for id in 0..n {
                let delay = Duration::from_millis(1 + (id as u64 * 7) % 4);
                runner = runner.with_behavior(&build_name(id), MockBehavior::exit(0).with_delay(delay));
            }
            let costs: Vec<u64> = (0..n as u64).map(|c| (c * 5) % 7).collect();
            let runner = Arc::new(runner);

            let summary = run_parallel(
                items_with_costs(&costs),
                Arc::clone(&runner),
                &MockTraceSource::new(),
                &options(p),
            )
            .await
            .unwrap();

            assert!(
                runner.peak_concurrency() <= p,
                "n={} p={} peak={}",
                n,
                p,
                runner.peak_concurrency()
            );
            assert_eq!(runner.launch_count(), n, "n={} p={}", n, p);
            let ids: HashSet<usize> = summary.records.iter().map(|r| r.id).collect();
            assert_eq!(ids.len(), n, "every item completes exactly once");
        }
    }
}

#[tokio::test]
async fn fills_every_slot_when_builds_overlap() {
    let runner = Arc::new(
        MockProcessRunner::new()
            .with_default(MockBehavior::exit(0).with_delay(Duration::from_millis(50))),
    );
    run_parallel(
        items_with_costs(&[1; 6]),
        Arc::clone(&runner),
        &MockTraceSource::new(),
        &options(3),
    )
    .await
    .unwrap();

    assert_eq!(runner.peak_concurrency(), 3);
}

#[tokio::test]
async fn fewer_items_than_parallelism_clamps() {
    let runner = Arc::new(
        MockProcessRunner::new()
            .with_default(MockBehavior::exit(0).with_delay(Duration::from_millis(20))),
    );
    let summary = run_parallel(
        items_with_costs(&[1, 2, 3]),
        Arc::clone(&runner),
        &MockTraceSource::new(),
        &options(16),
    )
    .await
    .unwrap();

    assert_eq!(summary.degree_of_parallelism, 3);
    assert!(runner.peak_concurrency() <= 3);
    assert_eq!(summary.records.len(), 3);
}

#[tokio::test]
async fn zero_parallelism_resolves_to_processor_count() {
    let runner = Arc::new(MockProcessRunner::new());
    let summary = run_parallel(
        items_with_costs(&[1; 4]),
        runner,
        &MockTraceSource::new(),
        &options(0),
    )
    .await
    .unwrap();

    assert_eq!(
        summary.degree_of_parallelism,
        logical_processor_count().min(4)
    );
}

#[tokio::test]
async fn empty_run_is_a_noop() {
    let runner = Arc::new(MockProcessRunner::new());
    let summary = run_parallel(Vec::new(), Arc::clone(&runner), &MockTraceSource::new(), &options(4))
        .await
        .unwrap();
    assert!(summary.records.is_empty());
    assert_eq!(runner.launch_count(), 0);
}

// --- Failures ---

#[tokio::test]
async fn failing_build_does_not_stop_the_run() {
    let runner = Arc::new(
        MockProcessRunner::new()
            .with_behavior("b2", MockBehavior::exit(1))
            .with_behavior("b3", MockBehavior::launch_failure("No such file or directory")),
    );
    let summary = run_parallel(
        items_with_costs(&[5, 4, 3, 2, 1]),
        Arc::clone(&runner),
        &MockTraceSource::new(),
        &options(2),
    )
    .await
    .unwrap();

    assert_eq!(summary.records.len(), 5);
    assert_eq!(summary.records[2].exit, ExitState::Exited { code: 1 });
    assert!(matches!(
        summary.records[3].exit,
        ExitState::LaunchFailed { .. }
    ));
    assert_eq!(summary.records[3].pid, None);
    assert_eq!(summary.succeeded(), 3);
    assert_eq!(summary.failed(), 2);
    assert_eq!(summary.launch_failed(), 1);
    assert!(!summary.all_succeeded());
}

#[tokio::test]
async fn failed_builds_are_not_retried() {
    let runner = Arc::new(MockProcessRunner::new().with_default(MockBehavior::exit(2)));
    run_parallel(
        items_with_costs(&[1, 1, 1]),
        Arc::clone(&runner),
        &MockTraceSource::new(),
        &options(2),
    )
    .await
    .unwrap();
    assert_eq!(runner.launch_count(), 3);
}

// --- Scheduler loop directly ---

#[tokio::test]
async fn run_slots_launches_in_given_order_and_completes_all() {
    let runner = MockProcessRunner::new()
        .with_behavior("b0", MockBehavior::exit(0).with_delay(Duration::from_millis(40)))
        .with_behavior("b1", MockBehavior::exit(0).with_delay(Duration::from_millis(1)));
    let items = vec![make_item(0, 0, false), make_item(1, 0, false), make_item(2, 0, false)];

    let done = run_slots(items, 10, 13, 2, &runner).await;

    assert_eq!(runner.timeline().launch_order(), vec![0, 1, 2]);
    assert_eq!(done.len(), 3);
    for item in &done {
        match item.state() {
            ItemState::Completed(record) => assert!((10..13).contains(&record.ordinal)),
            other => panic!("item {} not completed: {:?}", item.id(), other),
        }
    }
    // b1 finished first and freed its slot for b2 while b0 was still running
    let events = runner.timeline().events();
    let b2_launch = events
        .iter()
        .position(|e| *e == TimelineEvent::Launched { id: 2 })
        .unwrap();
    let b0_exit = events
        .iter()
        .position(|e| *e == TimelineEvent::Exited { id: 0 })
        .unwrap();
    assert!(b2_launch < b0_exit);
}
