//! End-to-end replays against the reference scheduler.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use kiln_sim::InstanceStatus;
use kiln_sim::Job;
use kiln_sim::PollOptions;
use kiln_sim::Resources;
use kiln_sim::Share;
use kiln_sim::SimConfig;
use kiln_sim::SimError;
use kiln_sim::Simulator;
use kiln_sim::TaskRecord;
use kiln_sim::equivalent_records;
use kiln_sim::phase_channels;
use kiln_sim::read_rows;
use kiln_testing::InMemoryJobStore;
use kiln_testing::MockCluster;
use kiln_testing::ReferenceScheduler;
use kiln_testing::ReplayRig;
use kiln_testing::SchedulerStats;
use kiln_testing::fixtures::failing_job;
use kiln_testing::fixtures::hosts;
use kiln_testing::fixtures::job;
use kiln_testing::fixtures::uniform_trace;
use kiln_time::SimulatedClock;

fn config_with_shares(users: usize) -> SimConfig {
    let mut config = SimConfig::with_cycle_step_ms(100);
    config.shares = (0..users)
        .map(|i| Share {
            user: format!("user-{i}"),
            cpus: 4.0,
            mem: 4_096.0,
            gpus: 0.0,
        })
        .collect();
    config
}

async fn replay(trace: Vec<Job>, config: &SimConfig) -> kiln_sim::Result<Vec<TaskRecord>> {
    ReplayRig::new(config).run(&hosts(2, 4.0, 4_096.0), trace, config, None).await
}

fn shifted(trace: &[Job], offset_ms: u64) -> Vec<Job> {
    trace
        .iter()
        .cloned()
        .map(|mut job| {
            job.submit_time_ms += offset_ms;
            job
        })
        .collect()
}

#[tokio::test]
async fn every_job_yields_one_ordered_row() {
    let config = config_with_shares(3);
    let trace = uniform_trace(20, 3, 100, 250);
    let records = replay(trace, &config).await.unwrap();

    assert_eq!(records.len(), 20);
    let job_ids: BTreeSet<&str> = records.iter().map(|r| r.job.id.as_str()).collect();
    assert_eq!(job_ids.len(), 20);
    for record in &records {
        let end = record.instance.end_time_ms.expect("finished");
        assert!(record.instance.start_time_ms >= record.job.submit_time_ms, "{record:?}");
        assert!(end >= record.instance.start_time_ms, "{record:?}");
        assert_eq!(record.instance.status, InstanceStatus::Success);
        assert!(record.instance.scheduled_at_ms.is_some());
    }
}

#[tokio::test]
async fn submissions_never_share_a_timestamp() {
    let config = config_with_shares(2);
    // Four jobs land in the same cycle.
    let trace: Vec<Job> = (0..4).map(|i| job(&format!("j{i}"), "user-0", 0, 50)).collect();
    let records = replay(trace, &config).await.unwrap();

    let submits: BTreeSet<u64> = records.iter().map(|r| r.job.submit_time_ms).collect();
    assert_eq!(submits.len(), 4);
}

#[tokio::test]
async fn replays_of_the_same_trace_are_equivalent() {
    let config = config_with_shares(3);
    let trace = uniform_trace(30, 3, 70, 400);

    let first = replay(trace.clone(), &config).await.unwrap();
    let second = replay(trace.clone(), &config).await.unwrap();
    let comparison = equivalent_records(&first, &second);
    assert!(comparison.is_equivalent(), "{:?}", comparison.diffs);

    // Absolute offsets do not matter, only relative scheduling.
    let later = replay(shifted(&trace, 1_000_000), &config).await.unwrap();
    let comparison = equivalent_records(&first, &later);
    assert!(comparison.is_equivalent(), "{:?}", comparison.diffs);
}

#[tokio::test]
async fn contention_changes_the_schedule() {
    let config = config_with_shares(1);
    let trace = uniform_trace(12, 1, 10, 500);

    let roomy = ReplayRig::new(&config).run(&hosts(4, 4.0, 4_096.0), trace.clone(), &config, None).await.unwrap();
    let tight = ReplayRig::new(&config).run(&hosts(1, 1.0, 4_096.0), trace, &config, None).await.unwrap();
    assert!(!equivalent_records(&roomy, &tight).is_equivalent());
}

#[tokio::test]
async fn failed_attempts_are_retried_up_to_max_retries() {
    let config = config_with_shares(1);
    let trace = vec![job("ok", "user-0", 0, 50), failing_job("flaky", "user-0", 0, 50, 2)];
    let records = replay(trace, &config).await.unwrap();

    let mut per_job: BTreeMap<&str, Vec<&TaskRecord>> = BTreeMap::new();
    for record in &records {
        per_job.entry(record.job.id.as_str()).or_default().push(record);
    }
    assert_eq!(per_job["ok"].len(), 1);
    assert_eq!(per_job["flaky"].len(), 2);
    assert!(per_job["flaky"].iter().all(|r| r.instance.status == InstanceStatus::Failed));
    assert!(per_job["flaky"].iter().all(|r| r.instance.reason.as_deref() == Some("simulated-failure")));
}

#[tokio::test]
async fn unplaceable_jobs_are_rejected_and_the_run_ends() {
    let config = config_with_shares(1);
    let mut huge = job("huge", "user-0", 0, 50);
    huge.resources = Resources::new(128.0, 64.0);
    let trace = vec![huge, job("small", "user-0", 10, 50)];

    let rig = ReplayRig::new(&config);
    let records = rig.simulator.simulate(&hosts(2, 4.0, 4_096.0), trace, &config, None).await.unwrap();
    assert_eq!(SchedulerStats::get(&rig.scheduler.stats().rejected), 1);
    rig.scheduler.shutdown().await;

    let ids: Vec<&str> = records.iter().map(|r| r.job.id.as_str()).collect();
    assert_eq!(ids, vec!["small"]);
}

#[tokio::test]
async fn phase_counts_follow_intervals() {
    let mut config = config_with_shares(1);
    config.time_ms_between_optimizer_calls = 250;
    config.time_ms_between_rebalancing = 450;
    config.max_cycles = Some(12);
    // One long job keeps the run going for all twelve cycles.
    let trace = vec![job("long", "user-0", 0, 1_000_000)];

    let rig = ReplayRig::new(&config);
    rig.simulator.simulate(&hosts(1, 4.0, 4_096.0), trace, &config, None).await.unwrap();
    let stats = rig.scheduler.stats();
    assert_eq!(SchedulerStats::get(&stats.completion), 12);
    assert_eq!(SchedulerStats::get(&stats.rank), 12);
    assert_eq!(SchedulerStats::get(&stats.offer), 12);
    assert_eq!(SchedulerStats::get(&stats.matching), 12);
    // step 100: optimizer accumulator 0,100,200,300 -> fires every fourth cycle.
    assert_eq!(SchedulerStats::get(&stats.optimize), 3);
    // step 100: rebalance accumulator 0..500 -> fires every sixth cycle.
    assert_eq!(SchedulerStats::get(&stats.rebalance), 2);
    assert_eq!(SchedulerStats::get(&stats.launched), 1);
    rig.scheduler.shutdown().await;
}

#[tokio::test]
async fn unsorted_trace_is_an_ordering_violation() {
    let config = SimConfig::with_cycle_step_ms(1_000);
    let trace = vec![job("a", "u", 0, 10), job("b", "u", 500, 10), job("c", "u", 100, 10)];
    let err = replay(trace, &config).await.unwrap_err();
    match err {
        SimError::OrderingViolation { offending } => assert_eq!(offending, vec![100]),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn missing_cycle_step_is_fatal() {
    let config = SimConfig::default();
    let err = replay(uniform_trace(3, 1, 10, 10), &config).await.unwrap_err();
    assert!(matches!(err, SimError::MissingConfig { ref option } if option == "cycle_step_ms"));
}

#[tokio::test(start_paused = true)]
async fn lost_confirmations_time_out_with_unconfirmed_ids() {
    let mut config = config_with_shares(1);
    config.poll = PollOptions {
        interval_ms: 10,
        timeout_ms: 100,
    };
    let clock = SimulatedClock::new(0);
    let store = Arc::new(InMemoryJobStore::new());
    let cluster = Arc::new(MockCluster::new());
    // Nobody forwards the cluster's status updates to the store.
    let _updates = cluster.take_status_updates();
    let (triggers, receivers) = phase_channels();
    let scheduler =
        ReferenceScheduler::spawn(store.clone(), cluster.clone(), receivers, clock.clone(), config.scheduler.clone());
    let simulator = Simulator::new(store, cluster, triggers, clock);

    let err = simulator
        .simulate(&hosts(1, 4.0, 4_096.0), vec![job("a", "user-0", 0, 50)], &config, None)
        .await
        .unwrap_err();
    scheduler.shutdown().await;

    match err {
        SimError::PollTimeout {
            label, diagnostics, ..
        } => {
            assert_eq!(label, "running tasks confirmed");
            assert_eq!(diagnostics.as_deref(), Some("1 running, unconfirmed: [\"a-0\"]"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn incremental_output_matches_final_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("progress.csv");
    let config = config_with_shares(2);
    let trace = uniform_trace(10, 2, 100, 150);

    let records = ReplayRig::new(&config)
        .run(&hosts(2, 4.0, 4_096.0), trace, &config, Some(&path))
        .await
        .unwrap();

    // The wall-clock interval never elapses in a run this short, so the whole file
    // comes from the final flush.
    let rows = read_rows(&path).unwrap();
    assert_eq!(rows.len(), records.len());
    let written: BTreeSet<String> = rows.into_iter().map(|r| r.instance_id).collect();
    let finished: BTreeSet<String> = records.into_iter().map(|r| r.instance.task_id).collect();
    assert_eq!(written, finished);
}

#[tokio::test]
async fn frequent_incremental_writes_never_duplicate_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frequent.csv");
    let mut config = config_with_shares(2);
    config.time_ms_between_incremental_output = 1;
    let trace = uniform_trace(25, 2, 50, 120);

    let records = ReplayRig::new(&config)
        .run(&hosts(2, 4.0, 4_096.0), trace, &config, Some(&path))
        .await
        .unwrap();

    let rows = read_rows(&path).unwrap();
    let unique: BTreeSet<&str> = rows.iter().map(|r| r.instance_id.as_str()).collect();
    assert_eq!(unique.len(), rows.len());
    assert!(rows.len() <= records.len());

    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text.lines().filter(|l| l.starts_with("job_id,")).count(), 1);
}
