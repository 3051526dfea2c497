use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::time::Duration;

use tokio::net::TcpListener;
use traffic_rank::{
    Coordinator, DistributedConfig, Hour, LocalCluster, LocalTransport, PartitionDispatcher,
    RetryPolicy, SampleGenerator, TcpTransport, TrafficError, TrafficEvent, Transport,
    WireMessage, WorkerAggregator,
};

fn scenario() -> Vec<TrafficEvent> {
    vec![
        TrafficEvent::new("08", 1, 10),
        TrafficEvent::new("08", 2, 5),
        TrafficEvent::new("09", 1, 3),
    ]
}

const SCENARIO_REPORT: &str = "
=== Traffic Analysis Report ===
Top 2 busiest traffic lights for each hour:
--------------------------------------------
At 08:00 - Traffic Light 1 handled 10 cars.
At 08:00 - Traffic Light 2 handled 5 cars.
At 09:00 - Traffic Light 1 handled 3 cars.
";

#[tokio::test]
async fn scenario_report_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "08 1 10\n08 2 5\n09 1 3").unwrap();
    file.flush().unwrap();

    let outcome = LocalCluster::new(DistributedConfig::new(3, 2))
        .run_file(file.path())
        .await
        .unwrap();

    assert_eq!(outcome.report.render(2), SCENARIO_REPORT);
    assert_eq!(outcome.dispatch.hours_for(1), vec![Hour::new(8).unwrap()]);
    assert_eq!(outcome.dispatch.hours_for(2), vec![Hour::new(9).unwrap()]);
}

#[tokio::test]
async fn report_is_grouped_by_worker_not_hour() {
    // P = 3: even hours go to worker 1, odd hours to worker 2
    let events = vec![
        TrafficEvent::new("03:00", 1, 1),
        TrafficEvent::new("02:00", 1, 1),
        TrafficEvent::new("01:00", 1, 1),
        TrafficEvent::new("00:00", 1, 1),
    ];
    let outcome = LocalCluster::new(DistributedConfig::new(3, 2))
        .run(events)
        .await
        .unwrap();

    let hours: Vec<u8> = outcome
        .report
        .lines()
        .iter()
        .map(|l| l.hour.value())
        .collect();
    assert_eq!(hours, vec![0, 2, 1, 3]);
}

#[tokio::test]
async fn dispatch_is_a_partition_of_the_input() {
    let events = SampleGenerator::new(2000, 25).with_seed(3).generate().unwrap();

    for processes in [2usize, 3, 5, 8] {
        let mut sent_cars: BTreeMap<Hour, u64> = BTreeMap::new();
        for event in &events {
            *sent_cars.entry(event.hour().unwrap()).or_default() += u64::from(event.cars_passed);
        }

        let outcome = LocalCluster::new(DistributedConfig::new(processes, 2))
            .run(events.clone())
            .await
            .unwrap();

        let mut seen = BTreeSet::new();
        for assignment in &outcome.dispatch.assignments {
            assert!(seen.insert(assignment.hour), "hour sent twice");
            let expected = usize::from(assignment.hour.value()) % (processes - 1) + 1;
            assert_eq!(assignment.target, expected);
            assert_eq!(assignment.cars, sent_cars[&assignment.hour]);
        }
        assert_eq!(seen.len(), sent_cars.len());
        assert_eq!(outcome.dispatch.records(), events.len());

        let worker_records: usize = outcome.workers.iter().map(|w| w.records).sum();
        let worker_cars: u64 = outcome.workers.iter().map(|w| w.cars).sum();
        assert_eq!(worker_records, events.len());
        assert_eq!(worker_cars, sent_cars.values().sum::<u64>());

        for worker in &outcome.workers {
            assert_eq!(worker.hours, outcome.dispatch.hours_for(worker.rank));
        }

        // at most two lines per hour, each hour ranked on its own
        for hour in seen {
            let lines: Vec<_> = outcome.report.for_hour(hour).collect();
            assert!(!lines.is_empty() && lines.len() <= 2);
            assert!(lines.windows(2).all(|w| w[0].count >= w[1].count));
        }
    }
}

#[tokio::test]
async fn one_sentinel_per_worker() {
    let group = LocalTransport::group(4, 64).unwrap();
    let dispatcher = PartitionDispatcher::new(4);
    let buckets = dispatcher.partition(scenario());
    dispatcher.dispatch(&group[0], buckets).await.unwrap();

    for worker in &group[1..] {
        let mut sentinels = 0;
        loop {
            match tokio::time::timeout(Duration::from_millis(50), worker.recv(0)).await {
                Ok(Ok(WireMessage::Sentinel)) => sentinels += 1,
                Ok(Ok(WireMessage::Dispatch(_))) => assert_eq!(sentinels, 0),
                Ok(other) => panic!("unexpected {:?}", other),
                Err(_) => break,
            }
        }
        assert_eq!(sentinels, 1);
    }
}

#[tokio::test]
async fn one_report_end_per_worker() {
    let mut endpoints = LocalTransport::group(3, 64).unwrap().into_iter();
    let coordinator = endpoints.next().unwrap();
    let workers: Vec<_> = endpoints
        .map(|endpoint| {
            tokio::spawn(async move {
                WorkerAggregator::new(2).run(&endpoint).await.unwrap();
                endpoint
            })
        })
        .collect();

    let dispatcher = PartitionDispatcher::new(3);
    let buckets = dispatcher.partition(scenario());
    dispatcher.dispatch(&coordinator, buckets).await.unwrap();

    let mut report_ends = BTreeMap::new();
    for rank in coordinator.peers() {
        loop {
            match coordinator.recv(rank).await.unwrap() {
                WireMessage::Report(_) => {}
                WireMessage::ReportEnd => {
                    *report_ends.entry(rank).or_insert(0) += 1;
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }
    // keep worker endpoints alive so a second REPORT_END would be observable
    let mut alive = Vec::new();
    for worker in workers {
        alive.push(worker.await.unwrap());
    }
    for rank in coordinator.peers() {
        let extra = tokio::time::timeout(Duration::from_millis(50), coordinator.recv(rank)).await;
        assert!(extra.is_err(), "worker {} sent more after REPORT_END", rank);
    }
    assert_eq!(report_ends, BTreeMap::from([(1, 1), (2, 1)]));
}

#[tokio::test]
async fn hour_bucket_larger_than_one_frame() {
    let events: Vec<TrafficEvent> = (0..1_000_000u32)
        .map(|i| TrafficEvent::new("08:00:00", i % 50 + 1, 1))
        .collect();

    let outcome = LocalCluster::new(DistributedConfig::new(3, 2))
        .run(events)
        .await
        .unwrap();

    let assignment = &outcome.dispatch.assignments[0];
    assert_eq!(outcome.dispatch.assignments.len(), 1);
    assert_eq!(assignment.records, 1_000_000);
    assert!(assignment.chunks > 1);
    assert_eq!(outcome.workers[0].records, 1_000_000);
    assert_eq!(outcome.workers[0].hours, vec![Hour::new(8).unwrap()]);

    let lines: Vec<(u32, u64)> = outcome
        .report
        .lines()
        .iter()
        .map(|l| (l.light_id, l.count))
        .collect();
    assert_eq!(lines, vec![(1, 20_000), (2, 20_000)]);
}

#[tokio::test]
async fn fewer_than_two_processes_is_rejected() {
    for processes in [0usize, 1] {
        let result = LocalCluster::new(DistributedConfig::new(processes, 2))
            .run(scenario())
            .await;
        assert!(matches!(result, Err(TrafficError::ConfigError(_))));
    }
}

#[tokio::test]
async fn invalid_hours_are_dropped_not_dispatched() {
    let mut events = scenario();
    events.push(TrafficEvent::new("99:00", 5, 100));
    events.push(TrafficEvent::new("x9:00", 6, 100));

    let outcome = LocalCluster::new(DistributedConfig::new(3, 2))
        .run(events)
        .await
        .unwrap();
    assert_eq!(outcome.dispatch.dropped, 2);
    assert_eq!(outcome.report.len(), 3);
    assert!(outcome.report.lines().iter().all(|l| l.count < 100));
}

#[tokio::test]
async fn tcp_cluster_runs_the_scenario() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let accept = tokio::spawn(TcpTransport::accept_workers(listener, 3));

    let retry = RetryPolicy::fixed(20, Duration::from_millis(10));
    let mut worker_tasks = Vec::new();
    for rank in [1usize, 2] {
        let addr = addr.clone();
        let retry = retry.clone();
        worker_tasks.push(tokio::spawn(async move {
            let transport = TcpTransport::connect(&addr, rank, &retry).await?;
            WorkerAggregator::new(2).run(&transport).await
        }));
    }

    let transport = accept.await.unwrap().unwrap();
    let outcome = Coordinator::new(DistributedConfig::new(3, 2))
        .run(&transport, scenario())
        .await
        .unwrap();
    assert_eq!(outcome.report.render(2), SCENARIO_REPORT);

    for task in worker_tasks {
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.buckets(), 1);
    }
}
