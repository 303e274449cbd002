//! Stream fan-out delivery tests
//!
//! Real TCP receivers subscribe to the fan-out and collect every package
//! pushed to them. Subscriber mutations apply on a 2.5 s cadence and
//! bursts go out every 250 ms, so these tests take a few seconds of wall
//! clock by design.

mod helpers;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use monolith::StreamPackage;
use monolith::services::stream::StreamFanout;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

use helpers::test_reading;

/// Accept connections forever, parsing each payload as one stream package
async fn spawn_receiver() -> (u16, Arc<Mutex<Vec<StreamPackage>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let packages: Arc<Mutex<Vec<StreamPackage>>> = Arc::new(Mutex::new(Vec::new()));

    let collected = packages.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let collected = collected.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                if socket.read_to_end(&mut buf).await.is_ok() {
                    if let Ok(package) = serde_json::from_slice::<StreamPackage>(&buf) {
                        collected.lock().unwrap().push(package);
                    }
                }
            });
        }
    });

    (port, packages)
}

fn received_readings(packages: &Arc<Mutex<Vec<StreamPackage>>>) -> usize {
    packages
        .lock()
        .unwrap()
        .iter()
        .map(|p| p.readings.len())
        .sum()
}

#[tokio::test]
async fn test_two_subscribers_receive_identical_packages() {
    let fanout = StreamFanout::new();
    fanout.start();

    let (port_a, packages_a) = spawn_receiver().await;
    let (port_b, packages_b) = spawn_receiver().await;

    fanout.add_destination("127.0.0.1", port_a);
    fanout.add_destination("127.0.0.1", port_b);

    // Wait out the destination-update cadence so both subscribers are live
    tokio::time::sleep(Duration::from_millis(3000)).await;

    for ts in 0..150 {
        assert!(fanout.submit(test_reading(ts, "n1", "n1:s", ts as f64)));
    }

    // 150 readings at 100 per burst need at least two bursts
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while received_readings(&packages_a) < 150 || received_readings(&packages_b) < 150 {
        if tokio::time::Instant::now() > deadline {
            panic!(
                "receivers incomplete: a={} b={}",
                received_readings(&packages_a),
                received_readings(&packages_b)
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    fanout.stop().await;

    let packages_a = packages_a.lock().unwrap().clone();
    let packages_b = packages_b.lock().unwrap().clone();

    // Every reading arrived, split across at least two packages
    assert!(packages_a.len() >= 2);
    assert!(packages_b.len() >= 2);
    assert_eq!(packages_a.iter().map(|p| p.readings.len()).sum::<usize>(), 150);
    assert_eq!(packages_b.iter().map(|p| p.readings.len()).sum::<usize>(), 150);

    // Identical sequence numbers across subscribers
    let mut sequences_a: Vec<u64> = packages_a.iter().map(|p| p.sequence).collect();
    let mut sequences_b: Vec<u64> = packages_b.iter().map(|p| p.sequence).collect();
    sequences_a.sort_unstable();
    sequences_b.sort_unstable();
    assert_eq!(sequences_a, sequences_b);

    // Sequences form a contiguous strictly increasing series from the first
    // package after start
    for pair in sequences_a.windows(2) {
        assert_eq!(pair[1], pair[0] + 1);
    }
    assert_eq!(sequences_a[0], 0);

    // Submission order is preserved within and across packages
    let mut ordered_a = packages_a.clone();
    ordered_a.sort_by_key(|p| p.sequence);
    let timestamps: Vec<i64> = ordered_a
        .iter()
        .flat_map(|p| p.readings.iter().map(|r| r.ts))
        .collect();
    let expected: Vec<i64> = (0..150).collect();
    assert_eq!(timestamps, expected);
}

#[tokio::test]
async fn test_removed_subscriber_stops_receiving() {
    let fanout = StreamFanout::new();
    fanout.start();

    let (port, packages) = spawn_receiver().await;
    fanout.add_destination("127.0.0.1", port);
    tokio::time::sleep(Duration::from_millis(3000)).await;

    assert!(fanout.submit(test_reading(1, "n1", "n1:s", 1.0)));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while received_readings(&packages) < 1 {
        assert!(tokio::time::Instant::now() < deadline, "first reading never arrived");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    fanout.remove_destination("127.0.0.1", port);
    tokio::time::sleep(Duration::from_millis(3000)).await;

    assert!(fanout.submit(test_reading(2, "n1", "n1:s", 2.0)));
    tokio::time::sleep(Duration::from_millis(1000)).await;

    // Queue drains only when a subscriber exists; after removal nothing
    // further arrives at the old endpoint
    assert_eq!(received_readings(&packages), 1);

    fanout.stop().await;
}
