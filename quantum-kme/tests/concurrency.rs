//! Concurrent acknowledgements and the background sweep.

use quantum_kme::*;
use std::sync::{Arc, Barrier};
use std::time::Duration;

fn service() -> Arc<KeyService> {
    Arc::new(KeyService::new(
        Arc::new(InMemoryBackend::new()),
        Arc::new(InMemoryAuditSink::new()),
    ))
}

#[test]
fn two_half_capacity_acks_both_succeed() {
    for _ in 0..50 {
        let kme = service();
        let id = kme.request_key(1024 * 8, None).unwrap().key_id;
        let barrier = Barrier::new(2);

        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        kme.acknowledge_usage(&id, 512, None)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(results.iter().all(|r| r.is_ok()));
        let entry = kme.entry(&id).unwrap().unwrap();
        assert_eq!(entry.consumed_bytes, 1024);
        assert_eq!(entry.state, KeyState::Exhausted);
        assert_eq!(results.iter().filter(|r| r.as_ref().unwrap().exhausted).count(), 1);
    }
}

#[test]
fn racing_acks_never_exceed_cap() {
    let kme = service();
    let id = kme.request_key(100 * 8, None).unwrap().key_id;
    let barrier = Barrier::new(8);

    let accepted: usize = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    (0..10)
                        .filter(|_| kme.acknowledge_usage(&id, 3, None).is_ok())
                        .count()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });

    // 100 / 3 = 33 acknowledgements fit; the 34th would overrun.
    assert_eq!(accepted, 33);
    let entry = kme.entry(&id).unwrap().unwrap();
    assert_eq!(entry.consumed_bytes, 99);
    assert_eq!(entry.state, KeyState::Active);
}

#[test]
fn ack_racing_destroy_is_all_or_nothing() {
    for _ in 0..200 {
        let kme = service();
        let id = kme.request_key(64 * 8, None).unwrap().key_id;
        let barrier = Barrier::new(2);

        let ack = std::thread::scope(|s| {
            let ack = s.spawn(|| {
                barrier.wait();
                kme.acknowledge_usage(&id, 32, None)
            });
            s.spawn(|| {
                barrier.wait();
                kme.destroy_key(&id).unwrap();
            });
            ack.join().unwrap()
        });

        let entry = kme.entry(&id).unwrap().unwrap();
        assert_eq!(entry.state, KeyState::Destroyed);
        match ack {
            Ok(receipt) => {
                assert_eq!(receipt.consumed_bytes, 32);
                assert_eq!(entry.consumed_bytes, 32);
            }
            Err(e) => {
                assert!(matches!(e, KmeError::KeyUnavailable { reason: Unavailable::Destroyed, .. }));
                assert_eq!(entry.consumed_bytes, 0);
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acks_on_runtime() {
    let kme = service();
    let id = kme.request_key(64 * 8, None).unwrap().key_id;

    let mut tasks = Vec::new();
    for _ in 0..2 {
        let kme = kme.clone();
        let id = id.clone();
        tasks.push(tokio::spawn(async move { kme.acknowledge_usage(&id, 32, None) }));
    }
    for t in tasks {
        t.await.unwrap().unwrap();
    }
    assert_eq!(kme.entry(&id).unwrap().unwrap().state, KeyState::Exhausted);
}

#[test]
fn concurrent_sweeps_do_not_overshoot() {
    let kme = service();
    let barrier = Barrier::new(4);

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                barrier.wait();
                kme.maintain_pool(7, 64).unwrap();
            });
        }
    });

    assert_eq!(kme.pool_stats().unwrap().key_count, 7);
}

#[tokio::test(start_paused = true)]
async fn background_maintenance_keeps_pool_topped_up() {
    let config = KmeConfig {
        pool_target: 3,
        default_key_bytes: 32,
        maintenance_interval: Duration::from_secs(10),
        ..KmeConfig::default()
    };
    let kme = Arc::new(KeyService::with_config(
        Arc::new(InMemoryBackend::new()),
        Arc::new(InMemoryAuditSink::new()),
        config,
    ));

    let handle = spawn_maintenance(kme.clone());
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(kme.pool_stats().unwrap().key_count, 3);

    // Drain one key; the next tick replaces it.
    let first = kme.entries().unwrap()[0].id.clone();
    kme.destroy_key(&first).unwrap();
    assert_eq!(kme.pool_stats().unwrap().key_count, 2);

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(kme.pool_stats().unwrap().key_count, 3);

    handle.abort();
}
