//! End-to-end scenarios from `spec.md` §8 (S1-S6), exercised against the
//! full [`ShuffleWorkerExtension`] surface over an in-process fake
//! scheduler and peer mesh.

mod support;

use shuffle::bridge::Bridge;
use shuffle::error::Error;
use shuffle::extension::ShuffleWorkerExtension;
use shuffle::table::{SimpleSchema, SimpleTable};
use shuffle::{InputPartitionId, OutputPartitionId, RunId, ShuffleId, WorkerAddress};
use std::collections::BTreeMap;
use std::sync::Arc;
use support::{MeshPeer, MeshScheduler, Registry};
use tempfile::TempDir;

fn two_worker_mesh(
    run_id: u64,
) -> (
    TempDir,
    Arc<Registry>,
    Arc<MeshScheduler>,
    Arc<MeshPeer>,
    Arc<ShuffleWorkerExtension<SimpleTable>>,
    Arc<ShuffleWorkerExtension<SimpleTable>>,
) {
    let dir = TempDir::new().unwrap();
    let mut worker_for = BTreeMap::new();
    worker_for.insert(OutputPartitionId(0), WorkerAddress::from("A"));
    worker_for.insert(OutputPartitionId(1), WorkerAddress::from("B"));

    let registry = Registry::new();
    let scheduler = Arc::new(MeshScheduler::new(run_id, worker_for, registry.clone()));
    let peer = Arc::new(MeshPeer::new(registry.clone()));

    let a = Arc::new(ShuffleWorkerExtension::<SimpleTable>::new(
        WorkerAddress::from("A"),
        scheduler.clone(),
        peer.clone(),
        dir.path().join("a"),
    ));
    let b = Arc::new(ShuffleWorkerExtension::<SimpleTable>::new(
        WorkerAddress::from("B"),
        scheduler.clone(),
        peer.clone(),
        dir.path().join("b"),
    ));
    registry.insert("A", a.clone());
    registry.insert("B", b.clone());

    (dir, registry, scheduler, peer, a, b)
}

/// S1: two workers, balanced. Hash(k) = k mod 2. A.get(p0) must equal the
/// multiset of rows whose key hashed to 0; B.get(p1) likewise for 1.
#[test]
fn s1_two_workers_balanced() {
    let (_dir, _registry, _scheduler, _peer, a, b) = two_worker_mesh(1);
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();
    let bridge = Bridge::new(rt.handle().clone());
    let shuffle_id = ShuffleId::from("s1");

    let (ta, tb) = {
        let (a, bridge, shuffle_id) = (a.clone(), bridge.clone(), shuffle_id.clone());
        let ta = std::thread::spawn(move || {
            a.add_partition_blocking(
                &bridge,
                &shuffle_id,
                SimpleTable::new(vec![
                    (0, "a".to_string()),
                    (1, "b".to_string()),
                    (0, "c".to_string()),
                    (1, "d".to_string()),
                ]),
                InputPartitionId(0),
                SimpleSchema::default(),
                "k".to_string(),
                2,
            )
            .unwrap()
        });

        let (b, bridge, shuffle_id) = (b.clone(), bridge.clone(), shuffle_id.clone());
        let tb = std::thread::spawn(move || {
            b.add_partition_blocking(
                &bridge,
                &shuffle_id,
                SimpleTable::new(vec![(0, "e".to_string()), (1, "f".to_string())]),
                InputPartitionId(1),
                SimpleSchema::default(),
                "k".to_string(),
                2,
            )
            .unwrap()
        });
        (ta, tb)
    };

    let run_a = ta.join().unwrap();
    let run_b = tb.join().unwrap();
    assert_eq!(run_a, run_b, "every input partition must use the same run");

    // The single distinguished barrier task calls barrier once; the
    // MeshScheduler fans shuffle_inputs_done out to both A and B.
    {
        let (a, bridge, shuffle_id) = (a.clone(), bridge.clone(), shuffle_id.clone());
        std::thread::spawn(move || a.barrier_blocking(&bridge, &shuffle_id, &[run_a]).unwrap())
            .join()
            .unwrap();
    }

    let p0 = {
        let (a, bridge, shuffle_id) = (a.clone(), bridge.clone(), shuffle_id.clone());
        std::thread::spawn(move || {
            a.get_output_partition_blocking(&bridge, &shuffle_id, run_a, OutputPartitionId(0))
                .unwrap()
        })
        .join()
        .unwrap()
    };
    let mut got: Vec<String> = p0.rows.iter().map(|(_, v)| v.clone()).collect();
    got.sort();
    assert_eq!(got, vec!["a".to_string(), "c".to_string(), "e".to_string()]);

    let p1 = {
        let (b, bridge, shuffle_id) = (b.clone(), bridge.clone(), shuffle_id.clone());
        std::thread::spawn(move || {
            b.get_output_partition_blocking(&bridge, &shuffle_id, run_b, OutputPartitionId(1))
                .unwrap()
        })
        .join()
        .unwrap()
    };
    let mut got: Vec<String> = p1.rows.iter().map(|(_, v)| v.clone()).collect();
    got.sort();
    assert_eq!(got, vec!["b".to_string(), "d".to_string(), "f".to_string()]);

    rt.block_on(async {
        a.close().await;
        b.close().await;
    });
}

/// S2: empty output. One input partition with every row hashing to p0;
/// B.get(p1) returns an empty table of the declared schema, not an error.
#[test]
fn s2_empty_output_partition() {
    let (_dir, _registry, _scheduler, _peer, a, b) = two_worker_mesh(1);
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();
    let bridge = Bridge::new(rt.handle().clone());
    let shuffle_id = ShuffleId::from("s2");

    let run_a = {
        let (a, bridge, shuffle_id) = (a.clone(), bridge.clone(), shuffle_id.clone());
        std::thread::spawn(move || {
            a.add_partition_blocking(
                &bridge,
                &shuffle_id,
                SimpleTable::new(vec![(0, "x".to_string()), (0, "y".to_string())]),
                InputPartitionId(0),
                SimpleSchema::default(),
                "k".to_string(),
                2,
            )
            .unwrap()
        })
        .join()
        .unwrap()
    };

    {
        let (a, bridge, shuffle_id) = (a.clone(), bridge.clone(), shuffle_id.clone());
        std::thread::spawn(move || a.barrier_blocking(&bridge, &shuffle_id, &[run_a]).unwrap())
            .join()
            .unwrap();
    }

    let p1 = {
        let (b, bridge, shuffle_id) = (b.clone(), bridge.clone(), shuffle_id.clone());
        std::thread::spawn(move || {
            b.get_output_partition_blocking(&bridge, &shuffle_id, run_a, OutputPartitionId(1))
                .unwrap()
        })
        .join()
        .unwrap()
    };
    assert!(p1.rows.is_empty());
    assert_eq!(p1.schema, SimpleSchema::default());

    rt.block_on(async {
        a.close().await;
        b.close().await;
    });
}

/// S3: duplicate receive. Delivering the same (input_partition, bytes)
/// twice is a no-op on the second delivery: `total_recvd` counts one
/// delivery and on-disk content is unchanged.
#[tokio::test]
async fn s3_duplicate_receive_is_idempotent() {
    let (_dir, _registry, _scheduler, _peer, _a, b) = two_worker_mesh(1);
    let shuffle_id = ShuffleId::from("s3");

    let run = b
        .get_or_create_shuffle(&shuffle_id, SimpleSchema::default(), "k".to_string(), 2)
        .await
        .unwrap();

    let shard = shuffle::types::Shard {
        input_partition: InputPartitionId(7),
        bytes: SimpleTable::new(vec![(1, "x".to_string())]).to_bytes(),
    };
    b.shuffle_receive(&shuffle_id, run.run_id(), vec![shard.clone()])
        .await
        .unwrap();
    b.shuffle_receive(&shuffle_id, run.run_id(), vec![shard.clone()])
        .await
        .unwrap();

    assert_eq!(run.total_received_bytes(), shard.bytes.len() as u64);

    run.inputs_done().await.unwrap();
    let out = run.get_output_partition(OutputPartitionId(1)).await.unwrap();
    assert_eq!(out.rows.len(), 1);

    b.close().await;
}

/// S4: barrier ordering. `add_partition` after `inputs_done` fails with
/// BarrierOrderingViolation, and the run remains usable for
/// `get_output_partition`.
#[test]
fn s4_add_partition_after_inputs_done_fails_ordering() {
    let (_dir, _registry, _scheduler, _peer, a, _b) = two_worker_mesh(1);
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let bridge = Bridge::new(rt.handle().clone());
    let shuffle_id = ShuffleId::from("s4");

    let run_a = {
        let (a, bridge, shuffle_id) = (a.clone(), bridge.clone(), shuffle_id.clone());
        std::thread::spawn(move || {
            a.add_partition_blocking(
                &bridge,
                &shuffle_id,
                SimpleTable::new(vec![(0, "z".to_string())]),
                InputPartitionId(0),
                SimpleSchema::default(),
                "k".to_string(),
                2,
            )
            .unwrap()
        })
        .join()
        .unwrap()
    };

    {
        let (a, bridge, shuffle_id) = (a.clone(), bridge.clone(), shuffle_id.clone());
        std::thread::spawn(move || a.barrier_blocking(&bridge, &shuffle_id, &[run_a]).unwrap())
            .join()
            .unwrap();
    }

    let err = {
        let (a, bridge, shuffle_id) = (a.clone(), bridge.clone(), shuffle_id.clone());
        std::thread::spawn(move || {
            a.add_partition_blocking(
                &bridge,
                &shuffle_id,
                SimpleTable::new(vec![(0, "late".to_string())]),
                InputPartitionId(9),
                SimpleSchema::default(),
                "k".to_string(),
                2,
            )
        })
        .join()
        .unwrap()
        .unwrap_err()
    };
    assert!(matches!(err, Error::BarrierOrderingViolation { .. }));

    let p0 = {
        let (a, bridge, shuffle_id) = (a.clone(), bridge.clone(), shuffle_id.clone());
        std::thread::spawn(move || {
            a.get_output_partition_blocking(&bridge, &shuffle_id, run_a, OutputPartitionId(0))
                .unwrap()
        })
        .join()
        .unwrap()
    };
    assert_eq!(p0.rows, vec![(0, "z".to_string())]);

    rt.block_on(a.close());
}

/// S5: stale run. A local run_id of 3 rejects a peer's `shuffle_receive`
/// carrying run_id 2; the same peer with run_id 4 triggers a refresh and
/// the local run_id becomes 4.
#[tokio::test]
async fn s5_stale_and_newer_run_id() {
    let (_dir, _registry, scheduler, _peer, _a, b) = two_worker_mesh(3);
    let shuffle_id = ShuffleId::from("s5");

    let run = b
        .get_or_create_shuffle(&shuffle_id, SimpleSchema::default(), "k".to_string(), 2)
        .await
        .unwrap();
    assert_eq!(run.run_id(), RunId(3));

    let err = b
        .shuffle_receive(&shuffle_id, RunId(2), vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StaleShuffle { .. }));

    scheduler.run_id.store(4, std::sync::atomic::Ordering::SeqCst);
    b.shuffle_receive(&shuffle_id, RunId(4), vec![])
        .await
        .unwrap();

    let refreshed = b.get_shuffle_run(&shuffle_id, RunId(4)).await.unwrap();
    assert_eq!(refreshed.run_id(), RunId(4));

    b.close().await;
}

/// S6: peer RPC failure. The sink for destination W fails once; the run
/// transitions to poisoned so a later `add_partition` raises `PeerFailed`;
/// `close` still succeeds and cleans up the scratch directory.
#[tokio::test]
async fn s6_peer_rpc_failure_poisons_run_but_close_still_succeeds() {
    let (dir, _registry, _scheduler, peer, a, _b) = two_worker_mesh(1);
    let shuffle_id = ShuffleId::from("s6");

    peer.fail_next_delivery_to("B");

    let run = a
        .get_or_create_shuffle(&shuffle_id, SimpleSchema::default(), "k".to_string(), 2)
        .await
        .unwrap();
    run.add_partition(
        SimpleTable::new(vec![(1, "z".to_string())]),
        InputPartitionId(0),
    )
    .await
    .unwrap();

    // inputs_done awaits the comm flush, which is where the poisoned
    // delivery to B actually surfaces, latching PeerFailed into the run.
    let err = a
        .shuffle_inputs_done(&shuffle_id, run.run_id())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PeerFailed { .. }));

    let err = run
        .add_partition(
            SimpleTable::new(vec![(1, "y".to_string())]),
            InputPartitionId(10),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PeerFailed { .. }));

    let scratch_dir = dir
        .path()
        .join("a")
        .join(format!("shuffle-{}-{}", shuffle_id, run.run_id()));
    assert!(scratch_dir.exists(), "scratch dir should exist before close");

    a.close().await;
    assert!(
        !scratch_dir.exists(),
        "close must recursively delete the run's scratch directory"
    );
}
