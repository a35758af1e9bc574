//! End-to-end upload and download against real piece servers on loopback

mod common;

use common::{dripping_node, silent_node, write_sample, TestCluster};
use nebula_client::{
    DownloadMode, Downloader, EventObserver, ProgressTracker, TransferEvent, UploadOutcome,
    Uploader,
};
use nebula_core::{NebulaError, StorageMode, UploadPolicy};
use nebula_network::PieceClient;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const MIB: usize = 1024 * 1024;

fn recorder() -> (EventObserver, Arc<Mutex<Vec<TransferEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let observer: EventObserver =
        Arc::new(move |event: &TransferEvent| sink.lock().push(event.clone()));
    (observer, events)
}

fn partial_path(dest: &std::path::Path) -> std::path::PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".partial");
    name.into()
}

#[tokio::test]
async fn test_replica_survives_down_and_corrupt_copies() {
    let mut cluster = TestCluster::start(3).await;
    let tracker = Arc::new(cluster.tracker(3, 4, 2));
    let dir = tempfile::tempdir().unwrap();
    let (path, data) = write_sample(dir.path(), "small.bin", 1024);

    let uploader = Uploader::new(tracker.clone(), PieceClient::new());
    let report = uploader
        .upload_file(&path, &UploadPolicy::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, UploadOutcome::Replicated { copies: 3 });

    let manifest = tracker.manifest(&report.key).unwrap();
    assert_eq!(manifest.mode, StorageMode::Replica);
    let shard = &manifest.partitions[0].shards[0];
    assert_eq!(shard.node_ids, vec!["node-0", "node-1", "node-2"]);
    assert!(shard.node_ids.contains(&shard.primary_node));
    for node in &cluster.nodes {
        assert_eq!(node.store.bytes_used(), 1024);
    }

    cluster.stop(0).await;
    cluster.nodes[1].corrupt(&report.key);

    let (observer, events) = recorder();
    let dest = dir.path().join("small.out");
    let downloaded = Downloader::new(tracker.clone(), PieceClient::new())
        .with_observer(observer)
        .download_file(&report.key, report.size, &dest, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(downloaded.mode, DownloadMode::Replica);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
    let failed: Vec<_> = events
        .lock()
        .iter()
        .filter_map(|e| match e {
            TransferEvent::ShardFailed { node_id, .. } => Some(node_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(failed, vec!["node-0", "node-1"]);
}

#[tokio::test]
async fn test_replica_upload_is_all_or_nothing() {
    let mut cluster = TestCluster::start(3).await;
    cluster.stop(1).await;
    let tracker = Arc::new(cluster.tracker(3, 4, 2));
    let dir = tempfile::tempdir().unwrap();
    let (path, _) = write_sample(dir.path(), "small.bin", 2000);

    let err = Uploader::new(tracker.clone(), PieceClient::new())
        .upload_file(&path, &UploadPolicy::default(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_shard_local(), "unexpected error: {err}");
    assert!(!err.is_unrecoverable());
    assert_eq!(tracker.commits(), 0);
}

#[tokio::test]
async fn test_erasure_repairs_two_corrupt_shards() {
    let cluster = TestCluster::start(6).await;
    let tracker = Arc::new(cluster.tracker(1, 4, 2));
    let dir = tempfile::tempdir().unwrap();
    let (path, data) = write_sample(dir.path(), "large.bin", 10 * MIB);

    let report = Uploader::new(tracker.clone(), PieceClient::new())
        .upload_file(&path, &UploadPolicy::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        report.outcome,
        UploadOutcome::ErasureCoded {
            partitions: 1,
            shards: 6
        }
    );

    let manifest = tracker.manifest(&report.key).unwrap();
    assert_eq!((manifest.data_shards, manifest.parity_shards), (4, 2));
    let shards = &manifest.partitions[0].shards;
    assert_eq!(shards.len(), 6);
    assert_eq!(shards.iter().filter(|s| s.is_data).count(), 4);

    // One data shard and one parity shard
    for shard in [&shards[1], &shards[4]] {
        cluster.node(&shard.primary_node).corrupt(&shard.hash);
    }

    let (observer, events) = recorder();
    let dest = dir.path().join("large.out");
    let downloaded = Downloader::new(tracker.clone(), PieceClient::new())
        .with_observer(observer)
        .download_file(&report.key, report.size, &dest, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(downloaded.mode, DownloadMode::Erasure);
    assert_eq!(downloaded.shards_repaired, 2);
    assert!(std::fs::read(&dest).unwrap() == data);
    let failed = events
        .lock()
        .iter()
        .filter(|e| matches!(e, TransferEvent::ShardFailed { .. }))
        .count();
    assert_eq!(failed, 2);
}

#[tokio::test]
async fn test_three_lost_shards_is_unrecoverable() {
    let mut cluster = TestCluster::start(6).await;
    let tracker = Arc::new(cluster.tracker(1, 4, 2));
    let dir = tempfile::tempdir().unwrap();
    let (path, _) = write_sample(dir.path(), "data.bin", MIB);

    let report = Uploader::new(tracker.clone(), PieceClient::new())
        .upload_file(&path, &UploadPolicy::default(), &CancellationToken::new())
        .await
        .unwrap();

    for i in 0..3 {
        cluster.stop(i).await;
    }

    let dest = dir.path().join("data.out");
    let err = Downloader::new(tracker.clone(), PieceClient::new())
        .download_file(&report.key, report.size, &dest, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        NebulaError::InsufficientShards {
            available: 3,
            required: 4
        }
    ));
    assert!(err.is_unrecoverable());
    assert!(!dest.exists());
    assert!(!partial_path(&dest).exists());
}

#[tokio::test]
async fn test_large_file_spans_partitions() {
    let cluster = TestCluster::start(6).await;
    let tracker = Arc::new(cluster.tracker(1, 4, 2));
    let dir = tempfile::tempdir().unwrap();
    let size = 5 * MIB / 2;
    let (path, data) = write_sample(dir.path(), "big.bin", size);
    let policy = UploadPolicy {
        max_partition_size: MIB as u64,
        ..UploadPolicy::default()
    };

    let (observer, upload_events) = recorder();
    let report = Uploader::new(tracker.clone(), PieceClient::new())
        .with_observer(observer)
        .upload_file(&path, &policy, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        report.outcome,
        UploadOutcome::ErasureCoded {
            partitions: 3,
            shards: 18
        }
    );

    let manifest = tracker.manifest(&report.key).unwrap();
    let sizes: Vec<u64> = manifest.partitions.iter().map(|p| p.size).collect();
    assert_eq!(sizes, vec![873_813, 873_813, 873_814]);
    assert_eq!(sizes.iter().sum::<u64>(), size as u64);
    assert_eq!(
        *upload_events.lock(),
        (0..3)
            .map(|index| TransferEvent::PartitionCompleted { index, total: 3 })
            .collect::<Vec<_>>()
    );

    let dest = dir.path().join("big.out");
    let downloaded = Downloader::new(tracker.clone(), PieceClient::new())
        .download_file(&report.key, report.size, &dest, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(downloaded.partitions, 3);
    assert_eq!(downloaded.shards_repaired, 0);
    assert!(std::fs::read(&dest).unwrap() == data);
}

#[tokio::test]
async fn test_download_cancelled_after_first_partition() {
    let cluster = TestCluster::start(6).await;
    let tracker = Arc::new(cluster.tracker(1, 4, 2));
    let dir = tempfile::tempdir().unwrap();
    let (path, _) = write_sample(dir.path(), "big.bin", 5 * MIB / 2);
    let policy = UploadPolicy {
        max_partition_size: MIB as u64,
        ..UploadPolicy::default()
    };

    let report = Uploader::new(tracker.clone(), PieceClient::new())
        .upload_file(&path, &policy, &CancellationToken::new())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let observer: EventObserver = Arc::new(move |event: &TransferEvent| {
        if let TransferEvent::PartitionCompleted { index: 0, .. } = event {
            trigger.cancel();
        }
    });

    let dest = dir.path().join("big.out");
    let err = Downloader::new(tracker.clone(), PieceClient::new())
        .with_observer(observer)
        .download_file(&report.key, report.size, &dest, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, NebulaError::Cancelled));
    assert!(!dest.exists());
    assert!(!partial_path(&dest).exists());
}

#[tokio::test]
async fn test_second_upload_is_already_stored() {
    let cluster = TestCluster::start(6).await;
    let tracker = Arc::new(cluster.tracker(1, 4, 2));
    let dir = tempfile::tempdir().unwrap();
    let (path, _) = write_sample(dir.path(), "twice.bin", 64 * 1024);

    let uploader = Uploader::new(tracker.clone(), PieceClient::new());
    let policy = UploadPolicy::default();
    uploader
        .upload_file(&path, &policy, &CancellationToken::new())
        .await
        .unwrap();
    let again = uploader
        .upload_file(&path, &policy, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(again.outcome, UploadOutcome::AlreadyStored);
    assert_eq!(tracker.commits(), 1);
}

#[tokio::test]
async fn test_tiny_file_stored_inline() {
    let cluster = TestCluster::start(3).await;
    let tracker = Arc::new(cluster.tracker(3, 4, 2).keeping_inline());
    let dir = tempfile::tempdir().unwrap();
    let (path, data) = write_sample(dir.path(), "tiny.txt", 100);

    let report = Uploader::new(tracker.clone(), PieceClient::new())
        .upload_file(&path, &UploadPolicy::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, UploadOutcome::StoredInline);
    assert!(cluster.nodes.iter().all(|n| n.store.bytes_used() == 0));

    let dest = dir.path().join("tiny.out");
    let downloaded = Downloader::new(tracker.clone(), PieceClient::new())
        .download_file(&report.key, report.size, &dest, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(downloaded.mode, DownloadMode::Inline);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
}

#[tokio::test]
async fn test_cancelled_upload_commits_nothing() {
    let cluster = TestCluster::start(6).await;
    let tracker = Arc::new(cluster.tracker(1, 4, 2));
    let dir = tempfile::tempdir().unwrap();
    let (path, _) = write_sample(dir.path(), "data.bin", 256 * 1024);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let progress = ProgressTracker::new();
    let err = Uploader::new(tracker.clone(), PieceClient::new())
        .with_progress(progress.clone())
        .upload_file(&path, &UploadPolicy::default(), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, NebulaError::Cancelled));
    assert_eq!(tracker.commits(), 0);
    assert!(progress.is_empty());
}

#[tokio::test]
async fn test_progress_reaches_completion() {
    let cluster = TestCluster::start(6).await;
    let tracker = Arc::new(cluster.tracker(1, 4, 2));
    let dir = tempfile::tempdir().unwrap();
    let (path, _) = write_sample(dir.path(), "tracked.bin", 3 * MIB);
    let key = path.display().to_string();

    let progress = ProgressTracker::new().retaining_finished(1);
    Uploader::new(tracker.clone(), PieceClient::new())
        .with_concurrency(2)
        .with_progress(progress.clone())
        .upload_file(&path, &UploadPolicy::default(), &CancellationToken::new())
        .await
        .unwrap();

    let ratios = progress.progress(&[key.clone()]);
    assert_eq!(ratios[&key], 1.0);
}

#[tokio::test]
async fn test_finished_transfers_leave_progress_empty() {
    let cluster = TestCluster::start(6).await;
    let tracker = Arc::new(cluster.tracker(3, 4, 2));
    let dir = tempfile::tempdir().unwrap();
    let progress = ProgressTracker::new();

    let uploader =
        Uploader::new(tracker.clone(), PieceClient::new()).with_progress(progress.clone());
    let downloader =
        Downloader::new(tracker.clone(), PieceClient::new()).with_progress(progress.clone());
    let dest = dir.path().join("out");

    let mut reports = Vec::new();
    for (name, len) in [("small.bin", 1024), ("large.bin", 300 * 1024)] {
        let (path, _) = write_sample(dir.path(), name, len);
        let report = uploader
            .upload_file(&path, &UploadPolicy::default(), &CancellationToken::new())
            .await
            .unwrap();
        downloader
            .download_file(&report.key, report.size, &dest, &CancellationToken::new())
            .await
            .unwrap();
        reports.push(report);
    }
    assert!(progress.is_empty());

    // A destination that cannot be created leaves nothing behind either
    let bad_dest = dir.path().join("missing-dir").join("out");
    let report = &reports[0];
    downloader
        .download_file(&report.key, report.size, &bad_dest, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(progress.is_empty());
}

#[tokio::test]
async fn test_dripping_replica_times_out_and_next_copy_serves() {
    let cluster = TestCluster::start(3).await;
    let tracker = Arc::new(cluster.tracker(3, 4, 2));
    let dir = tempfile::tempdir().unwrap();
    let (path, data) = write_sample(dir.path(), "small.bin", 1024);

    let report = Uploader::new(tracker.clone(), PieceClient::new())
        .upload_file(&path, &UploadPolicy::default(), &CancellationToken::new())
        .await
        .unwrap();

    // One byte every 20 ms: each frame is well inside the I/O timeout
    tracker.reroute("node-0", &dripping_node(Duration::from_millis(20)).await);

    let (observer, events) = recorder();
    let dest = dir.path().join("small.out");
    let started = Instant::now();
    let downloaded = Downloader::new(tracker.clone(), PieceClient::new())
        .with_operation_timeout(Duration::from_millis(300))
        .with_observer(observer)
        .download_file(&report.key, report.size, &dest, &CancellationToken::new())
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(downloaded.mode, DownloadMode::Replica);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
    let failed: Vec<_> = events
        .lock()
        .iter()
        .filter_map(|e| match e {
            TransferEvent::ShardFailed { node_id, error, .. } => {
                Some((node_id.clone(), error.clone()))
            }
            _ => None,
        })
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, "node-0");
    assert!(failed[0].1.contains("timeout"), "unexpected error: {}", failed[0].1);
}

#[tokio::test]
async fn test_silent_node_fails_upload_after_operation_timeout() {
    let cluster = TestCluster::start(6).await;
    let tracker = Arc::new(cluster.tracker(1, 4, 2));
    let dir = tempfile::tempdir().unwrap();
    let (path, _) = write_sample(dir.path(), "data.bin", 256 * 1024);
    let silent = silent_node().await;
    tracker.reroute("node-3", &silent.endpoint);

    let started = Instant::now();
    let err = Uploader::new(tracker.clone(), PieceClient::new())
        .with_operation_timeout(Duration::from_millis(300))
        .upload_file(&path, &UploadPolicy::default(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(err, NebulaError::ConnectionTimeout { .. }), "unexpected error: {err}");
    assert!(err.is_shard_local());
    assert_eq!(tracker.commits(), 0);
}

#[tokio::test]
async fn test_cancel_during_shard_transfer() {
    let cluster = TestCluster::start(6).await;
    let tracker = Arc::new(cluster.tracker(1, 4, 2));
    let dir = tempfile::tempdir().unwrap();
    let (path, _) = write_sample(dir.path(), "data.bin", 256 * 1024);
    let silent = silent_node().await;
    tracker.reroute("node-2", &silent.endpoint);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let progress = ProgressTracker::new();
    let uploader =
        Uploader::new(tracker.clone(), PieceClient::new()).with_progress(progress.clone());

    let policy = UploadPolicy::default();
    let started = Instant::now();
    let (result, cancelled_at) = tokio::join!(
        uploader.upload_file(&path, &policy, &cancel),
        async move {
            // The silent node only hears from us once placement is under way
            silent.connected.notified().await;
            trigger.cancel();
            Instant::now()
        }
    );

    let err = result.unwrap_err();
    assert!(matches!(err, NebulaError::Cancelled), "unexpected error: {err}");
    assert!(cancelled_at.elapsed() < Duration::from_secs(2));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(tracker.commits(), 0);
    assert!(progress.is_empty());
}
