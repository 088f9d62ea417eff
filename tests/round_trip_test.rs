//! End-to-end publish/fetch round trips over the in-memory substrate.

mod common;

use std::time::Duration;

use common::{assert_trees_equal, engine_with, publish_pipeline, write_tree};
use usenetsync::publish::{AccessParams, TierParams};
use usenetsync::types::{SegmentOwner, SessionStatus};

/// PUBLIC tier round trip with the production segment geometry: a small
/// packed file plus a large file split across two stream segments.
#[tokio::test]
async fn test_public_round_trip() {
    let env = engine_with(786432, 50000, 1).await;
    let files: Vec<(&str, Vec<u8>)> = vec![
        ("a.txt", b"hello".to_vec()),
        ("sub/b.bin", vec![0x41u8; 1_500_000]),
    ];
    write_tree(env.data_dir.path(), &files);

    env.engine.initialize_user("operator").await.unwrap();
    let folder_id = env
        .engine
        .add_folder(env.data_dir.path().to_str().unwrap())
        .await
        .unwrap();

    let version = env.engine.index_folder(&folder_id).await.unwrap();
    assert_eq!(version, 1);

    {
        let mut tx = env.engine.store().begin().await.unwrap();
        let entries = tx.current_files(&folder_id).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].relative_path, "a.txt");
        assert_eq!(entries[0].size, 5);
        assert_eq!(entries[1].relative_path, "sub/b.bin");
        assert_eq!(entries[1].size, 1_500_000);
        tx.rollback().await.unwrap();
    }

    let segment_rows = env.engine.segment_folder(&folder_id).await.unwrap();
    assert_eq!(segment_rows, 3);

    {
        let mut tx = env.engine.store().begin().await.unwrap();
        let segments = tx
            .segments_for_folder_version(&folder_id, 1)
            .await
            .unwrap();
        let mut stream_lengths: Vec<u64> = segments
            .iter()
            .filter(|s| matches!(s.owner, SegmentOwner::File(_)))
            .map(|s| s.length)
            .collect();
        stream_lengths.sort_unstable();
        assert_eq!(stream_lengths, vec![713568, 786432]);
        assert_eq!(
            segments
                .iter()
                .filter(|s| matches!(s.owner, SegmentOwner::Pack(_)))
                .count(),
            1
        );
        tx.rollback().await.unwrap();
    }

    let session = env.engine.upload_folder(&folder_id).await.unwrap();
    let progress = env
        .engine
        .wait_for_session(&session, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(progress.status, SessionStatus::Completed);
    assert_eq!(progress.completed_count, 3);
    assert_eq!(env.transport.article_count(), 3);
    common::wait_for_folder_status(&env, &folder_id, usenetsync::types::FolderStatus::Uploaded)
        .await;

    let published = env
        .engine
        .publish_folder(&folder_id, TierParams::Public, None)
        .await
        .unwrap();
    assert_eq!(published.share_id.len(), 24);
    let access_string = published.access_string.expect("public share has one");

    let download = env
        .engine
        .fetch_share(
            &published.share_id,
            AccessParams::Public {
                access_string: access_string.clone(),
            },
            env.dest_dir.path().to_str().unwrap(),
        )
        .await
        .unwrap();
    let progress = env
        .engine
        .wait_for_session(&download, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(progress.status, SessionStatus::Completed);

    assert_trees_equal(env.data_dir.path(), env.dest_dir.path(), &files);
}

/// Zero-byte files reconstruct empty; empty directories are recreated.
#[tokio::test]
async fn test_empty_file_and_empty_directory() {
    let env = engine_with(1000, 100, 1).await;
    write_tree(env.data_dir.path(), &[("empty.bin", Vec::new())]);
    std::fs::create_dir(env.data_dir.path().join("hollow")).unwrap();

    env.engine.initialize_user("operator").await.unwrap();
    let folder_id = env
        .engine
        .add_folder(env.data_dir.path().to_str().unwrap())
        .await
        .unwrap();
    publish_pipeline(&env, &folder_id).await;

    // A zero-byte file produces no segments.
    {
        let mut tx = env.engine.store().begin().await.unwrap();
        assert!(tx
            .segments_for_folder_version(&folder_id, 1)
            .await
            .unwrap()
            .is_empty());
        tx.rollback().await.unwrap();
    }

    let published = env
        .engine
        .publish_folder(&folder_id, TierParams::Public, None)
        .await
        .unwrap();
    let download = env
        .engine
        .fetch_share(
            &published.share_id,
            AccessParams::Public {
                access_string: published.access_string.unwrap(),
            },
            env.dest_dir.path().to_str().unwrap(),
        )
        .await
        .unwrap();
    let progress = env
        .engine
        .wait_for_session(&download, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(progress.status, SessionStatus::Completed);

    let empty = std::fs::read(env.dest_dir.path().join("empty.bin")).unwrap();
    assert!(empty.is_empty());
    assert!(env.dest_dir.path().join("hollow").is_dir());
}

/// A file of exactly the segment size yields one segment; one byte more
/// yields two whose lengths sum correctly. Both round-trip.
#[tokio::test]
async fn test_segment_size_boundaries() {
    let env = engine_with(1000, 100, 1).await;
    let files: Vec<(&str, Vec<u8>)> = vec![
        ("exact.bin", vec![7u8; 1000]),
        ("plus.bin", vec![8u8; 1001]),
    ];
    write_tree(env.data_dir.path(), &files);

    env.engine.initialize_user("operator").await.unwrap();
    let folder_id = env
        .engine
        .add_folder(env.data_dir.path().to_str().unwrap())
        .await
        .unwrap();
    publish_pipeline(&env, &folder_id).await;

    {
        let mut tx = env.engine.store().begin().await.unwrap();
        let segments = tx
            .segments_for_folder_version(&folder_id, 1)
            .await
            .unwrap();
        assert_eq!(segments.len(), 3);
        let mut lengths: Vec<u64> = segments.iter().map(|s| s.length).collect();
        lengths.sort_unstable();
        assert_eq!(lengths, vec![1, 1000, 1000]);
        tx.rollback().await.unwrap();
    }

    let published = env
        .engine
        .publish_folder(&folder_id, TierParams::Public, None)
        .await
        .unwrap();
    let download = env
        .engine
        .fetch_share(
            &published.share_id,
            AccessParams::Public {
                access_string: published.access_string.unwrap(),
            },
            env.dest_dir.path().to_str().unwrap(),
        )
        .await
        .unwrap();
    let progress = env
        .engine
        .wait_for_session(&download, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(progress.status, SessionStatus::Completed);
    assert_trees_equal(env.data_dir.path(), env.dest_dir.path(), &files);
}

/// Packing boundary: members totaling exactly the segment size share one
/// pack; one extra byte forces a second pack.
#[tokio::test]
async fn test_pack_capacity_boundary() {
    let env = engine_with(1000, 700, 1).await;
    write_tree(
        env.data_dir.path(),
        &[("a.bin", vec![1u8; 600]), ("b.bin", vec![2u8; 400])],
    );
    env.engine.initialize_user("operator").await.unwrap();
    let folder_id = env
        .engine
        .add_folder(env.data_dir.path().to_str().unwrap())
        .await
        .unwrap();
    env.engine.index_folder(&folder_id).await.unwrap();
    env.engine.segment_folder(&folder_id).await.unwrap();

    let pack_count = |segments: &[usenetsync::types::Segment]| {
        segments
            .iter()
            .filter_map(|s| match &s.owner {
                SegmentOwner::Pack(id) => Some(id.clone()),
                SegmentOwner::File(_) => None,
            })
            .collect::<std::collections::HashSet<_>>()
            .len()
    };

    {
        let mut tx = env.engine.store().begin().await.unwrap();
        let segments = tx
            .segments_for_folder_version(&folder_id, 1)
            .await
            .unwrap();
        assert_eq!(pack_count(&segments), 1);
        tx.rollback().await.unwrap();
    }

    // A sibling folder where the members no longer fit together.
    let env2 = engine_with(1000, 700, 1).await;
    write_tree(
        env2.data_dir.path(),
        &[("a.bin", vec![1u8; 600]), ("b.bin", vec![2u8; 401])],
    );
    env2.engine.initialize_user("operator").await.unwrap();
    let folder2 = env2
        .engine
        .add_folder(env2.data_dir.path().to_str().unwrap())
        .await
        .unwrap();
    env2.engine.index_folder(&folder2).await.unwrap();
    env2.engine.segment_folder(&folder2).await.unwrap();

    {
        let mut tx = env2.engine.store().begin().await.unwrap();
        let segments = tx.segments_for_folder_version(&folder2, 1).await.unwrap();
        assert_eq!(pack_count(&segments), 2);
        tx.rollback().await.unwrap();
    }
}

/// Indexing an unchanged tree is a complete no-op: same version, same
/// rows, nothing staged.
#[tokio::test]
async fn test_idempotent_index() {
    let env = engine_with(1000, 100, 1).await;
    write_tree(env.data_dir.path(), &[("a.txt", b"stable".to_vec())]);
    env.engine.initialize_user("operator").await.unwrap();
    let folder_id = env
        .engine
        .add_folder(env.data_dir.path().to_str().unwrap())
        .await
        .unwrap();

    let v1 = env.engine.index_folder(&folder_id).await.unwrap();
    let ids_before: Vec<String> = {
        let mut tx = env.engine.store().begin().await.unwrap();
        let ids = tx
            .current_files(&folder_id)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.file_id)
            .collect();
        tx.rollback().await.unwrap();
        ids
    };

    let v2 = env.engine.index_folder(&folder_id).await.unwrap();
    assert_eq!(v1, v2);

    let mut tx = env.engine.store().begin().await.unwrap();
    let folder = tx.get_folder(&folder_id).await.unwrap().unwrap();
    assert_eq!(folder.version, v1);
    let ids_after: Vec<String> = tx
        .current_files(&folder_id)
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.file_id)
        .collect();
    tx.rollback().await.unwrap();
    assert_eq!(ids_before, ids_after);
}
