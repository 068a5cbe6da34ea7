//! End-to-end slice → assemble → verify over an in-memory transport.

mod common;

use common::{assert_same_files, write_tree, Harness, SECRET};
use std::sync::{Arc, Mutex};

use svault_archive::{Progress, SliceOptions, MANIFEST_VERSION};
use svault_core::{BatchFilter, BatchStatus, SvaultError};
use svault_storage::{BlobTransport, Locator};

#[tokio::test]
async fn folder_roundtrip_restores_every_file() {
    let h = Harness::new();
    let src = write_tree(h.tmp.path());
    let engine = h.engine();

    let id = engine
        .slice(
            &src,
            SliceOptions {
                title: Some("Summer".into()),
                tags: vec!["family".into()],
                ..Default::default()
            },
        )
        .await
        .expect("slice");

    let (batch, chunks) = h.index.batch_with_chunks(&id).unwrap();
    assert_eq!(batch.status, BatchStatus::Complete);
    assert!(batch.is_directory);
    assert_eq!(batch.file_count, 4, ".DS_Store must be skipped");
    assert!(batch.chunk_count >= 11, "expected many chunks, got {}", batch.chunk_count);
    assert_eq!(chunks.len() as u64, batch.chunk_count);
    assert!(batch.manifest_locator.is_some());
    assert!(batch.card_id.is_some());
    for (i, c) in chunks.iter().enumerate() {
        assert_eq!(c.index, i as u64);
        assert!(c.stored_size <= 16 * 1024, "chunk {i} exceeds the cap");
    }

    let out = h.path("restore");
    let report = engine.assemble(&id, &out).await.expect("assemble");
    assert_eq!(report.files, 4);
    assert_eq!(report.downloaded, batch.chunk_count);
    assert_eq!(report.cached, 0);
    assert_same_files(&src, &out.join("photos"), &[".DS_Store"]);
    assert!(out.join("photos/empty").is_dir());
}

#[tokio::test]
async fn second_assemble_uses_cache_only() {
    let h = Harness::new();
    let src = write_tree(h.tmp.path());
    let engine = h.engine();
    let id = engine.slice(&src, SliceOptions::default()).await.unwrap();

    let out = h.path("restore");
    engine.assemble(&id, &out).await.unwrap();
    let first = std::fs::read(out.join("photos/2024/a.jpg")).unwrap();

    h.transport.reset_counters();
    let report = engine.assemble(&id, &out).await.unwrap();
    assert_eq!(h.transport.downloads(), 0);
    assert_eq!(report.downloaded, 0);
    assert_eq!(report.cached, h.index.get_batch(&id).unwrap().chunk_count);
    assert_eq!(std::fs::read(out.join("photos/2024/a.jpg")).unwrap(), first);
    assert_same_files(&src, &out.join("photos"), &[".DS_Store"]);
}

#[tokio::test]
async fn single_file_roundtrip() {
    let h = Harness::new();
    let src = h.path("notes.txt");
    std::fs::write(&src, b"just one small file").unwrap();
    let engine = h.engine();

    let id = engine.slice(&src, SliceOptions::default()).await.unwrap();
    let batch = h.index.get_batch(&id).unwrap();
    assert!(!batch.is_directory);
    assert_eq!(batch.chunk_count, 1);
    assert_eq!(batch.original_name, "notes.txt");

    let out = h.path("out");
    engine.assemble(&id, &out).await.unwrap();
    assert_eq!(std::fs::read(out.join("notes.txt")).unwrap(), b"just one small file");
}

#[tokio::test]
async fn verify_and_assemble_name_the_corrupted_chunk() {
    let h = Harness::new();
    let src = write_tree(h.tmp.path());
    let engine = h.engine();
    let id = engine.slice(&src, SliceOptions::default()).await.unwrap();

    let report = engine.verify(&id).await.unwrap();
    assert!(report.is_ok());
    assert_eq!(report.chunks_checked, h.index.get_batch(&id).unwrap().chunk_count);

    let (_, chunks) = h.index.batch_with_chunks(&id).unwrap();
    let target = chunks[10].locator.clone().unwrap();
    h.op.write(&target, b"tampered bytes".to_vec()).await.unwrap();

    let report = engine.verify(&id).await.unwrap();
    assert!(!report.is_ok());
    assert_eq!(report.mismatches.len(), 1);
    let first = report.first_mismatch().unwrap();
    assert_eq!(first.index, 10);
    assert_eq!(first.expected, chunks[10].cipher_hash);
    assert_ne!(first.actual, first.expected);

    match engine.assemble(&id, &h.path("restore")).await {
        Err(SvaultError::Integrity {
            batch_id,
            index,
            expected,
            ..
        }) => {
            assert_eq!(batch_id, id);
            assert_eq!(index, Some(10));
            assert_eq!(expected, chunks[10].cipher_hash);
        }
        other => panic!("expected integrity error, got {other:?}"),
    }
}

#[tokio::test]
async fn verify_reports_missing_chunk() {
    let h = Harness::new();
    let src = write_tree(h.tmp.path());
    let engine = h.engine();
    let id = engine.slice(&src, SliceOptions::default()).await.unwrap();

    let (_, chunks) = h.index.batch_with_chunks(&id).unwrap();
    let gone = Locator::new(chunks[2].locator.clone().unwrap());
    h.transport.delete_blob(&gone).await.unwrap();

    let report = engine.verify(&id).await.unwrap();
    let first = report.first_mismatch().unwrap();
    assert_eq!(first.index, 2);
    assert_eq!(first.actual, "missing");
}

#[tokio::test]
async fn wrong_secret_fails_before_any_download() {
    let h = Harness::new();
    let src = write_tree(h.tmp.path());
    let id = h.engine().slice(&src, SliceOptions::default()).await.unwrap();

    h.transport.reset_counters();
    let intruder = h.engine_with("not the secret", h.index.clone(), "other-cache");
    match intruder.assemble(&id, &h.path("restore")).await {
        Err(SvaultError::KeyMismatch { batch_id }) => assert_eq!(batch_id, id),
        other => panic!("expected key mismatch, got {other:?}"),
    }
    assert_eq!(h.transport.downloads(), 0);
}

#[tokio::test]
async fn missing_input_is_reported() {
    let h = Harness::new();
    let err = h
        .engine()
        .slice(&h.path("does-not-exist"), SliceOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SvaultError::InputNotFound(_)));
    assert!(h.index.list_batches(&BatchFilter::default()).is_empty());
}

#[tokio::test]
async fn manifest_blob_describes_the_batch() {
    let h = Harness::new();
    let src = write_tree(h.tmp.path());
    let id = h.engine().slice(&src, SliceOptions::default()).await.unwrap();

    let batch = h.index.get_batch(&id).unwrap();
    let raw = h
        .transport
        .download_blob(&Locator::new(batch.manifest_locator.clone().unwrap()))
        .await
        .unwrap();
    let manifest = svault_archive::manifest::decode(&raw).unwrap();

    assert_eq!(manifest.version, MANIFEST_VERSION);
    assert_eq!(manifest.batch_id, id);
    assert_eq!(manifest.chunks.len() as u64, batch.chunk_count);
    assert_eq!(manifest.files.len(), 4);
    assert_eq!(manifest.salt, batch.salt);
    assert_eq!(manifest.algorithms.encryption, "xchacha20poly1305");
    let text = String::from_utf8_lossy(&raw);
    assert!(!text.contains(SECRET));
}

#[tokio::test]
async fn progress_events_are_delivered() {
    let h = Harness::new();
    let src = write_tree(h.tmp.path());
    let events: Arc<Mutex<Vec<Progress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let engine = h
        .engine()
        .with_progress(Arc::new(move |p: &Progress| sink.lock().unwrap().push(p.clone())));

    let id = engine.slice(&src, SliceOptions::default()).await.unwrap();
    let chunks = h.index.get_batch(&id).unwrap().chunk_count;

    let events = events.lock().unwrap();
    assert!(matches!(events.first(), Some(Progress::Scanned { files: 4, .. })));
    let uploaded = events
        .iter()
        .filter(|e| matches!(e, Progress::ChunkUploaded { .. }))
        .count() as u64;
    assert_eq!(uploaded, chunks);
}

#[tokio::test]
async fn delete_tombstones_then_purges_remote() {
    let h = Harness::new();
    let src = write_tree(h.tmp.path());
    let engine = h.engine();
    let keep = engine.slice(&src, SliceOptions::default()).await.unwrap();
    let drop_local = engine.slice(&src, SliceOptions::default()).await.unwrap();
    let drop_remote = engine.slice(&src, SliceOptions::default()).await.unwrap();

    engine.delete(&drop_local, false).await.unwrap();
    assert_eq!(h.index.get_batch(&drop_local).unwrap().status, BatchStatus::Deleted);

    let (batch, chunks) = h.index.batch_with_chunks(&drop_remote).unwrap();
    engine.delete(&drop_remote, true).await.unwrap();
    assert!(matches!(
        h.index.get_batch(&drop_remote),
        Err(SvaultError::BatchNotFound(_))
    ));
    for c in &chunks {
        let loc = Locator::new(c.locator.clone().unwrap());
        assert!(h.transport.download_blob(&loc).await.is_err());
    }
    let manifest = Locator::new(batch.manifest_locator.unwrap());
    assert!(h.transport.download_blob(&manifest).await.is_err());

    let stats = engine.stats();
    assert_eq!(stats.batch_count, 1);
    assert_eq!(stats.by_status.get("deleted"), Some(&1));

    let complete = engine.list_batches(&BatchFilter {
        status: Some(BatchStatus::Complete),
        ..Default::default()
    });
    assert_eq!(complete.len(), 1);
    assert_eq!(complete[0].batch_id, keep);

    assert!(matches!(
        engine.assemble(&drop_local, &h.path("out")).await,
        Err(SvaultError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn delete_drops_cached_chunks() {
    let h = Harness::new();
    let src = write_tree(h.tmp.path());
    let engine = h.engine();
    let tombstoned = engine.slice(&src, SliceOptions::default()).await.unwrap();
    let purged = engine.slice(&src, SliceOptions::default()).await.unwrap();

    for id in [&tombstoned, &purged] {
        let report = engine.assemble(id, &h.path(&format!("out/{id}"))).await.unwrap();
        assert_eq!(h.cached_chunks(id) as u64, report.downloaded);
    }

    engine.delete(&tombstoned, false).await.unwrap();
    assert_eq!(h.cached_chunks(&tombstoned), 0);
    assert!(!h.path("cache").join(&tombstoned).exists());

    engine.delete(&purged, true).await.unwrap();
    assert_eq!(h.cached_chunks(&purged), 0);
    assert!(!h.path("cache").join(&purged).exists());
}

#[tokio::test]
async fn assemble_can_leave_no_cache_behind() {
    let h = Harness::new();
    let src = write_tree(h.tmp.path());
    let engine = h.engine_configured(|s| s.keep_chunk_cache = false);
    let id = engine.slice(&src, SliceOptions::default()).await.unwrap();

    let out = h.path("restored");
    let report = engine.assemble(&id, &out).await.unwrap();
    assert!(report.downloaded > 0);
    assert_same_files(&src, &out.join("photos"), &[".DS_Store"]);
    assert_eq!(h.cached_chunks(&id), 0);

    // With the cache kept, eviction is an explicit step.
    let keeping = h.engine();
    keeping.assemble(&id, &h.path("again")).await.unwrap();
    assert!(h.cached_chunks(&id) > 0);
    assert!(keeping.evict_cache(&id).await.unwrap());
    assert!(!keeping.evict_cache(&id).await.unwrap());
    assert!(keeping.evict_cache("../escape").await.is_err());
}

#[tokio::test]
async fn index_backup_lands_in_backup_destination() {
    let h = Harness::new();
    let src = write_tree(h.tmp.path());
    let engine = h.engine();
    let id = engine.slice(&src, SliceOptions::default()).await.unwrap();

    let locator = engine.backup_index().await.unwrap();
    assert!(locator.as_str().starts_with("archive-backups/"));

    let raw = h.transport.download_blob(&locator).await.unwrap();
    let text = String::from_utf8(raw.to_vec()).unwrap();
    assert!(text.contains(&id));
}
