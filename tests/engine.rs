mod common;

use bucketsync_lib::error::is_not_found;
use bucketsync_lib::storage::{LocalStorage, MemoryStorage};
use bucketsync_lib::{TransferEngine, TransferOptions};
use common::{slash, write_file, FaultyStorage};
use std::sync::Arc;
use std::time::Duration;

const KIB: u64 = 1024;

fn options() -> TransferOptions {
    TransferOptions {
        retry_delay: Duration::ZERO,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_upload_small_files_tree() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "a.txt", &[1u8; 10]);
    write_file(dir.path(), "sub/b.txt", &[2u8; 20]);

    let remote = MemoryStorage::new();
    let engine = TransferEngine::new(Arc::new(LocalStorage::new()), Arc::new(remote.clone()));
    let options = TransferOptions {
        large_file_threshold: 1024 * KIB,
        use_multipart: true,
        ..options()
    };

    let report = engine
        .upload_with_report(&slash(dir.path()), "bucket/prefix", &options)
        .await
        .unwrap();

    assert!(report.failed.is_empty());
    assert_eq!(report.files_total, 2);
    assert_eq!(report.files_completed, 2);
    assert_eq!(report.bytes_completed, 30);
    assert_eq!(
        remote.keys(),
        vec!["bucket/prefix/a.txt", "bucket/prefix/sub/b.txt"]
    );
    assert_eq!(remote.get("bucket/prefix/sub/b.txt").unwrap(), vec![2u8; 20]);
    // 小文件不走分片上传
    assert_eq!(remote.pending_uploads(), 0);
}

#[tokio::test]
async fn test_large_file_uploads_in_thirteen_parts() {
    let dir = tempfile::tempdir().unwrap();
    let data: Vec<u8> = (0..200 * KIB).map(|i| (i % 251) as u8).collect();
    write_file(dir.path(), "big.bin", &data);

    let remote = Arc::new(FaultyStorage::new());
    let engine = TransferEngine::new(Arc::new(LocalStorage::new()), remote.clone());
    let options = TransferOptions {
        chunk_size: 16 * KIB,
        large_file_threshold: 64 * KIB,
        max_chunks: 999,
        use_multipart: true,
        ..options()
    };

    let report = engine
        .upload_with_report(&slash(dir.path()), "s3://bucket/backup/", &options)
        .await
        .unwrap();

    assert!(report.failed.is_empty());
    assert_eq!(report.bytes_completed, 200 * KIB);
    assert_eq!(remote.attempts("bucket/backup/big.bin"), 1);
    assert_eq!(remote.completions(), 1);
    assert_eq!(remote.inner.get("bucket/backup/big.bin").unwrap(), data);
    assert_eq!(remote.inner.pending_uploads(), 0);
}

#[tokio::test]
async fn test_lost_part_aborts_and_fails_after_retries() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "big.bin", &vec![7u8; (200 * KIB) as usize]);
    let source = format!("{}/big.bin", slash(dir.path()));

    let remote = Arc::new(FaultyStorage::new().losing_part(7));
    let engine = TransferEngine::new(Arc::new(LocalStorage::new()), remote.clone());
    let options = TransferOptions {
        retry_count: 3,
        chunk_size: 16 * KIB,
        large_file_threshold: 64 * KIB,
        use_multipart: true,
        ..options()
    };

    let report = engine
        .upload_with_report(&slash(dir.path()), "bucket/backup", &options)
        .await
        .unwrap();

    assert_eq!(report.failed, vec![source]);
    assert_eq!(remote.attempts("bucket/backup/big.bin"), 3);
    assert_eq!(remote.completions(), 0);
    assert!(remote.inner.get("bucket/backup/big.bin").is_none());
    // 每次失败的会话都已中止
    assert_eq!(remote.inner.pending_uploads(), 0);
    // 失败的任务也按声明大小计数
    assert_eq!(report.files_completed, 1);
    assert_eq!(report.bytes_completed, 200 * KIB);
}

#[tokio::test]
async fn test_worker_pool_bounds_concurrency() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..5 {
        write_file(dir.path(), &format!("f{}.txt", i), b"payload");
    }

    let remote = Arc::new(FaultyStorage::new().with_open_delay(Duration::from_millis(30)));
    let engine = TransferEngine::new(Arc::new(LocalStorage::new()), remote.clone());
    let options = TransferOptions {
        worker_count: 2,
        ..options()
    };

    let failed = engine
        .upload(&slash(dir.path()), "bucket/x", &options)
        .await
        .unwrap();

    assert!(failed.is_empty());
    assert!(remote.max_active() <= 2, "max active: {}", remote.max_active());
    assert!(remote.max_active() >= 1);
    assert_eq!(remote.inner.keys().len(), 5);
}

#[tokio::test]
async fn test_failing_job_attempted_exactly_retry_count_times() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "ok.txt", b"fine");
    write_file(dir.path(), "bad.txt", b"broken");

    let remote = Arc::new(FaultyStorage::new().failing("bucket/x/bad.txt"));
    let engine = TransferEngine::new(Arc::new(LocalStorage::new()), remote.clone());
    let options = TransferOptions {
        retry_count: 4,
        ..options()
    };

    let report = engine
        .upload_with_report(&slash(dir.path()), "bucket/x", &options)
        .await
        .unwrap();

    assert_eq!(report.failed, vec![format!("{}/bad.txt", slash(dir.path()))]);
    assert_eq!(remote.attempts("bucket/x/bad.txt"), 4);
    assert_eq!(remote.attempts("bucket/x/ok.txt"), 1);
    assert_eq!(report.files_completed, 2);
    assert_eq!(report.bytes_completed, 10);
}

#[tokio::test]
async fn test_cancel_interrupts_retry_sleep() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "bad.txt", b"broken");

    let remote = Arc::new(FaultyStorage::new().failing("bucket/x/bad.txt"));
    let engine = TransferEngine::new(Arc::new(LocalStorage::new()), remote.clone());
    let options = TransferOptions {
        retry_count: 5,
        retry_delay: Duration::from_secs(30),
        ..Default::default()
    };

    let token = engine.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        engine.upload_with_report(&slash(dir.path()), "bucket/x", &options),
    )
    .await
    .expect("cancellation should interrupt the retry sleep")
    .unwrap();

    // 已经开始的任务被中断后记为失败
    assert_eq!(report.failed.len(), 1);
    assert_eq!(remote.attempts("bucket/x/bad.txt"), 1);
}

#[tokio::test]
async fn test_download_recreates_tree() {
    let remote = MemoryStorage::new();
    remote.put("bucket/data/top.txt", b"top".to_vec());
    remote.put("bucket/data/x/y/z.txt", b"deep".to_vec());
    remote.put("bucket/elsewhere.txt", b"skip".to_vec());

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let engine = TransferEngine::new(Arc::new(LocalStorage::new()), Arc::new(remote));

    let failed = engine
        .download("s3://bucket/data", &slash(&out), &options())
        .await
        .unwrap();

    assert!(failed.is_empty());
    assert_eq!(std::fs::read(out.join("top.txt")).unwrap(), b"top");
    assert_eq!(std::fs::read(out.join("x/y/z.txt")).unwrap(), b"deep");
    assert!(!out.join("elsewhere.txt").exists());
}

#[tokio::test]
async fn test_download_ignores_multipart_option() {
    let remote = MemoryStorage::new();
    let data = vec![9u8; 100];
    remote.put("bucket/big.bin", data.clone());

    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("big.bin");
    let engine = TransferEngine::new(Arc::new(LocalStorage::new()), Arc::new(remote));
    let options = TransferOptions {
        chunk_size: 7,
        large_file_threshold: 10,
        use_multipart: true,
        ..options()
    };

    // 源根路径本身是文件时直接映射到目标路径
    let failed = engine
        .download("bucket/big.bin", &slash(&target), &options)
        .await
        .unwrap();
    assert!(failed.is_empty());
    assert_eq!(std::fs::read(&target).unwrap(), data);
}

#[tokio::test]
async fn test_missing_local_root_fails() {
    let dir = tempfile::tempdir().unwrap();
    let engine = TransferEngine::new(
        Arc::new(LocalStorage::new()),
        Arc::new(MemoryStorage::new()),
    );

    let err = engine
        .upload(&slash(&dir.path().join("absent")), "bucket/x", &options())
        .await
        .unwrap_err();
    assert!(is_not_found(&err));
}

#[tokio::test]
async fn test_progress_snapshots_published() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "a.txt", &[0u8; 64]);

    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    let engine = TransferEngine::new(
        Arc::new(LocalStorage::new()),
        Arc::new(MemoryStorage::new()),
    )
    .with_progress(tx);

    engine
        .upload(&slash(dir.path()), "bucket/x", &options())
        .await
        .unwrap();

    let mut last = None;
    while let Ok(progress) = rx.try_recv() {
        last = Some(progress);
    }
    let last = last.expect("final snapshot");
    assert_eq!(last.files_completed, 1);
    assert_eq!(last.files_total, 1);
    assert_eq!(last.bytes_completed, 64);
    assert_eq!(last.bytes_total, 64);
}

#[cfg(unix)]
#[tokio::test]
async fn test_upload_follows_symlinks_by_target() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "real/a.txt", &[1u8; 10]);
    write_file(dir.path(), "big.bin", &vec![2u8; 5000]);
    std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("linkdir")).unwrap();
    std::os::unix::fs::symlink(dir.path().join("big.bin"), dir.path().join("linkbig")).unwrap();

    let remote = MemoryStorage::new();
    let engine = TransferEngine::new(Arc::new(LocalStorage::new()), Arc::new(remote.clone()));

    let report = engine
        .upload_with_report(&slash(dir.path()), "bucket/x", &options())
        .await
        .unwrap();

    // 指向目录的链接不作为文件传输
    assert!(report.failed.is_empty(), "failed: {:?}", report.failed);
    assert_eq!(report.files_total, 3);
    assert_eq!(report.bytes_total, 10010);
    assert_eq!(remote.get("bucket/x/linkbig").unwrap().len(), 5000);
}
