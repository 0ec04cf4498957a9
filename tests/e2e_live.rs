//! End-to-end test against the live aggregator API
//!
//! Needs network access and a real target, so it is ignored by default.
//!
//! # Running
//!
//! ```bash
//! TEST_CREATOR_URL="https://kemono.cr/patreon/user/12345" \
//!     cargo test --test e2e_live -- --ignored
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use creator_dl::{Config, CreatorDownloader, Event, RunStatus};

#[tokio::test]
#[ignore]
async fn live_download_of_one_post() {
    let url = match std::env::var("TEST_CREATOR_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("TEST_CREATOR_URL not set, skipping");
            return;
        }
    };

    let temp_dir = tempfile::tempdir().expect("temp dir");
    let config = Config {
        base_directory: temp_dir.path().to_path_buf(),
        ..Default::default()
    };
    let downloader = CreatorDownloader::new(config);

    let mut events = downloader.subscribe();
    let event_task = tokio::spawn(async move {
        let mut completed = 0u64;
        while let Ok(event) = events.recv().await {
            match event {
                Event::FileCompleted { path, .. } => {
                    println!("completed: {}", path.display());
                    completed += 1;
                }
                Event::FileFailed { url, error, .. } => {
                    eprintln!("failed: {url}: {error}");
                }
                Event::RunFinished { .. } => break,
                _ => {}
            }
        }
        completed
    });

    let summary = downloader.run(&url).await.expect("run should start");
    println!(
        "status={:?} discovered={} succeeded={} skipped={} failed={}",
        summary.status, summary.discovered, summary.succeeded, summary.skipped, summary.failed
    );

    assert_eq!(summary.status, RunStatus::Completed);
    assert!(summary.discovered > 0, "expected at least one file");

    let completed = event_task.await.unwrap();
    assert_eq!(completed, summary.succeeded);
}
