//! Bounded-concurrency download scheduler
//!
//! Pulls deduplicated work items from the discovery queue and downloads
//! them through a worker pool capped at `simultaneous_downloads`. Files
//! stream to a `.part` sibling and move into place atomically, so an
//! interrupted run never leaves a truncated file under its final name.
//! Existing non-empty destinations are skipped, which makes re-running a
//! target resume-safe.

use crate::config::{Config, DedupMode};
use crate::dedup::{DedupKey, DedupLedger};
use crate::discovery::{DescriptionTask, WorkItem};
use crate::error::{Error, Result};
use crate::naming::{sanitize_filename, FilePlacer};
use crate::retry::with_retry;
use crate::run::RunState;
use crate::types::{Event, FileTask, SkipReason};
use futures::StreamExt;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Matches HTML tags in post content for description files
static HTML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("static pattern"));

/// Downloads queued work items with bounded concurrency
#[derive(Clone)]
pub struct Scheduler {
    client: reqwest::Client,
    config: Arc<Config>,
    placer: Arc<FilePlacer>,
    ledger: Arc<DedupLedger>,
    state: Arc<RunState>,
    events: broadcast::Sender<Event>,
    cancel: CancellationToken,
    /// Run's base download directory; the placer appends the creator folder
    base: PathBuf,
}

impl Scheduler {
    /// Create a scheduler for one run
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: reqwest::Client,
        config: Arc<Config>,
        placer: Arc<FilePlacer>,
        ledger: Arc<DedupLedger>,
        state: Arc<RunState>,
        events: broadcast::Sender<Event>,
        cancel: CancellationToken,
    ) -> Self {
        let base = config.downloads_dir();
        Self {
            client,
            config,
            placer,
            ledger,
            state,
            events,
            cancel,
            base,
        }
    }

    /// Drain the queue, spawning one worker per item up to the concurrency
    /// cap, and wait for all in-flight transfers to settle
    ///
    /// After cancellation no new item starts; queued items are recorded as
    /// skipped and in-flight transfers finish or fail on their own.
    pub async fn run(&self, mut queue: mpsc::Receiver<WorkItem>) {
        let permits = self.config.download.simultaneous_downloads;
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut workers: JoinSet<()> = JoinSet::new();

        while let Some(item) = queue.recv().await {
            if self.cancel.is_cancelled() {
                self.skip_item(&item);
                continue;
            }
            // Not closed while we hold a clone, so acquire cannot fail
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let this = self.clone();
            workers.spawn(async move {
                let _permit = permit;
                match item {
                    WorkItem::File(task) => this.handle_file(task).await,
                    WorkItem::Description(desc) => this.handle_description(desc).await,
                }
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "download worker panicked");
            }
        }
    }

    /// Download one file: place it, resume-check, stream, dedup, rename
    async fn handle_file(&self, task: FileTask) {
        let placement = self.placer.place(&task, &self.base);
        let path = placement.path();

        if let Ok(meta) = tokio::fs::metadata(&path).await
            && meta.len() > 0
        {
            tracing::debug!(path = %path.display(), "destination exists, skipping");
            self.skip(&task.url, SkipReason::AlreadyOnDisk);
            return;
        }

        if let Err(err) = tokio::fs::create_dir_all(&placement.folder).await {
            self.fail(&task.url, &Error::Io(err), 0);
            return;
        }

        let part = placement.folder.join(format!("{}.part", placement.filename));
        let attempts = AtomicU32::new(0);
        let result = with_retry(
            &self.config.retry,
            self.config.download.file_download_max_retries,
            || {
                attempts.fetch_add(1, Ordering::Relaxed);
                self.fetch_to_part(&task, &part)
            },
        )
        .await;
        let attempts = attempts.load(Ordering::Relaxed);

        match result {
            Ok(digest) => {
                if self.config.dedup_mode == DedupMode::UrlAndContent
                    && !self.ledger.should_accept(DedupKey::Content(digest))
                {
                    let _ = tokio::fs::remove_file(&part).await;
                    self.skip(&task.url, SkipReason::DuplicateContent);
                    return;
                }
                match tokio::fs::rename(&part, &path).await {
                    Ok(()) => {
                        tracing::info!(url = %task.url, path = %path.display(), "file completed");
                        self.state.record_succeeded();
                        self.emit(Event::FileCompleted {
                            url: task.url,
                            path,
                        });
                    }
                    Err(err) => {
                        let _ = tokio::fs::remove_file(&part).await;
                        let error = Error::Filesystem {
                            path: path.clone(),
                            reason: err.to_string(),
                        };
                        self.fail(&task.url, &error, attempts);
                    }
                }
            }
            Err(Error::Cancelled) => {
                let _ = tokio::fs::remove_file(&part).await;
                self.skip(&task.url, SkipReason::Cancelled);
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&part).await;
                self.fail(&task.url, &err, attempts);
            }
        }
    }

    /// Stream the remote file into the `.part` sibling, returning the hex
    /// md5 digest of the bytes written
    async fn fetch_to_part(&self, task: &FileTask, part: &Path) -> Result<String> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let response = self.client.get(&task.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                url: task.url.clone(),
            });
        }
        let total_bytes = response.content_length();

        let mut file = tokio::fs::File::create(part).await?;
        let mut stream = response.bytes_stream();
        let mut context = md5::Context::new();
        let mut bytes_received = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            context.consume(&chunk);
            file.write_all(&chunk).await?;
            bytes_received += chunk.len() as u64;
            self.emit(Event::Progress {
                url: task.url.clone(),
                bytes_received,
                total_bytes,
            });
        }
        file.flush().await?;

        Ok(format!("{:x}", context.compute()))
    }

    /// Write a post's description text; failures are logged, never fatal
    async fn handle_description(&self, desc: DescriptionTask) {
        let folder =
            self.placer
                .description_folder(&self.base, &desc.post_id, &desc.post_title);
        let filename = sanitize_filename(
            &format!("{}_{}.txt", desc.post_id, desc.post_title),
            self.config.download.max_filename_length,
        );
        let path = folder.join(filename);

        if let Ok(meta) = tokio::fs::metadata(&path).await
            && meta.len() > 0
        {
            return;
        }

        let text = strip_html(&desc.content);
        let write = async {
            tokio::fs::create_dir_all(&folder).await?;
            tokio::fs::write(&path, text.as_bytes()).await
        };
        match write.await {
            Ok(()) => self.emit(Event::Log {
                message: format!("saved description for post {}", desc.post_id),
            }),
            Err(err) => {
                tracing::warn!(post_id = %desc.post_id, error = %err, "description write failed");
            }
        }
    }

    fn skip_item(&self, item: &WorkItem) {
        if let WorkItem::File(task) = item {
            self.skip(&task.url, SkipReason::Cancelled);
        }
    }

    fn skip(&self, url: &str, reason: SkipReason) {
        self.state.record_skipped();
        self.emit(Event::FileSkipped {
            url: url.to_string(),
            reason,
        });
    }

    fn fail(&self, url: &str, error: &Error, attempts: u32) {
        tracing::error!(
            url,
            error = %error,
            attempts,
            rate_limited = error.is_rate_limited(),
            "file failed"
        );
        self.state.record_failed();
        self.emit(Event::FileFailed {
            url: url.to_string(),
            error: error.to_string(),
            attempts,
        });
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

/// Drop HTML tags from post content, keeping the text between them
fn strip_html(content: &str) -> String {
    HTML_TAG.replace_all(content, "").trim().to_string()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        scheduler: Scheduler,
        state: Arc<RunState>,
        events: broadcast::Receiver<Event>,
        cancel: CancellationToken,
        _dir: TempDir,
    }

    fn harness(mut config: Config) -> Harness {
        let dir = TempDir::new().unwrap();
        config.base_directory = dir.path().to_path_buf();
        let config = Arc::new(config.validate());
        let placer = Arc::new(FilePlacer::new(
            &config.download,
            "patreon",
            "creator123",
            "Creator Name",
        ));
        let state = Arc::new(RunState::default());
        let (tx, rx) = broadcast::channel(1024);
        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(
            reqwest::Client::new(),
            Arc::clone(&config),
            placer,
            Arc::new(DedupLedger::new()),
            Arc::clone(&state),
            tx,
            cancel.clone(),
        );
        Harness {
            scheduler,
            state,
            events: rx,
            cancel,
            _dir: dir,
        }
    }

    fn file_task(url: &str, name: &str, index: usize, total: usize) -> WorkItem {
        WorkItem::File(FileTask {
            url: url.to_string(),
            name: Some(name.to_string()),
            post_id: "1".to_string(),
            post_title: "My Post".to_string(),
            index,
            total,
        })
    }

    async fn run_items(h: &Harness, items: Vec<WorkItem>) {
        let (tx, rx) = mpsc::channel(64);
        for item in items {
            tx.send(item).await.unwrap();
        }
        drop(tx);
        h.scheduler.run(rx).await;
    }

    #[tokio::test]
    async fn downloads_to_templated_path_atomically() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data/a.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpegbytes".to_vec()))
            .mount(&server)
            .await;

        let h = harness(Config::default());
        run_items(&h, vec![file_task(&format!("{}/data/a.jpg?f=a.jpg", server.uri()), "a.jpg", 0, 1)])
            .await;

        let expected = h
            .scheduler
            .base
            .join("creator123_Creator Name")
            .join("1_My_Post")
            .join("1_a.jpg");
        assert_eq!(std::fs::read(&expected).unwrap(), b"jpegbytes");
        assert_eq!(h.state.snapshot().succeeded, 1);

        // No temp files linger
        let siblings: Vec<_> = std::fs::read_dir(expected.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert!(siblings.iter().all(|n| !n.to_string_lossy().ends_with(".part")));
    }

    #[tokio::test]
    async fn existing_non_empty_destination_is_not_refetched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data/a.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fresh".to_vec()))
            .expect(0)
            .mount(&server)
            .await;

        let h = harness(Config::default());
        let dest_dir = h
            .scheduler
            .base
            .join("creator123_Creator Name")
            .join("1_My_Post");
        std::fs::create_dir_all(&dest_dir).unwrap();
        std::fs::write(dest_dir.join("1_a.jpg"), b"already here").unwrap();

        run_items(&h, vec![file_task(&format!("{}/data/a.jpg", server.uri()), "a.jpg", 0, 1)])
            .await;

        assert_eq!(h.state.snapshot().skipped, 1);
        assert_eq!(h.state.snapshot().succeeded, 0);
        assert_eq!(
            std::fs::read(dest_dir.join("1_a.jpg")).unwrap(),
            b"already here"
        );
    }

    #[tokio::test]
    async fn identical_content_from_different_urls_is_stored_once() {
        let server = MockServer::start().await;
        for name in ["a.jpg", "b.jpg"] {
            Mock::given(method("GET"))
                .and(path(format!("/data/{name}")))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(b"same bytes".to_vec()))
                .mount(&server)
                .await;
        }

        let h = harness(Config::default());
        run_items(
            &h,
            vec![
                file_task(&format!("{}/data/a.jpg", server.uri()), "a.jpg", 0, 2),
                file_task(&format!("{}/data/b.jpg", server.uri()), "b.jpg", 1, 2),
            ],
        )
        .await;

        let snap = h.state.snapshot();
        assert_eq!(snap.succeeded, 1);
        assert_eq!(snap.skipped, 1);
    }

    #[tokio::test]
    async fn url_only_mode_keeps_identical_content() {
        let server = MockServer::start().await;
        for name in ["a.jpg", "b.jpg"] {
            Mock::given(method("GET"))
                .and(path(format!("/data/{name}")))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(b"same bytes".to_vec()))
                .mount(&server)
                .await;
        }

        let h = harness(Config {
            dedup_mode: DedupMode::UrlOnly,
            ..Default::default()
        });
        run_items(
            &h,
            vec![
                file_task(&format!("{}/data/a.jpg", server.uri()), "a.jpg", 0, 2),
                file_task(&format!("{}/data/b.jpg", server.uri()), "b.jpg", 1, 2),
            ],
        )
        .await;

        assert_eq!(h.state.snapshot().succeeded, 2);
    }

    #[tokio::test]
    async fn permanent_http_error_is_recorded_as_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data/gone.jpg"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let mut h = harness(Config::default());
        run_items(&h, vec![file_task(&format!("{}/data/gone.jpg", server.uri()), "gone.jpg", 0, 1)])
            .await;

        assert_eq!(h.state.snapshot().failed, 1);

        let mut saw_failed = false;
        while let Ok(event) = h.events.try_recv() {
            if let Event::FileFailed { attempts, .. } = event {
                assert_eq!(attempts, 1);
                saw_failed = true;
            }
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn transient_error_is_retried_to_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data/flaky.jpg"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/data/flaky.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
            .mount(&server)
            .await;

        let config = Config {
            retry: crate::config::RetryConfig {
                initial_delay: std::time::Duration::from_millis(10),
                jitter: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let h = harness(config);
        run_items(&h, vec![file_task(&format!("{}/data/flaky.jpg", server.uri()), "flaky.jpg", 0, 1)])
            .await;

        assert_eq!(h.state.snapshot().succeeded, 1);
    }

    #[tokio::test]
    async fn cancellation_skips_queued_items() {
        let server = MockServer::start().await;
        let h = harness(Config::default());
        h.cancel.cancel();

        run_items(
            &h,
            vec![
                file_task(&format!("{}/data/a.jpg", server.uri()), "a.jpg", 0, 2),
                file_task(&format!("{}/data/b.jpg", server.uri()), "b.jpg", 1, 2),
            ],
        )
        .await;

        let snap = h.state.snapshot();
        assert_eq!(snap.skipped, 2);
        assert_eq!(snap.succeeded, 0);
    }

    #[tokio::test]
    async fn cancellation_drains_in_flight_transfer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data/slow.jpg"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"slow bytes".to_vec())
                    .set_delay(std::time::Duration::from_millis(300)),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/data/queued.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"queued".to_vec()))
            .mount(&server)
            .await;

        // One permit so the second task is still queued when the cancel
        // lands mid-transfer
        let mut h = harness(Config {
            download: crate::config::DownloadConfig {
                simultaneous_downloads: 1,
                ..Default::default()
            },
            ..Default::default()
        });
        let (tx, rx) = mpsc::channel(8);
        tx.send(file_task(&format!("{}/data/slow.jpg", server.uri()), "slow.jpg", 0, 2))
            .await
            .unwrap();
        tx.send(file_task(&format!("{}/data/queued.jpg", server.uri()), "queued.jpg", 1, 2))
            .await
            .unwrap();
        drop(tx);

        let scheduler = h.scheduler.clone();
        let worker = tokio::spawn(async move { scheduler.run(rx).await });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        h.cancel.cancel();
        worker.await.unwrap();

        let snap = h.state.snapshot();
        assert_eq!(snap.succeeded, 1);
        assert_eq!(snap.skipped, 1);

        let post_dir = h
            .scheduler
            .base
            .join("creator123_Creator Name")
            .join("1_My_Post");
        assert_eq!(std::fs::read(post_dir.join("1_slow.jpg")).unwrap(), b"slow bytes");
        assert!(!post_dir.join("1_queued.jpg").exists());

        let mut saw_cancelled_skip = false;
        while let Ok(event) = h.events.try_recv() {
            if let Event::FileSkipped {
                url,
                reason: SkipReason::Cancelled,
            } = event
            {
                assert!(url.ends_with("queued.jpg"));
                saw_cancelled_skip = true;
            }
        }
        assert!(saw_cancelled_skip);
    }

    #[tokio::test]
    async fn description_is_written_under_post_folder() {
        let h = harness(Config::default());
        let (tx, rx) = mpsc::channel(4);
        tx.send(WorkItem::Description(DescriptionTask {
            post_id: "7".to_string(),
            post_title: "My Post".to_string(),
            content: "hello world".to_string(),
        }))
        .await
        .unwrap();
        drop(tx);
        h.scheduler.run(rx).await;

        let expected = h
            .scheduler
            .base
            .join("creator123_Creator Name")
            .join("7_My_Post")
            .join("7_My_Post.txt");
        assert_eq!(std::fs::read_to_string(&expected).unwrap(), "hello world");
    }

    #[test]
    fn html_tags_are_stripped_from_descriptions() {
        let text = strip_html("<p>First line</p><br><a href=\"x\">a link</a>");
        assert_eq!(text, "First linea link");
        assert_eq!(strip_html("plain text"), "plain text");
    }
}
