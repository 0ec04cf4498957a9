//! Run controller
//!
//! Ties one URL to a full run: resolve the domain and target, look up the
//! creator's display name, start discovery feeding the scheduler, and
//! aggregate counters into a [`RunSummary`]. Consumers observe progress
//! through the broadcast [`Event`] stream and stop a run cooperatively via
//! [`CreatorDownloader::cancel`].

use crate::client::{build_client, get_json};
use crate::config::Config;
use crate::dedup::DedupLedger;
use crate::discovery::Discovery;
use crate::domain::{self, Target};
use crate::error::{Error, Result};
use crate::naming::FilePlacer;
use crate::scheduler::Scheduler;
use crate::types::{Event, RunStatus, RunSummary};
use chrono::Utc;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Event channel capacity; slow sinks lag rather than block the run
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Queue depth between discovery and the scheduler
const QUEUE_CAPACITY: usize = 256;

/// Shared per-run counters, mutated by discovery and the workers
#[derive(Debug, Default)]
pub struct RunState {
    discovered: AtomicU64,
    succeeded: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of the run counters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Counts {
    /// File tasks accepted by discovery
    pub discovered: u64,
    /// Files written to disk
    pub succeeded: u64,
    /// Files skipped
    pub skipped: u64,
    /// Files or posts that exhausted their retry budget
    pub failed: u64,
}

impl RunState {
    /// Count a task accepted by discovery
    pub fn record_discovered(&self) {
        self.discovered.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a file written to disk
    pub fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a skipped file
    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed file
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counter values
    pub fn snapshot(&self) -> Counts {
        Counts {
            discovered: self.discovered.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Creator profile as served by the aggregator API
#[derive(Debug, Deserialize)]
struct CreatorProfile {
    #[serde(default)]
    name: Option<String>,
}

/// Downloads everything a creator-page or post URL points at
///
/// One instance drives one run at a time. Cancellation is sticky: after
/// [`cancel`](Self::cancel), the instance cannot start another run.
pub struct CreatorDownloader {
    config: Arc<Config>,
    events: broadcast::Sender<Event>,
    cancel: CancellationToken,
}

impl CreatorDownloader {
    /// Create a downloader with a validated copy of the configuration
    pub fn new(config: Config) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config: Arc::new(config.validate()),
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Subscribe to the run's event stream
    ///
    /// Subscribing after a run started misses earlier events; a receiver
    /// that falls more than the channel capacity behind loses the oldest.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Request cooperative cancellation
    ///
    /// No new file starts after this returns; in-flight transfers finish
    /// or fail on their own.
    pub fn cancel(&self) {
        tracing::info!("cancellation requested");
        self.cancel.cancel();
    }

    /// The validated configuration this downloader runs with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run a full download for a creator-page or post URL
    ///
    /// Returns `Err` only when the run cannot start (unsupported domain,
    /// unparseable target, client construction). Failures during the run
    /// are reflected in the summary's status and counters instead.
    pub async fn run(&self, url: &str) -> Result<RunSummary> {
        let domain = domain::resolve(url)?;
        let target = domain::parse_target(url, domain)?;
        let client = build_client(&self.config, domain)?;
        self.execute(client, target, domain.api_base(), domain.base_url())
            .await
    }

    async fn execute(
        &self,
        client: reqwest::Client,
        target: Target,
        api_base: String,
        file_base: String,
    ) -> Result<RunSummary> {
        let started_at = Utc::now();
        let (service, creator_id) = target.creator();
        tracing::info!(service, creator_id, "run started");

        let creator_name = self
            .creator_name(&client, &api_base, service, creator_id)
            .await;
        let placer = Arc::new(FilePlacer::new(
            &self.config.download,
            service,
            creator_id,
            creator_name,
        ));
        let ledger = Arc::new(DedupLedger::new());
        let state = Arc::new(RunState::default());

        let scheduler = Scheduler::new(
            client.clone(),
            Arc::clone(&self.config),
            placer,
            Arc::clone(&ledger),
            Arc::clone(&state),
            self.events.clone(),
            self.cancel.clone(),
        );
        let discovery = Discovery::new(
            client,
            Arc::clone(&self.config),
            api_base,
            file_base,
            ledger,
            Arc::clone(&state),
            self.events.clone(),
            self.cancel.clone(),
        );

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let scheduler_handle = tokio::spawn(async move { scheduler.run(rx).await });

        let discovery_result = match &target {
            Target::Creator { .. } => discovery.run_creator(service, creator_id, &tx).await,
            Target::Post { post_id, .. } => {
                discovery.run_post(service, creator_id, post_id, &tx).await
            }
        };
        // Closing the queue lets the scheduler drain and stop
        drop(tx);

        if let Err(err) = scheduler_handle.await {
            tracing::error!(error = %err, "scheduler task panicked");
        }

        let status = match &discovery_result {
            _ if self.cancel.is_cancelled() => RunStatus::Cancelled,
            Ok(()) => RunStatus::Completed,
            Err(Error::Cancelled) => RunStatus::Cancelled,
            Err(err) => {
                tracing::error!(error = %err, "discovery failed");
                RunStatus::Failed
            }
        };

        let counts = state.snapshot();
        let summary = RunSummary {
            status,
            discovered: counts.discovered,
            succeeded: counts.succeeded,
            skipped: counts.skipped,
            failed: counts.failed,
            started_at,
            finished_at: Utc::now(),
        };
        let _ = self.events.send(Event::Log {
            message: format!(
                "run finished: {} succeeded, {} skipped, {} failed",
                summary.succeeded, summary.skipped, summary.failed
            ),
        });
        let _ = self.events.send(Event::RunFinished {
            summary: summary.clone(),
        });
        tracing::info!(
            ?status,
            discovered = counts.discovered,
            succeeded = counts.succeeded,
            skipped = counts.skipped,
            failed = counts.failed,
            "run finished"
        );
        Ok(summary)
    }

    /// Fetch the creator's display name for the folder component
    ///
    /// Falls back to the creator id when the profile is unavailable, so a
    /// missing profile never blocks the download.
    async fn creator_name(
        &self,
        client: &reqwest::Client,
        api_base: &str,
        service: &str,
        creator_id: &str,
    ) -> String {
        let url = format!("{api_base}/{service}/user/{creator_id}/profile");
        let profile: Result<CreatorProfile> = get_json(
            client,
            &self.config,
            &url,
            self.config.download.api_request_max_retries,
        )
        .await;
        match profile {
            Ok(CreatorProfile { name: Some(name) }) if !name.trim().is_empty() => name,
            Ok(_) => creator_id.to_string(),
            Err(err) => {
                tracing::warn!(creator_id, error = %err, "profile lookup failed, using id");
                creator_id.to_string()
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn downloader(dir: &TempDir) -> CreatorDownloader {
        CreatorDownloader::new(Config {
            base_directory: dir.path().to_path_buf(),
            ..Default::default()
        })
    }

    async fn mount_profile(server: &MockServer, name: &str) {
        Mock::given(method("GET"))
            .and(path("/api/v1/patreon/user/42/profile"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"id": "42", "name": name})),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn unsupported_domain_is_rejected_up_front() {
        let dir = TempDir::new().unwrap();
        let d = downloader(&dir);
        let err = d.run("https://example.com/patreon/user/42").await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedDomain(_)));
    }

    #[tokio::test]
    async fn post_run_downloads_and_summarizes() {
        let server = MockServer::start().await;
        mount_profile(&server, "Creator Name").await;
        Mock::given(method("GET"))
            .and(path("/api/v1/patreon/user/42/post/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "7",
                "title": "My Post",
                "file": {"path": "/data/a.jpg", "name": "a.jpg"},
                "attachments": [{"path": "/data/b.png", "name": "b.png"}]
            })))
            .mount(&server)
            .await;
        for name in ["a.jpg", "b.png"] {
            Mock::given(method("GET"))
                .and(path(format!("/data/{name}")))
                .respond_with(
                    ResponseTemplate::new(200).set_body_bytes(name.as_bytes().to_vec()),
                )
                .mount(&server)
                .await;
        }

        let dir = TempDir::new().unwrap();
        let d = downloader(&dir);
        let target = Target::Post {
            service: "patreon".to_string(),
            creator_id: "42".to_string(),
            post_id: "7".to_string(),
        };
        let summary = d
            .execute(
                reqwest::Client::new(),
                target,
                format!("{}/api/v1", server.uri()),
                server.uri(),
            )
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.discovered, 2);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 0);

        let post_dir = d
            .config()
            .downloads_dir()
            .join("42_Creator Name")
            .join("7_My_Post");
        assert!(post_dir.join("7_a.jpg").exists());
        assert!(post_dir.join("7_b.png").exists());
    }

    #[tokio::test]
    async fn missing_profile_falls_back_to_creator_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/patreon/user/42/profile"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/patreon/user/42/post/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "7",
                "file": {"path": "/data/a.jpg", "name": "a.jpg"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/data/a.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let d = downloader(&dir);
        let target = Target::Post {
            service: "patreon".to_string(),
            creator_id: "42".to_string(),
            post_id: "7".to_string(),
        };
        let summary = d
            .execute(
                reqwest::Client::new(),
                target,
                format!("{}/api/v1", server.uri()),
                server.uri(),
            )
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 1);
        assert!(d.config().downloads_dir().join("42_42").exists());
    }

    #[tokio::test]
    async fn failed_single_post_yields_failed_status() {
        let server = MockServer::start().await;
        mount_profile(&server, "Creator Name").await;
        Mock::given(method("GET"))
            .and(path("/api/v1/patreon/user/42/post/7"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let d = downloader(&dir);
        let target = Target::Post {
            service: "patreon".to_string(),
            creator_id: "42".to_string(),
            post_id: "7".to_string(),
        };
        let summary = d
            .execute(
                reqwest::Client::new(),
                target,
                format!("{}/api/v1", server.uri()),
                server.uri(),
            )
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.succeeded, 0);
    }

    #[tokio::test]
    async fn page_fetch_failure_fails_run_but_drains_found_files() {
        let server = MockServer::start().await;
        mount_profile(&server, "Creator Name").await;

        // Full first page keeps pagination going; the second page is gone
        // for good
        let first_page: Vec<serde_json::Value> = (0..crate::discovery::PAGE_SIZE)
            .map(|i| serde_json::json!({"id": i.to_string()}))
            .collect();
        Mock::given(method("GET"))
            .and(path("/api/v1/patreon/user/42"))
            .and(query_param("o", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(first_page))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/patreon/user/42"))
            .and(query_param("o", "50"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        // Every post resolves to the same file; dedup keeps the first
        Mock::given(method("GET"))
            .and(path_regex(r"^/api/v1/patreon/user/42/post/\d+$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "1",
                "title": "My Post",
                "file": {"path": "/data/a.jpg", "name": "a.jpg"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/data/a.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpegbytes".to_vec()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let d = downloader(&dir);
        let target = Target::Creator {
            service: "patreon".to_string(),
            creator_id: "42".to_string(),
        };
        let summary = d
            .execute(
                reqwest::Client::new(),
                target,
                format!("{}/api/v1", server.uri()),
                server.uri(),
            )
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.succeeded, 1);

        let downloaded = d
            .config()
            .downloads_dir()
            .join("42_Creator Name")
            .join("1_My_Post")
            .join("1_a.jpg");
        assert_eq!(std::fs::read(&downloaded).unwrap(), b"jpegbytes");
    }

    #[tokio::test]
    async fn cancelled_run_reports_cancelled_status() {
        let server = MockServer::start().await;
        mount_profile(&server, "Creator Name").await;

        let dir = TempDir::new().unwrap();
        let d = downloader(&dir);
        d.cancel();

        let target = Target::Creator {
            service: "patreon".to_string(),
            creator_id: "42".to_string(),
        };
        let summary = d
            .execute(
                reqwest::Client::new(),
                target,
                format!("{}/api/v1", server.uri()),
                server.uri(),
            )
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn events_include_discovery_and_completion() {
        let server = MockServer::start().await;
        mount_profile(&server, "Creator Name").await;
        Mock::given(method("GET"))
            .and(path("/api/v1/patreon/user/42/post/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "7",
                "file": {"path": "/data/a.jpg", "name": "a.jpg"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/data/a.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let d = downloader(&dir);
        let mut events = d.subscribe();
        let target = Target::Post {
            service: "patreon".to_string(),
            creator_id: "42".to_string(),
            post_id: "7".to_string(),
        };
        d.execute(
            reqwest::Client::new(),
            target,
            format!("{}/api/v1", server.uri()),
            server.uri(),
        )
        .await
        .unwrap();

        let mut saw_discovered = false;
        let mut saw_completed = false;
        let mut saw_finished = false;
        while let Ok(event) = events.try_recv() {
            match event {
                Event::FileDiscovered { .. } => saw_discovered = true,
                Event::FileCompleted { .. } => saw_completed = true,
                Event::RunFinished { summary } => {
                    saw_finished = true;
                    assert_eq!(summary.status, RunStatus::Completed);
                }
                _ => {}
            }
        }
        assert!(saw_discovered);
        assert!(saw_completed);
        assert!(saw_finished);
    }
}
