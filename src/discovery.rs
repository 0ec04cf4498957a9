//! Post discovery and file extraction
//!
//! Walks a creator's paginated post listing (or fetches a single post),
//! pulls every file reference out of each post, resolves it to an absolute
//! URL, filters by the extension allow-list, and streams accepted tasks
//! through the dedup ledger into the scheduler's queue. Discovery runs
//! concurrently with downloading; tasks flow as soon as pages yield them.

use crate::client::get_json;
use crate::config::Config;
use crate::dedup::{DedupKey, DedupLedger};
use crate::error::{Error, Result};
use crate::run::RunState;
use crate::types::{is_allowed_extension, Event, FileDescriptor, FileTask, Post, SkipReason};
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Posts per listing page; a shorter page ends pagination
pub const PAGE_SIZE: usize = 50;

/// Matches `src` attributes of `<img>` tags embedded in post content
static IMG_SRC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<img[^>]+src=["']([^"']+)["']"#).expect("static pattern"));

/// One unit of work handed to the scheduler
#[derive(Clone, Debug)]
pub enum WorkItem {
    /// A file to download
    File(FileTask),
    /// A post description to write as a text file
    Description(DescriptionTask),
}

/// A post's textual content, queued when `save_descriptions` is enabled
#[derive(Clone, Debug)]
pub struct DescriptionTask {
    /// Owning post id
    pub post_id: String,
    /// Owning post title
    pub post_title: String,
    /// Raw content to write
    pub content: String,
}

/// Streams file tasks for one target into the scheduler queue
pub struct Discovery {
    client: reqwest::Client,
    config: Arc<Config>,
    /// API root, e.g. `https://kemono.cr/api/v1`
    api_base: String,
    /// Root relative file paths resolve against, e.g. `https://kemono.cr`
    file_base: String,
    ledger: Arc<DedupLedger>,
    state: Arc<RunState>,
    events: broadcast::Sender<Event>,
    cancel: CancellationToken,
}

impl Discovery {
    /// Create a discovery stage for one run
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: reqwest::Client,
        config: Arc<Config>,
        api_base: impl Into<String>,
        file_base: impl Into<String>,
        ledger: Arc<DedupLedger>,
        state: Arc<RunState>,
        events: broadcast::Sender<Event>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            config,
            api_base: api_base.into(),
            file_base: file_base.into(),
            ledger,
            state,
            events,
            cancel,
        }
    }

    /// Walk a creator's post listing, streaming tasks as pages arrive
    ///
    /// A page fetch that exhausts its retry budget aborts discovery; a
    /// single post that cannot be fetched in full is reported and skipped.
    pub async fn run_creator(
        &self,
        service: &str,
        creator_id: &str,
        queue: &mpsc::Sender<WorkItem>,
    ) -> Result<()> {
        let mut offset = 0usize;
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let page_url = format!(
                "{}/{service}/user/{creator_id}?o={offset}",
                self.api_base
            );
            tracing::debug!(url = %page_url, offset, "fetching listing page");
            let posts: Vec<Post> = get_json(
                &self.client,
                &self.config,
                &page_url,
                self.config.download.creator_posts_max_attempts,
            )
            .await?;

            let page_len = posts.len();
            for post in &posts {
                if self.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                match self.process_post(service, creator_id, &post.id, queue).await {
                    Ok(()) => {}
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(err) => {
                        tracing::warn!(post_id = %post.id, error = %err, "post fetch failed");
                        self.state.record_failed();
                        self.emit(Event::PostFailed {
                            post_id: post.id.clone(),
                            error: err.to_string(),
                        });
                    }
                }
            }

            if page_len < PAGE_SIZE {
                tracing::debug!(page_len, "short page, listing exhausted");
                return Ok(());
            }
            offset += PAGE_SIZE;
        }
    }

    /// Fetch one post in full and stream its files
    ///
    /// Unlike creator mode, a fetch failure here is fatal: the post is the
    /// run's entire scope.
    pub async fn run_post(
        &self,
        service: &str,
        creator_id: &str,
        post_id: &str,
        queue: &mpsc::Sender<WorkItem>,
    ) -> Result<()> {
        self.process_post(service, creator_id, post_id, queue).await
    }

    async fn process_post(
        &self,
        service: &str,
        creator_id: &str,
        post_id: &str,
        queue: &mpsc::Sender<WorkItem>,
    ) -> Result<()> {
        let post_url = format!(
            "{}/{service}/user/{creator_id}/post/{post_id}",
            self.api_base
        );
        let post: Post = get_json(
            &self.client,
            &self.config,
            &post_url,
            self.config.download.post_data_max_retries,
        )
        .await?;

        self.emit_tasks(&post, queue).await
    }

    /// Filter, dedup, and queue every file a post references
    async fn emit_tasks(&self, post: &Post, queue: &mpsc::Sender<WorkItem>) -> Result<()> {
        let title = post.display_title();
        let mut accepted: Vec<(String, Option<String>)> = Vec::new();

        for descriptor in extract_candidates(post) {
            let Some(path) = descriptor.path.as_deref() else {
                continue;
            };
            let url = match resolve_file_url(&self.file_base, path, descriptor.name.as_deref()) {
                Ok(url) => url,
                Err(err) => {
                    tracing::warn!(path, error = %err, "unresolvable file reference");
                    continue;
                }
            };

            let ext = descriptor.effective_extension();
            if ext.is_empty() || !is_allowed_extension(&ext) {
                self.skip(&url, SkipReason::ExtensionNotAllowed);
                continue;
            }
            if !self.ledger.should_accept(DedupKey::from_url(&url)) {
                self.skip(&url, SkipReason::DuplicateUrl);
                continue;
            }
            accepted.push((url, descriptor.name.clone()));
        }

        let total = accepted.len();
        for (index, (url, name)) in accepted.into_iter().enumerate() {
            let task = FileTask {
                url: url.clone(),
                name,
                post_id: post.id.clone(),
                post_title: title.clone(),
                index,
                total,
            };
            self.state.record_discovered();
            self.emit(Event::FileDiscovered {
                url,
                post_id: post.id.clone(),
            });
            if queue.send(WorkItem::File(task)).await.is_err() {
                // Receiver gone means the scheduler shut down
                return Err(Error::Cancelled);
            }
        }

        if self.config.save_descriptions
            && let Some(content) = post.content.as_deref()
            && !content.trim().is_empty()
        {
            let item = WorkItem::Description(DescriptionTask {
                post_id: post.id.clone(),
                post_title: title,
                content: content.to_string(),
            });
            if queue.send(item).await.is_err() {
                return Err(Error::Cancelled);
            }
        }

        Ok(())
    }

    fn skip(&self, url: &str, reason: SkipReason) {
        self.state.record_skipped();
        self.emit(Event::FileSkipped {
            url: url.to_string(),
            reason,
        });
    }

    fn emit(&self, event: Event) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Every file reference a post carries, in stable discovery order:
/// primary file, attachments, embedded images
fn extract_candidates(post: &Post) -> Vec<FileDescriptor> {
    let mut candidates = Vec::new();
    if let Some(file) = &post.file {
        candidates.push(file.clone());
    }
    candidates.extend(post.attachments.iter().cloned());
    if let Some(content) = post.content.as_deref() {
        for capture in IMG_SRC.captures_iter(content) {
            if let Some(src) = capture.get(1) {
                candidates.push(FileDescriptor {
                    path: Some(src.as_str().to_string()),
                    name: None,
                });
            }
        }
    }
    candidates
}

/// Resolve a file path to an absolute URL, appending the declared name as
/// a `f` query parameter only when the URL has no query string yet
fn resolve_file_url(file_base: &str, path: &str, name: Option<&str>) -> Result<String> {
    let malformed = |reason: String| Error::MalformedResponse {
        url: path.to_string(),
        reason,
    };

    let mut url = if path.starts_with("http://") || path.starts_with("https://") {
        Url::parse(path).map_err(|e| malformed(e.to_string()))?
    } else {
        Url::parse(file_base)
            .and_then(|base| base.join(path))
            .map_err(|e| malformed(e.to_string()))?
    };

    if url.query().is_none()
        && let Some(name) = name
        && !name.is_empty()
    {
        url.set_query(Some(&format!("f={}", urlencoding::encode(name))));
    }

    Ok(url.to_string())
}
